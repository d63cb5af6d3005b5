//! Loop instrumentation.
//!
//! Each loop gets one id (assigned at its header, parents before their
//! subloops, depth-first), a before-loop hook in the preheader carrying
//! the trip count (materialized when statically expressible, -1
//! otherwise), a body-entry hook in the header, one body-exit hook per
//! exiting block (flagged when the exit is the latch), and after-loop
//! hooks at the dedicated exit blocks.

use weave_ir::analysis::{loop_trip_count, DomTree, LoopForest, TripCount};
use weave_ir::ir::{FuncId, Operand, Terminator};
use weave_ir::{Cursor, Module, Ty};

use crate::hooks::{insert_hook, HookSet};
use crate::props::{LoopExitProp, LoopProp};
use crate::tables::FrontEndTable;

/// Tables the loop instrumenter writes into.
pub struct LoopTables<'a> {
    pub loop_fed: &'a mut FrontEndTable,
    pub loop_exit_fed: &'a mut FrontEndTable,
}

/// Instrument every top-level loop of `func_id`, recursing into
/// subloops depth-first.
pub fn instrument_loops(
    module: &mut Module,
    func_id: FuncId,
    forest: &LoopForest,
    dom: &DomTree,
    hooks: &HookSet,
    tables: &mut LoopTables<'_>,
) {
    for &top in &forest.top_level {
        instrument_loop(module, func_id, forest, top, dom, hooks, tables);
    }
}

fn instrument_loop(
    module: &mut Module,
    func_id: FuncId,
    forest: &LoopForest,
    loop_idx: usize,
    dom: &DomTree,
    hooks: &HookSet,
    tables: &mut LoopTables<'_>,
) {
    let l = &forest.loops[loop_idx];
    assert!(
        l.is_simplified(module.func(func_id)),
        "loop with header {} is not in simplified form",
        l.header.raw(),
    );

    // Assign this loop's id before recursing so ids follow a
    // depth-first preorder.
    let local = tables.loop_fed.add_block(module, func_id, l.header);

    for &sub in &forest.loops[loop_idx].subloops {
        instrument_loop(module, func_id, forest, sub, dom, hooks, tables);
    }

    let l = &forest.loops[loop_idx];
    let func = module.func(func_id);
    let preheader = l
        .preheader(func)
        .unwrap_or_else(|| panic!("simplified loop lost its preheader"));
    let exiting = l.exiting_blocks(func);
    let exits = l.unique_exit_blocks(func);

    let prop = LoopProp {
        is_parallel: is_parallel_loop(func, l),
        has_unique_exiting_block: exiting.len() == 1,
    };
    let trip = loop_trip_count(func, l, dom);

    // Before-loop hook in the preheader, with the trip count.
    let header_loc = module.func(func_id).first_debug_loc(l.header);
    let func = module.func_mut(func_id);
    let mut cursor = Cursor::before_terminator(func, preheader);
    let loop_id = tables.loop_fed.to_global_id(local, &mut cursor);
    let trip_op = match trip {
        #[expect(clippy::cast_possible_wrap, reason = "trip counts far below i64::MAX")]
        TripCount::Constant(n) => Operand::i64(n as i64),
        TripCount::Computable { init, limit } => {
            let limit = cursor.zext_to_i64(limit);
            let init = cursor.zext_to_i64(init);
            Operand::Instr(cursor.sub(Ty::I64, limit, init))
        }
        TripCount::Unknown => Operand::i64(-1),
    };
    insert_hook(
        &mut cursor,
        hooks.before_loop,
        vec![loop_id, trip_op, prop.operand()],
        header_loc,
    );

    // Body-entry hook in the header.
    let header = forest.loops[loop_idx].header;
    let func = module.func_mut(func_id);
    let primary = func.first_debug_loc(header);
    let mut cursor = Cursor::at_first_insertion(func, header);
    insert_hook(
        &mut cursor,
        hooks.loopbody_entry,
        vec![loop_id, prop.operand()],
        primary,
    );

    // Body-exit hook at the end of each exiting block.
    for block in exiting {
        let exit_prop = LoopExitProp {
            is_latch: forest.loops[loop_idx].is_latch(block),
        };
        let exit_local = tables.loop_exit_fed.add_block(module, func_id, block);
        let func = module.func_mut(func_id);
        let primary = func.first_debug_loc(block);
        let mut cursor = Cursor::before_terminator(func, block);
        let exit_id = tables.loop_exit_fed.to_global_id(exit_local, &mut cursor);
        insert_hook(
            &mut cursor,
            hooks.loopbody_exit,
            vec![exit_id, loop_id, exit_prop.operand()],
            primary,
        );
    }

    // After-loop hooks at the dedicated exits.
    for block in exits {
        let func = module.func_mut(func_id);
        let primary = func.first_debug_loc(block);
        let mut cursor = Cursor::at_first_insertion(func, block);
        insert_hook(
            &mut cursor,
            hooks.after_loop,
            vec![loop_id, prop.operand()],
            primary,
        );
    }
}

/// A parallel (fork/join) loop: the header forks its body and the
/// continuation closes the iteration.
fn is_parallel_loop(func: &weave_ir::Function, l: &weave_ir::analysis::Loop) -> bool {
    match func.block(l.header).terminator {
        Terminator::Detach { continuation, .. } => l.is_latch(continuation),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weave_ir::ir::{Block, Instr};
    use weave_ir::Function;

    /// entry -> preheader -> header -{latch, exit}-; latch -> header.
    fn loop_func(module: &mut Module) -> FuncId {
        let f = module.interner.intern("f");
        let func_id = module.add_function(Function::new(f, vec![], Ty::Void));
        let func = module.func_mut(func_id);
        let preheader = func.add_block(Block {
            instrs: vec![],
            terminator: Terminator::Br {
                dest: weave_ir::BlockId::new(2),
            },
        });
        let header = func.add_block(Block {
            instrs: vec![],
            terminator: Terminator::Unreachable,
        });
        let latch = func.add_block(Block {
            instrs: vec![],
            terminator: Terminator::Br { dest: header },
        });
        let exit = func.add_block(Block {
            instrs: vec![],
            terminator: Terminator::Ret { value: None },
        });
        func.block_mut(func.entry).terminator = Terminator::Br { dest: preheader };
        func.block_mut(header).terminator = Terminator::CondBr {
            cond: Operand::i64(1),
            then_dest: latch,
            else_dest: exit,
        };
        func_id
    }

    fn run(module: &mut Module, func_id: FuncId) -> (FrontEndTable, FrontEndTable) {
        let hooks = HookSet::declare(module, &crate::Options::default());
        let mut loop_fed = FrontEndTable::new(module, "__weave_loop_base");
        let mut loop_exit_fed = FrontEndTable::new(module, "__weave_loop_exit_base");
        let dom = DomTree::compute(module.func(func_id));
        let forest = LoopForest::compute(module.func(func_id), &dom);
        let mut tables = LoopTables {
            loop_fed: &mut loop_fed,
            loop_exit_fed: &mut loop_exit_fed,
        };
        instrument_loops(module, func_id, &forest, &dom, &hooks, &mut tables);
        (loop_fed, loop_exit_fed)
    }

    #[test]
    fn unknown_trip_count_passes_sentinel() {
        let mut module = Module::new("unit.c");
        let func_id = loop_func(&mut module);
        let hooks = HookSet::declare(&mut module, &crate::Options::default());
        let (loop_fed, _) = run(&mut module, func_id);
        assert_eq!(loop_fed.count(), 1);

        // The before-loop hook sits in the preheader; its trip-count
        // argument must be the -1 sentinel.
        let func = module.func(func_id);
        let preheader = weave_ir::BlockId::new(1);
        let call = func
            .block(preheader)
            .instrs
            .iter()
            .copied()
            .find(|&i| func.instr(i).is_call())
            .unwrap_or_else(|| panic!("no hook call in preheader"));
        match func.instr(call) {
            Instr::Call { callee, args, .. } => {
                assert_eq!(
                    *callee,
                    weave_ir::Callee::Direct(hooks.before_loop),
                );
                assert_eq!(args[1], Operand::i64(-1));
            }
            _ => panic!("expected call"),
        }
    }

    #[test]
    fn exit_hooks_mark_the_latch() {
        let mut module = Module::new("unit.c");
        let func_id = loop_func(&mut module);
        let (_, loop_exit_fed) = run(&mut module, func_id);
        // One exiting block (the header).
        assert_eq!(loop_exit_fed.count(), 1);

        let func = module.func(func_id);
        let header = weave_ir::BlockId::new(2);
        // Header got: body-entry hook at top, exit hook before the
        // terminator (header is the exiting block, not the latch).
        let calls: Vec<_> = func
            .block(header)
            .instrs
            .iter()
            .filter(|&&i| func.instr(i).is_call())
            .collect();
        assert_eq!(calls.len(), 2);
    }

    #[test]
    fn after_loop_hook_lands_in_exit_block() {
        let mut module = Module::new("unit.c");
        let func_id = loop_func(&mut module);
        let hooks = HookSet::declare(&mut module, &crate::Options::default());
        run(&mut module, func_id);

        let func = module.func(func_id);
        let exit = weave_ir::BlockId::new(4);
        let has_after = func.block(exit).instrs.iter().any(|&i| {
            matches!(
                func.instr(i),
                Instr::Call { callee: weave_ir::Callee::Direct(n), .. } if *n == hooks.after_loop
            )
        });
        assert!(has_after);
    }
}
