//! Fork/join instrumentation.
//!
//! A fork gets a before-fork hook and sets its region's spawn-tracking
//! cell to 1; the spawned task's entry and every exit (normal,
//! exceptional, and exits funneled through shared cleanup regions) get
//! paired entry/exit hooks; the continuation — and its unwind
//! counterpart, resolved through any task-frame indirection — gets a
//! continue hook. A join gets before/after hooks bracketing the
//! synchronization, passing the tracking cell so the runtime knows
//! whether anything was actually pending; the cell is reset to 0 right
//! after the after-join hook.

use rustc_hash::FxHashMap;

use weave_ir::analysis::{task_frame_resume_dest, LoopForest, TaskTree};
use weave_ir::graph::predecessors;
use weave_ir::ir::{BlockId, FuncId, Instr, InstrId, Operand, Terminator};
use weave_ir::surgery::split_predecessors;
use weave_ir::{Cursor, Module, Ty};

use crate::hooks::{
    insert_hook, insert_hook_at_shared_eh_exits, insert_hook_in_successor, HookSet, MergeCache,
};
use crate::props::{DetachContinueProp, TaskExitProp, TaskProp};
use crate::tables::{FrontEndTable, UNKNOWN_ID};

/// Tables the fork instrumenter writes into.
pub struct TaskTables<'a> {
    pub detach_fed: &'a mut FrontEndTable,
    pub task_fed: &'a mut FrontEndTable,
    pub task_exit_fed: &'a mut FrontEndTable,
    pub detach_continue_fed: &'a mut FrontEndTable,
}

/// One i32 spawn-tracking cell per synchronization region, allocated in
/// the entry block and initialized to 0.
pub fn keep_track_of_spawns(
    module: &mut Module,
    func_id: FuncId,
    detaches: &[BlockId],
    syncs: &[BlockId],
) -> FxHashMap<InstrId, InstrId> {
    // Regions in first-use order, deduplicated, so allocation order is
    // deterministic.
    let mut regions: Vec<InstrId> = Vec::new();
    {
        let func = module.func(func_id);
        let mut push = |sr: InstrId| {
            if !regions.contains(&sr) {
                regions.push(sr);
            }
        };
        for &b in detaches {
            if let Terminator::Detach { sync_region, .. } = func.block(b).terminator {
                push(sync_region);
            }
        }
        for &b in syncs {
            if let Terminator::Sync { sync_region, .. } = func.block(b).terminator {
                push(sync_region);
            }
        }
    }

    let func = module.func_mut(func_id);
    let entry = func.entry;
    let mut cursor = Cursor::at_first_insertion(func, entry);
    let mut cells = FxHashMap::default();
    for region in regions {
        let cell = cursor.emit(Instr::Alloca {
            ty: Ty::I32,
            count: None,
        });
        cursor.store(Ty::I32, Operand::Const(weave_ir::Const::i32(0)), Operand::Instr(cell));
        cells.insert(region, cell);
    }
    cells
}

/// The index of the first insertion point in a detached block, past any
/// task-frame-use marker.
fn first_insertion_in_detached(func: &weave_ir::Function, block: BlockId) -> usize {
    let base = func.first_insertion_index(block);
    let instrs = &func.block(block).instrs;
    for (i, &id) in instrs.iter().enumerate().skip(base) {
        if matches!(func.instr(id), Instr::TaskFrameUse { .. }) {
            return i + 1;
        }
    }
    base
}

/// Does this detach spawn the body of a parallel loop?
pub fn spawns_parallel_loop_body(
    func: &weave_ir::Function,
    loops: &LoopForest,
    detach_block: BlockId,
) -> bool {
    let Terminator::Detach { continuation, .. } = func.block(detach_block).terminator else {
        return false;
    };
    loops
        .loop_for(detach_block)
        .is_some_and(|l| l.header == detach_block && l.is_latch(continuation))
}

/// Instrument one fork and its task's entry, exits, and continuations.
#[expect(clippy::too_many_arguments, reason = "mirrors the construct's many insertion sites")]
pub fn instrument_detach(
    module: &mut Module,
    func_id: FuncId,
    detach_block: BlockId,
    tasks: &TaskTree,
    loops: &LoopForest,
    track_cells: &FxHashMap<InstrId, InstrId>,
    hooks: &HookSet,
    tables: &mut TaskTables<'_>,
    cache: &mut MergeCache,
) {
    let (detached, continuation, unwind, sync_region) =
        match module.func(func_id).block(detach_block).terminator {
            Terminator::Detach {
                task,
                continuation,
                unwind,
                sync_region,
            } => (task, continuation, unwind, sync_region),
            ref other => panic!("not a detach: {other:?}"),
        };

    let task_idx = tasks.detached_task(detach_block);
    let parent = tasks.task_for(detach_block);
    let id_block = tasks.task(parent).entry;
    let loop_body = spawns_parallel_loop_body(module.func(func_id), loops, detach_block);

    // Materialize ids at the enclosing task's entry so they dominate
    // every insertion site below.
    let detach_local = tables
        .detach_fed
        .add_terminator(module, func_id, detach_block);
    let task_local = tables.task_fed.add_block(module, func_id, detached);
    let (detach_id, task_id) = {
        let func = module.func_mut(func_id);
        let index = first_insertion_in_detached(func, id_block);
        let mut id_cursor = Cursor::at(func, id_block, index);
        let detach_id = tables.detach_fed.to_global_id(detach_local, &mut id_cursor);
        let task_id = tables.task_fed.to_global_id(task_local, &mut id_cursor);
        (detach_id, task_id)
    };

    // Before-fork hook, preceded by the spawn-tracking store.
    let track = *track_cells
        .get(&sync_region)
        .unwrap_or_else(|| panic!("no tracking cell for sync region {}", sync_region.raw()));
    {
        let func = module.func_mut(func_id);
        let primary = func.first_debug_loc(detach_block);
        let mut cursor = Cursor::before_terminator(func, detach_block);
        cursor.store(
            Ty::I32,
            Operand::Const(weave_ir::Const::i32(1)),
            Operand::Instr(track),
        );
        insert_hook(
            &mut cursor,
            hooks.detach,
            vec![detach_id, Operand::Instr(track)],
            primary,
        );
    }

    // Task-entry hook, past any task-frame indirection.
    let task_prop = TaskProp {
        is_parallel_loop_body: loop_body,
    };
    {
        let func = module.func_mut(func_id);
        let primary = func.first_debug_loc(detached);
        let index = first_insertion_in_detached(func, detached);
        let mut cursor = Cursor::at(func, detached, index);
        insert_hook(
            &mut cursor,
            hooks.task,
            vec![task_id, detach_id, task_prop.operand()],
            primary,
        );
    }

    // Exit hooks at every reattach into the continuation and at every
    // detached rethrow the task encloses directly.
    let exit_prop = TaskExitProp {
        is_parallel_loop_body: loop_body,
    };
    let mut exits: Vec<BlockId> = Vec::new();
    {
        let func = module.func(func_id);
        let preds = predecessors(func);
        for &pred in &preds[continuation.index()] {
            if tasks.simply_encloses(task_idx, pred)
                && matches!(func.block(pred).terminator, Terminator::Reattach { .. })
            {
                exits.push(pred);
            }
        }
        for &block in &tasks.task(task_idx).blocks {
            if tasks.simply_encloses(task_idx, block)
                && matches!(func.block(block).terminator, Terminator::DetachedRethrow { .. })
            {
                exits.push(block);
            }
        }
    }
    for exit in exits {
        let exit_local = tables.task_exit_fed.add_terminator(module, func_id, exit);
        let func = module.func_mut(func_id);
        let primary = func.first_debug_loc(exit);
        let mut cursor = Cursor::before_terminator(func, exit);
        let exit_id = tables.task_exit_fed.to_global_id(exit_local, &mut cursor);
        insert_hook(
            &mut cursor,
            hooks.task_exit,
            vec![exit_id, task_id, detach_id, exit_prop.operand()],
            primary,
        );
    }

    // Exits funneled through shared cleanup regions.
    let defaults = vec![
        Operand::i64(UNKNOWN_ID),
        Operand::i64(UNKNOWN_ID),
        TaskExitProp::default_word(),
    ];
    for region in tasks.shared_eh_exits(task_idx) {
        if module
            .func(func_id)
            .is_placeholder_block(tasks.regions()[region].entry)
        {
            continue;
        }
        insert_hook_at_shared_eh_exits(
            module,
            func_id,
            cache,
            tasks,
            region,
            task_idx,
            hooks.task_exit,
            tables.task_exit_fed,
            &[task_id, detach_id, exit_prop.operand()],
            &defaults,
        );
    }

    // Continue hook at the continuation. The continue edge is critical
    // when blocks other than the detach and its paired reattaches also
    // enter the continuation; splitting moves the detach and reattach
    // edges together, preserving their pairing.
    let continuation = {
        let func = module.func_mut(func_id);
        let preds = predecessors(func);
        let (paired, foreign): (Vec<BlockId>, Vec<BlockId>) =
            preds[continuation.index()].iter().partition(|&&p| {
                p == detach_block
                    || matches!(
                        func.block(p).terminator,
                        Terminator::Reattach { continuation: c, sync_region: sr }
                            if c == continuation && sr == sync_region
                    )
            });
        if foreign.is_empty() {
            continuation
        } else {
            let new_block = BlockId::new(
                u32::try_from(func.blocks.len())
                    .unwrap_or_else(|_| panic!("block count exceeds u32::MAX")),
            );
            split_predecessors(func, continuation, &paired);
            new_block
        }
    };
    let cont_local = tables
        .detach_continue_fed
        .add_block(module, func_id, continuation);
    {
        let func = module.func_mut(func_id);
        let primary = func.first_debug_loc(continuation);
        let mut cursor = Cursor::at_first_insertion(func, continuation);
        let cont_id = tables
            .detach_continue_fed
            .to_global_id(cont_local, &mut cursor);
        insert_hook(
            &mut cursor,
            hooks.detach_continue,
            vec![cont_id, detach_id, DetachContinueProp::default_word()],
            primary,
        );
    }

    // Unwind continue hook, resolved through task-frame indirection.
    if let Some(unwind_dest) = unwind {
        let (pred_block, dest) = match tasks.task(task_idx).task_frame {
            Some(frame) => task_frame_resume_dest(module.func(func_id), frame)
                .unwrap_or_else(|| panic!("detach with unwind uses a task frame with no resume")),
            None => (detach_block, unwind_dest),
        };
        let unwind_prop = DetachContinueProp { is_unwind: true };
        let cont_local = tables.detach_continue_fed.add_block(module, func_id, dest);
        let cont_id = {
            let func = module.func_mut(func_id);
            let index = first_insertion_in_detached(func, id_block);
            let mut id_cursor = Cursor::at(func, id_block, index);
            tables
                .detach_continue_fed
                .to_global_id(cont_local, &mut id_cursor)
        };
        let unwind_defaults = vec![
            Operand::i64(UNKNOWN_ID),
            Operand::i64(UNKNOWN_ID),
            DetachContinueProp::default_word(),
        ];
        insert_hook_in_successor(
            module.func_mut(func_id),
            cache,
            dest,
            pred_block,
            hooks.detach_continue,
            vec![cont_id, detach_id, unwind_prop.operand()],
            unwind_defaults.clone(),
        );

        // Detached rethrows of this region feeding the unwind
        // destination update the same join.
        let rethrow_preds: Vec<BlockId> = {
            let func = module.func(func_id);
            let preds = predecessors(func);
            preds[dest.index()]
                .iter()
                .copied()
                .filter(|&p| {
                    matches!(
                        func.block(p).terminator,
                        Terminator::DetachedRethrow { sync_region: sr, .. } if sr == sync_region
                    )
                })
                .collect()
        };
        for pred in rethrow_preds {
            insert_hook_in_successor(
                module.func_mut(func_id),
                cache,
                dest,
                pred,
                hooks.detach_continue,
                vec![cont_id, detach_id, unwind_prop.operand()],
                unwind_defaults.clone(),
            );
        }
    }
}

/// Instrument one join with before/after hooks and the tracking-cell
/// reset.
#[expect(clippy::too_many_arguments, reason = "mirrors the construct's insertion sites")]
pub fn instrument_sync(
    module: &mut Module,
    func_id: FuncId,
    sync_block: BlockId,
    syncs_with_unwinds: bool,
    track_cells: &FxHashMap<InstrId, InstrId>,
    hooks: &HookSet,
    sync_fed: &mut FrontEndTable,
    cache: &mut MergeCache,
    calls_after_sync: &mut FxHashMap<BlockId, InstrId>,
) {
    let (continuation, sync_region) = match module.func(func_id).block(sync_block).terminator {
        Terminator::Sync {
            continuation,
            sync_region,
        } => (continuation, sync_region),
        ref other => panic!("not a sync: {other:?}"),
    };
    let track = *track_cells
        .get(&sync_region)
        .unwrap_or_else(|| panic!("no tracking cell for sync region {}", sync_region.raw()));

    let local = sync_fed.add_terminator(module, func_id, sync_block);
    let sync_id = {
        let func = module.func_mut(func_id);
        let primary = func.first_debug_loc(sync_block);
        let mut cursor = Cursor::before_terminator(func, sync_block);
        let sync_id = sync_fed.to_global_id(local, &mut cursor);
        insert_hook(
            &mut cursor,
            hooks.before_sync,
            vec![sync_id, Operand::Instr(track)],
            primary,
        );
        sync_id
    };

    // Resolve the after positions through a sync-unwind indirection.
    let (pred, normal, unwind) = if syncs_with_unwinds {
        match module.func(func_id).block(continuation).terminator {
            Terminator::SyncUnwind { normal, unwind, .. } => {
                (continuation, normal, Some(unwind))
            }
            ref other => panic!("sync-with-unwind continuation has terminator {other:?}"),
        }
    } else {
        (sync_block, continuation, None)
    };

    let defaults = vec![Operand::i64(UNKNOWN_ID), Operand::NULL];
    let mut place_after = |module: &mut Module, succ: BlockId| {
        let call = insert_hook_in_successor(
            module.func_mut(func_id),
            cache,
            succ,
            pred,
            hooks.after_sync,
            vec![sync_id, Operand::Instr(track)],
            defaults.clone(),
        );
        match call {
            Some(call) => {
                calls_after_sync.insert(succ, call);
                // Reset the tracking cell right after the after-join
                // hook.
                let func = module.func_mut(func_id);
                let block = succ;
                let mut cursor = Cursor::after_instr(func, block, call);
                cursor.store(
                    Ty::I32,
                    Operand::Const(weave_ir::Const::i32(0)),
                    Operand::Instr(track),
                );
            }
            None => {
                assert!(
                    calls_after_sync.contains_key(&succ),
                    "merged after-join call missing for block {}",
                    succ.raw(),
                );
            }
        }
    };

    place_after(module, normal);
    if let Some(unwind) = unwind {
        place_after(module, unwind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weave_ir::analysis::DomTree;
    use weave_ir::ir::{Block, Callee};
    use weave_ir::{Function, Name};

    /// entry(detach) -> task(reattach) -> cont(sync) -> exit.
    fn spawning_module() -> (Module, FuncId, BlockId, BlockId, BlockId) {
        let mut module = Module::new("unit.c");
        let f = module.interner.intern("f");
        let func_id = module.add_function(Function::new(f, vec![], Ty::Void));
        let func = module.func_mut(func_id);
        let sr = func.alloc_instr(Instr::SyncRegionStart, None);
        let entry = func.entry;
        func.block_mut(entry).instrs.push(sr);

        let task = func.add_block(Block {
            instrs: vec![],
            terminator: Terminator::Unreachable,
        });
        let cont = func.add_block(Block {
            instrs: vec![],
            terminator: Terminator::Unreachable,
        });
        let exit = func.add_block(Block {
            instrs: vec![],
            terminator: Terminator::Ret { value: None },
        });
        func.block_mut(entry).terminator = Terminator::Detach {
            task,
            continuation: cont,
            unwind: None,
            sync_region: sr,
        };
        func.block_mut(task).terminator = Terminator::Reattach {
            continuation: cont,
            sync_region: sr,
        };
        func.block_mut(cont).terminator = Terminator::Sync {
            continuation: exit,
            sync_region: sr,
        };
        (module, func_id, task, cont, exit)
    }

    fn count_hook_calls(module: &Module, func_id: FuncId, block: BlockId, hook: Name) -> usize {
        let func = module.func(func_id);
        func.block(block)
            .instrs
            .iter()
            .filter(|&&i| {
                matches!(
                    func.instr(i),
                    Instr::Call { callee: Callee::Direct(n), .. } if *n == hook
                )
            })
            .count()
    }

    #[test]
    fn detach_and_task_get_paired_hooks() {
        let (mut module, func_id, task, cont, _) = spawning_module();
        let hooks = HookSet::declare(&mut module, &crate::Options::default());
        let mut detach_fed = FrontEndTable::new(&mut module, "__weave_detach_base");
        let mut task_fed = FrontEndTable::new(&mut module, "__weave_task_base");
        let mut task_exit_fed = FrontEndTable::new(&mut module, "__weave_task_exit_base");
        let mut detach_continue_fed =
            FrontEndTable::new(&mut module, "__weave_detach_continue_base");

        let dom = DomTree::compute(module.func(func_id));
        let tasks = TaskTree::compute(module.func(func_id), &dom);
        let loops = LoopForest::compute(module.func(func_id), &dom);
        let entry = module.func(func_id).entry;
        let cells = keep_track_of_spawns(&mut module, func_id, &[entry], &[cont]);
        let mut cache = MergeCache::new();

        let mut tables = TaskTables {
            detach_fed: &mut detach_fed,
            task_fed: &mut task_fed,
            task_exit_fed: &mut task_exit_fed,
            detach_continue_fed: &mut detach_continue_fed,
        };
        instrument_detach(
            &mut module,
            func_id,
            entry,
            &tasks,
            &loops,
            &cells,
            &hooks,
            &mut tables,
            &mut cache,
        );

        assert_eq!(count_hook_calls(&module, func_id, entry, hooks.detach), 1);
        assert_eq!(count_hook_calls(&module, func_id, task, hooks.task), 1);
        assert_eq!(count_hook_calls(&module, func_id, task, hooks.task_exit), 1);
        assert_eq!(
            count_hook_calls(&module, func_id, cont, hooks.detach_continue),
            1
        );
        assert_eq!(detach_fed.count(), 1);
        assert_eq!(task_fed.count(), 1);
        assert_eq!(task_exit_fed.count(), 1);
        assert_eq!(detach_continue_fed.count(), 1);
    }

    #[test]
    fn sync_brackets_and_resets_tracking() {
        let (mut module, func_id, _, cont, exit) = spawning_module();
        let hooks = HookSet::declare(&mut module, &crate::Options::default());
        let mut sync_fed = FrontEndTable::new(&mut module, "__weave_sync_base");
        let entry = module.func(func_id).entry;
        let cells = keep_track_of_spawns(&mut module, func_id, &[entry], &[cont]);
        let mut cache = MergeCache::new();
        let mut calls_after_sync = FxHashMap::default();

        instrument_sync(
            &mut module,
            func_id,
            cont,
            false,
            &cells,
            &hooks,
            &mut sync_fed,
            &mut cache,
            &mut calls_after_sync,
        );

        assert_eq!(count_hook_calls(&module, func_id, cont, hooks.before_sync), 1);
        assert_eq!(count_hook_calls(&module, func_id, exit, hooks.after_sync), 1);

        // The store resetting the cell comes right after the after-sync
        // call.
        let func = module.func(func_id);
        let after = calls_after_sync
            .get(&exit)
            .copied()
            .unwrap_or_else(|| panic!("no after-sync call recorded"));
        let instrs = &func.block(exit).instrs;
        let pos = instrs
            .iter()
            .position(|&i| i == after)
            .unwrap_or_else(|| panic!("after-sync call not in exit block"));
        assert!(
            matches!(func.instr(instrs[pos + 1]), Instr::Store { value: Operand::Const(weave_ir::Const::Int { value: 0, .. }), .. }),
            "tracking cell must be reset right after the after-sync hook"
        );
    }

    #[test]
    fn spawn_cells_are_per_region_and_zeroed() {
        let (mut module, func_id, _, cont, _) = spawning_module();
        let entry = module.func(func_id).entry;
        let cells = keep_track_of_spawns(&mut module, func_id, &[entry], &[cont]);
        assert_eq!(cells.len(), 1);

        let func = module.func(func_id);
        let cell = *cells
            .values()
            .next()
            .unwrap_or_else(|| panic!("expected one cell"));
        assert!(matches!(func.instr(cell), Instr::Alloca { ty: Ty::I32, count: None }));
        // The cell's zeroing store is in the entry block.
        let zeroed = func.block(entry).instrs.iter().any(|&i| {
            matches!(
                func.instr(i),
                Instr::Store { addr: Operand::Instr(a), value: Operand::Const(weave_ir::Const::Int { value: 0, .. }), .. } if *a == cell
            )
        });
        assert!(zeroed);
    }
}
