//! Hook declarations and the insertion engine.
//!
//! Hook calls at points with a unique predecessor class are inserted
//! directly. At control-flow merges, the engine synthesizes one phi per
//! hook argument, keyed by `(merge block, hook)`: the first predecessor
//! to reach the pair creates the phis (its own arguments on its edge,
//! explicit defaults on every other edge) and the single hook call;
//! every later predecessor only fills in its edge's incoming values.
//! One call per merge, however many edges feed it.
//!
//! A specialized traversal threads these joins through chains of shared
//! exception regions in reverse postorder, and emits direct calls at
//! the detached-rethrow exits buried inside them.

use rustc_hash::{FxHashMap, FxHashSet};

use weave_ir::analysis::{detached_rethrows_in, TaskTree};
use weave_ir::graph::{predecessors, unique_predecessor};
use weave_ir::ir::{BlockId, FuncId, Instr, InstrId, Operand};
use weave_ir::{Cursor, DebugLoc, Function, Module, Name, Ty};

use crate::tables::FrontEndTable;
use crate::Options;

/// Interned names of every hook the engine can call, declared in the
/// module up front (gated by the per-category options).
#[derive(Debug, Clone, Copy)]
pub struct HookSet {
    pub func_entry: Name,
    pub func_exit: Name,
    pub bb_entry: Name,
    pub bb_exit: Name,
    pub before_loop: Name,
    pub after_loop: Name,
    pub loopbody_entry: Name,
    pub loopbody_exit: Name,
    pub before_call: Name,
    pub after_call: Name,
    pub before_load: Name,
    pub after_load: Name,
    pub before_store: Name,
    pub after_store: Name,
    pub detach: Name,
    pub task: Name,
    pub task_exit: Name,
    pub detach_continue: Name,
    pub before_sync: Name,
    pub after_sync: Name,
    pub before_alloca: Name,
    pub after_alloca: Name,
    pub before_allocfn: Name,
    pub after_allocfn: Name,
    pub before_free: Name,
    pub after_free: Name,
    pub memset: Name,
    pub memcpy: Name,
    pub memmove: Name,
}

impl HookSet {
    /// Intern every hook name and declare the hooks enabled by
    /// `options` in `module`.
    pub fn declare(module: &mut Module, options: &Options) -> Self {
        let i64_t = || Ty::I64;
        let ptr = || Ty::Ptr;
        let hooks = HookSet {
            func_entry: module.interner.intern("__weave_func_entry"),
            func_exit: module.interner.intern("__weave_func_exit"),
            bb_entry: module.interner.intern("__weave_bb_entry"),
            bb_exit: module.interner.intern("__weave_bb_exit"),
            before_loop: module.interner.intern("__weave_before_loop"),
            after_loop: module.interner.intern("__weave_after_loop"),
            loopbody_entry: module.interner.intern("__weave_loopbody_entry"),
            loopbody_exit: module.interner.intern("__weave_loopbody_exit"),
            before_call: module.interner.intern("__weave_before_call"),
            after_call: module.interner.intern("__weave_after_call"),
            before_load: module.interner.intern("__weave_before_load"),
            after_load: module.interner.intern("__weave_after_load"),
            before_store: module.interner.intern("__weave_before_store"),
            after_store: module.interner.intern("__weave_after_store"),
            detach: module.interner.intern("__weave_detach"),
            task: module.interner.intern("__weave_task"),
            task_exit: module.interner.intern("__weave_task_exit"),
            detach_continue: module.interner.intern("__weave_detach_continue"),
            before_sync: module.interner.intern("__weave_before_sync"),
            after_sync: module.interner.intern("__weave_after_sync"),
            before_alloca: module.interner.intern("__weave_before_alloca"),
            after_alloca: module.interner.intern("__weave_after_alloca"),
            before_allocfn: module.interner.intern("__weave_before_allocfn"),
            after_allocfn: module.interner.intern("__weave_after_allocfn"),
            before_free: module.interner.intern("__weave_before_free"),
            after_free: module.interner.intern("__weave_after_free"),
            memset: module.interner.intern("memset"),
            memcpy: module.interner.intern("memcpy"),
            memmove: module.interner.intern("memmove"),
        };

        let mut declare = |name: Name, params: Vec<Ty>, ret: Ty| {
            module.get_or_insert_declaration(name, params, ret);
        };

        if options.instrument_func_entry_exit {
            declare(hooks.func_entry, vec![i64_t(), i64_t()], Ty::Void);
            declare(hooks.func_exit, vec![i64_t(), i64_t(), i64_t()], Ty::Void);
        }
        if options.instrument_basic_blocks {
            declare(hooks.bb_entry, vec![i64_t(), i64_t()], Ty::Void);
            declare(hooks.bb_exit, vec![i64_t(), i64_t()], Ty::Void);
        }
        if options.instrument_loops {
            declare(hooks.before_loop, vec![i64_t(), i64_t(), i64_t()], Ty::Void);
            declare(hooks.after_loop, vec![i64_t(), i64_t()], Ty::Void);
            declare(hooks.loopbody_entry, vec![i64_t(), i64_t()], Ty::Void);
            declare(
                hooks.loopbody_exit,
                vec![i64_t(), i64_t(), i64_t()],
                Ty::Void,
            );
        }
        if options.instrument_calls {
            declare(hooks.before_call, vec![i64_t(), i64_t(), i64_t()], Ty::Void);
            declare(hooks.after_call, vec![i64_t(), i64_t(), i64_t()], Ty::Void);
        }
        if options.instrument_memory_accesses {
            for hook in [
                hooks.before_load,
                hooks.after_load,
                hooks.before_store,
                hooks.after_store,
            ] {
                declare(hook, vec![i64_t(), ptr(), Ty::I32, i64_t()], Ty::Void);
            }
        }
        if options.instrument_fork_join {
            declare(hooks.detach, vec![i64_t(), ptr()], Ty::Void);
            declare(hooks.task, vec![i64_t(), i64_t(), i64_t()], Ty::Void);
            declare(
                hooks.task_exit,
                vec![i64_t(), i64_t(), i64_t(), i64_t()],
                Ty::Void,
            );
            declare(
                hooks.detach_continue,
                vec![i64_t(), i64_t(), i64_t()],
                Ty::Void,
            );
            declare(hooks.before_sync, vec![i64_t(), ptr()], Ty::Void);
            declare(hooks.after_sync, vec![i64_t(), ptr()], Ty::Void);
        }
        if options.instrument_allocas {
            declare(hooks.before_alloca, vec![i64_t(), i64_t(), i64_t()], Ty::Void);
            declare(
                hooks.after_alloca,
                vec![i64_t(), ptr(), i64_t(), i64_t()],
                Ty::Void,
            );
        }
        if options.instrument_alloc_fns {
            declare(
                hooks.before_allocfn,
                vec![i64_t(), i64_t(), i64_t(), i64_t(), ptr(), i64_t()],
                Ty::Void,
            );
            declare(
                hooks.after_allocfn,
                vec![i64_t(), ptr(), i64_t(), i64_t(), i64_t(), ptr(), i64_t()],
                Ty::Void,
            );
            declare(hooks.before_free, vec![i64_t(), ptr(), i64_t()], Ty::Void);
            declare(hooks.after_free, vec![i64_t(), ptr(), i64_t()], Ty::Void);
        }
        if options.instrument_mem_intrinsics {
            declare(hooks.memset, vec![ptr(), Ty::I32, i64_t()], ptr());
            declare(hooks.memcpy, vec![ptr(), ptr(), i64_t()], ptr());
            declare(hooks.memmove, vec![ptr(), ptr(), i64_t()], ptr());
        }

        hooks
    }
}

// ── Direct insertion ────────────────────────────────────────────────

/// The debug location an inserted hook call gets: the instrumented
/// point's own location when available, otherwise a synthesized line-0
/// location — but only inside functions that carry debug info at all.
pub fn instrumentation_loc(func: &Function, primary: Option<DebugLoc>) -> Option<DebugLoc> {
    if func.subprogram.is_some() {
        Some(primary.unwrap_or(DebugLoc::synthetic()))
    } else {
        None
    }
}

/// Insert a call to `hook` at `cursor`, with the debug-location policy
/// applied from `primary_loc`.
pub fn insert_hook(
    cursor: &mut Cursor<'_>,
    hook: Name,
    args: Vec<Operand>,
    primary_loc: Option<DebugLoc>,
) -> InstrId {
    let loc = instrumentation_loc(cursor.func(), primary_loc);
    cursor.set_loc(loc);
    cursor.call(hook, args, Ty::Void)
}

// ── Merge-point insertion ───────────────────────────────────────────

/// Per-function cache of synthesized hook-argument joins: for each
/// `(merge block, hook)` pair, the phis holding each argument.
#[derive(Debug, Default)]
pub struct MergeCache {
    phis: FxHashMap<(BlockId, Name), Vec<InstrId>>,
}

impl MergeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The join phis for `(block, hook)`, if they exist.
    pub fn joins(&self, block: BlockId, hook: Name) -> Option<&[InstrId]> {
        self.phis.get(&(block, hook)).map(Vec::as_slice)
    }
}

/// Create or extend the argument joins for `(succ, hook)` on the edge
/// from `pred`. Returns `true` if the phis were newly created (the
/// caller must emit the hook call), `false` if an existing join was
/// extended.
///
/// # Panics
///
/// Panics when the cached joins disagree with `args` on arity, or when
/// `pred` is not an incoming edge of an existing join — both are
/// bookkeeping contract violations.
fn update_arg_phis(
    func: &mut Function,
    cache: &mut MergeCache,
    succ: BlockId,
    pred: BlockId,
    hook: Name,
    args: &[Operand],
    defaults: &[Operand],
) -> bool {
    let key = (succ, hook);
    if let Some(phis) = cache.phis.get(&key) {
        assert_eq!(
            phis.len(),
            args.len(),
            "merge point at block {} updated with wrong argument arity",
            succ.raw(),
        );
        for (phi, arg) in phis.iter().zip(args) {
            let Instr::Phi { incoming, .. } = func.instr_mut(*phi) else {
                panic!("merge cache points at a non-phi instruction");
            };
            let slot = incoming
                .iter_mut()
                .find(|(p, _)| *p == pred)
                .unwrap_or_else(|| {
                    panic!(
                        "block {} is not a predecessor edge of the join in block {}",
                        pred.raw(),
                        succ.raw(),
                    )
                });
            slot.1 = *arg;
        }
        return false;
    }

    assert_eq!(
        args.len(),
        defaults.len(),
        "default argument list must match the hook arity"
    );
    let preds = predecessors(func);
    let mut phis = Vec::with_capacity(args.len());
    for (arg, default) in args.iter().zip(defaults) {
        let ty = func.operand_ty(*arg);
        let incoming = preds[succ.index()]
            .iter()
            .map(|&p| (p, if p == pred { *arg } else { *default }))
            .collect();
        let phi = func.alloc_instr(Instr::Phi { ty, incoming }, None);
        func.block_mut(succ).instrs.insert(0, phi);
        phis.push(phi);
    }
    cache.phis.insert(key, phis);
    true
}

/// Insert a hook call in `succ` on behalf of the edge from `pred`.
///
/// With a unique predecessor this is a direct insertion. Otherwise the
/// merge cache synthesizes (or extends) one join per argument; only the
/// first predecessor to reach `(succ, hook)` produces a call — later
/// edges update the joins and get `None`.
pub fn insert_hook_in_successor(
    func: &mut Function,
    cache: &mut MergeCache,
    succ: BlockId,
    pred: BlockId,
    hook: Name,
    args: Vec<Operand>,
    defaults: Vec<Operand>,
) -> Option<InstrId> {
    let preds = predecessors(func);
    if let Some(unique) = unique_predecessor(&preds, succ) {
        assert_eq!(
            unique,
            pred,
            "block {} is not the unique predecessor of block {}",
            pred.raw(),
            succ.raw(),
        );
        let primary = func.first_debug_loc(succ);
        let mut cursor = Cursor::at_first_insertion(func, succ);
        return Some(insert_hook(&mut cursor, hook, args, primary));
    }

    if !update_arg_phis(func, cache, succ, pred, hook, &args, &defaults) {
        return None; // already merged; incoming values updated
    }

    let joined: Vec<Operand> = cache
        .joins(succ, hook)
        .map(|phis| phis.iter().map(|&p| Operand::Instr(p)).collect())
        .unwrap_or_default();
    let primary = func.first_debug_loc(succ);
    let mut cursor = Cursor::at_first_insertion(func, succ);
    Some(insert_hook(&mut cursor, hook, joined, primary))
}

/// Thread task-exit joins through chains of shared exception regions.
///
/// Starting at `region`, regions are visited in reverse postorder over
/// the region graph. The first region's joins gather `args` from every
/// in-edge the task contains; downstream regions receive the previous
/// region's joins as their incoming arguments. Whenever a region first
/// receives joins, a direct hook call is emitted at each detached-
/// rethrow exit inside it, with a fresh id from `fed` prepended to the
/// joined arguments.
#[expect(clippy::too_many_arguments, reason = "mirrors the traversal's inputs")]
pub fn insert_hook_at_shared_eh_exits(
    module: &mut Module,
    func_id: FuncId,
    cache: &mut MergeCache,
    tasks: &TaskTree,
    region: usize,
    task: usize,
    hook: Name,
    fed: &mut FrontEndTable,
    args: &[Operand],
    defaults: &[Operand],
) {
    let worklist = tasks.region_postorder(region);
    let mut visited: FxHashSet<usize> = FxHashSet::default();

    for &r in worklist.iter().rev() {
        let entry = tasks.regions()[r].entry;
        let mut no_new_phis = true;

        if r == region {
            // Entry edges coming from inside the task carry the real
            // arguments; every other edge keeps its default.
            let in_edges: Vec<BlockId> = tasks.regions()[r]
                .in_edges
                .iter()
                .copied()
                .filter(|p| tasks.contains(task, *p) && tasks.region_of_block(*p).is_none())
                .collect();
            for pred in in_edges {
                no_new_phis &= !update_arg_phis(
                    module.func_mut(func_id),
                    cache,
                    entry,
                    pred,
                    hook,
                    args,
                    defaults,
                );
            }
        } else {
            // Thread the joins of already-visited predecessor regions.
            let in_edges: Vec<(BlockId, usize)> = tasks.regions()[r]
                .in_edges
                .iter()
                .filter_map(|p| {
                    tasks
                        .region_of_block(*p)
                        .and_then(|pr| tasks.region_at(pr.entry))
                        .filter(|pr| visited.contains(pr))
                        .map(|pr| (*p, pr))
                })
                .collect();
            for (pred, pred_region) in in_edges {
                let pred_entry = tasks.regions()[pred_region].entry;
                let threaded: Vec<Operand> = cache
                    .joins(pred_entry, hook)
                    .map(|phis| phis.iter().map(|&p| Operand::Instr(p)).collect())
                    .unwrap_or_default();
                if threaded.is_empty() {
                    continue;
                }
                no_new_phis &= !update_arg_phis(
                    module.func_mut(func_id),
                    cache,
                    entry,
                    pred,
                    hook,
                    &threaded,
                    defaults,
                );
            }
        }
        visited.insert(r);

        if no_new_phis {
            continue;
        }

        // Fresh joins appeared in this region: emit the hook at every
        // rethrow exit buried in it.
        let rethrows = detached_rethrows_in(module.func(func_id), &tasks.regions()[r]);
        for block in rethrows {
            let local = fed.add_terminator(module, func_id, block);
            let joined: Vec<InstrId> = cache
                .joins(entry, hook)
                .map(<[InstrId]>::to_vec)
                .unwrap_or_default();
            let func = module.func_mut(func_id);
            let primary = func.first_debug_loc(block);
            let mut cursor = Cursor::before_terminator(func, block);
            let id_op = fed.to_global_id(local, &mut cursor);
            let mut call_args = vec![id_op];
            call_args.extend(joined.iter().map(|&p| Operand::Instr(p)));
            insert_hook(&mut cursor, hook, call_args, primary);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weave_ir::ir::{Block, Terminator};

    fn two_pred_merge() -> (Function, BlockId, BlockId, BlockId) {
        let mut func = Function::new(Name::EMPTY, vec![], Ty::Void);
        let merge = func.add_block(Block {
            instrs: vec![],
            terminator: Terminator::Ret { value: None },
        });
        let p1 = func.add_block(Block {
            instrs: vec![],
            terminator: Terminator::Br { dest: merge },
        });
        let p2 = func.add_block(Block {
            instrs: vec![],
            terminator: Terminator::Br { dest: merge },
        });
        func.block_mut(func.entry).terminator = Terminator::CondBr {
            cond: Operand::i64(0),
            then_dest: p1,
            else_dest: p2,
        };
        (func, merge, p1, p2)
    }

    #[test]
    fn first_edge_creates_call_second_updates() {
        let (mut func, merge, p1, p2) = two_pred_merge();
        let hook = Name::from_raw(100);
        let mut cache = MergeCache::new();

        let call = insert_hook_in_successor(
            &mut func,
            &mut cache,
            merge,
            p1,
            hook,
            vec![Operand::i64(11)],
            vec![Operand::i64(-1)],
        );
        assert!(call.is_some());

        let again = insert_hook_in_successor(
            &mut func,
            &mut cache,
            merge,
            p2,
            hook,
            vec![Operand::i64(22)],
            vec![Operand::i64(-1)],
        );
        assert!(again.is_none(), "second edge must not create a call");

        // Exactly one phi and one call in the merge block.
        let phis = cache.joins(merge, hook).map(<[InstrId]>::len);
        assert_eq!(phis, Some(1));
        let calls = func
            .block(merge)
            .instrs
            .iter()
            .filter(|&&i| func.instr(i).is_call())
            .count();
        assert_eq!(calls, 1);

        // The join carries each edge's argument.
        let phi = cache.joins(merge, hook).map(|p| p[0]);
        let Some(phi) = phi else {
            panic!("expected a join phi")
        };
        match func.instr(phi) {
            Instr::Phi { incoming, .. } => {
                assert!(incoming.contains(&(p1, Operand::i64(11))));
                assert!(incoming.contains(&(p2, Operand::i64(22))));
            }
            other => panic!("expected phi, got {other:?}"),
        }
    }

    #[test]
    fn unique_predecessor_is_direct() {
        let mut func = Function::new(Name::EMPTY, vec![], Ty::Void);
        let succ = func.add_block(Block {
            instrs: vec![],
            terminator: Terminator::Ret { value: None },
        });
        func.block_mut(func.entry).terminator = Terminator::Br { dest: succ };
        let entry = func.entry;

        let mut cache = MergeCache::new();
        let call = insert_hook_in_successor(
            &mut func,
            &mut cache,
            succ,
            entry,
            Name::from_raw(100),
            vec![Operand::i64(1)],
            vec![Operand::i64(-1)],
        );
        assert!(call.is_some());
        assert!(cache.joins(succ, Name::from_raw(100)).is_none());
    }

    #[test]
    #[should_panic(expected = "wrong argument arity")]
    fn arity_mismatch_is_fatal() {
        let (mut func, merge, p1, p2) = two_pred_merge();
        let hook = Name::from_raw(100);
        let mut cache = MergeCache::new();
        insert_hook_in_successor(
            &mut func,
            &mut cache,
            merge,
            p1,
            hook,
            vec![Operand::i64(1), Operand::i64(2)],
            vec![Operand::i64(-1), Operand::i64(-1)],
        );
        insert_hook_in_successor(
            &mut func,
            &mut cache,
            merge,
            p2,
            hook,
            vec![Operand::i64(1)],
            vec![Operand::i64(-1)],
        );
    }

    #[test]
    fn distinct_hooks_get_distinct_joins() {
        let (mut func, merge, p1, _) = two_pred_merge();
        let mut cache = MergeCache::new();
        let hook_a = Name::from_raw(100);
        let hook_b = Name::from_raw(101);
        insert_hook_in_successor(
            &mut func,
            &mut cache,
            merge,
            p1,
            hook_a,
            vec![Operand::i64(1)],
            vec![Operand::i64(-1)],
        );
        insert_hook_in_successor(
            &mut func,
            &mut cache,
            merge,
            p1,
            hook_b,
            vec![Operand::i64(2)],
            vec![Operand::i64(-1)],
        );
        assert!(cache.joins(merge, hook_a).is_some());
        assert!(cache.joins(merge, hook_b).is_some());
        let calls = func
            .block(merge)
            .instrs
            .iter()
            .filter(|&&i| func.instr(i).is_call())
            .count();
        assert_eq!(calls, 2);
    }

    #[test]
    fn hook_call_gets_synthetic_loc_with_subprogram() {
        let mut func = Function::new(Name::EMPTY, vec![], Ty::Void);
        func.subprogram = Some(weave_ir::Subprogram {
            name: Name::EMPTY,
            file: Name::EMPTY,
            directory: Name::EMPTY,
            line: 10,
        });
        let entry = func.entry;
        func.block_mut(entry).terminator = Terminator::Ret { value: None };
        let mut cursor = Cursor::before_terminator(&mut func, entry);
        let call = insert_hook(&mut cursor, Name::from_raw(5), vec![], None);
        assert_eq!(func.debug_loc(call), Some(DebugLoc::synthetic()));
    }

    #[test]
    fn hook_call_without_subprogram_has_no_loc() {
        let mut func = Function::new(Name::EMPTY, vec![], Ty::Void);
        let entry = func.entry;
        func.block_mut(entry).terminator = Terminator::Ret { value: None };
        let mut cursor = Cursor::before_terminator(&mut func, entry);
        let call = insert_hook(&mut cursor, Name::from_raw(5), vec![], None);
        assert_eq!(func.debug_loc(call), None);
    }
}
