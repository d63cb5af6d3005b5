//! CFG canonicalization.
//!
//! Three rewrites run before any hook is inserted:
//!
//! 1. [`setup_calls`] — inside spawned tasks, ordinary calls that may
//!    throw are promoted to invokes unwinding to a per-task cleanup pad,
//!    so exceptional task exits exist for the instrumenter to hook.
//! 2. [`split_blocks_at_calls`] — ordinary calls terminate their block,
//!    so "after call" has a well-defined insertion point.
//! 3. [`setup_blocks`] — every block that will receive merge-point hooks
//!    ends up with predecessors of a single semantic class, by splitting
//!    off one class at a time in a fixed priority order (fork exits
//!    last, preserving the deadness of fork placeholder blocks).
//!
//! Canonicalization assumes a well-formed input graph; violations are
//! bugs in the producer and fail loudly.

use rustc_hash::FxHashSet;
use smallvec::SmallVec;

use weave_ir::analysis::{DomTree, LibCallRecognizer, TaskTree};
use weave_ir::graph::predecessors;
use weave_ir::ir::{Block, BlockId, Callee, FnAttrs, FuncId, Instr, InstrId, Terminator};
use weave_ir::surgery::split_predecessors;
use weave_ir::{surgery, Function, Module, Ty};

/// Blocks that exist only as structural successors of detached-rethrow
/// and task-frame-resume terminators; they are dead by construction and
/// never instrumented.
pub fn placeholder_successors(func: &Function) -> FxHashSet<BlockId> {
    let mut set = FxHashSet::default();
    for block in &func.blocks {
        if let Terminator::DetachedRethrow { placeholder, .. }
        | Terminator::TaskFrameResume { placeholder, .. } = block.terminator
        {
            set.insert(placeholder);
        }
    }
    set
}

/// Promote may-throw calls inside spawned tasks to invokes, unwinding to
/// a synthetic cleanup landing pad (one per task) that resumes.
pub fn setup_calls(module: &mut Module, func_id: FuncId) {
    if module.func(func_id).attrs.contains(FnAttrs::NO_THROW) {
        return;
    }

    let dom = DomTree::compute(module.func(func_id));
    let tasks = TaskTree::compute(module.func(func_id), &dom);

    // Collect the promotion worklist before any mutation.
    let mut worklist: Vec<(usize, InstrId)> = Vec::new();
    {
        let func = module.func(func_id);
        for (idx, block) in func.blocks.iter().enumerate() {
            #[expect(clippy::cast_possible_truncation, reason = "block counts fit in u32")]
            let id = BlockId::new(idx as u32);
            if !dom.is_reachable(id) {
                continue;
            }
            let task = tasks.task_for(id);
            if tasks.task(task).detach_block.is_none() {
                continue; // only calls inside spawned tasks are promoted
            }
            for &instr in &block.instrs {
                if let Instr::Call { callee, no_return, .. } = func.instr(instr) {
                    if *no_return || !may_throw(module, *callee) {
                        continue;
                    }
                    worklist.push((task, instr));
                }
            }
        }
    }

    let mut cleanup_pads: Vec<(usize, BlockId)> = Vec::new();
    for (task, call) in worklist {
        let existing = cleanup_pads
            .iter()
            .find(|(t, _)| *t == task)
            .map(|&(_, pad)| pad);
        let pad = match existing {
            Some(pad) => pad,
            None => {
                let func = module.func_mut(func_id);
                let pad_value = func.alloc_instr(Instr::LandingPad { ty: Ty::Ptr }, None);
                let pad = func.add_block(Block {
                    instrs: vec![pad_value],
                    terminator: Terminator::Resume {
                        value: Some(weave_ir::Operand::Instr(pad_value)),
                    },
                });
                cleanup_pads.push((task, pad));
                pad
            }
        };

        let func = module.func_mut(func_id);
        let (block, index) = locate(func, call);
        // Everything after the call moves to the invoke's normal
        // destination; the call itself becomes the invoke payload.
        let normal = surgery::split_block(func, block, index + 1);
        let popped = func.block_mut(block).instrs.pop();
        assert_eq!(popped, Some(call), "call moved during promotion");
        func.block_mut(block).terminator = Terminator::Invoke {
            call,
            normal,
            unwind: pad,
        };
    }
}

/// Does a call to `callee` potentially unwind?
fn may_throw(module: &Module, callee: Callee) -> bool {
    match callee {
        Callee::Indirect(_) => true,
        Callee::Direct(name) => match module.function_by_name(name) {
            Some(f) => !module.func(f).attrs.contains(FnAttrs::NO_THROW),
            None => true,
        },
    }
}

/// Split blocks so every ordinary call terminates its block — unless it
/// is a placeholder, already followed by the terminator, or marked as
/// never returning.
pub fn split_blocks_at_calls(module: &mut Module, func_id: FuncId) {
    let calls: Vec<InstrId> = {
        let func = module.func(func_id);
        func.blocks
            .iter()
            .flat_map(|b| b.instrs.iter().copied())
            .filter(|&id| match func.instr(id) {
                Instr::Call { no_return, .. } => !*no_return,
                _ => false,
            })
            .collect()
    };

    for call in calls {
        let func = module.func_mut(func_id);
        let (block, index) = locate(func, call);
        if index + 1 < func.block(block).instrs.len() {
            surgery::split_block(func, block, index + 1);
        }
    }
}

/// Find the current position of an arena instruction.
///
/// # Panics
///
/// Panics if the instruction is placed in no block.
fn locate(func: &Function, instr: InstrId) -> (BlockId, usize) {
    for (idx, block) in func.blocks.iter().enumerate() {
        if let Some(pos) = block.instrs.iter().position(|&id| id == instr) {
            #[expect(clippy::cast_possible_truncation, reason = "block counts fit in u32")]
            return (BlockId::new(idx as u32), pos);
        }
    }
    panic!("instruction {} is not placed in any block", instr.raw());
}

// ── Predecessor-class canonicalization ──────────────────────────────

/// The predecessor classes the canonicalizer separates. Declaration
/// order is the split priority order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PredClass {
    Sync,
    SyncUnwind,
    AllocFnReturn,
    InvokeReturn,
    TaskFrameResume,
    ForkExit,
    Other,
}

fn classify_pred(func: &Function, pred: BlockId, recognizer: &LibCallRecognizer) -> PredClass {
    match &func.block(pred).terminator {
        Terminator::Detach { .. }
        | Terminator::Reattach { .. }
        | Terminator::DetachedRethrow { .. } => PredClass::ForkExit,
        Terminator::TaskFrameResume { .. } => PredClass::TaskFrameResume,
        Terminator::Sync { .. } => PredClass::Sync,
        Terminator::SyncUnwind { .. } => PredClass::SyncUnwind,
        Terminator::Invoke { call, .. } => match func.instr(*call) {
            Instr::Call {
                callee: Callee::Direct(name),
                ..
            } if recognizer.is_allocation_fn(*name) => PredClass::AllocFnReturn,
            _ => PredClass::InvokeReturn,
        },
        _ => PredClass::Other,
    }
}

/// Canonicalize every candidate block of `func_id` so each has
/// predecessors of a single class.
pub fn setup_blocks(module: &mut Module, func_id: FuncId, recognizer: &LibCallRecognizer) {
    // Candidates: landing pads, invoke normal destinations (except fork
    // placeholder successors), and join successors.
    let mut candidates: Vec<BlockId> = Vec::new();
    {
        let func = module.func(func_id);
        let placeholders = placeholder_successors(func);
        let mut seen = FxHashSet::default();
        for (idx, block) in func.blocks.iter().enumerate() {
            #[expect(clippy::cast_possible_truncation, reason = "block counts fit in u32")]
            let id = BlockId::new(idx as u32);
            if func.block_is_landing_pad(id) && seen.insert(id) {
                candidates.push(id);
            }
            match block.terminator {
                Terminator::Invoke { normal, .. } => {
                    if !placeholders.contains(&normal) && seen.insert(normal) {
                        candidates.push(normal);
                    }
                }
                Terminator::Sync { continuation, .. } => {
                    if seen.insert(continuation) {
                        candidates.push(continuation);
                    }
                }
                _ => {}
            }
        }
    }

    for block in candidates {
        setup_block(module, func_id, block, recognizer);
    }
}

/// Split `block` until its predecessors belong to one class.
fn setup_block(
    module: &mut Module,
    func_id: FuncId,
    block: BlockId,
    recognizer: &LibCallRecognizer,
) {
    let preds = predecessors(module.func(func_id));
    if preds[block.index()].len() <= 1 {
        return;
    }

    let mut by_class: Vec<(PredClass, Vec<BlockId>)> = Vec::new();
    {
        let func = module.func(func_id);
        for &pred in &preds[block.index()] {
            let class = classify_pred(func, pred, recognizer);
            match by_class.iter_mut().find(|(c, _)| *c == class) {
                Some((_, list)) => list.push(pred),
                None => by_class.push((class, vec![pred])),
            }
        }
    }

    let mut num_classes = by_class.len();
    if num_classes <= 1 {
        return;
    }

    // Fixed priority order; fork exits are split off last so placeholder
    // deadness invariants survive.
    let order: SmallVec<[PredClass; 6]> = SmallVec::from_slice(&[
        PredClass::Sync,
        PredClass::SyncUnwind,
        PredClass::AllocFnReturn,
        PredClass::InvokeReturn,
        PredClass::TaskFrameResume,
        PredClass::ForkExit,
    ]);

    let mut to_split = block;
    for class in order {
        if num_classes <= 1 {
            break;
        }
        let Some((_, list)) = by_class.iter().find(|(c, _)| *c == class) else {
            continue;
        };
        to_split = split_predecessors(module.func_mut(func_id), to_split, list);
        num_classes -= 1;
    }
}
