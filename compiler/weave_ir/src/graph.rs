//! Shared CFG queries over [`Function`]s.
//!
//! These are generic graph operations that the canonicalizer, the
//! analyses, and the instrumenters all need. They live here rather than
//! in a specific pass so that passes do not import from each other.
//!
//! Predecessor lists are recomputed after surgery rather than maintained
//! incrementally — the engine's phases are strictly ordered, so each
//! phase snapshots the adjacency it needs.

use rustc_hash::FxHashSet;
use smallvec::{smallvec, SmallVec};

use crate::ir::{BlockId, Function, Terminator};

/// Extract successor block IDs from a terminator, in successor-slot
/// order (deterministic).
pub fn successors(terminator: &Terminator) -> SmallVec<[BlockId; 4]> {
    match terminator {
        Terminator::Ret { .. } | Terminator::Resume { .. } | Terminator::Unreachable => {
            SmallVec::new()
        }
        Terminator::Br { dest } => smallvec![*dest],
        Terminator::CondBr {
            then_dest,
            else_dest,
            ..
        } => smallvec![*then_dest, *else_dest],
        Terminator::Switch { default, cases, .. } => {
            let mut targets = SmallVec::with_capacity(cases.len() + 1);
            targets.push(*default);
            for &(_, dest) in cases {
                targets.push(dest);
            }
            targets
        }
        Terminator::Invoke { normal, unwind, .. } => smallvec![*normal, *unwind],
        Terminator::Detach {
            task,
            continuation,
            unwind,
            ..
        } => {
            let mut targets: SmallVec<[BlockId; 4]> = smallvec![*task, *continuation];
            if let Some(u) = unwind {
                targets.push(*u);
            }
            targets
        }
        Terminator::Reattach { continuation, .. } | Terminator::Sync { continuation, .. } => {
            smallvec![*continuation]
        }
        Terminator::DetachedRethrow {
            placeholder,
            unwind,
            ..
        }
        | Terminator::TaskFrameResume {
            placeholder,
            unwind,
            ..
        } => smallvec![*placeholder, *unwind],
        Terminator::SyncUnwind { normal, unwind, .. } => smallvec![*normal, *unwind],
    }
}

/// Compute the predecessor list for each block (deduplicated).
///
/// Returns a vector indexed by block index; each entry lists distinct
/// predecessors in block-index-then-edge order, so the result is
/// deterministic for a given function.
pub fn predecessors(func: &Function) -> Vec<Vec<BlockId>> {
    let num_blocks = func.blocks.len();
    let mut preds: Vec<Vec<BlockId>> = vec![Vec::new(); num_blocks];

    for (block_idx, block) in func.blocks.iter().enumerate() {
        #[expect(clippy::cast_possible_truncation, reason = "block counts fit in u32")]
        let pred = BlockId::new(block_idx as u32);
        let mut seen = FxHashSet::default();
        for succ in successors(&block.terminator) {
            if succ.index() < num_blocks && seen.insert(succ) {
                preds[succ.index()].push(pred);
            }
        }
    }

    preds
}

/// The unique predecessor of `block`, if it has exactly one.
pub fn unique_predecessor(preds: &[Vec<BlockId>], block: BlockId) -> Option<BlockId> {
    match preds[block.index()].as_slice() {
        [single] => Some(*single),
        _ => None,
    }
}

/// Depth-first postorder over blocks reachable from the entry.
pub fn postorder(func: &Function) -> Vec<BlockId> {
    let mut order = Vec::with_capacity(func.blocks.len());
    let mut visited = FxHashSet::default();
    // Explicit stack of (block, next successor index) to avoid recursion.
    let mut stack: Vec<(BlockId, usize)> = vec![(func.entry, 0)];
    visited.insert(func.entry);

    while let Some((block, succ_idx)) = stack.pop() {
        let succs = successors(&func.block(block).terminator);
        if let Some(&next) = succs.get(succ_idx) {
            stack.push((block, succ_idx + 1));
            if visited.insert(next) {
                stack.push((next, 0));
            }
        } else {
            order.push(block);
        }
    }

    order
}

/// Reverse postorder over blocks reachable from the entry.
pub fn reverse_postorder(func: &Function) -> Vec<BlockId> {
    let mut order = postorder(func);
    order.reverse();
    order
}

/// The set of blocks reachable from the entry.
pub fn reachable_from_entry(func: &Function) -> FxHashSet<BlockId> {
    postorder(func).into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Block, Function, Operand, Terminator};
    use crate::name::Name;
    use crate::ty::Ty;

    /// entry -> {a, b} -> join
    fn diamond() -> Function {
        let mut func = Function::new(Name::EMPTY, vec![], Ty::Void);
        let a = func.add_block(Block {
            instrs: vec![],
            terminator: Terminator::Br {
                dest: BlockId::new(3),
            },
        });
        let b = func.add_block(Block {
            instrs: vec![],
            terminator: Terminator::Br {
                dest: BlockId::new(3),
            },
        });
        let join = func.add_block(Block {
            instrs: vec![],
            terminator: Terminator::Ret { value: None },
        });
        func.block_mut(func.entry).terminator = Terminator::CondBr {
            cond: Operand::i64(1),
            then_dest: a,
            else_dest: b,
        };
        assert_eq!(join, BlockId::new(3));
        func
    }

    #[test]
    fn diamond_predecessors() {
        let func = diamond();
        let preds = predecessors(&func);
        assert_eq!(preds[0], vec![]);
        assert_eq!(preds[1], vec![BlockId::new(0)]);
        assert_eq!(preds[2], vec![BlockId::new(0)]);
        assert_eq!(preds[3], vec![BlockId::new(1), BlockId::new(2)]);
    }

    #[test]
    fn diamond_unique_predecessor() {
        let func = diamond();
        let preds = predecessors(&func);
        assert_eq!(
            unique_predecessor(&preds, BlockId::new(1)),
            Some(BlockId::new(0))
        );
        assert_eq!(unique_predecessor(&preds, BlockId::new(3)), None);
    }

    #[test]
    fn rpo_starts_at_entry_ends_at_exit() {
        let func = diamond();
        let rpo = reverse_postorder(&func);
        assert_eq!(rpo.len(), 4);
        assert_eq!(rpo[0], BlockId::new(0));
        assert_eq!(rpo[3], BlockId::new(3));
    }

    #[test]
    fn unreachable_block_is_excluded() {
        let mut func = diamond();
        func.add_block(Block {
            instrs: vec![],
            terminator: Terminator::Unreachable,
        });
        let reachable = reachable_from_entry(&func);
        assert_eq!(reachable.len(), 4);
        assert!(!reachable.contains(&BlockId::new(4)));
    }

    #[test]
    fn detach_successors_in_order() {
        let mut func = Function::new(Name::EMPTY, vec![], Ty::Void);
        let sr = func.alloc_instr(crate::ir::Instr::SyncRegionStart, None);
        let t = Terminator::Detach {
            task: BlockId::new(1),
            continuation: BlockId::new(2),
            unwind: Some(BlockId::new(3)),
            sync_region: sr,
        };
        let succs = successors(&t);
        assert_eq!(succs.as_slice(), &[BlockId::new(1), BlockId::new(2), BlockId::new(3)]);
    }
}
