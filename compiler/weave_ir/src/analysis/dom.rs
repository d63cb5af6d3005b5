//! Dominator tree.
//!
//! The iterative dominance algorithm over reverse postorder (Cooper,
//! Harvey, Kennedy): simple, and fast enough for the block counts the
//! engine sees. Unreachable blocks have no dominance information and
//! report as such.

use crate::graph::{predecessors, reverse_postorder};
use crate::ir::{BlockId, Function};

/// Dominator relation for one function.
#[derive(Debug)]
pub struct DomTree {
    /// Immediate dominator per block index; `None` for unreachable
    /// blocks. The entry is its own idom.
    idom: Vec<Option<BlockId>>,
    /// Reverse-postorder number per block index; `None` for unreachable
    /// blocks.
    rpo_number: Vec<Option<u32>>,
}

impl DomTree {
    /// Compute dominators for `func`.
    pub fn compute(func: &Function) -> Self {
        let num_blocks = func.blocks.len();
        let rpo = reverse_postorder(func);
        let preds = predecessors(func);

        let mut rpo_number: Vec<Option<u32>> = vec![None; num_blocks];
        for (i, &block) in rpo.iter().enumerate() {
            #[expect(clippy::cast_possible_truncation, reason = "block counts fit in u32")]
            {
                rpo_number[block.index()] = Some(i as u32);
            }
        }

        let mut idom: Vec<Option<BlockId>> = vec![None; num_blocks];
        idom[func.entry.index()] = Some(func.entry);

        let intersect = |idom: &[Option<BlockId>], a: BlockId, b: BlockId| -> BlockId {
            let number = |block: BlockId| {
                rpo_number[block.index()]
                    .unwrap_or_else(|| panic!("block {} has no RPO number", block.raw()))
            };
            let mut f1 = a;
            let mut f2 = b;
            while f1 != f2 {
                while number(f1) > number(f2) {
                    f1 = idom[f1.index()]
                        .unwrap_or_else(|| panic!("missing idom for block {}", f1.raw()));
                }
                while number(f2) > number(f1) {
                    f2 = idom[f2.index()]
                        .unwrap_or_else(|| panic!("missing idom for block {}", f2.raw()));
                }
            }
            f1
        };

        let mut changed = true;
        while changed {
            changed = false;
            for &block in rpo.iter().skip(1) {
                let mut new_idom: Option<BlockId> = None;
                for &pred in &preds[block.index()] {
                    if idom[pred.index()].is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => pred,
                        Some(current) => intersect(&idom, pred, current),
                    });
                }
                if new_idom.is_some() && idom[block.index()] != new_idom {
                    idom[block.index()] = new_idom;
                    changed = true;
                }
            }
        }

        DomTree { idom, rpo_number }
    }

    /// True if `block` is reachable from the function entry.
    pub fn is_reachable(&self, block: BlockId) -> bool {
        self.rpo_number[block.index()].is_some()
    }

    /// Immediate dominator of `block` (`None` for the entry and for
    /// unreachable blocks).
    pub fn idom(&self, block: BlockId) -> Option<BlockId> {
        let parent = self.idom[block.index()]?;
        if parent == block {
            return None;
        }
        Some(parent)
    }

    /// True if `a` dominates `b` (reflexive).
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        if !self.is_reachable(a) || !self.is_reachable(b) {
            return false;
        }
        let mut cur = b;
        loop {
            if cur == a {
                return true;
            }
            match self.idom(cur) {
                Some(parent) => cur = parent,
                None => return false,
            }
        }
    }
}
