//! Natural loop forest.
//!
//! Loops are discovered from back edges (an edge whose destination
//! dominates its source) and grouped into a nesting forest. The engine
//! requires loops to be in *simplified form* — a dedicated preheader, a
//! single latch, and dedicated exit blocks — and asserts this before
//! instrumenting; the queries here let it check.

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use super::DomTree;
use crate::graph::{predecessors, reverse_postorder, successors};
use crate::ir::{BlockId, Function};

/// One natural loop.
#[derive(Debug)]
pub struct Loop {
    pub header: BlockId,
    /// Blocks with a back edge to the header.
    pub latches: Vec<BlockId>,
    /// All member blocks, header first, in discovery order.
    pub blocks: Vec<BlockId>,
    block_set: FxHashSet<BlockId>,
    pub parent: Option<usize>,
    pub subloops: Vec<usize>,
}

impl Loop {
    /// True if `block` belongs to this loop (including subloops).
    pub fn contains(&self, block: BlockId) -> bool {
        self.block_set.contains(&block)
    }

    /// True if `block` is a latch of this loop.
    pub fn is_latch(&self, block: BlockId) -> bool {
        self.latches.contains(&block)
    }

    /// The dedicated preheader: the unique out-of-loop predecessor of the
    /// header whose only successor is the header.
    pub fn preheader(&self, func: &Function) -> Option<BlockId> {
        let preds = predecessors(func);
        let outside: SmallVec<[BlockId; 2]> = preds[self.header.index()]
            .iter()
            .copied()
            .filter(|p| !self.contains(*p))
            .collect();
        match outside.as_slice() {
            [single] if successors(&func.block(*single).terminator).len() == 1 => Some(*single),
            _ => None,
        }
    }

    /// Member blocks with at least one successor outside the loop, in
    /// member order.
    pub fn exiting_blocks(&self, func: &Function) -> Vec<BlockId> {
        self.blocks
            .iter()
            .copied()
            .filter(|b| {
                successors(&func.block(*b).terminator)
                    .iter()
                    .any(|s| !self.contains(*s))
            })
            .collect()
    }

    /// Deduplicated out-of-loop successor blocks of the exiting blocks,
    /// in first-seen order.
    pub fn unique_exit_blocks(&self, func: &Function) -> Vec<BlockId> {
        let mut seen = FxHashSet::default();
        let mut exits = Vec::new();
        for &b in &self.blocks {
            for succ in successors(&func.block(b).terminator) {
                if !self.contains(succ) && seen.insert(succ) {
                    exits.push(succ);
                }
            }
        }
        exits
    }

    /// Simplified form: dedicated preheader, single latch, and dedicated
    /// exits (every exit block's predecessors are all inside the loop).
    pub fn is_simplified(&self, func: &Function) -> bool {
        if self.preheader(func).is_none() || self.latches.len() != 1 {
            return false;
        }
        let preds = predecessors(func);
        self.unique_exit_blocks(func).iter().all(|exit| {
            preds[exit.index()]
                .iter()
                .all(|p| self.contains(*p))
        })
    }
}

/// The loop forest of one function.
#[derive(Debug, Default)]
pub struct LoopForest {
    pub loops: Vec<Loop>,
    /// Innermost loop per block.
    innermost: FxHashMap<BlockId, usize>,
    /// Indices of loops with no parent, in header order.
    pub top_level: Vec<usize>,
}

impl LoopForest {
    /// Discover the natural loops of `func`.
    pub fn compute(func: &Function, dom: &DomTree) -> Self {
        let preds = predecessors(func);

        // Group back edges by header, in RPO for determinism.
        let mut latches_by_header: Vec<(BlockId, Vec<BlockId>)> = Vec::new();
        for &block in &reverse_postorder(func) {
            for succ in successors(&func.block(block).terminator) {
                if dom.dominates(succ, block) {
                    match latches_by_header.iter_mut().find(|(h, _)| *h == succ) {
                        Some((_, latches)) => latches.push(block),
                        None => latches_by_header.push((succ, vec![block])),
                    }
                }
            }
        }

        let mut loops: Vec<Loop> = Vec::with_capacity(latches_by_header.len());
        for (header, latches) in latches_by_header {
            // Flood backward from the latches up to the header.
            let mut block_set = FxHashSet::default();
            let mut blocks = vec![header];
            block_set.insert(header);
            let mut worklist: Vec<BlockId> = latches.clone();
            while let Some(b) = worklist.pop() {
                if block_set.insert(b) {
                    blocks.push(b);
                    for &p in &preds[b.index()] {
                        if dom.is_reachable(p) {
                            worklist.push(p);
                        }
                    }
                }
            }
            loops.push(Loop {
                header,
                latches,
                blocks,
                block_set,
                parent: None,
                subloops: Vec::new(),
            });
        }

        // Nesting: the parent of L is the smallest other loop whose set
        // contains L's header.
        for i in 0..loops.len() {
            let mut best: Option<usize> = None;
            for (j, candidate) in loops.iter().enumerate() {
                if i == j || !candidate.block_set.contains(&loops[i].header) {
                    continue;
                }
                let better = match best {
                    None => true,
                    Some(b) => candidate.blocks.len() < loops[b].blocks.len(),
                };
                if better {
                    best = Some(j);
                }
            }
            loops[i].parent = best;
        }
        for i in 0..loops.len() {
            if let Some(p) = loops[i].parent {
                loops[p].subloops.push(i);
            }
        }

        let top_level: Vec<usize> = loops
            .iter()
            .enumerate()
            .filter(|(_, l)| l.parent.is_none())
            .map(|(i, _)| i)
            .collect();

        let mut innermost: FxHashMap<BlockId, usize> = FxHashMap::default();
        for (i, l) in loops.iter().enumerate() {
            for &b in &l.blocks {
                match innermost.get(&b) {
                    Some(&cur) if loops[cur].blocks.len() <= l.blocks.len() => {}
                    _ => {
                        innermost.insert(b, i);
                    }
                }
            }
        }

        LoopForest {
            loops,
            innermost,
            top_level,
        }
    }

    /// Innermost loop containing `block`.
    pub fn loop_for(&self, block: BlockId) -> Option<&Loop> {
        self.innermost.get(&block).map(|&i| &self.loops[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Block, Operand, Terminator};
    use crate::name::Name;
    use crate::ty::Ty;

    /// entry -> preheader -> header <-> latch, header -> exit.
    fn simple_loop() -> Function {
        let mut func = Function::new(Name::EMPTY, vec![], Ty::Void);
        let preheader = func.add_block(Block {
            instrs: vec![],
            terminator: Terminator::Br {
                dest: BlockId::new(2),
            },
        });
        let header = func.add_block(Block {
            instrs: vec![],
            terminator: Terminator::CondBr {
                cond: Operand::i64(1),
                then_dest: BlockId::new(3),
                else_dest: BlockId::new(4),
            },
        });
        let latch = func.add_block(Block {
            instrs: vec![],
            terminator: Terminator::Br { dest: header },
        });
        func.add_block(Block {
            instrs: vec![],
            terminator: Terminator::Ret { value: None },
        });
        func.block_mut(func.entry).terminator = Terminator::Br { dest: preheader };
        assert_eq!(latch, BlockId::new(3));
        func
    }

    #[test]
    fn discovers_single_loop() {
        let func = simple_loop();
        let dom = DomTree::compute(&func);
        let forest = LoopForest::compute(&func, &dom);
        assert_eq!(forest.loops.len(), 1);
        let l = &forest.loops[0];
        assert_eq!(l.header, BlockId::new(2));
        assert_eq!(l.latches, vec![BlockId::new(3)]);
        assert!(l.contains(BlockId::new(2)));
        assert!(l.contains(BlockId::new(3)));
        assert!(!l.contains(BlockId::new(1)));
    }

    #[test]
    fn simplified_form_queries() {
        let func = simple_loop();
        let dom = DomTree::compute(&func);
        let forest = LoopForest::compute(&func, &dom);
        let l = &forest.loops[0];
        assert_eq!(l.preheader(&func), Some(BlockId::new(1)));
        assert_eq!(l.exiting_blocks(&func), vec![BlockId::new(2)]);
        assert_eq!(l.unique_exit_blocks(&func), vec![BlockId::new(4)]);
        assert!(l.is_simplified(&func));
        assert!(l.is_latch(BlockId::new(3)));
        assert!(!l.is_latch(BlockId::new(2)));
    }

    #[test]
    fn loop_for_finds_innermost() {
        let func = simple_loop();
        let dom = DomTree::compute(&func);
        let forest = LoopForest::compute(&func, &dom);
        assert!(forest.loop_for(BlockId::new(2)).is_some());
        assert!(forest.loop_for(BlockId::new(0)).is_none());
    }
}
