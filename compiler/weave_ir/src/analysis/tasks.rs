//! Fork/join task structure.
//!
//! A `Detach` terminator spawns a task whose body is the sub-CFG
//! dominated by the detached entry block; the spawning thread continues
//! at the detach's continuation. Tasks nest. Block ownership follows
//! dominance: a block belongs to the innermost task whose entry
//! dominates it — which also places *shared exception regions* (cleanup
//! reachable from several child tasks, so dominated by none of them)
//! with the enclosing task, exactly where the hook-threading traversal
//! needs them.
//!
//! All traversals here are explicit worklists producing deterministic
//! orders; nothing recurses.

use rustc_hash::{FxHashMap, FxHashSet};

use super::DomTree;
use crate::graph::{predecessors, successors};
use crate::ir::{BlockId, Function, Instr, InstrId, Operand, Terminator};

/// One task: the root (whole function) or a detached child.
#[derive(Debug)]
pub struct Task {
    /// The block whose `Detach` spawns this task; `None` for the root.
    pub detach_block: Option<BlockId>,
    /// The task's entry block (the detached block; function entry for
    /// the root).
    pub entry: BlockId,
    pub parent: Option<usize>,
    pub subtasks: Vec<usize>,
    /// Blocks owned directly by this task (not by a subtask), in block
    /// index order.
    pub blocks: Vec<BlockId>,
    /// The task-frame token this task uses, when its entry carries a
    /// task-frame-use marker.
    pub task_frame: Option<InstrId>,
}

/// A single-entry cleanup region reachable from more than one task.
#[derive(Debug)]
pub struct SharedEhRegion {
    /// The region's landing-pad entry block.
    pub entry: BlockId,
    /// Member blocks, entry first.
    pub blocks: Vec<BlockId>,
    /// Incoming edges `(predecessor block, entry)` from outside the
    /// region, in deterministic order.
    pub in_edges: Vec<BlockId>,
    /// Index of the task that owns the region's blocks.
    pub owner: usize,
}

/// Task structure of one function.
#[derive(Debug)]
pub struct TaskTree {
    pub tasks: Vec<Task>,
    /// Owning task per block (innermost); unreachable blocks map to the
    /// root.
    task_of: Vec<usize>,
    regions: Vec<SharedEhRegion>,
    region_of_entry: FxHashMap<BlockId, usize>,
    /// Which region, if any, owns each block.
    region_of_block: FxHashMap<BlockId, usize>,
    /// Region-graph successors: regions whose entry is a successor of a
    /// member block.
    region_succs: Vec<Vec<usize>>,
}

impl TaskTree {
    /// Compute the task tree of `func`.
    pub fn compute(func: &Function, dom: &DomTree) -> Self {
        let mut tasks = vec![Task {
            detach_block: None,
            entry: func.entry,
            parent: None,
            subtasks: Vec::new(),
            blocks: Vec::new(),
            task_frame: None,
        }];
        let mut entry_to_task: FxHashMap<BlockId, usize> = FxHashMap::default();
        entry_to_task.insert(func.entry, 0);

        for (idx, block) in func.blocks.iter().enumerate() {
            #[expect(clippy::cast_possible_truncation, reason = "block counts fit in u32")]
            let id = BlockId::new(idx as u32);
            if let Terminator::Detach { task: entry, .. } = block.terminator {
                if !dom.is_reachable(id) {
                    continue;
                }
                let task_idx = tasks.len();
                tasks.push(Task {
                    detach_block: Some(id),
                    entry,
                    parent: None,
                    subtasks: Vec::new(),
                    blocks: Vec::new(),
                    task_frame: task_frame_of(func, entry),
                });
                entry_to_task.insert(entry, task_idx);
            }
        }

        // Ownership: walk the idom chain until a task entry is found.
        let num_blocks = func.blocks.len();
        let mut task_of = vec![0usize; num_blocks];
        for idx in 0..num_blocks {
            #[expect(clippy::cast_possible_truncation, reason = "block counts fit in u32")]
            let id = BlockId::new(idx as u32);
            if !dom.is_reachable(id) {
                continue;
            }
            let mut cur = id;
            task_of[idx] = loop {
                if let Some(&t) = entry_to_task.get(&cur) {
                    break t;
                }
                match dom.idom(cur) {
                    Some(parent) => cur = parent,
                    None => break 0,
                }
            };
        }

        for idx in 0..num_blocks {
            #[expect(clippy::cast_possible_truncation, reason = "block counts fit in u32")]
            let id = BlockId::new(idx as u32);
            if dom.is_reachable(id) {
                tasks[task_of[idx]].blocks.push(id);
            }
        }

        // Parent = owner of the detach block.
        for i in 1..tasks.len() {
            let detach = tasks[i]
                .detach_block
                .unwrap_or_else(|| panic!("non-root task without a detach block"));
            let parent = task_of[detach.index()];
            tasks[i].parent = Some(parent);
            tasks[parent].subtasks.push(i);
        }

        let (regions, region_of_entry, region_of_block, region_succs) =
            compute_shared_regions(func, dom, &tasks, &task_of);

        TaskTree {
            tasks,
            task_of,
            regions,
            region_of_entry,
            region_of_block,
            region_succs,
        }
    }

    /// The innermost task owning `block`.
    pub fn task_for(&self, block: BlockId) -> usize {
        self.task_of[block.index()]
    }

    /// Borrow a task.
    pub fn task(&self, idx: usize) -> &Task {
        &self.tasks[idx]
    }

    /// The task spawned by the detach terminating `detach_block`.
    ///
    /// # Panics
    ///
    /// Panics if no task was detached there.
    pub fn detached_task(&self, detach_block: BlockId) -> usize {
        self.tasks
            .iter()
            .position(|t| t.detach_block == Some(detach_block))
            .unwrap_or_else(|| panic!("no task detached at block {}", detach_block.raw()))
    }

    /// True if `task` owns `block` directly (not through a subtask and
    /// not through a shared region owned by an ancestor).
    pub fn simply_encloses(&self, task: usize, block: BlockId) -> bool {
        self.task_of[block.index()] == task && !self.region_of_block.contains_key(&block)
    }

    /// True if `block` belongs to `task` or any of its descendants.
    pub fn contains(&self, task: usize, block: BlockId) -> bool {
        let mut cur = self.task_of[block.index()];
        loop {
            if cur == task {
                return true;
            }
            match self.tasks[cur].parent {
                Some(p) => cur = p,
                None => return false,
            }
        }
    }

    /// All shared exception regions of the function.
    pub fn regions(&self) -> &[SharedEhRegion] {
        &self.regions
    }

    /// The region owning `block`, if any.
    pub fn region_of_block(&self, block: BlockId) -> Option<&SharedEhRegion> {
        self.region_of_block.get(&block).map(|&i| &self.regions[i])
    }

    /// The region entered at `entry`, if any.
    pub fn region_at(&self, entry: BlockId) -> Option<usize> {
        self.region_of_entry.get(&entry).copied()
    }

    /// Shared regions that `task`'s exceptional exits feed, i.e. regions
    /// with an in-edge from a block the task contains that is not itself
    /// inside a shared region. Deterministic order.
    pub fn shared_eh_exits(&self, task: usize) -> Vec<usize> {
        let mut out = Vec::new();
        for (i, region) in self.regions.iter().enumerate() {
            let entered_from_task = region.in_edges.iter().any(|pred| {
                self.contains(task, *pred) && !self.region_of_block.contains_key(pred)
            });
            if entered_from_task {
                out.push(i);
            }
        }
        out
    }

    /// Post-order over the region graph starting at `start` (explicit
    /// stack; chains of shared regions come out innermost-first, so the
    /// reverse is the threading order).
    pub fn region_postorder(&self, start: usize) -> Vec<usize> {
        let mut order = Vec::new();
        let mut visited = FxHashSet::default();
        visited.insert(start);
        let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
        while let Some((region, next)) = stack.pop() {
            if let Some(&succ) = self.region_succs[region].get(next) {
                stack.push((region, next + 1));
                if visited.insert(succ) {
                    stack.push((succ, 0));
                }
            } else {
                order.push(region);
            }
        }
        order
    }
}

/// The task-frame token used by a task entered at `entry`, if any.
fn task_frame_of(func: &Function, entry: BlockId) -> Option<InstrId> {
    func.block(entry).instrs.iter().find_map(|&id| {
        if let Instr::TaskFrameUse {
            frame: Operand::Instr(frame),
        } = func.instr(id)
        {
            Some(*frame)
        } else {
            None
        }
    })
}

/// Find the block resuming a task frame and its unwind destination:
/// `(resume block, unwind dest)`.
pub fn task_frame_resume_dest(func: &Function, frame: InstrId) -> Option<(BlockId, BlockId)> {
    for (idx, block) in func.blocks.iter().enumerate() {
        if let Terminator::TaskFrameResume {
            frame: Operand::Instr(f),
            unwind,
            ..
        } = block.terminator
        {
            if f == frame {
                #[expect(clippy::cast_possible_truncation, reason = "block counts fit in u32")]
                return Some((BlockId::new(idx as u32), unwind));
            }
        }
    }
    None
}

type RegionData = (
    Vec<SharedEhRegion>,
    FxHashMap<BlockId, usize>,
    FxHashMap<BlockId, usize>,
    Vec<Vec<usize>>,
);

/// Discover shared exception regions: landing pads owned by a task but
/// entered from its strict descendants, plus the single-entry block
/// regions they head.
fn compute_shared_regions(
    func: &Function,
    dom: &DomTree,
    tasks: &[Task],
    task_of: &[usize],
) -> RegionData {
    let preds = predecessors(func);

    let is_strict_descendant = |mut t: usize, ancestor: usize| -> bool {
        while let Some(p) = tasks[t].parent {
            if p == ancestor {
                return true;
            }
            t = p;
        }
        false
    };

    // Entries, in block index order.
    let mut entries: Vec<BlockId> = Vec::new();
    for idx in 0..func.blocks.len() {
        #[expect(clippy::cast_possible_truncation, reason = "block counts fit in u32")]
        let id = BlockId::new(idx as u32);
        if !dom.is_reachable(id) || !func.block_is_landing_pad(id) {
            continue;
        }
        let owner = task_of[idx];
        let from_descendant = preds[idx]
            .iter()
            .any(|p| is_strict_descendant(task_of[p.index()], owner));
        if from_descendant {
            entries.push(id);
        }
    }

    let entry_set: FxHashSet<BlockId> = entries.iter().copied().collect();
    let mut regions: Vec<SharedEhRegion> = Vec::new();
    let mut region_of_entry: FxHashMap<BlockId, usize> = FxHashMap::default();
    let mut region_of_block: FxHashMap<BlockId, usize> = FxHashMap::default();

    for &entry in &entries {
        let owner = task_of[entry.index()];
        let mut blocks = vec![entry];
        let mut member: FxHashSet<BlockId> = FxHashSet::default();
        member.insert(entry);
        let mut worklist = vec![entry];
        while let Some(b) = worklist.pop() {
            for succ in successors(&func.block(b).terminator) {
                if entry_set.contains(&succ)
                    || task_of[succ.index()] != owner
                    || !dom.is_reachable(succ)
                {
                    continue;
                }
                if member.insert(succ) {
                    blocks.push(succ);
                    worklist.push(succ);
                }
            }
        }
        let in_edges: Vec<BlockId> = preds[entry.index()]
            .iter()
            .copied()
            .filter(|p| !member.contains(p))
            .collect();
        let region_idx = regions.len();
        region_of_entry.insert(entry, region_idx);
        for &b in &blocks {
            region_of_block.insert(b, region_idx);
        }
        regions.push(SharedEhRegion {
            entry,
            blocks,
            in_edges,
            owner,
        });
    }

    let mut region_succs: Vec<Vec<usize>> = vec![Vec::new(); regions.len()];
    for (i, region) in regions.iter().enumerate() {
        let mut seen = FxHashSet::default();
        for &b in &region.blocks {
            for succ in successors(&func.block(b).terminator) {
                if let Some(&j) = region_of_entry.get(&succ) {
                    if j != i && seen.insert(j) {
                        region_succs[i].push(j);
                    }
                }
            }
        }
    }

    (regions, region_of_entry, region_of_block, region_succs)
}

/// Blocks of `region` terminated by a detached rethrow, in member order.
pub fn detached_rethrows_in(func: &Function, region: &SharedEhRegion) -> Vec<BlockId> {
    region
        .blocks
        .iter()
        .copied()
        .filter(|b| matches!(func.block(*b).terminator, Terminator::DetachedRethrow { .. }))
        .collect()
}
