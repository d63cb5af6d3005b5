//! CFG surgery: block and edge splitting.
//!
//! The canonicalizer rewrites graphs with these primitives. All of them
//! keep arena `InstrId`s stable (instructions move between blocks as
//! indices) and patch phi incoming lists so no reference dangles — the
//! reason this IR is an arena in the first place.

use rustc_hash::FxHashSet;

use crate::graph::successors;
use crate::ir::{Block, BlockId, Function, Instr, Operand, Terminator};

/// Split `block` in two at `at_index`: instructions `at_index..` and the
/// terminator move to a new block, and `block` falls through to it.
///
/// Phi edges in the moved terminator's successors are retargeted from
/// `block` to the new block. Returns the new block.
pub fn split_block(func: &mut Function, block: BlockId, at_index: usize) -> BlockId {
    let tail: Vec<_> = func.block_mut(block).instrs.split_off(at_index);
    let terminator = std::mem::replace(
        &mut func.block_mut(block).terminator,
        Terminator::Unreachable,
    );

    let new_block = func.add_block(Block {
        instrs: tail,
        terminator,
    });
    func.block_mut(block).terminator = Terminator::Br { dest: new_block };

    // The moved terminator's successors now see `new_block` as their
    // predecessor on those edges.
    for succ in successors(&func.block(new_block).terminator.clone()) {
        rename_phi_edges(func, succ, block, new_block);
    }

    new_block
}

/// Split the listed predecessors of `block` off into a new forwarding
/// block, so `block` is left with predecessors of the remaining classes.
///
/// Mirrors the shape the canonicalizer needs:
///
/// - ordinary blocks: a new block takes the listed predecessors and
///   branches to `block`; returns `block` (which keeps the remaining
///   predecessors, ready for further splitting). If `block` is a
///   placeholder (`unreachable` and no real instructions), the new block
///   terminates in `unreachable` instead, preserving the deadness
///   invariant of fork placeholder blocks.
/// - landing pads: both predecessor groups move into new landing pads
///   that branch to `block`; `block`'s pad marker is replaced by a phi of
///   the two new pad values and it stops being a landing pad. Returns the
///   new block holding the *remaining* predecessors.
///
/// # Panics
///
/// Panics if `preds` is empty.
pub fn split_predecessors(func: &mut Function, block: BlockId, preds: &[BlockId]) -> BlockId {
    assert!(!preds.is_empty(), "split_predecessors: empty predecessor list");

    if func.block_is_landing_pad(block) {
        return split_landing_pad_predecessors(func, block, preds);
    }

    let placeholder = func.is_placeholder_block(block);
    let terminator = if placeholder {
        Terminator::Unreachable
    } else {
        Terminator::Br { dest: block }
    };
    let new_block = func.add_block(Block {
        instrs: vec![],
        terminator,
    });

    for &pred in preds {
        func.block_mut(pred).terminator.retarget(block, new_block);
    }

    if placeholder {
        // The forwarding block never reaches `block`; drop the moved
        // edges from its phis entirely.
        remove_phi_edges(func, block, preds);
    } else {
        hoist_phi_edges(func, block, preds, new_block);
    }

    block
}

/// Landing-pad variant of [`split_predecessors`]; see there.
fn split_landing_pad_predecessors(
    func: &mut Function,
    block: BlockId,
    preds: &[BlockId],
) -> BlockId {
    let pad_slot = func
        .block(block)
        .instrs
        .iter()
        .copied()
        .find(|id| matches!(func.instr(*id), Instr::LandingPad { .. }))
        .unwrap_or_else(|| panic!("block {} is not a landing pad", block.raw()));
    let pad_ty = match func.instr(pad_slot) {
        Instr::LandingPad { ty } => ty.clone(),
        _ => unreachable!(),
    };

    let pred_set: FxHashSet<BlockId> = preds.iter().copied().collect();
    let all_preds = crate::graph::predecessors(func);
    let remaining: Vec<BlockId> = all_preds[block.index()]
        .iter()
        .copied()
        .filter(|p| !pred_set.contains(p))
        .collect();
    assert!(
        !remaining.is_empty(),
        "splitting every predecessor off a landing pad leaves it unreachable"
    );

    let make_pad = |func: &mut Function, group: &[BlockId]| {
        let pad = func.alloc_instr(Instr::LandingPad { ty: pad_ty.clone() }, None);
        let new_block = func.add_block(Block {
            instrs: vec![pad],
            terminator: Terminator::Br { dest: block },
        });
        for &pred in group {
            func.block_mut(pred).terminator.retarget(block, new_block);
        }
        hoist_phi_edges(func, block, group, new_block);
        (new_block, pad)
    };

    let (split_bb, split_pad) = make_pad(func, preds);
    let (rest_bb, rest_pad) = make_pad(func, &remaining);

    // The original block keeps the pad's value slot, but it becomes a
    // phi over the two new pads; the block is no longer a landing pad.
    *func.instr_mut(pad_slot) = Instr::Phi {
        ty: pad_ty,
        incoming: vec![
            (split_bb, Operand::Instr(split_pad)),
            (rest_bb, Operand::Instr(rest_pad)),
        ],
    };

    rest_bb
}

/// True when an edge `pred -> dest` is critical: `pred` has several
/// successors and `dest` has several predecessors.
pub fn is_critical_edge(func: &Function, pred: BlockId, dest: BlockId) -> bool {
    let out = successors(&func.block(pred).terminator);
    if out.len() < 2 {
        return false;
    }
    crate::graph::predecessors(func)[dest.index()].len() > 1
}

/// Split the edge `pred -> dest` by interposing a forwarding block.
/// Every edge slot from `pred` to `dest` is redirected. Returns the new
/// block.
pub fn split_edge(func: &mut Function, pred: BlockId, dest: BlockId) -> BlockId {
    let new_block = func.add_block(Block {
        instrs: vec![],
        terminator: Terminator::Br { dest },
    });
    func.block_mut(pred).terminator.retarget(dest, new_block);
    rename_phi_edges(func, dest, pred, new_block);
    new_block
}

// ── Phi maintenance ─────────────────────────────────────────────────

/// In `block`'s phis, rename incoming edges from `old_pred` to
/// `new_pred`.
fn rename_phi_edges(func: &mut Function, block: BlockId, old_pred: BlockId, new_pred: BlockId) {
    let phi_slots: Vec<_> = leading_phis(func, block);
    for slot in phi_slots {
        if let Instr::Phi { incoming, .. } = func.instr_mut(slot) {
            for (pred, _) in incoming.iter_mut() {
                if *pred == old_pred {
                    *pred = new_pred;
                }
            }
        }
    }
}

/// In `block`'s phis, drop incoming edges from any of `preds`.
fn remove_phi_edges(func: &mut Function, block: BlockId, preds: &[BlockId]) {
    let pred_set: FxHashSet<BlockId> = preds.iter().copied().collect();
    let phi_slots: Vec<_> = leading_phis(func, block);
    for slot in phi_slots {
        if let Instr::Phi { incoming, .. } = func.instr_mut(slot) {
            incoming.retain(|(pred, _)| !pred_set.contains(pred));
        }
    }
}

/// In `block`'s phis, collapse incoming edges from `preds` into a single
/// edge from `via` — hoisting a new phi into `via` when the moved edges
/// carry more than one distinct value.
fn hoist_phi_edges(func: &mut Function, block: BlockId, preds: &[BlockId], via: BlockId) {
    let pred_set: FxHashSet<BlockId> = preds.iter().copied().collect();
    let phi_slots: Vec<_> = leading_phis(func, block);
    for slot in phi_slots {
        let (ty, moved, kept) = match func.instr(slot) {
            Instr::Phi { ty, incoming } => {
                let (moved, kept): (Vec<_>, Vec<_>) = incoming
                    .iter()
                    .copied()
                    .partition(|(pred, _)| pred_set.contains(pred));
                (ty.clone(), moved, kept)
            }
            _ => continue,
        };
        if moved.is_empty() {
            continue;
        }
        let via_value = if moved.len() == 1 || moved.iter().all(|(_, v)| *v == moved[0].1) {
            moved[0].1
        } else {
            let hoisted = func.alloc_instr(
                Instr::Phi {
                    ty,
                    incoming: moved,
                },
                None,
            );
            func.block_mut(via).instrs.insert(0, hoisted);
            Operand::Instr(hoisted)
        };
        let mut incoming = kept;
        incoming.push((via, via_value));
        if let Instr::Phi {
            incoming: dest_incoming,
            ..
        } = func.instr_mut(slot)
        {
            *dest_incoming = incoming;
        }
    }
}

/// Arena slots of the phis at the front of `block`.
fn leading_phis(func: &Function, block: BlockId) -> Vec<crate::ir::InstrId> {
    func.block(block)
        .instrs
        .iter()
        .copied()
        .take_while(|id| matches!(func.instr(*id), Instr::Phi { .. } | Instr::LandingPad { .. }))
        .filter(|id| matches!(func.instr(*id), Instr::Phi { .. }))
        .collect()
}
