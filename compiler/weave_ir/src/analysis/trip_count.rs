//! Static loop trip-count estimation.
//!
//! Recognizes the canonical counted-loop shape — an induction phi in the
//! header, a constant positive step, and a compare-and-branch against a
//! limit — and classifies the trip count as a compile-time constant, an
//! expression computable from values already available at the preheader,
//! or unknown. Anything fancier degrades to [`TripCount::Unknown`]; the
//! instrumenter passes a sentinel in that case rather than guessing.

use rustc_hash::FxHashMap;

use super::{DomTree, Loop};
use crate::ir::{
    BinOpKind, BlockId, Const, Function, ICmpPred, Instr, InstrId, Operand, Terminator,
};

/// Result of trip-count analysis for one loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TripCount {
    /// Exact compile-time iteration count.
    Constant(u64),
    /// `limit - init`, both operands available at the loop preheader
    /// (unit-step loops only).
    Computable { init: Operand, limit: Operand },
    /// Not statically determined.
    Unknown,
}

/// Analyze the trip count of `l`.
pub fn loop_trip_count(func: &Function, l: &Loop, dom: &DomTree) -> TripCount {
    let Some(preheader) = l.preheader(func) else {
        return TripCount::Unknown;
    };
    let [latch] = l.latches.as_slice() else {
        return TripCount::Unknown;
    };

    // The compare-and-branch may sit in the header (while shape) or in
    // the latch (do-while shape); only the header shape is counted here.
    let Terminator::CondBr {
        cond: Operand::Instr(cmp),
        then_dest,
        else_dest,
    } = func.block(l.header).terminator
    else {
        return TripCount::Unknown;
    };
    let true_continues = match (l.contains(then_dest), l.contains(else_dest)) {
        (true, false) => true,
        (false, true) => false,
        _ => return TripCount::Unknown,
    };

    let Instr::ICmp { pred, lhs, rhs } = *func.instr(cmp) else {
        return TripCount::Unknown;
    };
    let pred = if true_continues { pred } else { invert(pred) };

    // Find the induction phi: incoming `init` from the preheader and a
    // constant-step increment from the latch.
    let Some((phi, init, step)) = induction_phi(func, l.header, preheader, *latch) else {
        return TripCount::Unknown;
    };
    if lhs != Operand::Instr(phi) {
        return TripCount::Unknown;
    }
    let limit = rhs;

    if let (Operand::Const(Const::Int { value: a, .. }), Operand::Const(Const::Int { value: b, .. })) =
        (init, limit)
    {
        return constant_count(pred, a, b, step);
    }

    // Unit-step loops whose bounds are already available at the
    // preheader can be materialized as `limit - init`.
    let defs = def_blocks(func);
    if step == 1
        && matches!(pred, ICmpPred::Ult | ICmpPred::Slt | ICmpPred::Ne)
        && available_at(dom, &defs, preheader, init)
        && available_at(dom, &defs, preheader, limit)
    {
        return TripCount::Computable { init, limit };
    }

    TripCount::Unknown
}

/// The header's induction phi: `(phi, init operand, step)`.
fn induction_phi(
    func: &Function,
    header: BlockId,
    preheader: BlockId,
    latch: BlockId,
) -> Option<(InstrId, Operand, i64)> {
    for &id in &func.block(header).instrs {
        let Instr::Phi { incoming, .. } = func.instr(id) else {
            break;
        };
        let init = incoming
            .iter()
            .find(|(pred, _)| *pred == preheader)
            .map(|(_, v)| *v)?;
        let next = incoming
            .iter()
            .find(|(pred, _)| *pred == latch)
            .map(|(_, v)| *v)?;
        let Operand::Instr(next_id) = next else {
            continue;
        };
        let Instr::BinOp {
            op: BinOpKind::Add,
            lhs,
            rhs,
            ..
        } = func.instr(next_id)
        else {
            continue;
        };
        let step = match (*lhs, *rhs) {
            (l, Operand::Const(Const::Int { value, .. })) if l == Operand::Instr(id) => value,
            (Operand::Const(Const::Int { value, .. }), r) if r == Operand::Instr(id) => value,
            _ => continue,
        };
        if step > 0 {
            return Some((id, init, step));
        }
    }
    None
}

fn constant_count(pred: ICmpPred, init: i64, limit: i64, step: i64) -> TripCount {
    let span = match pred {
        ICmpPred::Ult | ICmpPred::Slt => limit.saturating_sub(init),
        ICmpPred::Ule | ICmpPred::Sle => limit.saturating_sub(init).saturating_add(1),
        ICmpPred::Ne => {
            let span = limit.wrapping_sub(init);
            if span >= 0 && span % step == 0 {
                span
            } else {
                return TripCount::Unknown;
            }
        }
        _ => return TripCount::Unknown,
    };
    if span <= 0 {
        return TripCount::Constant(0);
    }
    #[expect(clippy::cast_sign_loss, reason = "span and step are positive here")]
    let count = ((span + step - 1) / step) as u64;
    TripCount::Constant(count)
}

fn invert(pred: ICmpPred) -> ICmpPred {
    match pred {
        ICmpPred::Eq => ICmpPred::Ne,
        ICmpPred::Ne => ICmpPred::Eq,
        ICmpPred::Ult => ICmpPred::Uge,
        ICmpPred::Ule => ICmpPred::Ugt,
        ICmpPred::Ugt => ICmpPred::Ule,
        ICmpPred::Uge => ICmpPred::Ult,
        ICmpPred::Slt => ICmpPred::Sge,
        ICmpPred::Sle => ICmpPred::Sgt,
        ICmpPred::Sgt => ICmpPred::Sle,
        ICmpPred::Sge => ICmpPred::Slt,
    }
}

/// True if `operand`'s value is already available at `at`: constants,
/// parameters, globals, and instructions defined in blocks dominating
/// `at`.
fn available_at(
    dom: &DomTree,
    defs: &FxHashMap<InstrId, BlockId>,
    at: BlockId,
    operand: Operand,
) -> bool {
    match operand {
        Operand::Const(_) | Operand::Param(_) | Operand::Global(_) | Operand::Func(_) => true,
        Operand::Instr(id) => defs
            .get(&id)
            .is_some_and(|def| *def == at || dom.dominates(*def, at)),
    }
}

/// Map each placed instruction to its block.
fn def_blocks(func: &Function) -> FxHashMap<InstrId, BlockId> {
    let mut map = FxHashMap::default();
    for (idx, block) in func.blocks.iter().enumerate() {
        #[expect(clippy::cast_possible_truncation, reason = "block counts fit in u32")]
        let id = BlockId::new(idx as u32);
        for &instr in &block.instrs {
            map.insert(instr, id);
        }
        if let Terminator::Invoke { call, .. } = block.terminator {
            map.insert(call, id);
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::LoopForest;
    use crate::ir::{Block, Terminator, Ty};
    use crate::name::Name;

    /// `for (i = init; i < limit; i += 1)` with operand bounds.
    fn counted_loop(init: Operand, limit: Operand) -> Function {
        let mut func = Function::new(Name::EMPTY, vec![Ty::I64], Ty::Void);
        let preheader = func.add_block(Block {
            instrs: vec![],
            terminator: Terminator::Br {
                dest: BlockId::new(2),
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

        let phi = func.alloc_instr(
            Instr::Phi {
                ty: Ty::I64,
                incoming: vec![],
            },
            None,
        );
        let next = func.alloc_instr(
            Instr::BinOp {
                op: BinOpKind::Add,
                ty: Ty::I64,
                lhs: Operand::Instr(phi),
                rhs: Operand::i64(1),
            },
            None,
        );
        if let Instr::Phi { incoming, .. } = func.instr_mut(phi) {
            *incoming = vec![(preheader, init), (latch, Operand::Instr(next))];
        }
        let cmp = func.alloc_instr(
            Instr::ICmp {
                pred: ICmpPred::Ult,
                lhs: Operand::Instr(phi),
                rhs: limit,
            },
            None,
        );
        func.block_mut(header).instrs = vec![phi, cmp];
        func.block_mut(latch).instrs = vec![next];
        func.block_mut(header).terminator = Terminator::CondBr {
            cond: Operand::Instr(cmp),
            then_dest: latch,
            else_dest: exit,
        };
        func
    }

    fn analyze(func: &Function) -> TripCount {
        let dom = DomTree::compute(func);
        let forest = LoopForest::compute(func, &dom);
        assert_eq!(forest.loops.len(), 1);
        loop_trip_count(func, &forest.loops[0], &dom)
    }

    #[test]
    fn constant_bounds_give_constant_count() {
        let func = counted_loop(Operand::i64(0), Operand::i64(10));
        assert_eq!(analyze(&func), TripCount::Constant(10));
    }

    #[test]
    fn empty_range_is_zero() {
        let func = counted_loop(Operand::i64(10), Operand::i64(10));
        assert_eq!(analyze(&func), TripCount::Constant(0));
    }

    #[test]
    fn parameter_limit_is_computable() {
        let func = counted_loop(Operand::i64(0), Operand::Param(0));
        assert_eq!(
            analyze(&func),
            TripCount::Computable {
                init: Operand::i64(0),
                limit: Operand::Param(0),
            }
        );
    }

    #[test]
    fn loop_carried_limit_is_unknown() {
        // Use the phi itself as the limit: defined inside the loop, so
        // not available at the preheader.
        let mut func = counted_loop(Operand::i64(0), Operand::i64(1));
        // Rewrite the compare to reference the phi on both sides.
        let header = BlockId::new(2);
        let phi = func.block(header).instrs[0];
        let cmp = func.block(header).instrs[1];
        if let Instr::ICmp { rhs, .. } = func.instr_mut(cmp) {
            *rhs = Operand::Instr(phi);
        }
        assert_eq!(analyze(&func), TripCount::Unknown);
    }
}
