//! Positional instruction emission.
//!
//! [`Cursor`] follows the "position at a block, emit instructions"
//! pattern: it holds a mutable borrow of a [`Function`], a block, and an
//! index into that block's instruction list. Each emitted instruction is
//! allocated in the arena, spliced in at the cursor, and the cursor
//! advances past it — so a sequence of `emit` calls appears in program
//! order before whatever the cursor originally pointed at.

use crate::debug::DebugLoc;
use crate::ir::{
    BinOpKind, BlockId, Callee, CastKind, Const, Function, Instr, InstrId, Operand,
};
use crate::name::Name;
use crate::ty::Ty;

/// Insertion point into a function's block, with a debug-location
/// register applied to everything emitted.
pub struct Cursor<'a> {
    func: &'a mut Function,
    block: BlockId,
    index: usize,
    loc: Option<DebugLoc>,
}

impl<'a> Cursor<'a> {
    /// Position at an explicit index within `block`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is past the end of the block's instruction list.
    pub fn at(func: &'a mut Function, block: BlockId, index: usize) -> Self {
        assert!(
            index <= func.block(block).instrs.len(),
            "cursor index {index} out of bounds in block {}",
            block.raw(),
        );
        Cursor {
            func,
            block,
            index,
            loc: None,
        }
    }

    /// Position at the block's first insertion point (after phis and any
    /// landing-pad marker).
    pub fn at_first_insertion(func: &'a mut Function, block: BlockId) -> Self {
        let index = func.first_insertion_index(block);
        Cursor {
            func,
            block,
            index,
            loc: None,
        }
    }

    /// Position immediately before the block's terminator.
    pub fn before_terminator(func: &'a mut Function, block: BlockId) -> Self {
        let index = func.block(block).instrs.len();
        Cursor {
            func,
            block,
            index,
            loc: None,
        }
    }

    /// Position immediately before an existing instruction in `block`.
    ///
    /// # Panics
    ///
    /// Panics if `instr` is not in `block`'s instruction list.
    pub fn before_instr(func: &'a mut Function, block: BlockId, instr: InstrId) -> Self {
        let index = func
            .block(block)
            .instrs
            .iter()
            .position(|id| *id == instr)
            .unwrap_or_else(|| {
                panic!(
                    "instruction {} not found in block {}",
                    instr.raw(),
                    block.raw()
                )
            });
        Cursor {
            func,
            block,
            index,
            loc: None,
        }
    }

    /// Position immediately after an existing instruction in `block`.
    ///
    /// # Panics
    ///
    /// Panics if `instr` is not in `block`'s instruction list.
    pub fn after_instr(func: &'a mut Function, block: BlockId, instr: InstrId) -> Self {
        let mut cursor = Cursor::before_instr(func, block, instr);
        cursor.index += 1;
        cursor
    }

    /// Set the debug location applied to subsequently emitted
    /// instructions.
    pub fn set_loc(&mut self, loc: Option<DebugLoc>) {
        self.loc = loc;
    }

    /// Borrow the underlying function.
    pub fn func(&self) -> &Function {
        self.func
    }

    /// Emit `instr` at the cursor and advance past it.
    pub fn emit(&mut self, instr: Instr) -> InstrId {
        let id = self.func.alloc_instr(instr, self.loc);
        self.func
            .block_mut(self.block)
            .instrs
            .insert(self.index, id);
        self.index += 1;
        id
    }

    // ── Convenience emitters ────────────────────────────────────

    /// Non-atomic load.
    pub fn load(&mut self, ty: Ty, addr: Operand) -> InstrId {
        let align = u32::try_from(ty.align_bytes()).unwrap_or(1);
        self.emit(Instr::Load {
            ty,
            addr,
            align,
            atomic: None,
            invariant: false,
            vtable: false,
        })
    }

    /// Load of a value that is invariant for the unit's lifetime
    /// (identifier base cells).
    pub fn load_invariant(&mut self, ty: Ty, addr: Operand) -> InstrId {
        let id = self.load(ty, addr);
        if let Instr::Load { invariant, .. } = self.func.instr_mut(id) {
            *invariant = true;
        }
        id
    }

    /// Non-atomic store.
    pub fn store(&mut self, ty: Ty, value: Operand, addr: Operand) -> InstrId {
        let align = u32::try_from(ty.align_bytes()).unwrap_or(1);
        self.emit(Instr::Store {
            ty,
            value,
            addr,
            align,
            atomic: None,
            vtable: false,
        })
    }

    /// Integer addition.
    pub fn add(&mut self, ty: Ty, lhs: Operand, rhs: Operand) -> InstrId {
        self.emit(Instr::BinOp {
            op: BinOpKind::Add,
            ty,
            lhs,
            rhs,
        })
    }

    /// Integer subtraction.
    pub fn sub(&mut self, ty: Ty, lhs: Operand, rhs: Operand) -> InstrId {
        self.emit(Instr::BinOp {
            op: BinOpKind::Sub,
            ty,
            lhs,
            rhs,
        })
    }

    /// Integer multiplication.
    pub fn mul(&mut self, ty: Ty, lhs: Operand, rhs: Operand) -> InstrId {
        self.emit(Instr::BinOp {
            op: BinOpKind::Mul,
            ty,
            lhs,
            rhs,
        })
    }

    /// Direct call.
    pub fn call(&mut self, callee: Name, args: Vec<Operand>, ret: Ty) -> InstrId {
        self.emit(Instr::Call {
            callee: Callee::Direct(callee),
            args,
            ret,
            no_return: false,
        })
    }

    /// Widen an integer operand to `i64`, emitting a zero-extension only
    /// when the operand is not already 64 bits wide. Integer constants
    /// are rewritten in place.
    pub fn zext_to_i64(&mut self, operand: Operand) -> Operand {
        if let Operand::Const(Const::Int { value, .. }) = operand {
            return Operand::i64(value);
        }
        if self.func.operand_ty(operand) == Ty::I64 {
            return operand;
        }
        Operand::Instr(self.emit(Instr::Cast {
            kind: CastKind::ZExt,
            ty: Ty::I64,
            value: operand,
        }))
    }
}
