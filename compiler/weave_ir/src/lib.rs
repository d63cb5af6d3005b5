//! WEAVE IR — the program representation the instrumentation engine
//! transforms.
//!
//! This crate provides:
//!
//! - **The arena IR** ([`Module`], [`Function`], [`Block`], [`Instr`],
//!   [`Terminator`]) — blocks and instructions addressed by stable
//!   indices, so CFG surgery never dangles a reference.
//! - **Emission and surgery** ([`Cursor`], [`surgery`]) — positional
//!   instruction insertion plus the block/predecessor/critical-edge
//!   splitting primitives the canonicalizer is built from.
//! - **Graph queries** ([`graph`]) — predecessors, successors, reverse
//!   postorder, reachability.
//! - **Analysis collaborators** ([`analysis`]) — dominators, the natural
//!   loop forest, the fork/join task tree with shared exception regions,
//!   the allocation/free call recognizer, and trip-count estimation.
//!   These are pure query interfaces: the engine consumes them and never
//!   mutates them.
//!
//! # Crate dependencies
//!
//! No dependency on the instrumentation engine — `weave_instrument`
//! depends on this crate, not the other way around.

pub mod analysis;
pub mod builder;
pub mod debug;
pub mod graph;
pub mod ir;
pub mod name;
pub mod surgery;
pub mod ty;

pub use builder::Cursor;
pub use debug::{DebugLoc, Subprogram};
pub use ir::{
    BinOpKind, Block, BlockId, Callee, CastKind, Const, ConstExpr, CtorEntry, FnAttrs, FuncId,
    Function, Global, GlobalId, ICmpPred, Instr, InstrId, Linkage, MemIntrinsicKind, Module,
    Operand, SyncScope, Terminator,
};
pub use name::{Interner, Name};
pub use ty::Ty;
