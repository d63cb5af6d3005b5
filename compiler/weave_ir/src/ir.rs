//! WEAVE IR — arena-based basic-block program representation.
//!
//! The instrumentation engine mutates a program's control-flow graph in
//! place: splitting blocks, inserting hook calls, synthesizing phi joins.
//! To keep references stable across that surgery, everything is addressed
//! by index into per-function arenas:
//!
//! - **[`Function`]** — owns an instruction arena (`instrs`) and a block
//!   list (`blocks`). An [`InstrId`] is an index into the arena and never
//!   moves; blocks hold ordered lists of `InstrId`s, so moving an
//!   instruction between blocks moves an index, not the instruction.
//! - **[`Instr`]** — a closed tagged variant over every operation the
//!   engine must recognize. An instruction *is* its value: operands name
//!   producing instructions by `InstrId`.
//! - **[`Terminator`]** — block exits, including the fork/join terminators
//!   (`Detach`/`Reattach`/`Sync`) and their exception-path companions.
//! - **[`Module`]** — one compilation unit: functions, globals, the
//!   interner, and the global-constructor list.

use crate::debug::{DebugLoc, Subprogram};
use crate::name::{Interner, Name};
pub use crate::ty::Ty;

// ── ID newtypes ─────────────────────────────────────────────────────

macro_rules! id_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
        #[repr(transparent)]
        pub struct $name(u32);

        impl $name {
            /// Create a new ID from a raw index.
            #[inline]
            pub const fn new(raw: u32) -> Self {
                Self(raw)
            }

            /// Get the raw `u32` value.
            #[inline]
            pub const fn raw(self) -> u32 {
                self.0
            }

            /// Get the index as `usize` (for indexing into `Vec`s).
            #[inline]
            pub const fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

id_newtype! {
    /// Instruction ID — an index into a function's instruction arena.
    ///
    /// Stable for the function's lifetime: surgery moves IDs between
    /// blocks but never reindexes the arena.
    InstrId
}

id_newtype! {
    /// Basic block ID within a function. Blocks are appended, never
    /// removed, so IDs are stable across CFG surgery.
    BlockId
}

id_newtype! {
    /// Function ID within a module.
    FuncId
}

id_newtype! {
    /// Global variable ID within a module.
    GlobalId
}

// ── Constants and operands ──────────────────────────────────────────

/// A compile-time constant operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
pub enum Const {
    /// Integer constant of an explicit bit width.
    Int { bits: u32, value: i64 },
    /// Null pointer.
    Null,
}

impl Const {
    /// 64-bit integer constant.
    #[inline]
    pub const fn i64(value: i64) -> Const {
        Const::Int { bits: 64, value }
    }

    /// 32-bit integer constant.
    #[inline]
    pub const fn i32(value: i64) -> Const {
        Const::Int { bits: 32, value }
    }
}

/// An instruction operand.
///
/// Values are produced by instructions ([`Operand::Instr`]), function
/// parameters, addresses of module globals, or constants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
pub enum Operand {
    /// The value produced by an arena instruction.
    Instr(InstrId),
    /// The n-th function parameter.
    Param(u32),
    /// The address of a module global.
    Global(GlobalId),
    /// The address of a function.
    Func(FuncId),
    /// A constant.
    Const(Const),
}

impl Operand {
    /// 64-bit integer constant operand.
    #[inline]
    pub const fn i64(value: i64) -> Operand {
        Operand::Const(Const::i64(value))
    }

    /// Null pointer operand.
    pub const NULL: Operand = Operand::Const(Const::Null);
}

// ── Instruction payloads ────────────────────────────────────────────

/// Callee of a call: a known function by name, or a computed address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
pub enum Callee {
    Direct(Name),
    Indirect(Operand),
}

/// Memory-transfer intrinsic kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
pub enum MemIntrinsicKind {
    MemSet,
    MemCpy,
    MemMove,
}

/// Integer binary operations the engine emits (id arithmetic, size
/// computations, trip counts).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
pub enum BinOpKind {
    Add,
    Sub,
    Mul,
    UDiv,
}

/// Integer comparison predicates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
pub enum ICmpPred {
    Eq,
    Ne,
    Ult,
    Ule,
    Ugt,
    Uge,
    Slt,
    Sle,
    Sgt,
    Sge,
}

/// Cast kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
pub enum CastKind {
    ZExt,
    Trunc,
    PtrToInt,
    IntToPtr,
}

/// Synchronization scope of an atomic access.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
pub enum SyncScope {
    /// Visible to the current thread only — not a cross-thread
    /// synchronization point.
    SingleThread,
    /// Visible system-wide.
    System,
}

// ── Instructions ────────────────────────────────────────────────────

/// A single instruction.
///
/// Closed variant set: adding an operation kind is a compile error until
/// every instrumenter that matches on instructions handles it.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
pub enum Instr {
    /// SSA merge: one incoming operand per predecessor edge. Phis appear
    /// only at the front of a block's instruction list.
    Phi {
        ty: Ty,
        incoming: Vec<(BlockId, Operand)>,
    },

    /// Landing-pad marker: first non-phi instruction of a block reached
    /// by unwind edges. Produces the exception payload.
    LandingPad { ty: Ty },

    /// Memory read.
    Load {
        ty: Ty,
        addr: Operand,
        align: u32,
        /// Synchronization scope when the load is atomic.
        atomic: Option<SyncScope>,
        /// Reads a value that never changes after unit initialization
        /// (identifier base cells).
        invariant: bool,
        /// The access goes through a virtual-table pointer (front-end
        /// aliasing metadata).
        vtable: bool,
    },

    /// Memory write.
    Store {
        ty: Ty,
        value: Operand,
        addr: Operand,
        align: u32,
        atomic: Option<SyncScope>,
        vtable: bool,
    },

    /// Stack allocation. `count` is the dynamic element count for array
    /// allocas; `None` means a single element.
    Alloca { ty: Ty, count: Option<Operand> },

    /// Function call that cannot unwind out of its block. Calls that can
    /// throw are modeled by [`Terminator::Invoke`].
    Call {
        callee: Callee,
        args: Vec<Operand>,
        ret: Ty,
        no_return: bool,
    },

    /// Atomic read-modify-write.
    AtomicRmw { addr: Operand, value: Operand },

    /// Atomic compare-and-exchange.
    CmpXchg {
        addr: Operand,
        expected: Operand,
        replacement: Operand,
    },

    /// Memory fence.
    Fence,

    /// memset/memcpy/memmove in intrinsic form. The memory instrumenter
    /// rewrites these into plain calls so a runtime can interpose them.
    MemIntrinsic {
        kind: MemIntrinsicKind,
        dst: Operand,
        /// Source pointer (transfer intrinsics).
        src: Option<Operand>,
        /// Fill byte (memset).
        value: Option<Operand>,
        len: Operand,
    },

    /// Integer arithmetic.
    BinOp {
        op: BinOpKind,
        ty: Ty,
        lhs: Operand,
        rhs: Operand,
    },

    /// Integer comparison, produces `i1`.
    ICmp {
        pred: ICmpPred,
        lhs: Operand,
        rhs: Operand,
    },

    /// Width or representation cast.
    Cast {
        kind: CastKind,
        ty: Ty,
        value: Operand,
    },

    /// Pointer offset computation. Only the base participates in the
    /// engine's address analyses.
    Gep {
        base: Operand,
        indices: Vec<Operand>,
    },

    /// Start of a fork/join synchronization region; produces a token
    /// referenced by `Detach`/`Reattach`/`Sync` terminators.
    SyncRegionStart,

    /// Create a task frame token.
    TaskFrameCreate,

    /// Placeholder marking a detached block as using a task frame.
    TaskFrameUse { frame: Operand },
}

impl Instr {
    /// The type of the value this instruction produces, or `None` for
    /// pure side effects.
    pub fn result_ty(&self) -> Option<Ty> {
        match self {
            Instr::Phi { ty, .. }
            | Instr::LandingPad { ty }
            | Instr::Load { ty, .. }
            | Instr::BinOp { ty, .. }
            | Instr::Cast { ty, .. } => Some(ty.clone()),
            Instr::Call { ret, .. } => {
                if *ret == Ty::Void {
                    None
                } else {
                    Some(ret.clone())
                }
            }
            Instr::Alloca { .. } | Instr::Gep { .. } => Some(Ty::Ptr),
            Instr::ICmp { .. } => Some(Ty::I1),
            Instr::AtomicRmw { .. } | Instr::CmpXchg { .. } => Some(Ty::I64),
            Instr::SyncRegionStart | Instr::TaskFrameCreate => Some(Ty::Token),
            Instr::Store { .. }
            | Instr::Fence
            | Instr::MemIntrinsic { .. }
            | Instr::TaskFrameUse { .. } => None,
        }
    }

    /// True for calls (direct or indirect), the construct the call-site
    /// instrumenter iterates over.
    pub fn is_call(&self) -> bool {
        matches!(self, Instr::Call { .. })
    }

    /// True for structural markers that represent no code after
    /// lowering: never instrumented, never counted, never terminate
    /// blocks.
    pub fn is_placeholder(&self) -> bool {
        matches!(
            self,
            Instr::SyncRegionStart | Instr::TaskFrameCreate | Instr::TaskFrameUse { .. }
        )
    }

    /// Direct callee name, if this is a direct call.
    pub fn direct_callee(&self) -> Option<Name> {
        match self {
            Instr::Call {
                callee: Callee::Direct(name),
                ..
            } => Some(*name),
            _ => None,
        }
    }
}

// ── Terminators ─────────────────────────────────────────────────────

/// How control leaves a basic block.
///
/// The fork/join terminators follow the detach/reattach/sync model: a
/// `Detach` spawns `task` and continues at `continuation`; `Reattach`
/// ends a task body; `Sync` waits on every outstanding task in its
/// region. `DetachedRethrow`, `TaskFrameResume`, and `SyncUnwind` are the
/// exception-path companions — their `placeholder`/`normal` successors
/// carry structural information only ([`Terminator::DetachedRethrow`]'s
/// placeholder block is unreachable by construction).
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
pub enum Terminator {
    Br {
        dest: BlockId,
    },
    CondBr {
        cond: Operand,
        then_dest: BlockId,
        else_dest: BlockId,
    },
    Switch {
        value: Operand,
        default: BlockId,
        cases: Vec<(i64, BlockId)>,
    },
    Ret {
        value: Option<Operand>,
    },
    /// Call that may unwind. The call payload lives in the instruction
    /// arena (so it has a stable identity for identifier tables) but is
    /// not a member of any block's instruction list.
    Invoke {
        call: InstrId,
        normal: BlockId,
        unwind: BlockId,
    },
    /// Continue unwinding out of the function.
    Resume {
        value: Option<Operand>,
    },
    Unreachable,
    /// Fork: spawn `task` as a parallel child; the spawning thread
    /// continues at `continuation`.
    Detach {
        task: BlockId,
        continuation: BlockId,
        unwind: Option<BlockId>,
        sync_region: InstrId,
    },
    /// Normal exit of a spawned task body.
    Reattach {
        continuation: BlockId,
        sync_region: InstrId,
    },
    /// Join: wait for every outstanding task of `sync_region`.
    Sync {
        continuation: BlockId,
        sync_region: InstrId,
    },
    /// Exceptional exit of a spawned task body.
    DetachedRethrow {
        sync_region: InstrId,
        placeholder: BlockId,
        unwind: BlockId,
    },
    /// Exceptional continuation through a task frame.
    TaskFrameResume {
        frame: Operand,
        placeholder: BlockId,
        unwind: BlockId,
    },
    /// Join that may itself unwind (exceptions raised by joined tasks).
    SyncUnwind {
        sync_region: InstrId,
        normal: BlockId,
        unwind: BlockId,
    },
}

impl Terminator {
    /// Rewrite every successor edge equal to `from` into `to`.
    ///
    /// Used by CFG surgery when predecessors are redirected through a
    /// new forwarding block.
    pub fn retarget(&mut self, from: BlockId, to: BlockId) {
        let patch = |b: &mut BlockId| {
            if *b == from {
                *b = to;
            }
        };
        match self {
            Terminator::Br { dest } => patch(dest),
            Terminator::CondBr {
                then_dest,
                else_dest,
                ..
            } => {
                patch(then_dest);
                patch(else_dest);
            }
            Terminator::Switch { default, cases, .. } => {
                patch(default);
                for (_, dest) in cases {
                    patch(dest);
                }
            }
            Terminator::Invoke { normal, unwind, .. } => {
                patch(normal);
                patch(unwind);
            }
            Terminator::Detach {
                task,
                continuation,
                unwind,
                ..
            } => {
                patch(task);
                patch(continuation);
                if let Some(u) = unwind {
                    patch(u);
                }
            }
            Terminator::Reattach { continuation, .. } | Terminator::Sync { continuation, .. } => {
                patch(continuation);
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
            } => {
                patch(placeholder);
                patch(unwind);
            }
            Terminator::SyncUnwind { normal, unwind, .. } => {
                patch(normal);
                patch(unwind);
            }
            Terminator::Ret { .. } | Terminator::Resume { .. } | Terminator::Unreachable => {}
        }
    }
}

// ── Blocks ──────────────────────────────────────────────────────────

/// A basic block: an ordered list of arena instruction IDs plus a
/// terminator. Phis (and a landing-pad marker, if any) come first.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
pub struct Block {
    pub instrs: Vec<InstrId>,
    pub terminator: Terminator,
}

// ── Function attributes ─────────────────────────────────────────────

bitflags::bitflags! {
    /// Function-level attributes the instrumentation engine consults or
    /// invalidates.
    ///
    /// Inserted hook calls read and write global state, so memory-effect
    /// attributes are removed from every instrumented function.
    #[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
    pub struct FnAttrs: u32 {
        /// Reads memory but never writes it.
        const READ_ONLY = 1 << 0;
        /// Accesses no memory at all.
        const READ_NONE = 1 << 1;
        /// Accesses only memory reachable from its arguments.
        const ARG_MEM_ONLY = 1 << 2;
        /// Accesses only memory invisible to the caller.
        const INACCESSIBLE_MEM_ONLY = 1 << 3;
        /// Never unwinds.
        const NO_THROW = 1 << 4;
    }
}

#[cfg(feature = "cache")]
impl serde::Serialize for FnAttrs {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.bits().serialize(serializer)
    }
}

#[cfg(feature = "cache")]
impl<'de> serde::Deserialize<'de> for FnAttrs {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(FnAttrs::from_bits_retain(u32::deserialize(deserializer)?))
    }
}

/// Linkage of a function or global.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
pub enum Linkage {
    External,
    Internal,
    Private,
    /// May be overridden by a definition in another unit; used for the
    /// per-callee identifier cells every unit can reference but only the
    /// owning unit's initializer writes.
    Weak,
}

// ── Functions ───────────────────────────────────────────────────────

/// A function: instruction arena, block list, and metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
pub struct Function {
    pub name: Name,
    pub params: Vec<Ty>,
    pub ret: Ty,
    pub linkage: Linkage,
    pub attrs: FnAttrs,
    /// Declarations have no blocks and are never instrumented.
    pub is_declaration: bool,
    /// Object-file section override, when the front end placed the
    /// function somewhere special (startup sections are skipped).
    pub section: Option<String>,
    /// Instruction arena. Indexed by [`InstrId`]; slots never move.
    pub instrs: Vec<Instr>,
    /// Debug location per arena slot, parallel to `instrs`.
    pub debug_locs: Vec<Option<DebugLoc>>,
    pub blocks: Vec<Block>,
    pub entry: BlockId,
    pub subprogram: Option<Subprogram>,
}

impl Function {
    /// Create an empty function definition with a single entry block
    /// terminated by `unreachable`.
    pub fn new(name: Name, params: Vec<Ty>, ret: Ty) -> Self {
        Function {
            name,
            params,
            ret,
            linkage: Linkage::External,
            attrs: FnAttrs::empty(),
            is_declaration: false,
            section: None,
            instrs: Vec::new(),
            debug_locs: Vec::new(),
            blocks: vec![Block {
                instrs: Vec::new(),
                terminator: Terminator::Unreachable,
            }],
            entry: BlockId::new(0),
            subprogram: None,
        }
    }

    /// Create a declaration (no body).
    pub fn declaration(name: Name, params: Vec<Ty>, ret: Ty) -> Self {
        Function {
            name,
            params,
            ret,
            linkage: Linkage::External,
            attrs: FnAttrs::empty(),
            is_declaration: true,
            section: None,
            instrs: Vec::new(),
            debug_locs: Vec::new(),
            blocks: Vec::new(),
            entry: BlockId::new(0),
            subprogram: None,
        }
    }

    /// Borrow an arena instruction.
    ///
    /// # Panics
    ///
    /// Panics if `id` is out of bounds.
    #[inline]
    pub fn instr(&self, id: InstrId) -> &Instr {
        &self.instrs[id.index()]
    }

    /// Mutably borrow an arena instruction.
    #[inline]
    pub fn instr_mut(&mut self, id: InstrId) -> &mut Instr {
        &mut self.instrs[id.index()]
    }

    /// Allocate an arena slot for `instr` without placing it in a block.
    pub fn alloc_instr(&mut self, instr: Instr, loc: Option<DebugLoc>) -> InstrId {
        let id = u32::try_from(self.instrs.len())
            .unwrap_or_else(|_| panic!("instruction count exceeds u32::MAX"));
        self.instrs.push(instr);
        self.debug_locs.push(loc);
        InstrId::new(id)
    }

    /// Append a new block; returns its ID.
    pub fn add_block(&mut self, block: Block) -> BlockId {
        let id = u32::try_from(self.blocks.len())
            .unwrap_or_else(|_| panic!("block count exceeds u32::MAX"));
        self.blocks.push(block);
        BlockId::new(id)
    }

    /// Borrow a block.
    #[inline]
    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    /// Mutably borrow a block.
    #[inline]
    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.index()]
    }

    /// The type of an operand's value.
    pub fn operand_ty(&self, operand: Operand) -> Ty {
        match operand {
            Operand::Instr(id) => self
                .instr(id)
                .result_ty()
                .unwrap_or_else(|| panic!("operand references void instruction {}", id.raw())),
            Operand::Param(i) => self.params[i as usize].clone(),
            Operand::Global(_) | Operand::Func(_) => Ty::Ptr,
            Operand::Const(Const::Int { bits, .. }) => Ty::Int(bits),
            Operand::Const(Const::Null) => Ty::Ptr,
        }
    }

    /// True if the block's leading instructions include a landing-pad
    /// marker (the block is reached by unwind edges).
    pub fn block_is_landing_pad(&self, block: BlockId) -> bool {
        self.block(block)
            .instrs
            .iter()
            .take_while(|id| {
                matches!(
                    self.instr(**id),
                    Instr::Phi { .. } | Instr::LandingPad { .. }
                )
            })
            .any(|id| matches!(self.instr(*id), Instr::LandingPad { .. }))
    }

    /// Index of the first position in `block` where ordinary instructions
    /// may be inserted: after phis and any landing-pad marker.
    pub fn first_insertion_index(&self, block: BlockId) -> usize {
        self.block(block)
            .instrs
            .iter()
            .take_while(|id| {
                matches!(
                    self.instr(**id),
                    Instr::Phi { .. } | Instr::LandingPad { .. }
                )
            })
            .count()
    }

    /// First debug location attached to any instruction in the block.
    pub fn first_debug_loc(&self, block: BlockId) -> Option<DebugLoc> {
        self.block(block)
            .instrs
            .iter()
            .find_map(|id| self.debug_locs[id.index()])
    }

    /// Debug location of an arena instruction.
    #[inline]
    pub fn debug_loc(&self, id: InstrId) -> Option<DebugLoc> {
        self.debug_locs[id.index()]
    }

    /// Set the debug location of an arena instruction.
    #[inline]
    pub fn set_debug_loc(&mut self, id: InstrId, loc: Option<DebugLoc>) {
        self.debug_locs[id.index()] = loc;
    }

    /// True if a block's body is empty of real instructions and it
    /// terminates in `unreachable` — the placeholder shape that follows
    /// detached-rethrow and task-frame-resume terminators.
    pub fn is_placeholder_block(&self, block: BlockId) -> bool {
        let b = self.block(block);
        matches!(b.terminator, Terminator::Unreachable)
            && b.instrs
                .iter()
                .all(|id| matches!(self.instr(*id), Instr::Phi { .. } | Instr::LandingPad { .. }))
    }
}

// ── Globals ─────────────────────────────────────────────────────────

/// Initializer expression for a global.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
pub enum ConstExpr {
    Int { bits: u32, value: i64 },
    Null,
    /// NUL-terminated string payload.
    Str(String),
    /// Address of another global.
    GlobalAddr(GlobalId),
    /// Address of a function.
    FuncAddr(FuncId),
    Struct(Vec<ConstExpr>),
    Array(Vec<ConstExpr>),
}

/// A module-level global variable.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
pub struct Global {
    pub name: Name,
    pub ty: Ty,
    pub init: Option<ConstExpr>,
    pub linkage: Linkage,
    pub constant: bool,
    pub thread_local: bool,
}

/// One entry of the module's global-constructor list: `func` runs at load
/// time, lower priorities first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
pub struct CtorEntry {
    pub priority: u16,
    pub func: FuncId,
}

// ── Modules ─────────────────────────────────────────────────────────

/// One compilation unit.
#[derive(Debug, Default)]
pub struct Module {
    /// Unit name (typically the source path).
    pub name: String,
    pub interner: Interner,
    pub functions: Vec<Function>,
    pub globals: Vec<Global>,
    /// Load-time constructors, run before user code in priority order.
    pub global_ctors: Vec<CtorEntry>,
}

impl Module {
    /// Create an empty module with the given unit name.
    pub fn new(name: impl Into<String>) -> Self {
        Module {
            name: name.into(),
            interner: Interner::new(),
            functions: Vec::new(),
            globals: Vec::new(),
            global_ctors: Vec::new(),
        }
    }

    /// Borrow a function.
    #[inline]
    pub fn func(&self, id: FuncId) -> &Function {
        &self.functions[id.index()]
    }

    /// Mutably borrow a function.
    #[inline]
    pub fn func_mut(&mut self, id: FuncId) -> &mut Function {
        &mut self.functions[id.index()]
    }

    /// Append a function; returns its ID.
    pub fn add_function(&mut self, func: Function) -> FuncId {
        let id = u32::try_from(self.functions.len())
            .unwrap_or_else(|_| panic!("function count exceeds u32::MAX"));
        self.functions.push(func);
        FuncId::new(id)
    }

    /// Find a function by name.
    pub fn function_by_name(&self, name: Name) -> Option<FuncId> {
        self.functions.iter().position(|f| f.name == name).map(|i| {
            #[expect(clippy::cast_possible_truncation, reason = "function counts fit in u32")]
            let id = i as u32;
            FuncId::new(id)
        })
    }

    /// Get an existing function declaration by name, or insert one with
    /// the given signature.
    pub fn get_or_insert_declaration(&mut self, name: Name, params: Vec<Ty>, ret: Ty) -> FuncId {
        if let Some(id) = self.function_by_name(name) {
            return id;
        }
        self.add_function(Function::declaration(name, params, ret))
    }

    /// Borrow a global.
    #[inline]
    pub fn global(&self, id: GlobalId) -> &Global {
        &self.globals[id.index()]
    }

    /// Mutably borrow a global.
    #[inline]
    pub fn global_mut(&mut self, id: GlobalId) -> &mut Global {
        &mut self.globals[id.index()]
    }

    /// Find a global by name.
    pub fn global_by_name(&self, name: Name) -> Option<GlobalId> {
        self.globals.iter().position(|g| g.name == name).map(|i| {
            #[expect(clippy::cast_possible_truncation, reason = "global counts fit in u32")]
            let id = i as u32;
            GlobalId::new(id)
        })
    }

    /// Append a global; returns its ID.
    pub fn add_global(&mut self, global: Global) -> GlobalId {
        let id = u32::try_from(self.globals.len())
            .unwrap_or_else(|_| panic!("global count exceeds u32::MAX"));
        self.globals.push(global);
        GlobalId::new(id)
    }

    /// Get an existing global by name or insert one built by `make`.
    pub fn get_or_insert_global(
        &mut self,
        name: Name,
        make: impl FnOnce(Name) -> Global,
    ) -> GlobalId {
        if let Some(id) = self.global_by_name(name) {
            return id;
        }
        self.add_global(make(name))
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_newtype_basics() {
        let i = InstrId::new(42);
        assert_eq!(i.raw(), 42);
        assert_eq!(i.index(), 42);
        assert!(BlockId::new(0) < BlockId::new(1));
        assert_eq!(std::mem::size_of::<InstrId>(), 4);
    }

    #[test]
    fn alloc_instr_is_sequential() {
        let mut func = Function::new(Name::EMPTY, vec![], Ty::Void);
        let a = func.alloc_instr(Instr::Fence, None);
        let b = func.alloc_instr(Instr::SyncRegionStart, None);
        assert_eq!(a, InstrId::new(0));
        assert_eq!(b, InstrId::new(1));
        assert_eq!(func.debug_locs.len(), 2);
    }

    #[test]
    fn operand_types() {
        let mut func = Function::new(Name::EMPTY, vec![Ty::Ptr, Ty::I32], Ty::Void);
        let load = func.alloc_instr(
            Instr::Load {
                ty: Ty::I64,
                addr: Operand::Param(0),
                align: 8,
                atomic: None,
                invariant: false,
                vtable: false,
            },
            None,
        );
        assert_eq!(func.operand_ty(Operand::Instr(load)), Ty::I64);
        assert_eq!(func.operand_ty(Operand::Param(1)), Ty::I32);
        assert_eq!(func.operand_ty(Operand::i64(3)), Ty::I64);
        assert_eq!(func.operand_ty(Operand::NULL), Ty::Ptr);
    }

    #[test]
    fn first_insertion_index_skips_phis_and_pad() {
        let mut func = Function::new(Name::EMPTY, vec![], Ty::Void);
        let phi = func.alloc_instr(
            Instr::Phi {
                ty: Ty::I64,
                incoming: vec![],
            },
            None,
        );
        let pad = func.alloc_instr(Instr::LandingPad { ty: Ty::Ptr }, None);
        let fence = func.alloc_instr(Instr::Fence, None);
        let entry = func.entry;
        func.block_mut(entry).instrs = vec![phi, pad, fence];
        assert_eq!(func.first_insertion_index(entry), 2);
        assert!(func.block_is_landing_pad(entry));
    }

    #[test]
    fn placeholder_block_shape() {
        let mut func = Function::new(Name::EMPTY, vec![], Ty::Void);
        let bb = func.add_block(Block {
            instrs: vec![],
            terminator: Terminator::Unreachable,
        });
        assert!(func.is_placeholder_block(bb));
        let fence = func.alloc_instr(Instr::Fence, None);
        func.block_mut(bb).instrs.push(fence);
        assert!(!func.is_placeholder_block(bb));
    }

    #[test]
    fn retarget_rewrites_all_edges() {
        let mut t = Terminator::CondBr {
            cond: Operand::i64(0),
            then_dest: BlockId::new(1),
            else_dest: BlockId::new(2),
        };
        t.retarget(BlockId::new(2), BlockId::new(5));
        assert_eq!(
            t,
            Terminator::CondBr {
                cond: Operand::i64(0),
                then_dest: BlockId::new(1),
                else_dest: BlockId::new(5),
            }
        );
    }

    #[test]
    fn module_get_or_insert_global_is_idempotent() {
        let mut module = Module::new("unit");
        let name = module.interner.intern("__weave_func_id_main");
        let a = module.get_or_insert_global(name, |name| Global {
            name,
            ty: Ty::I64,
            init: Some(ConstExpr::Int {
                bits: 64,
                value: -1,
            }),
            linkage: Linkage::Weak,
            constant: false,
            thread_local: false,
        });
        let b = module.get_or_insert_global(name, |_| panic!("must not be called"));
        assert_eq!(a, b);
        assert_eq!(module.globals.len(), 1);
    }

    #[cfg(feature = "cache")]
    #[test]
    fn function_roundtrips_through_bincode() {
        let mut func = Function::new(Name::EMPTY, vec![Ty::Ptr], Ty::I64);
        let entry = func.entry;
        let load = func.alloc_instr(
            Instr::Load {
                ty: Ty::I64,
                addr: Operand::Param(0),
                align: 8,
                atomic: None,
                invariant: false,
                vtable: false,
            },
            Some(crate::debug::DebugLoc { line: 4, col: 2 }),
        );
        func.block_mut(entry).instrs.push(load);
        func.block_mut(entry).terminator = Terminator::Ret {
            value: Some(Operand::Instr(load)),
        };
        func.attrs = FnAttrs::READ_ONLY | FnAttrs::NO_THROW;

        let bytes = bincode::serialize(&func).unwrap_or_else(|e| panic!("serialize failed: {e}"));
        let roundtripped: Function =
            bincode::deserialize(&bytes).unwrap_or_else(|e| panic!("deserialize failed: {e}"));
        assert_eq!(roundtripped, func);
    }

    #[test]
    fn declaration_lookup() {
        let mut module = Module::new("unit");
        let name = module.interner.intern("__weave_bb_entry");
        let a = module.get_or_insert_declaration(name, vec![Ty::I64, Ty::I64], Ty::Void);
        let b = module.get_or_insert_declaration(name, vec![Ty::I64, Ty::I64], Ty::Void);
        assert_eq!(a, b);
        assert!(module.func(a).is_declaration);
    }
}
