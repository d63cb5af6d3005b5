//! Identifier tables.
//!
//! Every instrumented construct gets a *local id* from a per-kind table:
//! a dense counter starting at 0, idempotent per entity. At run time the
//! global id is `base + local`, where `base` lives in a per-unit global
//! cell patched when units are linked/loaded — so ids stay valid across
//! separately compiled units. Reads of the base cell are invariant
//! loads: the cell never changes once the unit is initialized.
//!
//! [`FrontEndTable`] additionally records source-location metadata per
//! id; [`SizeTable`] records static size facts per basic block.

use rustc_hash::FxHashMap;
use weave_ir::ir::{BlockId, ConstExpr, FuncId, Global, GlobalId, Instr, InstrId, Linkage, Operand, Terminator};
use weave_ir::{Cursor, Function, Module, Name, Ty};

/// Sentinel id for unknown targets and merge-point defaults.
pub const UNKNOWN_ID: i64 = -1;

/// Opaque, stable handle to a program point. Used only as a map key;
/// the tables never dereference it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntityRef {
    Function(FuncId),
    Block(FuncId, BlockId),
    Instr(FuncId, InstrId),
    /// A block's terminator (terminators live outside the instruction
    /// arena, so they are identified by their block).
    Terminator(FuncId, BlockId),
}

/// Dense entity → local-id map plus the unit-relocatable base cell.
#[derive(Debug)]
pub struct IdTable {
    next_id: u64,
    ids: FxHashMap<EntityRef, u64>,
    base: GlobalId,
}

impl IdTable {
    /// Create a table whose base cell is the i64 global `base_name`
    /// (internal linkage, initialized to 0, patched at load time).
    pub fn new(module: &mut Module, base_name: &str) -> Self {
        let name = module.interner.intern(base_name);
        let base = module.get_or_insert_global(name, |name| Global {
            name,
            ty: Ty::I64,
            init: Some(ConstExpr::Int { bits: 64, value: 0 }),
            linkage: Linkage::Internal,
            constant: false,
            thread_local: false,
        });
        IdTable {
            next_id: 0,
            ids: FxHashMap::default(),
            base,
        }
    }

    /// Assign (or look up) the local id of `entity`. Idempotent: the
    /// first call consumes the next counter value, later calls return
    /// the same id.
    pub fn get_or_assign(&mut self, entity: EntityRef) -> u64 {
        if let Some(&id) = self.ids.get(&entity) {
            return id;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.ids.insert(entity, id);
        id
    }

    /// Number of ids assigned.
    pub fn count(&self) -> u64 {
        self.next_id
    }

    /// The base-id cell.
    pub fn base_global(&self) -> GlobalId {
        self.base
    }

    /// Materialize the global id `base + local` at `cursor`: an
    /// invariant load of the base cell plus an addition.
    pub fn to_global_id(&self, local: u64, cursor: &mut Cursor<'_>) -> Operand {
        let base = cursor.load_invariant(Ty::I64, Operand::Global(self.base));
        #[expect(clippy::cast_possible_wrap, reason = "local ids stay far below i64::MAX")]
        let sum = cursor.add(Ty::I64, Operand::Instr(base), Operand::i64(local as i64));
        Operand::Instr(sum)
    }
}

// ── Front-end data ──────────────────────────────────────────────────

#[expect(clippy::cast_possible_wrap, reason = "lines and columns fit in i32")]
fn as_i32(value: u32) -> i32 {
    value as i32
}

/// Source-location metadata attached 1:1 with a local id. Absent
/// numeric fields use -1; absent strings are empty.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SourceLocRecord {
    pub name: Name,
    pub line: i32,
    pub col: i32,
    pub file: Name,
    pub directory: Name,
}

impl SourceLocRecord {
    /// Record for an id with no known source location.
    pub fn sentinel() -> Self {
        SourceLocRecord {
            name: Name::EMPTY,
            line: -1,
            col: -1,
            file: Name::EMPTY,
            directory: Name::EMPTY,
        }
    }
}

/// Identifier table with per-id source-location records.
#[derive(Debug)]
pub struct FrontEndTable {
    table: IdTable,
    records: FxHashMap<u64, SourceLocRecord>,
}

impl FrontEndTable {
    pub fn new(module: &mut Module, base_name: &str) -> Self {
        FrontEndTable {
            table: IdTable::new(module, base_name),
            records: FxHashMap::default(),
        }
    }

    /// Assign an id to a whole function, recording its subprogram
    /// location (or the module name as a fallback).
    pub fn add_function(&mut self, module: &mut Module, func_id: FuncId) -> u64 {
        let id = self.table.get_or_assign(EntityRef::Function(func_id));
        let record = match module.func(func_id).subprogram {
            Some(sp) => SourceLocRecord {
                name: sp.name,
                line: as_i32(sp.line),
                col: -1,
                file: sp.file,
                directory: sp.directory,
            },
            None => {
                let func_name = module.func(func_id).name;
                let file = module.interner.intern(&module.name.clone());
                SourceLocRecord {
                    name: func_name,
                    line: -1,
                    col: -1,
                    file,
                    directory: Name::EMPTY,
                }
            }
        };
        self.record_metadata(id, record);
        id
    }

    /// Assign an id to a basic block, using the first debug location in
    /// the block.
    pub fn add_block(&mut self, module: &mut Module, func_id: FuncId, block: BlockId) -> u64 {
        let id = self.table.get_or_assign(EntityRef::Block(func_id, block));
        let func = module.func(func_id);
        let record = match (func.first_debug_loc(block), func.subprogram) {
            (Some(loc), Some(sp)) => SourceLocRecord {
                name: sp.name,
                line: as_i32(loc.line),
                col: as_i32(loc.col),
                file: sp.file,
                directory: sp.directory,
            },
            _ => SourceLocRecord::sentinel(),
        };
        self.record_metadata(id, record);
        id
    }

    /// Assign an id to an arena instruction. `real_name` overrides the
    /// display name (callee names for call sites).
    pub fn add_instr(
        &mut self,
        module: &mut Module,
        func_id: FuncId,
        instr: InstrId,
        real_name: Option<Name>,
    ) -> u64 {
        let id = self.table.get_or_assign(EntityRef::Instr(func_id, instr));
        let loc = module.func(func_id).debug_loc(instr);
        let record = self.instr_record(module, func_id, loc, real_name);
        self.record_metadata(id, record);
        id
    }

    /// Assign an id to a block's terminator. Invoke terminators carry
    /// their call's debug location; others fall back to the subprogram.
    pub fn add_terminator(&mut self, module: &mut Module, func_id: FuncId, block: BlockId) -> u64 {
        let id = self
            .table
            .get_or_assign(EntityRef::Terminator(func_id, block));
        let func = module.func(func_id);
        let loc = match func.block(block).terminator {
            Terminator::Invoke { call, .. } => func.debug_loc(call),
            _ => None,
        };
        let record = self.instr_record(module, func_id, loc, None);
        self.record_metadata(id, record);
        id
    }

    fn instr_record(
        &self,
        module: &mut Module,
        func_id: FuncId,
        loc: Option<weave_ir::DebugLoc>,
        real_name: Option<Name>,
    ) -> SourceLocRecord {
        let func = module.func(func_id);
        match (loc, func.subprogram) {
            (Some(loc), Some(sp)) => SourceLocRecord {
                name: real_name.unwrap_or(sp.name),
                line: as_i32(loc.line),
                col: as_i32(loc.col),
                file: sp.file,
                directory: sp.directory,
            },
            (None, Some(sp)) => SourceLocRecord {
                name: real_name.unwrap_or(sp.name),
                line: as_i32(sp.line),
                col: -1,
                file: sp.file,
                directory: sp.directory,
            },
            (_, None) => {
                let func_name = func.name;
                let file = module.interner.intern(&module.name.clone());
                SourceLocRecord {
                    name: real_name.unwrap_or(func_name),
                    line: -1,
                    col: -1,
                    file,
                    directory: Name::EMPTY,
                }
            }
        }
    }

    /// Attach `record` to an already-assigned id. Requesting metadata
    /// for an id that does not exist is reported and ignored — the
    /// serialized entry falls back to a placeholder.
    pub fn record_metadata(&mut self, local_id: u64, record: SourceLocRecord) {
        if local_id >= self.table.count() {
            tracing::warn!(local_id, "metadata recorded for unassigned id; ignored");
            return;
        }
        self.records.insert(local_id, record);
    }

    /// Ordered entries `0..count`, with sentinels for ids that had no
    /// metadata recorded. No gaps by construction.
    pub fn entries(&self) -> Vec<SourceLocRecord> {
        (0..self.table.count())
            .map(|id| {
                self.records
                    .get(&id)
                    .copied()
                    .unwrap_or_else(SourceLocRecord::sentinel)
            })
            .collect()
    }

    pub fn count(&self) -> u64 {
        self.table.count()
    }

    pub fn base_global(&self) -> GlobalId {
        self.table.base_global()
    }

    pub fn to_global_id(&self, local: u64, cursor: &mut Cursor<'_>) -> Operand {
        self.table.to_global_id(local, cursor)
    }
}

// ── Size tables ─────────────────────────────────────────────────────

/// Optional cost-model collaborator replacing the unit instruction
/// count with target-specific costs.
pub trait CostModel {
    fn instr_cost(&self, func: &Function, instr: &Instr) -> u32;
}

/// Per-basic-block static size facts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizeRecord {
    /// Raw instruction count, terminator included.
    pub full: u32,
    /// Cost-weighted count excluding phis and placeholder operations.
    pub non_empty: u32,
}

/// Identifier table recording size facts per basic block.
#[derive(Debug)]
pub struct SizeTable {
    table: IdTable,
    records: FxHashMap<u64, SizeRecord>,
}

impl SizeTable {
    pub fn new(module: &mut Module, base_name: &str) -> Self {
        SizeTable {
            table: IdTable::new(module, base_name),
            records: FxHashMap::default(),
        }
    }

    /// Assign an id to `block` and record its sizes.
    pub fn add_block(
        &mut self,
        module: &Module,
        func_id: FuncId,
        block: BlockId,
        cost_model: Option<&dyn CostModel>,
    ) -> u64 {
        let id = self.table.get_or_assign(EntityRef::Block(func_id, block));
        let func = module.func(func_id);
        let b = func.block(block);

        #[expect(clippy::cast_possible_truncation, reason = "block sizes fit in u32")]
        let full = (b.instrs.len() + 1) as u32;
        let mut non_empty: u32 = 1; // the terminator
        for &instr_id in &b.instrs {
            let instr = func.instr(instr_id);
            if matches!(instr, Instr::Phi { .. }) || instr.is_placeholder() {
                continue;
            }
            non_empty += match cost_model {
                Some(model) => model.instr_cost(func, instr),
                None => 1,
            };
        }

        self.record(id, SizeRecord { full, non_empty });
        id
    }

    /// Record sizes for an id.
    ///
    /// # Panics
    ///
    /// Panics if the id already has a record — duplicate insertion is a
    /// bookkeeping contract violation.
    pub fn record(&mut self, local_id: u64, record: SizeRecord) {
        assert!(
            !self.records.contains_key(&local_id),
            "id {local_id} already exists in size table"
        );
        self.records.insert(local_id, record);
    }

    /// Ordered entries `0..count`.
    ///
    /// # Panics
    ///
    /// Panics on a gap: every assigned id must have a record.
    pub fn entries(&self) -> Vec<SizeRecord> {
        (0..self.table.count())
            .map(|id| {
                *self
                    .records
                    .get(&id)
                    .unwrap_or_else(|| panic!("size table has no record for id {id}"))
            })
            .collect()
    }

    pub fn count(&self) -> u64 {
        self.table.count()
    }
}
