//! Unit table serialization and the load-time initializer.
//!
//! Every identifier table is serialized into a constant global array of
//! `{ name_ptr, line, col, file_ptr }` records plus a unit record
//! `{ count, base_id_ptr, entries_ptr }`; size tables serialize to
//! `{ count, entries_ptr }` of `{ full, non_empty }`. The records are
//! collected — in a fixed order matching the companion runtime — into
//! two arrays handed to `__weavert_unit_init` by a synthetic
//! constructor that runs ahead of ordinary user code. The constructor
//! also receives a helper that patches every defined callee's weak
//! identifier cell with its final global id.

use weave_ir::ir::{
    ConstExpr, CtorEntry, FuncId, Global, GlobalId, Linkage, Operand, Terminator,
};
use weave_ir::{Cursor, Function, Module, Name, Ty};

use crate::calls::func_id_cell;
use crate::tables::{FrontEndTable, SizeTable};

/// Priority of the unit constructor; anything registered at or below it
/// runs before instrumented code and is itself never instrumented.
pub const WEAVE_CTOR_PRIORITY: u16 = 65535;

/// Runtime registration entry point.
pub const RT_UNIT_INIT: &str = "__weavert_unit_init";

/// The synthetic per-unit constructor.
pub const UNIT_CTOR: &str = "__weave_unit_ctor";

/// The weak-cell patch helper passed to the runtime.
pub const INIT_CALLSITES: &str = "__weave_init_callsite_to_function";

/// The front-end tables in their serialization order. The order is part
/// of the runtime contract; changing it breaks every consumer.
pub struct UnitFedTables<'a> {
    pub tables: [(&'a str, &'a FrontEndTable, &'a str); 16],
}

/// A `{ name_ptr, line, col, file_ptr }` record type.
fn fed_entry_ty() -> Ty {
    Ty::Struct(vec![Ty::Ptr, Ty::I32, Ty::I32, Ty::Ptr])
}

/// A `{ count, base_id_ptr, entries_ptr }` record type.
fn unit_fed_record_ty() -> Ty {
    Ty::Struct(vec![Ty::I64, Ty::Ptr, Ty::Ptr])
}

/// A `{ full, non_empty }` record type.
fn size_entry_ty() -> Ty {
    Ty::Struct(vec![Ty::I32, Ty::I32])
}

/// A `{ count, entries_ptr }` record type.
fn unit_size_record_ty() -> Ty {
    Ty::Struct(vec![Ty::I64, Ty::Ptr])
}

/// A private constant string global, deduplicated by `prefix + text`;
/// empty strings serialize as null pointers.
fn string_global(module: &mut Module, text: &str, prefix: &str) -> ConstExpr {
    if text.is_empty() {
        return ConstExpr::Null;
    }
    let name = {
        let full = format!("{prefix}{text}");
        module.interner.intern(&full)
    };
    let payload = text.to_owned();
    let id = module.get_or_insert_global(name, move |name| Global {
        name,
        ty: Ty::Array {
            elem: Box::new(Ty::I8),
            len: payload.len() as u64 + 1,
        },
        init: Some(ConstExpr::Str(payload)),
        linkage: Linkage::Private,
        constant: true,
        thread_local: false,
    });
    ConstExpr::GlobalAddr(id)
}

/// Serialize one front-end table into its entries global, returning the
/// unit record pointing at it.
fn fed_table_record(
    module: &mut Module,
    kind: &str,
    name_prefix: &str,
    table: &FrontEndTable,
) -> ConstExpr {
    // Resolve interned strings before creating any global (the interner
    // and the global list both live in the module).
    let resolved: Vec<(String, i32, i32, String)> = table
        .entries()
        .iter()
        .map(|record| {
            let name = module.interner.resolve(record.name).to_owned();
            let file = module.interner.resolve(record.file);
            let dir = module.interner.resolve(record.directory);
            let path = if dir.is_empty() {
                file.to_owned()
            } else {
                format!("{dir}/{file}")
            };
            (name, record.line, record.col, path)
        })
        .collect();

    let entries: Vec<ConstExpr> = resolved
        .into_iter()
        .map(|(name, line, col, path)| {
            let name_ptr = string_global(module, &name, name_prefix);
            let file_ptr = string_global(module, &path, "__weave_unit_filename_");
            ConstExpr::Struct(vec![
                name_ptr,
                ConstExpr::Int {
                    bits: 32,
                    value: i64::from(line),
                },
                ConstExpr::Int {
                    bits: 32,
                    value: i64::from(col),
                },
                file_ptr,
            ])
        })
        .collect();

    let len = entries.len() as u64;
    let entries_global = {
        let name = {
            let full = format!("__weave_unit_fed_table_{kind}");
            module.interner.intern(&full)
        };
        module.add_global(Global {
            name,
            ty: Ty::Array {
                elem: Box::new(fed_entry_ty()),
                len,
            },
            init: Some(ConstExpr::Array(entries)),
            linkage: Linkage::Internal,
            constant: false,
            thread_local: false,
        })
    };

    #[expect(clippy::cast_possible_wrap, reason = "table counts fit in i64")]
    let count = table.count() as i64;
    ConstExpr::Struct(vec![
        ConstExpr::Int {
            bits: 64,
            value: count,
        },
        ConstExpr::GlobalAddr(table.base_global()),
        ConstExpr::GlobalAddr(entries_global),
    ])
}

/// Serialize a size table into its entries global and unit record.
fn size_table_record(module: &mut Module, kind: &str, table: &SizeTable) -> ConstExpr {
    let entries: Vec<ConstExpr> = table
        .entries()
        .iter()
        .map(|record| {
            ConstExpr::Struct(vec![
                ConstExpr::Int {
                    bits: 32,
                    value: i64::from(record.full),
                },
                ConstExpr::Int {
                    bits: 32,
                    value: i64::from(record.non_empty),
                },
            ])
        })
        .collect();
    let len = entries.len() as u64;
    let entries_global = {
        let name = {
            let full = format!("__weave_unit_size_table_{kind}");
            module.interner.intern(&full)
        };
        module.add_global(Global {
            name,
            ty: Ty::Array {
                elem: Box::new(size_entry_ty()),
                len,
            },
            init: Some(ConstExpr::Array(entries)),
            linkage: Linkage::Internal,
            constant: false,
            thread_local: false,
        })
    };
    #[expect(clippy::cast_possible_wrap, reason = "table counts fit in i64")]
    let count = table.count() as i64;
    ConstExpr::Struct(vec![
        ConstExpr::Int {
            bits: 64,
            value: count,
        },
        ConstExpr::GlobalAddr(entries_global),
    ])
}

/// Emit the weak-cell patch helper: for every function defined in this
/// unit, store `function_base + local_offset` into the callee's weak id
/// cell. Iteration follows table insertion order, so output is
/// deterministic.
fn emit_init_callsites(
    module: &mut Module,
    func_offsets: &[(Name, u64)],
    function_base: GlobalId,
) -> FuncId {
    // Create the cells (and the function shell) before building the
    // body, so no global is created while the function is borrowed.
    let cells: Vec<(GlobalId, u64)> = func_offsets
        .iter()
        .map(|&(name, local)| (func_id_cell(module, name), local))
        .collect();

    let fn_name = module.interner.intern(INIT_CALLSITES);
    let mut func = Function::new(fn_name, vec![], Ty::Void);
    func.linkage = Linkage::Internal;
    let entry = func.entry;
    func.block_mut(entry).terminator = Terminator::Ret { value: None };

    let mut cursor = Cursor::before_terminator(&mut func, entry);
    let base = cursor.load_invariant(Ty::I64, Operand::Global(function_base));
    for (cell, local) in cells {
        #[expect(clippy::cast_possible_wrap, reason = "local ids stay far below i64::MAX")]
        let global_id = cursor.add(Ty::I64, Operand::Instr(base), Operand::i64(local as i64));
        cursor.store(Ty::I64, Operand::Instr(global_id), Operand::Global(cell));
    }

    module.add_function(func)
}

/// Serialize all tables and emit the unit constructor.
pub fn finalize_unit(
    module: &mut Module,
    fed_tables: &UnitFedTables<'_>,
    bb_size: &SizeTable,
    func_offsets: &[(Name, u64)],
    function_base: GlobalId,
) -> FuncId {
    let init_callsites = emit_init_callsites(module, func_offsets, function_base);

    // Front-end tables, in the documented order.
    let records: Vec<ConstExpr> = fed_tables
        .tables
        .iter()
        .map(|(kind, table, prefix)| fed_table_record(module, kind, prefix, table))
        .collect();
    let fed_array = {
        let name = module.interner.intern("__weave_unit_fed_tables");
        let len = records.len() as u64;
        module.add_global(Global {
            name,
            ty: Ty::Array {
                elem: Box::new(unit_fed_record_ty()),
                len,
            },
            init: Some(ConstExpr::Array(records)),
            linkage: Linkage::Internal,
            constant: false,
            thread_local: false,
        })
    };

    // Size tables (currently just the basic-block table).
    let size_records = vec![size_table_record(module, "bb", bb_size)];
    let size_array = {
        let name = module.interner.intern("__weave_unit_size_tables");
        let len = size_records.len() as u64;
        module.add_global(Global {
            name,
            ty: Ty::Array {
                elem: Box::new(unit_size_record_ty()),
                len,
            },
            init: Some(ConstExpr::Array(size_records)),
            linkage: Linkage::Internal,
            constant: false,
            thread_local: false,
        })
    };

    let unit_name_ptr = {
        let unit_name = module.name.clone();
        string_global(module, &unit_name, "__weave_unit_name_")
    };
    let unit_name_op = match unit_name_ptr {
        ConstExpr::GlobalAddr(id) => Operand::Global(id),
        _ => Operand::NULL,
    };

    let rt_init = module.interner.intern(RT_UNIT_INIT);
    module.get_or_insert_declaration(rt_init, vec![Ty::Ptr, Ty::Ptr, Ty::Ptr, Ty::Ptr], Ty::Void);

    // The constructor itself: one call to the runtime, then return.
    let ctor_name = module.interner.intern(UNIT_CTOR);
    let mut ctor = Function::new(ctor_name, vec![], Ty::Void);
    ctor.linkage = Linkage::Internal;
    let entry = ctor.entry;
    ctor.block_mut(entry).terminator = Terminator::Ret { value: None };
    {
        let mut cursor = Cursor::before_terminator(&mut ctor, entry);
        cursor.call(
            rt_init,
            vec![
                unit_name_op,
                Operand::Global(fed_array),
                Operand::Global(size_array),
                Operand::Func(init_callsites),
            ],
            Ty::Void,
        );
    }
    let ctor_id = module.add_function(ctor);
    module.global_ctors.push(CtorEntry {
        priority: WEAVE_CTOR_PRIORITY,
        func: ctor_id,
    });
    ctor_id
}

/// An always-empty block list means a malformed constructor; used by
/// tests to sanity-check emitted functions.
pub fn ctor_call_target(module: &Module, ctor: FuncId) -> Option<Name> {
    let func = module.func(ctor);
    let entry = func.entry;
    func.block(entry)
        .instrs
        .iter()
        .find_map(|&i| func.instr(i).direct_callee())
}

#[cfg(test)]
mod tests {
    use super::*;
    use weave_ir::ir::Instr;

    fn sample_unit() -> (Module, FuncId) {
        let mut module = Module::new("sample.c");
        let f = module.interner.intern("main");
        let func_id = module.add_function(Function::new(f, vec![], Ty::Void));
        let func = module.func_mut(func_id);
        let entry = func.entry;
        func.block_mut(entry).terminator = Terminator::Ret { value: None };
        (module, func_id)
    }

    fn empty_fed(module: &mut Module, base: &str) -> FrontEndTable {
        FrontEndTable::new(module, base)
    }

    #[test]
    fn finalize_emits_ctor_and_patch_fn() {
        let (mut module, func_id) = sample_unit();
        let mut function_fed = empty_fed(&mut module, "__weave_function_base");
        let local = function_fed.add_function(&mut module, func_id);
        let func_name = module.func(func_id).name;

        let empty: Vec<FrontEndTable> = (0..15)
            .map(|i| empty_fed(&mut module, &format!("__weave_base_{i}")))
            .collect();
        let bb_size = SizeTable::new(&mut module, "__weave_bb_base");

        let fed_tables = UnitFedTables {
            tables: [
                ("function", &function_fed, "__weave_unit_function_name_"),
                ("function_exit", &empty[0], "__weave_unit_function_name_"),
                ("loop", &empty[1], "__weave_unit_function_name_"),
                ("loop_exit", &empty[2], "__weave_unit_function_name_"),
                ("basic_block", &empty[3], "__weave_unit_function_name_"),
                ("callsite", &empty[4], "__weave_unit_function_name_"),
                ("load", &empty[5], "__weave_unit_function_name_"),
                ("store", &empty[6], "__weave_unit_function_name_"),
                ("detach", &empty[7], "__weave_unit_function_name_"),
                ("task", &empty[8], "__weave_unit_function_name_"),
                ("task_exit", &empty[9], "__weave_unit_function_name_"),
                ("detach_continue", &empty[10], "__weave_unit_function_name_"),
                ("sync", &empty[11], "__weave_unit_function_name_"),
                ("alloca", &empty[12], "__weave_unit_variable_name_"),
                ("allocfn", &empty[13], "__weave_unit_variable_name_"),
                ("free", &empty[14], "__weave_unit_function_name_"),
            ],
        };
        let ctor = finalize_unit(
            &mut module,
            &fed_tables,
            &bb_size,
            &[(func_name, local)],
            function_fed.base_global(),
        );

        // The ctor is registered once at the documented priority and
        // calls the runtime entry point.
        assert_eq!(module.global_ctors.len(), 1);
        assert_eq!(module.global_ctors[0].priority, WEAVE_CTOR_PRIORITY);
        assert_eq!(module.global_ctors[0].func, ctor);
        let target = ctor_call_target(&module, ctor);
        assert_eq!(target, module.interner.get(RT_UNIT_INIT));

        // The patch function stores base + 0 into the weak cell.
        let patch_name = module
            .interner
            .get(INIT_CALLSITES)
            .unwrap_or_else(|| panic!("patch fn not interned"));
        let patch = module
            .function_by_name(patch_name)
            .unwrap_or_else(|| panic!("patch fn not emitted"));
        let func = module.func(patch);
        let entry = func.entry;
        let stores = func
            .block(entry)
            .instrs
            .iter()
            .filter(|&&i| matches!(func.instr(i), Instr::Store { .. }))
            .count();
        assert_eq!(stores, 1);

        // The serialized function table reproduces the recorded name.
        let table_name = module
            .interner
            .get("__weave_unit_fed_table_function")
            .and_then(|n| module.global_by_name(n));
        let Some(table_global) = table_name else {
            panic!("function fed table not emitted");
        };
        match &module.global(table_global).init {
            Some(ConstExpr::Array(entries)) => {
                assert_eq!(entries.len(), 1);
                match &entries[0] {
                    ConstExpr::Struct(fields) => {
                        // Name pointer is non-null ("main"); line/col
                        // are sentinels (no subprogram).
                        assert!(matches!(fields[0], ConstExpr::GlobalAddr(_)));
                        assert_eq!(fields[1], ConstExpr::Int { bits: 32, value: -1 });
                        assert_eq!(fields[2], ConstExpr::Int { bits: 32, value: -1 });
                    }
                    other => panic!("expected struct entry, got {other:?}"),
                }
            }
            other => panic!("expected array initializer, got {other:?}"),
        }
    }

    #[test]
    fn string_globals_are_deduplicated() {
        let (mut module, _) = sample_unit();
        let a = string_global(&mut module, "main", "__weave_unit_function_name_");
        let b = string_global(&mut module, "main", "__weave_unit_function_name_");
        assert_eq!(a, b);
        assert_eq!(string_global(&mut module, "", "p_"), ConstExpr::Null);
    }
}
