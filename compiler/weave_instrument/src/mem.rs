//! Memory-access instrumentation.
//!
//! Loads and stores get before/after hooks carrying the address, the
//! access width in bytes, and a property word computed by a backward
//! per-block sweep (so a load can be flagged when the same address is
//! written later in its block). Accesses whose bit width is not a whole
//! number of bytes are skipped. Atomic operations are reported but not
//! hooked; memory intrinsics are rewritten into plain libc calls so a
//! runtime can interpose them.

use rustc_hash::FxHashSet;

use weave_ir::ir::{
    Callee, FuncId, Instr, InstrId, MemIntrinsicKind, Operand, SyncScope,
};
use weave_ir::{Cursor, Function, Module, Ty};

use crate::hooks::{insert_hook, HookSet};
use crate::props::LoadStoreProp;
use crate::tables::FrontEndTable;

/// True for operations that synchronize across threads: atomic accesses
/// with a system scope, read-modify-writes, compare-exchanges, fences.
pub fn is_atomic(instr: &Instr) -> bool {
    match instr {
        Instr::Load { atomic, .. } | Instr::Store { atomic, .. } => {
            matches!(atomic, Some(SyncScope::System))
        }
        Instr::AtomicRmw { .. } | Instr::CmpXchg { .. } | Instr::Fence => true,
        _ => false,
    }
}

/// Strip address computations down to the underlying object.
fn underlying_object(func: &Function, mut addr: Operand) -> Operand {
    loop {
        match addr {
            Operand::Instr(id) => match func.instr(id) {
                Instr::Gep { base, .. } => addr = *base,
                Instr::Cast { value, .. } => addr = *value,
                _ => return addr,
            },
            _ => return addr,
        }
    }
}

/// Does the address provably point at constant data? A global marked
/// constant, or a value loaded through a vtable pointer. Only one
/// address-computation layer is peeled, mirroring the conservative
/// original analysis.
fn addr_points_to_constant_data(module: &Module, func: &Function, addr: Operand) -> bool {
    let addr = match addr {
        Operand::Instr(id) => match func.instr(id) {
            Instr::Gep { base, .. } => *base,
            _ => addr,
        },
        _ => addr,
    };
    match addr {
        Operand::Global(g) => module.global(g).constant,
        Operand::Instr(id) => matches!(func.instr(id), Instr::Load { vtable: true, .. }),
        _ => false,
    }
}

/// Conservative pointer-capture check: stack objects count as captured
/// when their address flows into a call or is stored; everything with a
/// global-value base counts as captured outright.
fn may_be_captured(func: &Function, object: Operand) -> bool {
    match object {
        Operand::Global(_) | Operand::Func(_) | Operand::Param(_) => true,
        Operand::Instr(id) if matches!(func.instr(id), Instr::Alloca { .. }) => {
            let as_op = Operand::Instr(id);
            for instr in &func.instrs {
                match instr {
                    Instr::Call { args, .. } => {
                        if args.contains(&as_op) {
                            return true;
                        }
                    }
                    Instr::Store { value, .. } if *value == as_op => return true,
                    _ => {}
                }
            }
            false
        }
        _ => true,
    }
}

fn is_thread_local(module: &Module, object: Operand) -> bool {
    matches!(object, Operand::Global(g) if module.global(g).thread_local)
}

/// Compute property words for a span of loads and stores from one
/// block, walking backward so each load learns whether its address is
/// written later in the block. Consumes (clears) `span`.
pub fn compute_load_store_properties(
    module: &Module,
    func: &Function,
    span: &mut Vec<InstrId>,
    out: &mut Vec<(InstrId, LoadStoreProp)>,
) {
    let mut write_targets: FxHashSet<Operand> = FxHashSet::default();

    for &id in span.iter().rev() {
        let (addr, align, vtable, is_store) = match func.instr(id) {
            Instr::Store {
                addr,
                align,
                vtable,
                ..
            } => (*addr, *align, *vtable, true),
            Instr::Load {
                addr,
                align,
                vtable,
                ..
            } => (*addr, *align, *vtable, false),
            other => panic!("load/store span contains {other:?}"),
        };

        let read_before_write = if is_store {
            write_targets.insert(addr);
            false
        } else {
            write_targets.contains(&addr)
        };
        let object = underlying_object(func, addr);
        #[expect(clippy::cast_possible_truncation, reason = "alignment fits in u8")]
        let alignment = align.min(255) as u8;
        let prop = LoadStoreProp {
            alignment,
            is_vtable_access: vtable,
            is_constant: addr_points_to_constant_data(module, func, addr),
            is_on_stack: matches!(
                object,
                Operand::Instr(o) if matches!(func.instr(o), Instr::Alloca { .. })
            ),
            may_be_captured: may_be_captured(func, object),
            is_thread_local: is_thread_local(module, object),
            load_read_before_write_in_block: read_before_write,
        };
        out.push((id, prop));
    }
    span.clear();
}

/// Instrument one load or store with before/after hooks.
///
/// Returns `false` when the access was skipped (unsupported width).
#[expect(clippy::too_many_arguments, reason = "threads the per-unit tables through")]
pub fn instrument_load_or_store(
    module: &mut Module,
    func_id: FuncId,
    access: InstrId,
    prop: LoadStoreProp,
    hooks: &HookSet,
    load_fed: &mut FrontEndTable,
    store_fed: &mut FrontEndTable,
    block: weave_ir::BlockId,
) -> bool {
    let (is_write, addr, ty) = {
        let func = module.func(func_id);
        match func.instr(access) {
            Instr::Store { addr, ty, .. } => (true, *addr, ty.clone()),
            Instr::Load { addr, ty, .. } => (false, *addr, ty.clone()),
            other => panic!("not a memory access: {other:?}"),
        }
    };
    let Some(num_bytes) = ty.store_size_bytes() else {
        tracing::debug!(instr = access.raw(), "skipping access of unsupported width");
        return false;
    };
    #[expect(clippy::cast_possible_wrap, reason = "access widths are small")]
    let num_bytes = Operand::Const(weave_ir::Const::i32(num_bytes as i64));

    let (fed, before_hook, after_hook) = if is_write {
        (store_fed, hooks.before_store, hooks.after_store)
    } else {
        (load_fed, hooks.before_load, hooks.after_load)
    };
    let local = fed.add_instr(module, func_id, access, None);

    let func = module.func_mut(func_id);
    let primary = func.debug_loc(access);
    let prop_op = prop.operand();

    let mut cursor = Cursor::before_instr(func, block, access);
    let id_op = fed.to_global_id(local, &mut cursor);
    insert_hook(
        &mut cursor,
        before_hook,
        vec![id_op, addr, num_bytes, prop_op],
        primary,
    );

    let mut cursor = Cursor::after_instr(func, block, access);
    insert_hook(
        &mut cursor,
        after_hook,
        vec![id_op, addr, num_bytes, prop_op],
        primary,
    );
    true
}

/// Report an atomic operation the engine does not hook.
pub fn instrument_atomic(module: &Module, func_id: FuncId, instr: InstrId) {
    let name = module.func(func_id).name;
    tracing::warn!(
        function = name.raw(),
        instr = instr.raw(),
        "uninstrumented atomic operation in program under test"
    );
}

/// Rewrite a memory intrinsic into a plain libc call in place, keeping
/// its arena slot (and therefore its identity and position).
pub fn instrument_mem_intrinsic(module: &mut Module, func_id: FuncId, instr: InstrId) -> bool {
    let func = module.func_mut(func_id);
    let Instr::MemIntrinsic {
        kind,
        dst,
        src,
        value,
        len,
    } = func.instr(instr).clone()
    else {
        return false;
    };

    let (callee, args) = match kind {
        MemIntrinsicKind::MemSet => (
            module_hook_name(kind),
            vec![dst, value.unwrap_or(Operand::Const(weave_ir::Const::i32(0))), len],
        ),
        MemIntrinsicKind::MemCpy | MemIntrinsicKind::MemMove => (
            module_hook_name(kind),
            vec![dst, src.unwrap_or(Operand::NULL), len],
        ),
    };
    let callee = module.interner.intern(callee);

    *module.func_mut(func_id).instr_mut(instr) = Instr::Call {
        callee: Callee::Direct(callee),
        args,
        ret: Ty::Ptr,
        no_return: false,
    };
    true
}

fn module_hook_name(kind: MemIntrinsicKind) -> &'static str {
    match kind {
        MemIntrinsicKind::MemSet => "memset",
        MemIntrinsicKind::MemCpy => "memcpy",
        MemIntrinsicKind::MemMove => "memmove",
    }
}
