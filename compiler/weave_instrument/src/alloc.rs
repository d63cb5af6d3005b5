//! Stack- and heap-allocation instrumentation.
//!
//! Allocas get before/after hooks carrying the allocated size (element
//! size times the dynamic count for array allocas). Recognized
//! allocation calls carry size, element count, alignment, and — for
//! realloc-style calls — the prior pointer, each falling back to a
//! zero/null default when not statically extractable; the after hook's
//! address argument is null on the exceptional path of a throwing call,
//! since the call never completed there. Frees get before/after hooks
//! with the freed address.

use weave_ir::analysis::LibCallRecognizer;
use weave_ir::ir::{FuncId, Instr, InstrId, Operand, Terminator};
use weave_ir::surgery::{is_critical_edge, split_edge};
use weave_ir::{Cursor, Module, Ty};

use crate::calls::CallSite;
use crate::hooks::{insert_hook, insert_hook_in_successor, HookSet, MergeCache};
use crate::props::{AllocFnProp, AllocaProp, FreeProp};
use crate::tables::{FrontEndTable, UNKNOWN_ID};

/// Instrument a stack allocation with before/after hooks.
pub fn instrument_alloca(
    module: &mut Module,
    func_id: FuncId,
    block: weave_ir::BlockId,
    alloca: InstrId,
    hooks: &HookSet,
    alloca_fed: &mut FrontEndTable,
) {
    let (elem_size, count, is_entry) = {
        let func = module.func(func_id);
        match func.instr(alloca) {
            Instr::Alloca { ty, count } => {
                (ty.alloc_size_bytes(), *count, block == func.entry)
            }
            other => panic!("not an alloca: {other:?}"),
        }
    };

    let local = alloca_fed.add_instr(module, func_id, alloca, None);
    let prop = AllocaProp {
        is_static: is_entry && count.is_none(),
    };

    let func = module.func_mut(func_id);
    let primary = func.debug_loc(alloca);
    let mut cursor = Cursor::before_instr(func, block, alloca);
    let id_op = alloca_fed.to_global_id(local, &mut cursor);
    #[expect(clippy::cast_possible_wrap, reason = "allocation sizes fit in i64")]
    let size_op = match count {
        None => Operand::i64(elem_size as i64),
        Some(count) => {
            let count = cursor.zext_to_i64(count);
            Operand::Instr(cursor.mul(Ty::I64, Operand::i64(elem_size as i64), count))
        }
    };
    insert_hook(
        &mut cursor,
        hooks.before_alloca,
        vec![id_op, size_op, prop.operand()],
        primary,
    );

    let mut cursor = Cursor::after_instr(func, block, alloca);
    insert_hook(
        &mut cursor,
        hooks.after_alloca,
        vec![id_op, Operand::Instr(alloca), size_op, prop.operand()],
        primary,
    );
}

/// The statically extracted hook arguments of an allocation call:
/// `(size, count, alignment, old pointer)`.
fn alloc_fn_args(
    module: &Module,
    func_id: FuncId,
    call: InstrId,
    recognizer: &LibCallRecognizer,
) -> Option<(Operand, Operand, Operand, Operand, AllocFnProp)> {
    let func = module.func(func_id);
    let Instr::Call { args, .. } = func.instr(call) else {
        return None;
    };
    let callee = func.instr(call).direct_callee()?;
    let spec = recognizer.alloc_spec(callee)?;

    // No extractable size defeats instrumentation of this call.
    let size = *args.get(spec.size_arg? as usize)?;
    let count = spec
        .count_arg
        .and_then(|i| args.get(i as usize).copied())
        .unwrap_or(Operand::i64(1));
    let align = spec
        .align_arg
        .and_then(|i| args.get(i as usize).copied())
        .unwrap_or(Operand::i64(0));
    let old_ptr = spec
        .old_ptr_arg
        .and_then(|i| args.get(i as usize).copied())
        .unwrap_or(Operand::NULL);
    let prop = AllocFnProp {
        kind: spec.kind.code(),
    };
    Some((size, count, align, old_ptr, prop))
}

/// Instrument a recognized allocation call. Calls whose arguments defeat
/// static extraction are skipped whole.
#[expect(clippy::too_many_arguments, reason = "threads the per-unit tables through")]
pub fn instrument_alloc_fn(
    module: &mut Module,
    func_id: FuncId,
    site: CallSite,
    hooks: &HookSet,
    recognizer: &LibCallRecognizer,
    alloc_fn_fed: &mut FrontEndTable,
    cache: &mut MergeCache,
) {
    let call = site.call_instr(module.func(func_id));
    let Some((size, count, align, old_ptr, prop)) =
        alloc_fn_args(module, func_id, call, recognizer)
    else {
        tracing::debug!(
            instr = call.raw(),
            "allocation call with unextractable arguments skipped"
        );
        return;
    };

    let local = alloc_fn_fed.add_instr(module, func_id, call, None);

    let func = module.func_mut(func_id);
    let primary = func.debug_loc(call);
    let (_block, mut cursor) = match site {
        CallSite::Plain { block, call } => (block, Cursor::before_instr(func, block, call)),
        CallSite::Invoke { block } => (block, Cursor::before_terminator(func, block)),
    };
    let id_op = alloc_fn_fed.to_global_id(local, &mut cursor);
    let size = cursor.zext_to_i64(size);
    let count = cursor.zext_to_i64(count);
    let align = cursor.zext_to_i64(align);
    insert_hook(
        &mut cursor,
        hooks.before_allocfn,
        vec![id_op, size, count, align, old_ptr, prop.operand()],
        primary,
    );

    match site {
        CallSite::Plain { block, call } => {
            let func = module.func_mut(func_id);
            let mut cursor = Cursor::after_instr(func, block, call);
            insert_hook(
                &mut cursor,
                hooks.after_allocfn,
                vec![
                    id_op,
                    Operand::Instr(call),
                    size,
                    count,
                    align,
                    old_ptr,
                    prop.operand(),
                ],
                primary,
            );
        }
        CallSite::Invoke { block } => {
            let (mut normal, unwind) = match module.func(func_id).block(block).terminator {
                Terminator::Invoke { normal, unwind, .. } => (normal, unwind),
                ref other => panic!("invoke call site has terminator {other:?}"),
            };
            // The result is only valid on the normal path; give it a
            // dedicated block if the edge is critical, then insert
            // directly.
            let func = module.func_mut(func_id);
            if is_critical_edge(func, block, normal) {
                normal = split_edge(func, block, normal);
            }
            let func = module.func_mut(func_id);
            let primary_normal = func.first_debug_loc(normal);
            let mut cursor = Cursor::at_first_insertion(func, normal);
            insert_hook(
                &mut cursor,
                hooks.after_allocfn,
                vec![
                    id_op,
                    Operand::Instr(call),
                    size,
                    count,
                    align,
                    old_ptr,
                    prop.operand(),
                ],
                primary_normal,
            );

            // The address is null on the exceptional path: the call did
            // not complete.
            insert_hook_in_successor(
                module.func_mut(func_id),
                cache,
                unwind,
                block,
                hooks.after_allocfn,
                vec![
                    id_op,
                    Operand::NULL,
                    size,
                    count,
                    align,
                    old_ptr,
                    prop.operand(),
                ],
                vec![
                    Operand::i64(UNKNOWN_ID),
                    Operand::NULL,
                    Operand::i64(0),
                    Operand::i64(0),
                    Operand::i64(0),
                    Operand::NULL,
                    AllocFnProp::default_word(),
                ],
            );
        }
    }
}

/// Instrument a recognized free call with before/after hooks.
pub fn instrument_free(
    module: &mut Module,
    func_id: FuncId,
    block: weave_ir::BlockId,
    call: InstrId,
    hooks: &HookSet,
    recognizer: &LibCallRecognizer,
    free_fed: &mut FrontEndTable,
) {
    let (addr, prop) = {
        let func = module.func(func_id);
        let callee = func
            .instr(call)
            .direct_callee()
            .unwrap_or_else(|| panic!("free call without a direct callee"));
        let kind = recognizer
            .free_kind(callee)
            .unwrap_or_else(|| panic!("free call with unrecognized callee"));
        let Instr::Call { args, .. } = func.instr(call) else {
            panic!("not a call: {call:?}");
        };
        let addr = args.first().copied().unwrap_or(Operand::NULL);
        (addr, FreeProp { kind: kind.code() })
    };

    let local = free_fed.add_instr(module, func_id, call, None);

    let func = module.func_mut(func_id);
    let primary = func.debug_loc(call);
    let mut cursor = Cursor::before_instr(func, block, call);
    let id_op = free_fed.to_global_id(local, &mut cursor);
    insert_hook(
        &mut cursor,
        hooks.before_free,
        vec![id_op, addr, prop.operand()],
        primary,
    );

    let mut cursor = Cursor::after_instr(func, block, call);
    insert_hook(
        &mut cursor,
        hooks.after_free,
        vec![id_op, addr, prop.operand()],
        primary,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use weave_ir::ir::Callee;
    use weave_ir::{Function, Interner};

    fn test_module() -> (Module, FuncId, LibCallRecognizer) {
        let mut module = Module::new("unit.c");
        let f = module.interner.intern("f");
        let func_id = module.add_function(Function::new(f, vec![Ty::I64], Ty::Void));
        let func = module.func_mut(func_id);
        let entry = func.entry;
        func.block_mut(entry).terminator = Terminator::Ret { value: None };
        let recognizer = LibCallRecognizer::new(&mut module.interner);
        (module, func_id, recognizer)
    }

    #[test]
    fn static_alloca_sizes_are_constant() {
        let (mut module, func_id, _) = test_module();
        let hooks = HookSet::declare(&mut module, &crate::Options::default());
        let mut fed = FrontEndTable::new(&mut module, "__weave_alloca_base");

        let func = module.func_mut(func_id);
        let entry = func.entry;
        let slot = func.alloc_instr(
            Instr::Alloca {
                ty: Ty::I64,
                count: None,
            },
            None,
        );
        func.block_mut(entry).instrs = vec![slot];

        instrument_alloca(&mut module, func_id, entry, slot, &hooks, &mut fed);

        let func = module.func(func_id);
        let before = func
            .block(entry)
            .instrs
            .iter()
            .copied()
            .find(|&i| {
                matches!(
                    func.instr(i),
                    Instr::Call { callee: Callee::Direct(n), .. } if *n == hooks.before_alloca
                )
            })
            .unwrap_or_else(|| panic!("missing before hook"));
        match func.instr(before) {
            Instr::Call { args, .. } => {
                assert_eq!(args[1], Operand::i64(8));
                assert_eq!(args[2], AllocaProp { is_static: true }.operand());
            }
            _ => panic!("expected call"),
        }
    }

    #[test]
    fn array_alloca_multiplies_by_count() {
        let (mut module, func_id, _) = test_module();
        let hooks = HookSet::declare(&mut module, &crate::Options::default());
        let mut fed = FrontEndTable::new(&mut module, "__weave_alloca_base");

        let func = module.func_mut(func_id);
        let entry = func.entry;
        let slot = func.alloc_instr(
            Instr::Alloca {
                ty: Ty::I32,
                count: Some(Operand::Param(0)),
            },
            None,
        );
        func.block_mut(entry).instrs = vec![slot];

        instrument_alloca(&mut module, func_id, entry, slot, &hooks, &mut fed);

        let func = module.func(func_id);
        let has_mul = func
            .block(entry)
            .instrs
            .iter()
            .any(|&i| matches!(func.instr(i), Instr::BinOp { op: weave_ir::BinOpKind::Mul, .. }));
        assert!(has_mul, "array alloca must multiply element size by count");
    }

    #[test]
    fn malloc_args_are_extracted() {
        let (mut module, func_id, recognizer) = test_module();
        let hooks = HookSet::declare(&mut module, &crate::Options::default());
        let mut fed = FrontEndTable::new(&mut module, "__weave_allocfn_base");
        let mut cache = MergeCache::new();
        let malloc = module.interner.intern("malloc");

        let func = module.func_mut(func_id);
        let entry = func.entry;
        let call = func.alloc_instr(
            Instr::Call {
                callee: Callee::Direct(malloc),
                args: vec![Operand::i64(64)],
                ret: Ty::Ptr,
                no_return: false,
            },
            None,
        );
        func.block_mut(entry).instrs = vec![call];

        instrument_alloc_fn(
            &mut module,
            func_id,
            CallSite::Plain { block: entry, call },
            &hooks,
            &recognizer,
            &mut fed,
            &mut cache,
        );
        assert_eq!(fed.count(), 1);

        let func = module.func(func_id);
        let before = func
            .block(entry)
            .instrs
            .iter()
            .copied()
            .find(|&i| {
                matches!(
                    func.instr(i),
                    Instr::Call { callee: Callee::Direct(n), .. } if *n == hooks.before_allocfn
                )
            })
            .unwrap_or_else(|| panic!("missing before hook"));
        match func.instr(before) {
            Instr::Call { args, .. } => {
                assert_eq!(args[1], Operand::i64(64)); // size
                assert_eq!(args[2], Operand::i64(1)); // count default
                assert_eq!(args[3], Operand::i64(0)); // alignment default
                assert_eq!(args[4], Operand::NULL); // old pointer default
            }
            _ => panic!("expected call"),
        }
    }

    #[test]
    fn posix_memalign_is_skipped() {
        let (mut module, func_id, recognizer) = test_module();
        let hooks = HookSet::declare(&mut module, &crate::Options::default());
        let mut fed = FrontEndTable::new(&mut module, "__weave_allocfn_base");
        let mut cache = MergeCache::new();
        let pm = module.interner.intern("posix_memalign");

        let func = module.func_mut(func_id);
        let entry = func.entry;
        let call = func.alloc_instr(
            Instr::Call {
                callee: Callee::Direct(pm),
                args: vec![Operand::NULL, Operand::i64(16), Operand::i64(64)],
                ret: Ty::I32,
                no_return: false,
            },
            None,
        );
        func.block_mut(entry).instrs = vec![call];

        instrument_alloc_fn(
            &mut module,
            func_id,
            CallSite::Plain { block: entry, call },
            &hooks,
            &recognizer,
            &mut fed,
            &mut cache,
        );
        assert_eq!(fed.count(), 0);
        assert_eq!(module.func(func_id).block(entry).instrs.len(), 1);
    }

    #[test]
    fn free_gets_paired_hooks() {
        let (mut module, func_id, recognizer) = test_module();
        let hooks = HookSet::declare(&mut module, &crate::Options::default());
        let mut fed = FrontEndTable::new(&mut module, "__weave_free_base");
        let free = module.interner.intern("free");

        let func = module.func_mut(func_id);
        let entry = func.entry;
        let call = func.alloc_instr(
            Instr::Call {
                callee: Callee::Direct(free),
                args: vec![Operand::NULL],
                ret: Ty::Void,
                no_return: false,
            },
            None,
        );
        func.block_mut(entry).instrs = vec![call];

        instrument_free(
            &mut module,
            func_id,
            entry,
            call,
            &hooks,
            &recognizer,
            &mut fed,
        );

        let func = module.func(func_id);
        let hook_calls = func
            .block(entry)
            .instrs
            .iter()
            .filter(|&&i| {
                matches!(
                    func.instr(i),
                    Instr::Call { callee: Callee::Direct(n), .. }
                        if *n == hooks.before_free || *n == hooks.after_free
                )
            })
            .count();
        assert_eq!(hook_calls, 2);
    }

    #[test]
    fn recognizer_interner_is_shared() {
        // Recognizer names interned through a different interner must
        // not alias module names (guard against accidental reuse).
        let mut other = Interner::new();
        let recognizer = LibCallRecognizer::new(&mut other);
        let malloc = other.intern("malloc");
        assert!(recognizer.is_allocation_fn(malloc));
    }
}
