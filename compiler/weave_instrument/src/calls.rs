//! Call-site instrumentation and interposition.
//!
//! Direct callees get a weak per-callee id cell (`__weave_func_id_<f>`)
//! that any unit can read and the defining unit's initializer patches,
//! enabling cross-unit callee resolution; indirect calls carry the
//! unknown-target sentinel. Before/after hooks are independently
//! toggleable per callee. Throwing calls (invokes) have two "after"
//! positions — the normal and the unwind destination — reached through
//! the merge-point mechanism.

use weave_ir::ir::{
    BlockId, Callee, ConstExpr, FuncId, Global, Instr, InstrId, Linkage, Operand, Terminator,
};
use weave_ir::{Cursor, Module, Name, Ty};

use crate::config::{InstrumentationConfig, InstrumentationPoint};
use crate::hooks::{insert_hook, insert_hook_in_successor, HookSet, MergeCache};
use crate::props::CallProp;
use crate::tables::{FrontEndTable, UNKNOWN_ID};

/// Where a call-site worklist entry lives: a plain call inside `block`,
/// or the payload of `block`'s invoke terminator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallSite {
    Plain { block: BlockId, call: InstrId },
    Invoke { block: BlockId },
}

impl CallSite {
    /// The call's arena slot.
    pub fn call_instr(self, func: &weave_ir::Function) -> InstrId {
        match self {
            CallSite::Plain { call, .. } => call,
            CallSite::Invoke { block } => match func.block(block).terminator {
                Terminator::Invoke { call, .. } => call,
                ref other => panic!("invoke call site has terminator {other:?}"),
            },
        }
    }
}

/// The weak per-callee identifier cell for `callee`, creating it (with
/// the unknown-target sentinel as initializer) on first use.
pub fn func_id_cell(module: &mut Module, callee: Name) -> weave_ir::GlobalId {
    let cell_name = {
        let text = format!("__weave_func_id_{}", module.interner.resolve(callee));
        module.interner.intern(&text)
    };
    module.get_or_insert_global(cell_name, |name| Global {
        name,
        ty: Ty::I64,
        init: Some(ConstExpr::Int {
            bits: 64,
            value: UNKNOWN_ID,
        }),
        linkage: Linkage::Weak,
        constant: false,
        thread_local: false,
    })
}

/// Instrument one call site with before/after hooks.
#[expect(clippy::too_many_arguments, reason = "threads the per-unit tables through")]
pub fn instrument_callsite(
    module: &mut Module,
    func_id: FuncId,
    site: CallSite,
    hooks: &HookSet,
    config: &dyn InstrumentationConfig,
    callsite_fed: &mut FrontEndTable,
    cache: &mut MergeCache,
) {
    let call = site.call_instr(module.func(func_id));
    let called = module.func(func_id).instr(call).direct_callee();

    let (before, after) = match called {
        Some(name) => (
            config.should_instrument(name, InstrumentationPoint::BeforeCall),
            config.should_instrument(name, InstrumentationPoint::AfterCall),
        ),
        None => (true, true),
    };
    if !before && !after {
        return;
    }

    // The weak cell must exist before any cursor borrows the function.
    let cell = called.map(|name| func_id_cell(module, name));

    let local = callsite_fed.add_instr(module, func_id, call, called);
    let prop = CallProp {
        is_indirect: called.is_none(),
    };

    let func = module.func_mut(func_id);
    let primary = func.debug_loc(call);
    let (_block, mut cursor) = match site {
        CallSite::Plain { block, call } => (block, Cursor::before_instr(func, block, call)),
        CallSite::Invoke { block } => (block, Cursor::before_terminator(func, block)),
    };

    let call_id = callsite_fed.to_global_id(local, &mut cursor);
    let target_id = match cell {
        Some(cell) => Operand::Instr(cursor.load(Ty::I64, Operand::Global(cell))),
        None => Operand::i64(UNKNOWN_ID),
    };

    if before {
        insert_hook(
            &mut cursor,
            hooks.before_call,
            vec![call_id, target_id, prop.operand()],
            primary,
        );
    }

    if !after {
        return;
    }
    match site {
        CallSite::Invoke { block } => {
            let (normal, unwind) = match module.func(func_id).block(block).terminator {
                Terminator::Invoke { normal, unwind, .. } => (normal, unwind),
                ref other => panic!("invoke call site has terminator {other:?}"),
            };
            let defaults = vec![
                Operand::i64(UNKNOWN_ID),
                Operand::i64(UNKNOWN_ID),
                CallProp::default_word(),
            ];
            for succ in [normal, unwind] {
                insert_hook_in_successor(
                    module.func_mut(func_id),
                    cache,
                    succ,
                    block,
                    hooks.after_call,
                    vec![call_id, target_id, prop.operand()],
                    defaults.clone(),
                );
            }
        }
        CallSite::Plain { block, call } => {
            let func = module.func_mut(func_id);
            let mut cursor = Cursor::after_instr(func, block, call);
            insert_hook(
                &mut cursor,
                hooks.after_call,
                vec![call_id, target_id, prop.operand()],
                primary,
            );
        }
    }
}

/// Retarget a call to its interposition wrapper when the configuration
/// asks for it.
pub fn interpose_call(
    module: &mut Module,
    func_id: FuncId,
    site: CallSite,
    config: &dyn InstrumentationConfig,
) {
    let call = site.call_instr(module.func(func_id));
    let Some(called) = module.func(func_id).instr(call).direct_callee() else {
        return;
    };
    if !config.should_interpose(called) {
        return;
    }

    let wrapper = {
        let text = format!("__weave_interpose_{}", module.interner.resolve(called));
        module.interner.intern(&text)
    };
    // Mirror the original callee's signature when it is known in this
    // unit; otherwise derive it from the call.
    let (params, ret) = match module.function_by_name(called) {
        Some(f) => (module.func(f).params.clone(), module.func(f).ret.clone()),
        None => {
            let func = module.func(func_id);
            match func.instr(call) {
                Instr::Call { args, ret, .. } => (
                    args.iter().map(|&a| func.operand_ty(a)).collect(),
                    ret.clone(),
                ),
                _ => (Vec::new(), Ty::Void),
            }
        }
    };
    module.get_or_insert_declaration(wrapper, params, ret);

    if let Instr::Call { callee, .. } = module.func_mut(func_id).instr_mut(call) {
        *callee = Callee::Direct(wrapper);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DefaultConfig;
    use weave_ir::ir::Block;
    use weave_ir::Function;

    fn test_module() -> (Module, FuncId, Name) {
        let mut module = Module::new("unit.c");
        let f = module.interner.intern("f");
        let g = module.interner.intern("g");
        let func_id = module.add_function(Function::new(f, vec![], Ty::Void));
        let func = module.func_mut(func_id);
        let entry = func.entry;
        func.block_mut(entry).terminator = Terminator::Ret { value: None };
        (module, func_id, g)
    }

    #[test]
    fn direct_call_gets_weak_cell_and_hooks() {
        let (mut module, func_id, g) = test_module();
        let hooks = HookSet::declare(&mut module, &crate::Options::default());
        let mut fed = FrontEndTable::new(&mut module, "__weave_callsite_base");
        let mut cache = MergeCache::new();

        let func = module.func_mut(func_id);
        let entry = func.entry;
        let call = func.alloc_instr(
            Instr::Call {
                callee: Callee::Direct(g),
                args: vec![],
                ret: Ty::Void,
                no_return: false,
            },
            None,
        );
        func.block_mut(entry).instrs = vec![call];

        instrument_callsite(
            &mut module,
            func_id,
            CallSite::Plain { block: entry, call },
            &hooks,
            &DefaultConfig,
            &mut fed,
            &mut cache,
        );

        let cell_name = module.interner.get("__weave_func_id_g");
        assert!(cell_name.and_then(|n| module.global_by_name(n)).is_some());
        assert_eq!(fed.count(), 1);

        let func = module.func(func_id);
        // base load + add + cell load + before + call + after.
        assert_eq!(func.block(entry).instrs.len(), 6);
        let hook_calls = func
            .block(entry)
            .instrs
            .iter()
            .filter(|&&i| {
                matches!(
                    func.instr(i),
                    Instr::Call { callee: Callee::Direct(n), .. }
                        if *n == hooks.before_call || *n == hooks.after_call
                )
            })
            .count();
        assert_eq!(hook_calls, 2);
    }

    #[test]
    fn indirect_call_uses_unknown_sentinel() {
        let (mut module, func_id, _) = test_module();
        let hooks = HookSet::declare(&mut module, &crate::Options::default());
        let mut fed = FrontEndTable::new(&mut module, "__weave_callsite_base");
        let mut cache = MergeCache::new();

        let func = module.func_mut(func_id);
        let entry = func.entry;
        let call = func.alloc_instr(
            Instr::Call {
                callee: Callee::Indirect(Operand::Param(0)),
                args: vec![],
                ret: Ty::Void,
                no_return: false,
            },
            None,
        );
        func.block_mut(entry).instrs = vec![call];

        instrument_callsite(
            &mut module,
            func_id,
            CallSite::Plain { block: entry, call },
            &hooks,
            &DefaultConfig,
            &mut fed,
            &mut cache,
        );

        let func = module.func(func_id);
        let before = func
            .block(entry)
            .instrs
            .iter()
            .copied()
            .find(|&i| {
                matches!(
                    func.instr(i),
                    Instr::Call { callee: Callee::Direct(n), .. } if *n == hooks.before_call
                )
            })
            .unwrap_or_else(|| panic!("missing before hook"));
        match func.instr(before) {
            Instr::Call { args, .. } => {
                assert_eq!(args[1], Operand::i64(UNKNOWN_ID));
                assert_eq!(args[2], CallProp { is_indirect: true }.operand());
            }
            _ => panic!("expected call"),
        }
    }

    #[test]
    fn invoke_after_hooks_reach_both_destinations() {
        let (mut module, func_id, g) = test_module();
        let hooks = HookSet::declare(&mut module, &crate::Options::default());
        let mut fed = FrontEndTable::new(&mut module, "__weave_callsite_base");
        let mut cache = MergeCache::new();

        let func = module.func_mut(func_id);
        let entry = func.entry;
        let normal = func.add_block(Block {
            instrs: vec![],
            terminator: Terminator::Ret { value: None },
        });
        let pad = func.alloc_instr(Instr::LandingPad { ty: Ty::Ptr }, None);
        let unwind = func.add_block(Block {
            instrs: vec![pad],
            terminator: Terminator::Resume {
                value: Some(Operand::Instr(pad)),
            },
        });
        let call = func.alloc_instr(
            Instr::Call {
                callee: Callee::Direct(g),
                args: vec![],
                ret: Ty::Void,
                no_return: false,
            },
            None,
        );
        func.block_mut(entry).terminator = Terminator::Invoke {
            call,
            normal,
            unwind,
        };

        instrument_callsite(
            &mut module,
            func_id,
            CallSite::Invoke { block: entry },
            &hooks,
            &DefaultConfig,
            &mut fed,
            &mut cache,
        );

        let func = module.func(func_id);
        for succ in [normal, unwind] {
            let after = func.block(succ).instrs.iter().any(|&i| {
                matches!(
                    func.instr(i),
                    Instr::Call { callee: Callee::Direct(n), .. } if *n == hooks.after_call
                )
            });
            assert!(after, "missing after hook in successor");
        }
    }

    #[test]
    fn interposition_retargets_the_callee() {
        let (mut module, func_id, g) = test_module();
        let mut config = crate::config::DenyList::new();
        config.interpose(g);

        let func = module.func_mut(func_id);
        let entry = func.entry;
        let call = func.alloc_instr(
            Instr::Call {
                callee: Callee::Direct(g),
                args: vec![],
                ret: Ty::Void,
                no_return: false,
            },
            None,
        );
        func.block_mut(entry).instrs = vec![call];

        interpose_call(
            &mut module,
            func_id,
            CallSite::Plain { block: entry, call },
            &config,
        );

        let func = module.func(func_id);
        match func.instr(call) {
            Instr::Call {
                callee: Callee::Direct(n),
                ..
            } => {
                assert_eq!(module.interner.resolve(*n), "__weave_interpose_g");
            }
            _ => panic!("expected retargeted call"),
        }
        let wrapper = module
            .interner
            .get("__weave_interpose_g")
            .and_then(|n| module.function_by_name(n));
        assert!(wrapper.is_some());
    }
}
