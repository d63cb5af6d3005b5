//! Shared test utilities for the pipeline tests.
//!
//! Consolidates the module factories and hook-call probes used across
//! the per-construct tests and `tests.rs`. Only compiled in test
//! builds.

use weave_ir::ir::{BlockId, Callee, ConstExpr, FuncId, Instr, Operand};
use weave_ir::{Module, Name};

/// Look up an already-interned hook or global name.
pub(crate) fn named(module: &Module, text: &str) -> Name {
    module
        .interner
        .get(text)
        .unwrap_or_else(|| panic!("'{text}' was never interned"))
}

/// Count direct calls to `hook` in one block.
pub(crate) fn calls_in_block(module: &Module, func_id: FuncId, block: BlockId, hook: Name) -> usize {
    let func = module.func(func_id);
    func.block(block)
        .instrs
        .iter()
        .filter(|&&i| {
            matches!(
                func.instr(i),
                Instr::Call { callee: Callee::Direct(n), .. } if *n == hook
            )
        })
        .count()
}

/// Count direct calls to `hook` across the whole function.
pub(crate) fn calls_in_func(module: &Module, func_id: FuncId, hook: Name) -> usize {
    let func = module.func(func_id);
    (0..func.blocks.len())
        .map(|i| {
            #[expect(clippy::cast_possible_truncation, reason = "block counts fit in u32")]
            let block = BlockId::new(i as u32);
            calls_in_block(module, func_id, block, hook)
        })
        .sum()
}

/// Number of phis at the front of a block.
pub(crate) fn phis_in_block(module: &Module, func_id: FuncId, block: BlockId) -> usize {
    let func = module.func(func_id);
    func.block(block)
        .instrs
        .iter()
        .filter(|&&i| matches!(func.instr(i), Instr::Phi { .. }))
        .count()
}

/// Argument lists of every direct call to `hook` in the function, in
/// block order.
pub(crate) fn call_args(module: &Module, func_id: FuncId, hook: Name) -> Vec<Vec<Operand>> {
    let func = module.func(func_id);
    let mut out = Vec::new();
    for block in &func.blocks {
        for &i in &block.instrs {
            if let Instr::Call {
                callee: Callee::Direct(n),
                args,
                ..
            } = func.instr(i)
            {
                if *n == hook {
                    out.push(args.clone());
                }
            }
        }
    }
    out
}

/// The serialized entries of a unit fed table, by kind suffix.
pub(crate) fn fed_entries(module: &Module, kind: &str) -> Vec<ConstExpr> {
    let name = named(module, &format!("__weave_unit_fed_table_{kind}"));
    let global = module
        .global_by_name(name)
        .unwrap_or_else(|| panic!("fed table '{kind}' was not emitted"));
    match &module.global(global).init {
        Some(ConstExpr::Array(entries)) => entries.clone(),
        other => panic!("fed table '{kind}' has initializer {other:?}"),
    }
}

/// Decode one packed property-word argument as a plain integer.
pub(crate) fn prop_word(arg: Operand) -> u64 {
    match arg {
        Operand::Const(weave_ir::Const::Int { value, .. }) => {
            #[expect(clippy::cast_sign_loss, reason = "property words are small bit patterns")]
            let word = value as u64;
            word
        }
        other => panic!("expected a constant property word, got {other:?}"),
    }
}
