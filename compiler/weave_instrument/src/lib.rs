//! WEAVE — whole-program instrumentation over [`weave_ir`].
//!
//! Given a compilation unit's IR, the engine inserts calls to external
//! hook functions at well-defined program points — function entry/exit,
//! basic blocks, loops, memory accesses, call sites, allocations, and
//! fork/join task boundaries — assigns every instrumented point a
//! stable identifier, and emits per-unit metadata tables plus a
//! load-time initializer that registers them with a runtime.
//!
//! The pipeline per function: canonicalize the CFG (promote throwing
//! calls in tasks, make calls terminate blocks, separate predecessor
//! classes), collect worklists of every instrumentable construct in one
//! deterministic pass, then run the per-construct instrumenters in a
//! fixed order. After all functions, the identifier tables are
//! serialized and the unit constructor is emitted.
//!
//! ```
//! use weave_instrument::{config::DefaultConfig, Instrumenter, Options};
//! let mut module = weave_ir::Module::new("demo.c");
//! let config = DefaultConfig;
//! let summary = Instrumenter::new(&mut module, Options::default(), &config).run();
//! assert!(summary.diagnostics.is_empty());
//! ```

pub mod alloc;
pub mod calls;
pub mod canon;
pub mod config;
pub mod hooks;
pub mod loops;
pub mod mem;
pub mod props;
pub mod tables;
pub mod tasks;
pub mod unit;

#[cfg(test)]
mod test_helpers;

use rustc_hash::{FxHashMap, FxHashSet};

use weave_ir::analysis::{DomTree, LibCallRecognizer, LoopForest, TaskTree};
use weave_ir::ir::{BlockId, FnAttrs, FuncId, Instr, InstrId, Terminator};
use weave_ir::{Cursor, Module, Name};

use crate::calls::CallSite;
use crate::config::{InstrumentationConfig, InstrumentationPoint};
use crate::hooks::{insert_hook, HookSet, MergeCache};
use crate::mem::is_atomic;
use crate::props::{BlockProp, FuncExitProp, FuncProp, LoadStoreProp};
use crate::tables::{CostModel, FrontEndTable, SizeTable};
use crate::unit::{UnitFedTables, WEAVE_CTOR_PRIORITY};

/// Per-category toggles and CFG policies.
#[derive(Clone, Copy, Debug)]
pub struct Options {
    pub instrument_func_entry_exit: bool,
    pub instrument_loops: bool,
    pub instrument_basic_blocks: bool,
    pub instrument_memory_accesses: bool,
    pub instrument_calls: bool,
    pub instrument_atomics: bool,
    pub instrument_mem_intrinsics: bool,
    pub instrument_fork_join: bool,
    pub instrument_allocas: bool,
    pub instrument_alloc_fns: bool,
    pub interpose: bool,
    /// Promote throwing calls inside tasks to invokes so exceptional
    /// paths can be instrumented.
    pub calls_may_throw: bool,
    /// Split blocks so ordinary calls terminate them.
    pub calls_terminate_blocks: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            instrument_func_entry_exit: true,
            instrument_loops: true,
            instrument_basic_blocks: true,
            instrument_memory_accesses: true,
            instrument_calls: true,
            instrument_atomics: true,
            instrument_mem_intrinsics: true,
            instrument_fork_join: true,
            instrument_allocas: true,
            instrument_alloc_fns: true,
            interpose: true,
            calls_may_throw: true,
            calls_terminate_blocks: true,
        }
    }
}

/// Unit-level diagnostic; none of these abort the run.
#[derive(Debug, thiserror::Error)]
pub enum UnitDiagnostic {
    /// Merging an auxiliary hook-definition module failed for a symbol.
    #[error("linking tool module '{module}': {reason}")]
    ToolLink { module: String, reason: String },
}

/// What a run did.
#[derive(Debug, Default)]
pub struct UnitSummary {
    pub instrumented_functions: usize,
    pub diagnostics: Vec<UnitDiagnostic>,
}

/// The engine: one instance per compilation unit, consumed by
/// [`run`](Instrumenter::run).
pub struct Instrumenter<'a> {
    module: &'a mut Module,
    options: Options,
    config: &'a dyn InstrumentationConfig,
    cost_model: Option<&'a dyn CostModel>,
    recognizer: LibCallRecognizer,
    hooks: HookSet,

    function_fed: FrontEndTable,
    function_exit_fed: FrontEndTable,
    loop_fed: FrontEndTable,
    loop_exit_fed: FrontEndTable,
    basic_block_fed: FrontEndTable,
    callsite_fed: FrontEndTable,
    load_fed: FrontEndTable,
    store_fed: FrontEndTable,
    detach_fed: FrontEndTable,
    task_fed: FrontEndTable,
    task_exit_fed: FrontEndTable,
    detach_continue_fed: FrontEndTable,
    sync_fed: FrontEndTable,
    alloca_fed: FrontEndTable,
    alloc_fn_fed: FrontEndTable,
    free_fed: FrontEndTable,
    bb_size: SizeTable,

    /// Defined functions and their local ids, in assignment order; the
    /// patch helper iterates this.
    func_offsets: Vec<(Name, u64)>,
    /// Functions contributed by a linked tool module — never
    /// instrumented.
    tool_functions: FxHashSet<Name>,
    diagnostics: Vec<UnitDiagnostic>,
    instrumented: usize,
}

impl<'a> Instrumenter<'a> {
    pub fn new(
        module: &'a mut Module,
        options: Options,
        config: &'a dyn InstrumentationConfig,
    ) -> Self {
        let recognizer = LibCallRecognizer::new(&mut module.interner);
        let hooks = HookSet::declare(module, &options);

        let function_fed = FrontEndTable::new(module, "__weave_func_base_id");
        let function_exit_fed = FrontEndTable::new(module, "__weave_func_exit_base_id");
        let loop_fed = FrontEndTable::new(module, "__weave_loop_base_id");
        let loop_exit_fed = FrontEndTable::new(module, "__weave_loop_exit_base_id");
        let basic_block_fed = FrontEndTable::new(module, "__weave_bb_base_id");
        let callsite_fed = FrontEndTable::new(module, "__weave_callsite_base_id");
        let load_fed = FrontEndTable::new(module, "__weave_load_base_id");
        let store_fed = FrontEndTable::new(module, "__weave_store_base_id");
        let detach_fed = FrontEndTable::new(module, "__weave_detach_base_id");
        let task_fed = FrontEndTable::new(module, "__weave_task_base_id");
        let task_exit_fed = FrontEndTable::new(module, "__weave_task_exit_base_id");
        let detach_continue_fed = FrontEndTable::new(module, "__weave_detach_continue_base_id");
        let sync_fed = FrontEndTable::new(module, "__weave_sync_base_id");
        let alloca_fed = FrontEndTable::new(module, "__weave_alloca_base_id");
        let alloc_fn_fed = FrontEndTable::new(module, "__weave_allocfn_base_id");
        let free_fed = FrontEndTable::new(module, "__weave_free_base_id");
        let bb_size = SizeTable::new(module, "__weave_bb_size_base_id");

        Instrumenter {
            module,
            options,
            config,
            cost_model: None,
            recognizer,
            hooks,
            function_fed,
            function_exit_fed,
            loop_fed,
            loop_exit_fed,
            basic_block_fed,
            callsite_fed,
            load_fed,
            store_fed,
            detach_fed,
            task_fed,
            task_exit_fed,
            detach_continue_fed,
            sync_fed,
            alloca_fed,
            alloc_fn_fed,
            free_fed,
            bb_size,
            func_offsets: Vec::new(),
            tool_functions: FxHashSet::default(),
            diagnostics: Vec::new(),
            instrumented: 0,
        }
    }

    /// Use a target cost model for size-table weights.
    pub fn with_cost_model(mut self, model: &'a dyn CostModel) -> Self {
        self.cost_model = Some(model);
        self
    }

    /// Record the functions an auxiliary tool module contributes. They
    /// define hooks and must never be instrumented; a tool symbol that
    /// collides with a definition in this unit is surfaced as a
    /// diagnostic rather than aborting the run.
    pub fn link_tool_functions<'n>(
        &mut self,
        tool_module: &str,
        names: impl IntoIterator<Item = &'n str>,
    ) {
        for text in names {
            let name = self.module.interner.intern(text);
            let collides = self
                .module
                .function_by_name(name)
                .is_some_and(|f| !self.module.func(f).is_declaration);
            if collides {
                self.diagnostics.push(UnitDiagnostic::ToolLink {
                    module: tool_module.to_owned(),
                    reason: format!("symbol '{text}' is already defined in this unit"),
                });
                continue;
            }
            self.tool_functions.insert(name);
        }
    }

    /// Instrument the whole unit and emit its tables and constructor.
    pub fn run(mut self) -> UnitSummary {
        tracing::debug!(unit = %self.module.name, "instrumenting unit");

        let original_count = self.module.functions.len();
        for idx in 0..original_count {
            #[expect(clippy::cast_possible_truncation, reason = "function counts fit in u32")]
            let func_id = FuncId::new(idx as u32);
            self.instrument_function(func_id);
        }

        let fed_tables = UnitFedTables {
            tables: [
                ("function", &self.function_fed, "__weave_unit_function_name_"),
                (
                    "function_exit",
                    &self.function_exit_fed,
                    "__weave_unit_function_name_",
                ),
                ("loop", &self.loop_fed, "__weave_unit_function_name_"),
                (
                    "loop_exit",
                    &self.loop_exit_fed,
                    "__weave_unit_function_name_",
                ),
                (
                    "basic_block",
                    &self.basic_block_fed,
                    "__weave_unit_function_name_",
                ),
                ("callsite", &self.callsite_fed, "__weave_unit_function_name_"),
                ("load", &self.load_fed, "__weave_unit_function_name_"),
                ("store", &self.store_fed, "__weave_unit_function_name_"),
                ("detach", &self.detach_fed, "__weave_unit_function_name_"),
                ("task", &self.task_fed, "__weave_unit_function_name_"),
                (
                    "task_exit",
                    &self.task_exit_fed,
                    "__weave_unit_function_name_",
                ),
                (
                    "detach_continue",
                    &self.detach_continue_fed,
                    "__weave_unit_function_name_",
                ),
                ("sync", &self.sync_fed, "__weave_unit_function_name_"),
                ("alloca", &self.alloca_fed, "__weave_unit_variable_name_"),
                ("allocfn", &self.alloc_fn_fed, "__weave_unit_variable_name_"),
                ("free", &self.free_fed, "__weave_unit_function_name_"),
            ],
        };
        unit::finalize_unit(
            self.module,
            &fed_tables,
            &self.bb_size,
            &self.func_offsets,
            self.function_fed.base_global(),
        );

        UnitSummary {
            instrumented_functions: self.instrumented,
            diagnostics: self.diagnostics,
        }
    }

    /// Skip declarations, engine-internal functions, tool functions,
    /// startup-section functions, and anything that runs at or before
    /// the unit constructor's priority.
    fn should_not_instrument(&self, func_id: FuncId) -> bool {
        let func = self.module.func(func_id);
        if func.is_declaration {
            return true;
        }
        if self.tool_functions.contains(&func.name) {
            return true;
        }
        let name = self.module.interner.resolve(func.name);
        if name.contains("__weave") {
            return true;
        }
        if let Some(section) = &func.section {
            if section == ".text.startup" || section.contains("__StaticInit") {
                return true;
            }
        }
        self.module
            .global_ctors
            .iter()
            .any(|c| c.priority <= WEAVE_CTOR_PRIORITY && c.func == func_id)
    }

    fn instrument_function(&mut self, func_id: FuncId) {
        if self.should_not_instrument(func_id) {
            return;
        }

        if self.options.calls_may_throw {
            canon::setup_calls(self.module, func_id);
        }
        if self.options.instrument_basic_blocks && self.options.calls_terminate_blocks {
            canon::split_blocks_at_calls(self.module, func_id);
        }
        canon::setup_blocks(self.module, func_id, &self.recognizer);
        tracing::debug!(
            function = self.module.func(func_id).name.raw(),
            blocks = self.module.func(func_id).blocks.len(),
            "canonicalized function"
        );

        let dom = DomTree::compute(self.module.func(func_id));
        assert!(
            dom.is_reachable(self.module.func(func_id).entry),
            "function entry must be reachable"
        );
        let tasks = TaskTree::compute(self.module.func(func_id), &dom);
        let loops = LoopForest::compute(self.module.func(func_id), &dom);

        let lists = self.collect_worklists(func_id, &dom);
        let fn_name = self.module.func(func_id).name;

        let local_fn_id = self.function_fed.add_function(self.module, func_id);
        self.func_offsets.push((fn_name, local_fn_id));

        let mut cache = MergeCache::new();

        // Basic blocks first, so the function-entry hook ends up ahead
        // of the entry block's own hook.
        if self.options.instrument_basic_blocks {
            for &block in &lists.basic_blocks {
                self.instrument_basic_block(func_id, block);
            }
        }

        if self.options.instrument_fork_join {
            let track_cells = tasks::keep_track_of_spawns(
                self.module,
                func_id,
                &lists.detaches,
                &lists.syncs.iter().map(|&(b, _)| b).collect::<Vec<_>>(),
            );
            if self
                .config
                .should_instrument(fn_name, InstrumentationPoint::Detach)
            {
                for &detach in &lists.detaches {
                    let mut tables = tasks::TaskTables {
                        detach_fed: &mut self.detach_fed,
                        task_fed: &mut self.task_fed,
                        task_exit_fed: &mut self.task_exit_fed,
                        detach_continue_fed: &mut self.detach_continue_fed,
                    };
                    tasks::instrument_detach(
                        self.module,
                        func_id,
                        detach,
                        &tasks,
                        &loops,
                        &track_cells,
                        &self.hooks,
                        &mut tables,
                        &mut cache,
                    );
                }
            }
            if self
                .config
                .should_instrument(fn_name, InstrumentationPoint::Sync)
            {
                let mut calls_after_sync: FxHashMap<BlockId, InstrId> = FxHashMap::default();
                for &(sync, with_unwind) in &lists.syncs {
                    tasks::instrument_sync(
                        self.module,
                        func_id,
                        sync,
                        with_unwind,
                        &track_cells,
                        &self.hooks,
                        &mut self.sync_fed,
                        &mut cache,
                        &mut calls_after_sync,
                    );
                }
            }
        }

        if self.options.instrument_loops {
            let mut tables = loops::LoopTables {
                loop_fed: &mut self.loop_fed,
                loop_exit_fed: &mut self.loop_exit_fed,
            };
            loops::instrument_loops(self.module, func_id, &loops, &dom, &self.hooks, &mut tables);
        }

        if self.options.instrument_memory_accesses {
            for &(block, access, prop) in &lists.loads_stores {
                mem::instrument_load_or_store(
                    self.module,
                    func_id,
                    access,
                    prop,
                    &self.hooks,
                    &mut self.load_fed,
                    &mut self.store_fed,
                    block,
                );
            }
        }

        if self.options.instrument_atomics {
            for &atomic in &lists.atomics {
                mem::instrument_atomic(self.module, func_id, atomic);
            }
        }

        if self.options.instrument_mem_intrinsics {
            for &intrinsic in &lists.mem_intrinsics {
                mem::instrument_mem_intrinsic(self.module, func_id, intrinsic);
            }
        }

        if self.options.instrument_calls {
            for &site in &lists.callsites {
                calls::instrument_callsite(
                    self.module,
                    func_id,
                    site,
                    &self.hooks,
                    self.config,
                    &mut self.callsite_fed,
                    &mut cache,
                );
            }
        }

        if self.options.instrument_allocas {
            for &(block, alloca) in &lists.allocas {
                alloc::instrument_alloca(
                    self.module,
                    func_id,
                    block,
                    alloca,
                    &self.hooks,
                    &mut self.alloca_fed,
                );
            }
        }

        if self.options.instrument_alloc_fns {
            for &site in &lists.alloc_calls {
                alloc::instrument_alloc_fn(
                    self.module,
                    func_id,
                    site,
                    &self.hooks,
                    &self.recognizer,
                    &mut self.alloc_fn_fed,
                    &mut cache,
                );
            }
            for &(block, call) in &lists.free_calls {
                alloc::instrument_free(
                    self.module,
                    func_id,
                    block,
                    call,
                    &self.hooks,
                    &self.recognizer,
                    &mut self.free_fed,
                );
            }
        }

        if self.options.interpose && self.config.any_interposition() {
            for &site in &lists.all_calls {
                calls::interpose_call(self.module, func_id, site, self.config);
            }
        }

        if self.options.instrument_func_entry_exit {
            self.instrument_func_entry_exit(func_id, fn_name, local_fn_id, lists.may_spawn);
        }

        // Hook calls touch global state; drop memory-effect attributes
        // the instrumentation invalidated.
        self.module.func_mut(func_id).attrs.remove(
            FnAttrs::READ_ONLY
                | FnAttrs::READ_NONE
                | FnAttrs::ARG_MEM_ONLY
                | FnAttrs::INACCESSIBLE_MEM_ONLY,
        );
        self.instrumented += 1;
    }

    fn instrument_basic_block(&mut self, func_id: FuncId, block: BlockId) {
        let local = self.basic_block_fed.add_block(self.module, func_id, block);
        let size_id = self
            .bb_size
            .add_block(self.module, func_id, block, self.cost_model);
        assert_eq!(
            local, size_id,
            "basic block received different ids in the location and size tables"
        );

        let func = self.module.func_mut(func_id);
        let is_pad = func.block_is_landing_pad(block);
        let prop = BlockProp {
            is_landing_pad: is_pad,
            is_eh_pad: is_pad,
        };
        let primary = func.first_debug_loc(block);

        let mut cursor = Cursor::at_first_insertion(func, block);
        let id_op = self.basic_block_fed.to_global_id(local, &mut cursor);
        insert_hook(
            &mut cursor,
            self.hooks.bb_entry,
            vec![id_op, prop.operand()],
            primary,
        );

        let mut cursor = Cursor::before_terminator(func, block);
        insert_hook(
            &mut cursor,
            self.hooks.bb_exit,
            vec![id_op, prop.operand()],
            primary,
        );
    }

    fn instrument_func_entry_exit(
        &mut self,
        func_id: FuncId,
        fn_name: Name,
        local_fn_id: u64,
        may_spawn: bool,
    ) {
        // Materialize the function id at the entry so it dominates
        // every exit.
        let func_id_op = {
            let func = self.module.func_mut(func_id);
            let entry = func.entry;
            let mut cursor = Cursor::at_first_insertion(func, entry);
            let op = self.function_fed.to_global_id(local_fn_id, &mut cursor);

            if self
                .config
                .should_instrument(fn_name, InstrumentationPoint::FunctionEntry)
            {
                let prop = FuncProp { may_spawn };
                let primary = cursor.func().first_debug_loc(entry);
                insert_hook(
                    &mut cursor,
                    self.hooks.func_entry,
                    vec![op, prop.operand()],
                    primary,
                );
            }
            op
        };

        if !self
            .config
            .should_instrument(fn_name, InstrumentationPoint::FunctionExit)
        {
            return;
        }
        let exits: Vec<(BlockId, bool)> = self
            .module
            .func(func_id)
            .blocks
            .iter()
            .enumerate()
            .filter_map(|(idx, block)| {
                #[expect(clippy::cast_possible_truncation, reason = "block counts fit in u32")]
                let id = BlockId::new(idx as u32);
                match block.terminator {
                    Terminator::Ret { .. } => Some((id, false)),
                    Terminator::Resume { .. } => Some((id, true)),
                    _ => None,
                }
            })
            .collect();
        for (block, eh_return) in exits {
            let exit_local = self
                .function_exit_fed
                .add_terminator(self.module, func_id, block);
            let prop = FuncExitProp {
                may_spawn,
                eh_return,
            };
            let func = self.module.func_mut(func_id);
            let primary = func.first_debug_loc(block);
            let mut cursor = Cursor::before_terminator(func, block);
            let exit_id = self.function_exit_fed.to_global_id(exit_local, &mut cursor);
            insert_hook(
                &mut cursor,
                self.hooks.func_exit,
                vec![exit_id, func_id_op, prop.operand()],
                primary,
            );
        }
    }

    /// One deterministic pass over the canonicalized function, compiling
    /// the worklists of every instrumentable construct before anything
    /// is modified.
    fn collect_worklists(&self, func_id: FuncId, dom: &DomTree) -> Worklists {
        let func = self.module.func(func_id);
        let placeholders = canon::placeholder_successors(func);

        // Sync-unwind continuations are structural; their blocks are
        // not instrumented as basic blocks.
        let mut bbs_to_ignore: FxHashSet<BlockId> = FxHashSet::default();
        let mut syncs: Vec<(BlockId, bool)> = Vec::new();
        for (idx, block) in func.blocks.iter().enumerate() {
            #[expect(clippy::cast_possible_truncation, reason = "block counts fit in u32")]
            let id = BlockId::new(idx as u32);
            if !dom.is_reachable(id) {
                continue;
            }
            if let Terminator::Sync { continuation, .. } = block.terminator {
                let with_unwind = matches!(
                    func.block(continuation).terminator,
                    Terminator::SyncUnwind { .. }
                ) && func
                    .block(continuation)
                    .instrs
                    .iter()
                    .all(|&i| matches!(func.instr(i), Instr::Phi { .. }));
                if with_unwind {
                    bbs_to_ignore.insert(continuation);
                }
                syncs.push((id, with_unwind));
            }
        }

        let mut lists = Worklists {
            syncs,
            ..Worklists::default()
        };

        for (idx, block) in func.blocks.iter().enumerate() {
            #[expect(clippy::cast_possible_truncation, reason = "block counts fit in u32")]
            let id = BlockId::new(idx as u32);
            if !dom.is_reachable(id) || (id != func.entry && placeholders.contains(&id)) {
                continue;
            }

            let mut span: Vec<InstrId> = Vec::new();
            for &instr_id in &block.instrs {
                let instr = func.instr(instr_id);
                if is_atomic(instr) {
                    lists.atomics.push(instr_id);
                    continue;
                }
                match instr {
                    Instr::Load { .. } | Instr::Store { .. } => span.push(instr_id),
                    Instr::MemIntrinsic { .. } => {
                        lists.mem_intrinsics.push(instr_id);
                        mem::compute_load_store_properties(
                            self.module,
                            func,
                            &mut span,
                            lists.raw_loads_stores(id),
                        );
                    }
                    Instr::Alloca { .. } => lists.allocas.push((id, instr_id)),
                    Instr::Call { .. } => {
                        let site = CallSite::Plain {
                            block: id,
                            call: instr_id,
                        };
                        self.classify_call(func, site, instr_id, &mut lists);
                        mem::compute_load_store_properties(
                            self.module,
                            func,
                            &mut span,
                            lists.raw_loads_stores(id),
                        );
                    }
                    _ => {}
                }
            }
            mem::compute_load_store_properties(
                self.module,
                func,
                &mut span,
                lists.raw_loads_stores(id),
            );

            match block.terminator {
                Terminator::Detach { .. } => {
                    lists.may_spawn = true;
                    lists.detaches.push(id);
                }
                Terminator::Invoke { call, .. } => {
                    let site = CallSite::Invoke { block: id };
                    self.classify_call(func, site, call, &mut lists);
                }
                _ => {}
            }

            if !bbs_to_ignore.contains(&id) {
                lists.basic_blocks.push(id);
            }
        }

        lists.finish();
        lists
    }

    /// Classify one call site as an allocation, a free, or an ordinary
    /// call.
    fn classify_call(
        &self,
        func: &weave_ir::Function,
        site: CallSite,
        call: InstrId,
        lists: &mut Worklists,
    ) {
        lists.all_calls.push(site);
        match func.instr(call).direct_callee() {
            Some(name) if self.recognizer.is_allocation_fn(name) => lists.alloc_calls.push(site),
            Some(name) if self.recognizer.free_kind(name).is_some() => {
                match site {
                    CallSite::Plain { block, call } => lists.free_calls.push((block, call)),
                    // Frees do not throw; an invoked free is treated as
                    // an ordinary call site.
                    CallSite::Invoke { .. } => lists.callsites.push(site),
                }
            }
            _ => lists.callsites.push(site),
        }
    }
}

/// The per-function worklists, in collection order.
#[derive(Debug, Default)]
struct Worklists {
    loads_stores: Vec<(BlockId, InstrId, LoadStoreProp)>,
    pending: Vec<(BlockId, Vec<(InstrId, LoadStoreProp)>)>,
    atomics: Vec<InstrId>,
    mem_intrinsics: Vec<InstrId>,
    callsites: Vec<CallSite>,
    alloc_calls: Vec<CallSite>,
    free_calls: Vec<(BlockId, InstrId)>,
    allocas: Vec<(BlockId, InstrId)>,
    all_calls: Vec<CallSite>,
    basic_blocks: Vec<BlockId>,
    detaches: Vec<BlockId>,
    syncs: Vec<(BlockId, bool)>,
    may_spawn: bool,
}

impl Worklists {
    /// A property sink for one block's load/store span.
    fn raw_loads_stores(&mut self, block: BlockId) -> &mut Vec<(InstrId, LoadStoreProp)> {
        if self.pending.last().map(|(b, _)| *b) != Some(block) {
            self.pending.push((block, Vec::new()));
        }
        match self.pending.last_mut() {
            Some((_, list)) => list,
            None => unreachable!("pending span was just pushed"),
        }
    }

    /// Flatten the pending per-block spans into the final list.
    fn finish(&mut self) {
        for (block, list) in self.pending.drain(..) {
            for (instr, prop) in list {
                self.loads_stores.push((block, instr, prop));
            }
        }
    }
}
