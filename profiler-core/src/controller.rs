//! The Profiler Controller (spec §4.1): the lifecycle-callback surface
//! the host drives, dispatching into the module metadata store, the
//! signature engine, the two rewrite strategies, the ReJIT coordinator,
//! and the loader injector. Grounded on `bsharp_analysis::framework`'s
//! session/pipeline split — a thin dispatcher over injected
//! collaborators, testable against a fake host the way `AnalysisSession`
//! is tested against an in-memory `ArtifactStore`.

use std::sync::Arc;

use profiler_il::rule::Wrapper;
use profiler_il::signature::TypeSig;
use profiler_il::{AssemblyId, FunctionId, IsolationBoundaryId, MethodReplacement, MethodToken, ModuleId};
use profiler_rejit::RejitHandler;
use profiler_rewrite::strategy::call_site::{self, CallSiteEditPlan, ResolvedTarget, WrapperResolution};
use profiler_rewrite::strategy::wrap::{self, ParamShape, WrapPlan};
use profiler_rewrite::strategy::SkipReason;
use profiler_rewrite::{body, Opcode};

use crate::config::{EngineConfig, RuntimeKind};
use crate::errors::{CoreError, EngineEvent, Result};
use crate::host::{RuntimeHost, WrapperMember};
use crate::loader::LoaderInjector;
use crate::process_state::ProcessState;
use crate::rejit_adapter::CoreRejitHost;

/// The well-known allow-list the loader stub skips injecting into —
/// spec §9's Open Question, resolved here as a plain configurable list
/// rather than a hardcoded one (see DESIGN.md).
const LOADER_SKIP_TYPE_PREFIXES: &[&str] = &["System.", "System.Net.Http."];

pub struct ProfilerController<H: RuntimeHost> {
    host: Arc<H>,
    config: EngineConfig,
    state: ProcessState,
    rejit: Arc<RejitHandler<CoreRejitHost<H>>>,
    managed_counterpart_assembly: String,
    loader_startup_type: String,
}

impl<H: RuntimeHost> ProfilerController<H> {
    /// **Initialize**: acquires the capability record, records the
    /// runtime kind, subscribes to the event mask, and refuses attach
    /// when `TRACE_ENABLED` is unset, the process is excluded, or the
    /// process looks like known infrastructure (spec §4.1).
    pub fn initialize(
        host: Arc<H>,
        config: EngineConfig,
        managed_counterpart_assembly: String,
        loader_startup_type: String,
    ) -> Result<Arc<Self>> {
        if !config.trace_enabled {
            let event = EngineEvent::RefuseAttach { reason: "TRACE_ENABLED is not set".into() };
            event.log();
            return Err(CoreError::RefuseAttach("TRACE_ENABLED is not set".into()));
        }
        let process_name = host.process_name();
        if config.process_is_excluded(&process_name) {
            let reason = format!("process '{process_name}' is excluded");
            EngineEvent::RefuseAttach { reason: reason.clone() }.log();
            return Err(CoreError::RefuseAttach(reason));
        }

        host.set_event_mask(config.enable_inlining, config.disable_optimizations);

        let state = ProcessState::init();
        let rejit_host = Arc::new(CoreRejitHost(host.clone()));
        let rewrite_host = host.clone();
        let rejit = RejitHandler::new(rejit_host, move |module, method| {
            apply_rejit_rewrite(rewrite_host.as_ref(), module, method);
        });

        Ok(Arc::new(Self { host, config, state, rejit, managed_counterpart_assembly, loader_startup_type }))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// **AssemblyLoadFinished**: records the boundary the managed
    /// counterpart loaded into under the desktop-equality /
    /// core-`>=` version policy, and sets the domain-neutral flag if
    /// that boundary is the core library's.
    pub fn assembly_load_finished(&self, assembly: AssemblyId, assembly_name: &str, version: profiler_il::rule::VersionTriple, expected: profiler_il::rule::VersionTriple) {
        if !self.state.is_attached() || assembly_name != self.managed_counterpart_assembly {
            return;
        }
        let version_ok = match self.host.runtime_kind() {
            RuntimeKind::Desktop => version == expected,
            RuntimeKind::Core => version >= expected,
        };
        if !version_ok {
            EngineEvent::NonFatalSkip {
                module: ModuleId(0),
                reason: format!("managed counterpart version {version:?} does not satisfy policy against {expected:?}"),
            }
            .log();
            return;
        }
        let boundary = self.host.assembly_isolation_boundary(assembly);
        let mut boundaries = self.state.boundaries().lock();
        boundaries.mark_loaded(boundary);
        if boundary == self.host.corlib_isolation_boundary() {
            boundaries.set_domain_neutral(true);
        }
    }

    /// **ModuleLoadFinished**: skips uninstrumentable modules, rewrites
    /// the managed counterpart's native-methods type, or admits every
    /// other module into the ReJIT pipeline.
    pub fn module_load_finished(&self, module: ModuleId) {
        if !self.state.is_attached() {
            return;
        }
        if self.host.is_resource_windows_metadata_or_dynamic(module) {
            return;
        }
        let boundary = self.host.module_isolation_boundary(module);
        let assembly_name = self.host.module_assembly_name(module);
        let mvid = self.host.module_version_id(module);

        let mut registry = self.state.modules().write();
        registry.register_module(module, boundary, assembly_name.clone(), mvid);

        if assembly_name == self.managed_counterpart_assembly {
            let injector = LoaderInjector::new(self.host.as_ref());
            if let Err(reason) = injector.rewrite_native_methods_type(module) {
                EngineEvent::NonFatalSkip { module, reason }.log();
            }
            return;
        }

        let rules = self.state.rules().read().clone();
        let active: Vec<MethodReplacement> = rules.into_iter().filter(|r| !self.config.integration_is_disabled(&r.integration_name)).collect();
        registry.set_filtered_rules(module, active.clone());
        drop(registry);

        if active.is_empty() {
            return;
        }
        let integrations = Arc::new(active);
        if let Err(err) = self.rejit.enqueue_process_module(vec![module], integrations) {
            log::warn!("failed to enqueue module {module} for rejit scan: {err}");
        }
    }

    /// **ModuleUnloadStarted**: under the module lock, drops the
    /// module's metadata, informs the coordinator, and drops the
    /// boundary from the loaded/injected sets if it's now empty.
    pub fn module_unload_started(&self, module: ModuleId) {
        let boundary = {
            let mut registry = self.state.modules().write();
            let removed = registry.unregister_module(module);
            self.rejit.remove_module(module);
            removed.map(|m| m.boundary)
        };
        if let Some(boundary) = boundary {
            let registry = self.state.modules().read();
            if registry.boundary_is_empty(boundary) {
                drop(registry);
                self.state.boundaries().lock().remove_boundary(boundary);
            }
        }
    }

    /// **JITCompilationStarted**: no-op when `safe_to_block` is false.
    /// Otherwise runs the loader injector on the boundary's first JIT,
    /// then the call-site replacement strategy.
    pub fn jit_compilation_started(&self, function: FunctionId, safe_to_block: bool) {
        if !safe_to_block || !self.state.is_attached() {
            return;
        }
        let boundary = self.host.module_isolation_boundary(function.module);
        if !self.state.boundaries().lock().is_injected(boundary) {
            if self.should_inject_loader(function.module, function.token) {
                let first_time = self.state.boundaries().lock().mark_injected(boundary);
                if first_time {
                    let injector = LoaderInjector::new(self.host.as_ref());
                    if let Err(reason) = injector.inject_loader_stub(function.module, function.token, &self.loader_startup_type, &self.config, boundary) {
                        EngineEvent::NonFatalSkip { module: function.module, reason }.log();
                    }
                }
            }
        }

        self.instrument_caller(function.module, function.token);
    }

    fn should_inject_loader(&self, module: ModuleId, method: MethodToken) -> bool {
        let Some(info) = self.host.function_info(module, method) else { return true };
        !LOADER_SKIP_TYPE_PREFIXES.iter().any(|prefix| info.type_name.starts_with(prefix))
    }

    /// **JITInlining**: `false` iff the callee is registered with the
    /// ReJIT Coordinator.
    pub fn jit_inlining(&self, _caller: FunctionId, callee: FunctionId) -> bool {
        !self.rejit.has_module_and_method(callee.module, callee.token)
    }

    /// **JITCachedFunctionSearchStarted**: `false` iff the callee's
    /// boundary has no loader yet.
    pub fn jit_cached_function_search_started(&self, function: FunctionId) -> bool {
        let boundary = self.host.module_isolation_boundary(function.module);
        self.state.boundaries().lock().is_injected(boundary)
    }

    /// **AppDomainShutdownFinished**: removes the boundary from the
    /// "loader injected" set.
    pub fn app_domain_shutdown_finished(&self, boundary: IsolationBoundaryId) {
        self.state.boundaries().lock().remove_boundary(boundary);
    }

    /// `InitializeProfiler`'s ingestion entry point (spec §4.9):
    /// appends `rules` to the global list and submits a rejit scan for
    /// every module already on the analysis list, returning a future
    /// the caller can block on for the accepted count. `None` if the
    /// coordinator has already shut down.
    pub fn ingest_rules(&self, rules: Vec<MethodReplacement>) -> Option<profiler_rejit::RejitCountFuture> {
        self.state.rules().write().extend(rules.iter().cloned());
        let modules: Vec<ModuleId> = self.state.modules().read().analysis_list().to_vec();
        let active: Vec<MethodReplacement> = rules.into_iter().filter(|r| !self.config.integration_is_disabled(&r.integration_name)).collect();
        self.rejit.enqueue_process_module(modules, Arc::new(active)).ok()
    }

    pub fn shutdown(&self) {
        self.rejit.shutdown();
        self.state.teardown();
    }

    /// Resolves `module`/`method`'s wrapper-member reference through
    /// the per-module cache (spec §4.2): a hit returns immediately, a
    /// negative-cache hit short-circuits without asking the host
    /// again, and a fresh miss asks the host once and records whichever
    /// way it goes.
    fn ensure_wrapper_ref(&self, module_id: ModuleId, wrapper: &Wrapper, rule_key: &str, member: WrapperMember) -> std::result::Result<u32, SkipReason> {
        let key = format!("{rule_key}|{member:?}");
        {
            let registry = self.state.modules().read();
            if let Some(token) = registry.store.try_get_wrapper_member_ref(module_id, &key) {
                return Ok(token.0);
            }
            if registry.store.is_failed_wrapper_member_key(module_id, &key) {
                return Err(SkipReason::WrapperUnresolvable(key));
            }
        }
        match self.host.resolve_wrapper_member(module_id, wrapper, member) {
            Some(token) => {
                let mut registry = self.state.modules().write();
                if let Some(metadata) = registry.store.get_mut(module_id) {
                    metadata.cache.put_wrapper_member_ref(key, profiler_il::MemberRefToken(token));
                }
                Ok(token)
            }
            None => {
                self.state.modules().write().store.mark_failed_wrapper_member_key(module_id, key.clone());
                EngineEvent::WrapperUnresolvable { key: key.clone(), module: module_id }.log();
                Err(SkipReason::WrapperUnresolvable(key))
            }
        }
    }

    /// Call-site replacement over every eligible call/callvirt in
    /// `caller`'s body (spec §4.5). Each site is handled independently;
    /// a skip on one site never aborts the others.
    fn instrument_caller(&self, module: ModuleId, caller: MethodToken) {
        if self.state.modules().read().filtered_rules(module).is_empty() {
            return;
        }
        let Some(raw_body) = self.host.read_method_body(module, caller) else { return };
        let Ok(mut parsed) = body::import(&raw_body) else { return };

        let sites: Vec<_> = parsed
            .iter()
            .filter_map(|n| match n.opcode {
                Opcode::Call { is_virt } => n.token().map(|tok| (n.id, is_virt, tok)),
                _ => None,
            })
            .collect();

        let mut edited = false;
        for (node_id, is_virt, target_token) in sites {
            let preceded_by_constrained = self.is_preceded_by_constrained(&parsed, node_id);

            let Some(info) = self.host.function_info(module, MethodToken(target_token)) else { continue };
            let rules = self.state.modules().read().filtered_rules(module).to_vec();
            let target = ResolvedTarget {
                info,
                method_def_token: target_token,
                preceded_by_constrained_prefix: preceded_by_constrained,
                managed_counterpart_loaded: self.state.boundaries().lock().is_loaded(self.host.module_isolation_boundary(module)),
                domain_neutral_without_opt_in: self.state.boundaries().lock().is_domain_neutral()
                    && matches!(self.host.runtime_kind(), RuntimeKind::Desktop)
                    && !self.config.domain_neutral_instrumentation,
            };

            let rule = match call_site::find_matching_rule(&rules, &target) {
                Ok(rule) => rule.clone(),
                Err(SkipReason::NoMatchingRule) => continue,
                Err(reason) => {
                    EngineEvent::NonFatalSkip { module, reason: reason.to_string() }.log();
                    continue;
                }
            };

            let rule_key = rule.wrapper_member_key();
            let member_ref = match self.ensure_wrapper_ref(module, &rule.wrapper, &rule_key, WrapperMember::Target) {
                Ok(token) => token,
                Err(_) => continue,
            };

            let method_spec_token = if target.info.generic_arity > 0 {
                let type_args: Vec<&str> = target.info.params.iter().filter_map(TypeSig::full_name).collect();
                if type_args.len() != target.info.generic_arity as usize {
                    EngineEvent::NonFatalSkip { module, reason: SkipReason::GenericArityMismatch.to_string() }.log();
                    continue;
                }
                match self.host.resolve_method_spec(module, &rule.wrapper, &type_args) {
                    Some(token) => Some(token),
                    None => {
                        EngineEvent::WrapperUnresolvable { key: rule_key.clone(), module }.log();
                        continue;
                    }
                }
            } else {
                None
            };

            let resolution = WrapperResolution { member_ref_token: member_ref, method_spec_token };
            let box_kind = call_site::detect_box_requirement(&target.info);
            let box_type_token = box_kind.as_ref().and_then(|kind| {
                let type_name = match kind {
                    profiler_il::signature::BoxBeforeCall::CancellationToken => "System.Threading.CancellationToken".to_string(),
                    profiler_il::signature::BoxBeforeCall::ReadOnlyMemory(inner) => inner.full_name().unwrap_or("System.ReadOnlyMemory`1").to_string(),
                };
                self.host.type_def_info(module, &type_name).map(|t| t.token)
            });
            let wrapper_return_is_abstract = matches!(rule.wrapper.action, profiler_il::rule::WrapperAction::ReplaceTargetMethod);
            let mvid = self.host.module_version_id(module);

            let plan = CallSiteEditPlan::new(
                &target,
                &resolution,
                is_virt,
                wrapper_return_is_abstract,
                box_type_token,
                mvid.0 as i64,
            );

            if call_site::apply_five_step_edit(&mut parsed, node_id, &plan).is_ok() {
                edited = true;
            } else {
                EngineEvent::NonFatalSkip { module, reason: "five-step edit failed".into() }.log();
            }
        }

        if !edited {
            return;
        }
        match body::export(&parsed) {
            Ok(new_raw) => {
                if self.host.write_method_body(module, caller, &new_raw).is_err() {
                    EngineEvent::ExportFailed { module, token: caller.0 }.log();
                }
            }
            Err(err) => {
                log::error!("export failed for {module}/{caller:?}: {err}");
                EngineEvent::ExportFailed { module, token: caller.0 }.log();
            }
        }
    }

    fn is_preceded_by_constrained(&self, body: &profiler_rewrite::body::MethodBody, call_node: profiler_rewrite::ids::NodeId) -> bool {
        body.prev_of(call_node)
            .and_then(|prev| body.node(prev))
            .map(|n| matches!(n.opcode, Opcode::ConstrainedPrefix))
            .unwrap_or(false)
    }
}

/// Invoked by the ReJIT coordinator once `NotifyReJITCompilationStarted`
/// fires and a function-control object is in hand. Builds a `WrapPlan`
/// from the stashed rule and the target's signature, applies the
/// wrapping strategy, and hands the new body back through the
/// function-control object (spec §4.6).
fn apply_rejit_rewrite<H: RuntimeHost>(
    host: &H,
    module: &profiler_rejit::RejitHandlerModule<H::FunctionControl>,
    method: &profiler_rejit::RejitHandlerModuleMethod<H::FunctionControl>,
) {
    let module_id = module.module_id;
    let method_token = method.method_token;
    let Some(rule) = method.method_replacement() else {
        EngineEvent::RejitNotifyMissed { module: module_id, token: method_token.0 }.log();
        return;
    };
    let Some(function_control) = method.take_function_control() else {
        EngineEvent::RejitNotifyMissed { module: module_id, token: method_token.0 }.log();
        return;
    };
    let Some(info) = host.function_info(module_id, method_token) else {
        EngineEvent::NonFatalSkip { module: module_id, reason: "target function info unavailable".into() }.log();
        return;
    };
    let Some(raw_body) = host.read_method_body(module_id, method_token) else {
        EngineEvent::NonFatalSkip { module: module_id, reason: "target method body unavailable".into() }.log();
        return;
    };
    let Ok(mut parsed) = profiler_rewrite::body::import(&raw_body) else {
        EngineEvent::NonFatalSkip { module: module_id, reason: "target method body malformed".into() }.log();
        return;
    };

    let rule_key = rule.wrapper_member_key();
    let begin = host.resolve_wrapper_member(module_id, &rule.wrapper, WrapperMember::BeginMethod);
    let end = host.resolve_wrapper_member(module_id, &rule.wrapper, WrapperMember::EndMethod);
    let log_exception = host.resolve_wrapper_member(module_id, &rule.wrapper, WrapperMember::LogException);
    let get_return_value = host.resolve_wrapper_member(module_id, &rule.wrapper, WrapperMember::GetReturnValue);
    let (Some(begin_method_ref), Some(end_method_ref), Some(log_exception_ref)) = (begin, end, log_exception) else {
        EngineEvent::WrapperUnresolvable { key: rule_key, module: module_id }.log();
        return;
    };

    let exception_type = host.type_def_info(module_id, "System.Exception");
    let exception_type_token = exception_type.map(|t| t.token).unwrap_or(0);

    let instance_type = if info.calling_convention.has_this {
        host.type_def_info(module_id, &info.type_name)
    } else {
        None
    };

    let plan = WrapPlan {
        is_void: matches!(info.return_type, TypeSig::Void),
        is_instance: info.calling_convention.has_this,
        instance_is_value_type: instance_type.map(|t| t.is_value_type).unwrap_or(false),
        instance_is_generic_value_type: instance_type.map(|t| t.is_value_type && t.is_generic).unwrap_or(false),
        instance_type_token: instance_type.map(|t| t.token).unwrap_or(0),
        params: info.params.iter().map(|p| param_shape(host, module_id, p)).collect(),
        begin_method_ref,
        end_method_ref,
        log_exception_ref,
        get_return_value_ref: get_return_value,
        exception_type_token,
    };

    match wrap::apply_wrap(&mut parsed, &plan) {
        Ok(_) => match profiler_rewrite::body::export(&parsed) {
            Ok(new_raw) => {
                if host.apply_rejit_body(&function_control, &new_raw).is_err() {
                    EngineEvent::ExportFailed { module: module_id, token: method_token.0 }.log();
                }
            }
            Err(err) => {
                log::error!("export failed for {module_id}/{method_token:?}: {err}");
                EngineEvent::ExportFailed { module: module_id, token: method_token.0 }.log();
            }
        },
        Err(reason) => EngineEvent::NonFatalSkip { module: module_id, reason: reason.to_string() }.log(),
    }
}

fn param_shape<H: RuntimeHost>(host: &H, module: ModuleId, sig: &TypeSig) -> ParamShape {
    if sig.is_by_ref() {
        return ParamShape::ByRef;
    }
    match sig {
        TypeSig::GenericInstance { .. } => {
            let token = sig.full_name().and_then(|name| host.type_def_info(module, name)).map(|t| t.token).unwrap_or(0);
            ParamShape::Generic { type_token: token }
        }
        _ if sig.is_value_type() => {
            let token = sig.full_name().and_then(|name| host.type_def_info(module, name)).map(|t| t.token).unwrap_or(0);
            ParamShape::ValueType { type_token: token }
        }
        _ => ParamShape::ReferenceType,
    }
}
