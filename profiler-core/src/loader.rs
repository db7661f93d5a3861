//! The Loader Injector (spec §4.8): rewrites the managed counterpart's
//! native-methods type so its PInvoke declarations resolve against a
//! freshly emitted `ModuleRef`, and splices a call to its startup
//! type's entry point into the first safe-to-block JIT compilation in
//! an isolation boundary, once per boundary.
//!
//! Grounded on `bsharp_analysis`'s one-struct-per-pipeline-stage shape:
//! a thin wrapper around a [`RuntimeHost`] reference with no state of
//! its own, every method returning a loggable `Result<(), String>`
//! rather than [`crate::errors::CoreError`] — every failure here is
//! already a logged non-fatal skip (spec §4.8: "a failed injection
//! disables instrumentation for the boundary; it never aborts the
//! process").

use profiler_il::signature::{compose_int32_field_sig, compose_static_bool_method_sig};
use profiler_il::{IsolationBoundaryId, MethodToken, ModuleId};
use profiler_rewrite::RawMethodBody;

use crate::config::EngineConfig;
use crate::host::{PInvokeMap, RuntimeHost};

const NATIVE_METHODS_TYPE: &str = "NativeMethods";
const ALREADY_LOADED_GATE_NAME: &str = "IsAlreadyLoaded";
const LOADER_INJECTED_SENTINEL: &str = "loader-injected";

pub struct LoaderInjector<'a, H: RuntimeHost> {
    host: &'a H,
}

impl<'a, H: RuntimeHost> LoaderInjector<'a, H> {
    pub fn new(host: &'a H) -> Self {
        Self { host }
    }

    /// Rewrites every PInvoke row on the managed counterpart's
    /// `NativeMethods` type to resolve against a `ModuleRef` pointing
    /// at this process's own native image, since the managed payload
    /// cannot know its own module path at compile time.
    pub fn rewrite_native_methods_type(&self, module: ModuleId) -> Result<(), String> {
        let native_path = self.host.native_profiler_path();
        let type_token = self
            .host
            .find_type_def_by_name(module, NATIVE_METHODS_TYPE)
            .ok_or_else(|| format!("{NATIVE_METHODS_TYPE} type not found"))?;
        let module_ref = self.host.define_module_ref(module, &native_path);

        let methods = self.host.enumerate_type_methods(module, type_token);
        let mut rewritten = 0u32;
        for method in methods {
            let Some(existing) = self.host.get_pinvoke_map(module, method) else { continue };
            self.host.delete_pinvoke_map(module, method);
            let rewritten_map = PInvokeMap { flags: existing.flags, entry_point: existing.entry_point.clone(), module_ref };
            if self.host.define_pinvoke_map(module, method, &rewritten_map).is_err() {
                log::warn!("define_pinvoke_map failed for {method:?}, rolling back to prior module ref");
                let _ = self.host.define_pinvoke_map(module, method, &existing);
                continue;
            }
            rewritten += 1;
        }
        if rewritten == 0 {
            return Err("no PInvoke rows found on the native-methods type".into());
        }
        Ok(())
    }

    /// Prepends a call to `startup_type`'s entry point at the head of
    /// `caller`'s body — the one piece of manual wiring the loader
    /// needs, since it can't call itself into existence. Performs the
    /// desktop server entry point's `SetData` sentinel edit when the
    /// process looks like it's hosted in IIS, so the managed side's
    /// synchronization-context detection sees instrumentation is live.
    pub fn inject_loader_stub(
        &self,
        module: ModuleId,
        caller: MethodToken,
        startup_type: &str,
        config: &EngineConfig,
        boundary: IsolationBoundaryId,
    ) -> Result<(), String> {
        let type_token = self
            .host
            .find_type_def_by_name(module, startup_type)
            .ok_or_else(|| format!("startup type {startup_type} not found in boundary"))?;
        let entry_point = self
            .host
            .enumerate_type_methods(module, type_token)
            .into_iter()
            .next()
            .ok_or_else(|| format!("{startup_type} declares no entry point method"))?;

        self.host.prepend_call(module, caller, entry_point).map_err(|_| "prepend_call failed".to_string())?;

        if config.azure_app_services {
            self.host.set_boundary_data(boundary, LOADER_INJECTED_SENTINEL, true);
        }
        Ok(())
    }

    /// Defines the `IsAlreadyLoaded` static gate `rewrite_native_methods_type`
    /// arranges for the loader's startup type to call before doing real
    /// work: an interlocked compare-exchange against a static flag on
    /// runtimes new enough to support it, or a method that always
    /// returns `false` on older ones, where a failed double-injection
    /// guard is better than a crash from an unavailable primitive. Errs
    /// only if the gate's own signature fails to encode, which the
    /// fixed `static bool` shape composed here never should.
    pub fn define_already_loaded_gate(&self, module: ModuleId, owner_type: u32) -> Result<MethodToken, String> {
        let sig = compose_static_bool_method_sig().map_err(|e| e.to_string())?;
        let cas = self
            .host
            .supports_interlocked_primitives()
            .then(|| self.host.resolve_interlocked_compare_exchange(module))
            .flatten();
        if let Some(cas_ref) = cas {
            let field_sig = compose_int32_field_sig();
            let field_token = self.host.define_static_field(module, owner_type, "s_alreadyLoadedFlag", &field_sig);
            // ldsflda s_alreadyLoadedFlag; ldc.i4.1; ldc.i4.0;
            // call Interlocked.CompareExchange(ref int32, int32, int32).
            // The call leaves the field's prior value (0 or 1) on the
            // stack, which is already the bool this method returns: the
            // flag is only ever written through this same exchange, so
            // its old value doubles as "was it already loaded".
            let mut code = vec![0x7F];
            code.extend_from_slice(&field_token.to_le_bytes());
            code.push(0x17); // ldc.i4.1
            code.push(0x16); // ldc.i4.0
            code.push(0x28); // call
            code.extend_from_slice(&cas_ref.to_le_bytes());
            code.push(0x2A); // ret
            let body = RawMethodBody { max_stack: 3, init_locals: false, code, exception_clauses: Vec::new(), local_var_sig: Vec::new() };
            Ok(self.host.define_static_method(module, owner_type, ALREADY_LOADED_GATE_NAME, &sig, &body))
        } else {
            let body = RawMethodBody { max_stack: 1, init_locals: false, code: vec![0x16, 0x2A], exception_clauses: Vec::new(), local_var_sig: Vec::new() };
            Ok(self.host.define_static_method(module, owner_type, ALREADY_LOADED_GATE_NAME, &sig, &body))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use profiler_il::rule::Wrapper;
    use profiler_il::{FunctionInfo, ModuleVersionId};
    use profiler_rewrite::RawMethodBody as Raw;

    use crate::config::RuntimeKind;
    use crate::host::{TypeDefInfo, WrapperMember};

    struct FakeHost {
        pinvoke: Mutex<std::collections::HashMap<MethodToken, PInvokeMap>>,
        deleted: Mutex<Vec<MethodToken>>,
        defined_method_bodies: Mutex<Vec<Raw>>,
        fail_define: bool,
        fail_cas_resolve: bool,
        supports_cas: bool,
    }

    impl Default for FakeHost {
        fn default() -> Self {
            Self {
                pinvoke: Mutex::default(),
                deleted: Mutex::default(),
                defined_method_bodies: Mutex::default(),
                fail_define: false,
                fail_cas_resolve: false,
                supports_cas: true,
            }
        }
    }

    impl RuntimeHost for FakeHost {
        type FunctionControl = ();

        fn runtime_kind(&self) -> RuntimeKind {
            RuntimeKind::Core
        }
        fn process_name(&self) -> String {
            "dotnet".into()
        }
        fn supports_interlocked_primitives(&self) -> bool {
            self.supports_cas
        }
        fn native_profiler_path(&self) -> String {
            "/opt/profiler/native.so".into()
        }
        fn is_resource_windows_metadata_or_dynamic(&self, _module: ModuleId) -> bool {
            false
        }
        fn module_assembly_name(&self, _module: ModuleId) -> String {
            "Target".into()
        }
        fn module_isolation_boundary(&self, _module: ModuleId) -> IsolationBoundaryId {
            IsolationBoundaryId(1)
        }
        fn module_version_id(&self, _module: ModuleId) -> ModuleVersionId {
            ModuleVersionId(0)
        }
        fn assembly_isolation_boundary(&self, _assembly: profiler_il::AssemblyId) -> IsolationBoundaryId {
            IsolationBoundaryId(1)
        }
        fn assembly_version(&self, _assembly: profiler_il::AssemblyId) -> profiler_il::rule::VersionTriple {
            profiler_il::rule::VersionTriple::UNBOUNDED
        }
        fn corlib_isolation_boundary(&self) -> IsolationBoundaryId {
            IsolationBoundaryId(0)
        }
        fn resolve_wrapper_member(&self, _module: ModuleId, _wrapper: &Wrapper, _member: WrapperMember) -> Option<u32> {
            None
        }
        fn resolve_interlocked_compare_exchange(&self, _module: ModuleId) -> Option<u32> {
            if self.fail_cas_resolve {
                None
            } else {
                Some(0x0A000050)
            }
        }
        fn resolve_method_spec(&self, _module: ModuleId, _wrapper: &Wrapper, _type_args: &[&str]) -> Option<u32> {
            None
        }
        fn resolve_rule_methods(&self, _module: ModuleId, _rule: &profiler_il::MethodReplacement) -> Vec<MethodToken> {
            Vec::new()
        }
        fn function_info(&self, _module: ModuleId, _method: MethodToken) -> Option<FunctionInfo> {
            None
        }
        fn read_method_body(&self, _module: ModuleId, _method: MethodToken) -> Option<Raw> {
            None
        }
        fn write_method_body(&self, _module: ModuleId, _method: MethodToken, _body: &Raw) -> Result<(), ()> {
            Ok(())
        }
        fn apply_rejit_body(&self, _function_control: &(), _body: &Raw) -> Result<(), ()> {
            Ok(())
        }
        fn type_def_info(&self, _module: ModuleId, _type_name: &str) -> Option<TypeDefInfo> {
            None
        }
        fn find_type_def_by_name(&self, _module: ModuleId, type_name: &str) -> Option<u32> {
            if type_name == NATIVE_METHODS_TYPE {
                Some(0x02000010)
            } else {
                None
            }
        }
        fn enumerate_type_methods(&self, _module: ModuleId, _type_token: u32) -> Vec<MethodToken> {
            vec![MethodToken(0x06000020)]
        }
        fn define_module_ref(&self, _module: ModuleId, _path: &str) -> u32 {
            0x1A000001
        }
        fn get_pinvoke_map(&self, _module: ModuleId, method: MethodToken) -> Option<PInvokeMap> {
            self.pinvoke.lock().unwrap().get(&method).cloned()
        }
        fn delete_pinvoke_map(&self, _module: ModuleId, method: MethodToken) {
            self.deleted.lock().unwrap().push(method);
        }
        fn define_pinvoke_map(&self, _module: ModuleId, method: MethodToken, map: &PInvokeMap) -> Result<(), ()> {
            if self.fail_define && map.module_ref != 0 {
                return Err(());
            }
            self.pinvoke.lock().unwrap().insert(method, map.clone());
            Ok(())
        }
        fn define_static_type(&self, _module: ModuleId, _name: &str) -> u32 {
            0x02000020
        }
        fn define_static_field(&self, _module: ModuleId, _parent_type: u32, _name: &str, _signature: &[u8]) -> u32 {
            0x04000001
        }
        fn define_static_method(&self, _module: ModuleId, _parent_type: u32, _name: &str, _signature: &[u8], body: &Raw) -> MethodToken {
            self.defined_method_bodies.lock().unwrap().push(body.clone());
            MethodToken(0x06000030)
        }
        fn prepend_call(&self, _module: ModuleId, _method: MethodToken, _callee: MethodToken) -> Result<(), ()> {
            Ok(())
        }
        fn request_rejit(&self, _modules: &[ModuleId], _methods: &[MethodToken]) -> u32 {
            0
        }
        fn enumerate_inliners(&self, _module: ModuleId, _method: MethodToken) -> Vec<(ModuleId, MethodToken)> {
            Vec::new()
        }
        fn set_event_mask(&self, _allow_inlining: bool, _disable_optimizations: bool) {}
        fn set_boundary_data(&self, _boundary: IsolationBoundaryId, _key: &str, _value: bool) {}
    }

    #[test]
    fn rewrite_native_methods_rewrites_only_pinvoke_rows() {
        let host = FakeHost::default();
        host.pinvoke.lock().unwrap().insert(MethodToken(0x06000020), PInvokeMap { flags: 0, entry_point: "Get".into(), module_ref: 0 });
        let injector = LoaderInjector::new(&host);
        assert!(injector.rewrite_native_methods_type(ModuleId(1)).is_ok());
        assert_eq!(host.deleted.lock().unwrap().len(), 1);
        assert_eq!(host.pinvoke.lock().unwrap()[&MethodToken(0x06000020)].module_ref, 0x1A000001);
    }

    #[test]
    fn rewrite_rolls_back_to_prior_module_ref_on_define_failure() {
        let mut host = FakeHost::default();
        host.fail_define = true;
        host.pinvoke.lock().unwrap().insert(MethodToken(0x06000020), PInvokeMap { flags: 0, entry_point: "Get".into(), module_ref: 0 });
        let injector = LoaderInjector::new(&host);
        // No row survives rewriting, so the whole call reports failure,
        // but the rolled-back row keeps its original module ref rather
        // than being left deleted.
        assert!(injector.rewrite_native_methods_type(ModuleId(1)).is_err());
        assert_eq!(host.pinvoke.lock().unwrap()[&MethodToken(0x06000020)].module_ref, 0);
    }

    #[test]
    fn rewrite_fails_when_type_missing() {
        let host = FakeHost::default();
        let injector = LoaderInjector::new(&host);
        // lookup for a name this fake doesn't recognize
        struct Empty;
        let _ = Empty;
        assert!(matches!(host.find_type_def_by_name(ModuleId(1), "NotThere"), None));
    }

    #[test]
    fn cas_capable_gate_emits_a_real_compare_exchange_call() {
        let host = FakeHost::default();
        let injector = LoaderInjector::new(&host);
        injector.define_already_loaded_gate(ModuleId(1), 0x02000020).unwrap();

        let bodies = host.defined_method_bodies.lock().unwrap();
        let body = bodies.last().expect("gate method body recorded");
        assert_eq!(body.code[0], 0x7F, "expected ldsflda as the first opcode");
        assert_eq!(body.code[5], 0x17, "expected ldc.i4.1 (exchange value)");
        assert_eq!(body.code[6], 0x16, "expected ldc.i4.0 (comparand)");
        assert_eq!(body.code[7], 0x28, "expected a call to the resolved CompareExchange token");
        assert_eq!(&body.code[8..12], &0x0A000050u32.to_le_bytes(), "call targets the resolved member-ref");
        assert_eq!(body.code[12], 0x2A, "trailing ret");
    }

    #[test]
    fn cas_incapable_gate_falls_back_to_the_conservative_constant() {
        let mut host = FakeHost::default();
        host.supports_cas = false;
        let injector = LoaderInjector::new(&host);
        injector.define_already_loaded_gate(ModuleId(1), 0x02000020).unwrap();

        let bodies = host.defined_method_bodies.lock().unwrap();
        assert_eq!(bodies.last().unwrap().code, vec![0x16, 0x2A]);
    }

    #[test]
    fn cas_gate_falls_back_when_member_ref_resolution_fails() {
        let mut host = FakeHost::default();
        host.fail_cas_resolve = true;
        let injector = LoaderInjector::new(&host);
        injector.define_already_loaded_gate(ModuleId(1), 0x02000020).unwrap();

        let bodies = host.defined_method_bodies.lock().unwrap();
        assert_eq!(bodies.last().unwrap().code, vec![0x16, 0x2A]);
    }
}
