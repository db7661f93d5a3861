//! The capability record the controller drives but never implements
//! (spec §9's re-architecture of "deep polymorphism over profiler-info
//! versions"): one flat trait, built once at `Initialize`, rather than
//! a chain of versioned interfaces. Grounded on `bsharp_il::loader`'s
//! `IlProvider` split between a parsed model and the thing that
//! resolves it against live metadata.

use profiler_il::rule::Wrapper;
use profiler_il::{AssemblyId, FunctionInfo, IsolationBoundaryId, MethodReplacement, MethodToken, ModuleId, ModuleVersionId};
use profiler_rewrite::RawMethodBody;

use crate::config::RuntimeKind;

/// Which of a wrapper's well-known members is being resolved. Folds
/// spec §4.5's "wrapper member reference" and §4.6's `BeginMethod`/
/// `EndMethod`/`LogException`/`GetReturnValue` lookups into the same
/// ensure-wrapper-ref seam (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WrapperMember {
    /// The named member for call-site replacement (`wrapper.method_name`).
    Target,
    BeginMethod,
    EndMethod,
    LogException,
    GetReturnValue,
}

#[derive(Debug, Clone, Copy)]
pub struct TypeDefInfo {
    pub token: u32,
    pub is_value_type: bool,
    pub is_generic: bool,
}

/// The fields of a `PInvokeMap` row the loader injector reads, deletes,
/// and re-creates against a new `ModuleRef` (spec §4.8).
#[derive(Debug, Clone)]
pub struct PInvokeMap {
    pub flags: u16,
    pub entry_point: String,
    pub module_ref: u32,
}

/// Everything the engine asks the host profiling API to do. A
/// production implementation wraps the real `ICorProfilerInfo*`
/// interfaces and the metadata emit/import APIs; tests implement a
/// `FakeHost` that simulates a handful of modules and methods.
pub trait RuntimeHost: Send + Sync + 'static {
    /// The per-method function-control object the runtime hands back
    /// through `GetReJITParameters`, threaded straight through to
    /// `profiler_rejit::RejitHost::FunctionControl`.
    type FunctionControl: Send + 'static;

    fn runtime_kind(&self) -> RuntimeKind;
    fn process_name(&self) -> String;
    fn supports_interlocked_primitives(&self) -> bool;
    fn native_profiler_path(&self) -> String;

    fn is_resource_windows_metadata_or_dynamic(&self, module: ModuleId) -> bool;
    fn module_assembly_name(&self, module: ModuleId) -> String;
    fn module_isolation_boundary(&self, module: ModuleId) -> IsolationBoundaryId;
    fn module_version_id(&self, module: ModuleId) -> ModuleVersionId;

    fn assembly_isolation_boundary(&self, assembly: AssemblyId) -> IsolationBoundaryId;
    fn assembly_version(&self, assembly: AssemblyId) -> profiler_il::rule::VersionTriple;
    fn corlib_isolation_boundary(&self) -> IsolationBoundaryId;

    /// Resolves `member` of `wrapper`'s type into a cross-module member
    /// reference token, minting a `MemberRef`/`TypeRef` row in `module`
    /// as needed. `None` on failure — the caller records the negative
    /// cache entry, never the host.
    fn resolve_wrapper_member(&self, module: ModuleId, wrapper: &Wrapper, member: WrapperMember) -> Option<u32>;

    /// Resolves `System.Threading.Interlocked::CompareExchange(int32&, int32, int32)`
    /// into a `MemberRef` token in `module`, minting the `TypeRef`/
    /// `MemberRef` rows as needed — the same token-minting capability as
    /// [`Self::resolve_wrapper_member`], aimed at a CoreLib intrinsic
    /// instead of a wrapper's own type. `None` when the host can't reach
    /// CoreLib's `Interlocked` type, in which case the loader injector
    /// falls back to its conservative gate.
    fn resolve_interlocked_compare_exchange(&self, module: ModuleId) -> Option<u32>;

    /// Every method token in `module` whose (type, method) pair matches
    /// `rule`'s target — the seam `profiler_rejit::RejitHost` and the
    /// legacy call-site path both resolve rules through.
    fn resolve_rule_methods(&self, module: ModuleId, rule: &MethodReplacement) -> Vec<MethodToken>;

    /// Parses and resolves `method`'s signature against `module`'s
    /// metadata — the source of a `FunctionInfo` the rewrite strategies
    /// match rules against.
    fn function_info(&self, module: ModuleId, method: MethodToken) -> Option<FunctionInfo>;
    fn read_method_body(&self, module: ModuleId, method: MethodToken) -> Option<RawMethodBody>;
    /// Commits a rewritten body for the legacy call-site path, where
    /// there is no function-control object to hand it back through.
    fn write_method_body(&self, module: ModuleId, method: MethodToken, body: &RawMethodBody) -> Result<(), ()>;
    /// Commits a rewritten body via the per-method function-control
    /// object the ReJIT path stashed (spec §4.6: "the rewrite is atomic
    /// at the host level").
    fn apply_rejit_body(&self, function_control: &Self::FunctionControl, body: &RawMethodBody) -> Result<(), ()>;

    /// Everything the wrapping strategy needs about a named type to
    /// decide how to push its instance (spec §4.6): the token to box
    /// or `ldobj` against, and whether it is a value type / open
    /// generic, since a generic value-type instance aborts the
    /// rewrite.
    fn type_def_info(&self, module: ModuleId, type_name: &str) -> Option<TypeDefInfo>;

    /// A `MethodSpec` token binding a generic wrapper member to
    /// `type_args`' concrete instantiation — the call-site strategy's
    /// step 3 when the target is generic (spec §4.5).
    fn resolve_method_spec(&self, module: ModuleId, wrapper: &Wrapper, type_args: &[&str]) -> Option<u32>;

    fn find_type_def_by_name(&self, module: ModuleId, type_name: &str) -> Option<u32>;
    /// Every method token `type_token` declares in `module` — the
    /// loader injector's way of finding a PInvoke row or a startup
    /// type's entry point without a dedicated by-name method lookup
    /// (spec §4.8).
    fn enumerate_type_methods(&self, module: ModuleId, type_token: u32) -> Vec<MethodToken>;
    fn define_module_ref(&self, module: ModuleId, path: &str) -> u32;
    fn get_pinvoke_map(&self, module: ModuleId, method: MethodToken) -> Option<PInvokeMap>;
    fn delete_pinvoke_map(&self, module: ModuleId, method: MethodToken);
    fn define_pinvoke_map(&self, module: ModuleId, method: MethodToken, map: &PInvokeMap) -> Result<(), ()>;

    fn define_static_type(&self, module: ModuleId, name: &str) -> u32;
    fn define_static_field(&self, module: ModuleId, parent_type: u32, name: &str, signature: &[u8]) -> u32;
    fn define_static_method(
        &self,
        module: ModuleId,
        parent_type: u32,
        name: &str,
        signature: &[u8],
        body: &RawMethodBody,
    ) -> MethodToken;

    /// Prepends a call to `callee` at the start of `method`'s body.
    /// Used once per isolation boundary to splice in the loader-stub
    /// call (spec §4.8), and for the desktop server entry point's
    /// `SetData` sentinel edit.
    fn prepend_call(&self, module: ModuleId, method: MethodToken, callee: MethodToken) -> Result<(), ()>;

    fn request_rejit(&self, modules: &[ModuleId], methods: &[MethodToken]) -> u32;
    fn enumerate_inliners(&self, module: ModuleId, method: MethodToken) -> Vec<(ModuleId, MethodToken)>;

    fn set_event_mask(&self, allow_inlining: bool, disable_optimizations: bool);

    /// `SetData`-equivalent on an isolation boundary: a sentinel string
    /// key and a boxed boolean, used by the desktop server entry point
    /// edit in spec §4.8.
    fn set_boundary_data(&self, boundary: IsolationBoundaryId, key: &str, value: bool);
}
