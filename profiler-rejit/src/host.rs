//! The runtime-side operations the coordinator drives but never
//! implements itself: requesting a rejit, and enumerating the methods
//! that inline into a given method (needed for NGen'd inliner re-rejit).

use profiler_il::{MethodReplacement, MethodToken, ModuleId};

/// Everything the ReJIT Coordinator asks the host profiling API to do.
/// A production implementation wraps `ICorProfilerInfo4`/`6`/`10`; tests
/// use an in-memory fake that just counts calls.
pub trait RejitHost: Send + Sync + 'static {
    /// The per-method function-control object the runtime hands back
    /// through `GetReJITParameters`. Opaque to the coordinator beyond
    /// "store it until the rewrite callback needs it".
    type FunctionControl: Send + 'static;

    /// Resolves `rule`'s target type/method against `module`'s metadata,
    /// returning the method tokens of every method in the module that
    /// matches. Empty when the module doesn't define the rule's target
    /// type, or the method isn't found. The coordinator never inspects
    /// metadata itself — this is the seam a real implementation plugs
    /// the metadata reader into.
    fn resolve_rule_methods(&self, module: ModuleId, rule: &MethodReplacement) -> Vec<MethodToken>;

    /// Ask the host to schedule a rejit of the given (module, method)
    /// pairs. Returns the number of methods the host accepted.
    fn request_rejit(&self, modules: &[ModuleId], methods: &[MethodToken]) -> u32;

    /// List the (module, method) pairs that inline calls to `method` in
    /// `module`, as reported by the host's inliner-enumeration API.
    /// Only meaningful for modules previously reported via
    /// [`crate::coordinator::RejitHandler::add_ngen_module`].
    fn enumerate_inliners(&self, module: ModuleId, method: MethodToken) -> Vec<(ModuleId, MethodToken)>;
}
