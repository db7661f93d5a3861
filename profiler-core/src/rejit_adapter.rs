//! Binds a [`crate::host::RuntimeHost`] to `profiler_rejit::RejitHost`
//! so `ProfilerController` can hand a single host implementation to
//! both the rewrite pipeline and the ReJIT coordinator, instead of the
//! coordinator knowing anything about the wider capability record.

use std::sync::Arc;

use profiler_il::{MethodReplacement, MethodToken, ModuleId};
use profiler_rejit::RejitHost;

use crate::host::RuntimeHost;

pub struct CoreRejitHost<H: RuntimeHost>(pub Arc<H>);

impl<H: RuntimeHost> RejitHost for CoreRejitHost<H> {
    type FunctionControl = H::FunctionControl;

    fn resolve_rule_methods(&self, module: ModuleId, rule: &MethodReplacement) -> Vec<MethodToken> {
        self.0.resolve_rule_methods(module, rule)
    }

    fn request_rejit(&self, modules: &[ModuleId], methods: &[MethodToken]) -> u32 {
        self.0.request_rejit(modules, methods)
    }

    fn enumerate_inliners(&self, module: ModuleId, method: MethodToken) -> Vec<(ModuleId, MethodToken)> {
        self.0.enumerate_inliners(module, method)
    }
}
