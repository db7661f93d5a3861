//! One method tracked by the coordinator: its pending rewrite intent,
//! the per-method function-control slot, and the set of NGen'd modules
//! already confirmed to contain an inliner of it.

use std::collections::HashSet;

use parking_lot::Mutex;
use profiler_il::{MethodReplacement, MethodToken, ModuleId};

struct MethodState<FC> {
    function_control: Option<FC>,
    method_replacement: Option<MethodReplacement>,
    /// NGen'd modules whose inliners of this method have already been
    /// enqueued for rejit — re-architected from the original's
    /// `m_ngenModules` map, which used presence-as-bool.
    rejitted_inliner_modules: HashSet<ModuleId>,
}

/// Arena entry for one (module, method) the coordinator has accepted a
/// rejit intent for. Holds no pointer back to its owning module or
/// handler — callers address it by `(ModuleId, MethodToken)` through
/// [`crate::coordinator::RejitHandler`], per the arena-indexed
/// re-architecture in spec §9.
pub struct RejitHandlerModuleMethod<FC> {
    pub method_token: MethodToken,
    state: Mutex<MethodState<FC>>,
}

impl<FC> RejitHandlerModuleMethod<FC> {
    pub fn new(method_token: MethodToken) -> Self {
        Self {
            method_token,
            state: Mutex::new(MethodState {
                function_control: None,
                method_replacement: None,
                rejitted_inliner_modules: HashSet::new(),
            }),
        }
    }

    /// Stashed by `NotifyReJITParameters`; the rewrite cannot proceed
    /// without it.
    pub fn set_function_control(&self, function_control: FC) {
        self.state.lock().function_control = Some(function_control);
    }

    pub fn take_function_control(&self) -> Option<FC> {
        self.state.lock().function_control.take()
    }

    pub fn has_function_control(&self) -> bool {
        self.state.lock().function_control.is_some()
    }

    pub fn set_method_replacement(&self, replacement: MethodReplacement) {
        self.state.lock().method_replacement = Some(replacement);
    }

    pub fn method_replacement(&self) -> Option<MethodReplacement> {
        self.state.lock().method_replacement.clone()
    }

    /// Records that `ngen_module`'s inliners of this method have been
    /// requested for rejit, so a later `AddNGenModule` call for the
    /// same module never re-enqueues the same inliners.
    pub fn mark_inliners_rejitted(&self, ngen_module: ModuleId) -> bool {
        self.state.lock().rejitted_inliner_modules.insert(ngen_module)
    }
}
