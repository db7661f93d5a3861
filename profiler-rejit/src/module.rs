//! One module tracked by the coordinator: an arena of its methods,
//! indexed by token, with its own lock for insertion.

use std::collections::HashMap;

use parking_lot::Mutex;
use profiler_il::{MethodToken, ModuleId};

use crate::method::RejitHandlerModuleMethod;

#[derive(Default)]
struct ModuleMethods<FC> {
    entries: Vec<std::sync::Arc<RejitHandlerModuleMethod<FC>>>,
    index: HashMap<MethodToken, usize>,
}

/// Arena entry for one module. Method lookups and insertions go through
/// `methods`'s own lock, separate from the coordinator's module-map
/// lock, matching the original's nested `m_modules_lock`/`m_methods_lock`
/// pair without the bidirectional `RejitHandlerModule*` back-pointer.
pub struct RejitHandlerModule<FC> {
    pub module_id: ModuleId,
    methods: Mutex<ModuleMethods<FC>>,
}

impl<FC> RejitHandlerModule<FC> {
    pub fn new(module_id: ModuleId) -> Self {
        Self { module_id, methods: Mutex::new(ModuleMethods::default()) }
    }

    /// Returns the existing entry for `method_token`, or creates and
    /// registers a fresh one. The only mutating entry point into this
    /// module's method arena; the worker thread is the only caller that
    /// invokes it during normal operation (spec §5).
    pub fn get_or_add_method(&self, method_token: MethodToken) -> std::sync::Arc<RejitHandlerModuleMethod<FC>> {
        let mut guard = self.methods.lock();
        if let Some(&idx) = guard.index.get(&method_token) {
            return guard.entries[idx].clone();
        }
        let entry = std::sync::Arc::new(RejitHandlerModuleMethod::new(method_token));
        let idx = guard.entries.len();
        guard.entries.push(entry.clone());
        guard.index.insert(method_token, idx);
        entry
    }

    pub fn get_method(&self, method_token: MethodToken) -> Option<std::sync::Arc<RejitHandlerModuleMethod<FC>>> {
        let guard = self.methods.lock();
        guard.index.get(&method_token).map(|&idx| guard.entries[idx].clone())
    }

    pub fn contains_method(&self, method_token: MethodToken) -> bool {
        self.methods.lock().index.contains_key(&method_token)
    }

    pub fn method_tokens(&self) -> Vec<MethodToken> {
        self.methods.lock().entries.iter().map(|m| m.method_token).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_add_is_idempotent() {
        let module = RejitHandlerModule::<()>::new(ModuleId(1));
        let a = module.get_or_add_method(MethodToken(0x06000001));
        let b = module.get_or_add_method(MethodToken(0x06000001));
        assert!(std::sync::Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn contains_method_reflects_registration() {
        let module = RejitHandlerModule::<()>::new(ModuleId(1));
        assert!(!module.contains_method(MethodToken(1)));
        module.get_or_add_method(MethodToken(1));
        assert!(module.contains_method(MethodToken(1)));
    }
}
