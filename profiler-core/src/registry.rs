//! The module-scoped bookkeeping `ModuleLoadFinished` populates and
//! `ModuleUnloadStarted` tears down: the IL crate's metadata store, the
//! ReJIT analysis list, and the legacy call-site path's per-module
//! filtered-rule snapshot.
//!
//! Kept separate from `profiler_il::store::ModuleMetadata` rather than
//! adding fields to it: that struct's public surface is exactly the
//! three caches spec §4.2 operationalizes (`TryGetWrapperMemberRef` and
//! friends), and this registry is controller-specific bookkeeping on
//! top of it (see DESIGN.md).

use std::collections::HashMap;

use profiler_il::{IsolationBoundaryId, MethodReplacement, ModuleId, ModuleMetadata, ModuleMetadataStore, ModuleVersionId};

#[derive(Debug, Default)]
pub struct ModuleRegistry {
    pub store: ModuleMetadataStore,
    /// Order in which modules were admitted to the ReJIT pipeline —
    /// spec §4.1's "appending the module id to the analysis list".
    analysis_list: Vec<ModuleId>,
    /// Legacy (non-ReJIT) path's per-module snapshot of rules not
    /// disabled by `DISABLED_INTEGRATIONS` at the time the module was
    /// loaded.
    filtered_rules: HashMap<ModuleId, Vec<MethodReplacement>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_module(&mut self, module_id: ModuleId, boundary: IsolationBoundaryId, assembly_name: String, mvid: ModuleVersionId) {
        self.store.insert(ModuleMetadata::new(module_id, boundary, assembly_name, mvid));
        self.analysis_list.push(module_id);
    }

    pub fn unregister_module(&mut self, module_id: ModuleId) -> Option<ModuleMetadata> {
        self.analysis_list.retain(|&m| m != module_id);
        self.filtered_rules.remove(&module_id);
        self.store.remove(module_id)
    }

    pub fn set_filtered_rules(&mut self, module_id: ModuleId, rules: Vec<MethodReplacement>) {
        self.filtered_rules.insert(module_id, rules);
    }

    pub fn filtered_rules(&self, module_id: ModuleId) -> &[MethodReplacement] {
        self.filtered_rules.get(&module_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn analysis_list(&self) -> &[ModuleId] {
        &self.analysis_list
    }

    /// True iff no module in the registry still lives in `boundary` —
    /// `ModuleUnloadStarted`'s trigger for dropping the boundary from
    /// the loaded/injected sets.
    pub fn boundary_is_empty(&self, boundary: IsolationBoundaryId) -> bool {
        self.store.modules_in_boundary(boundary).next().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use profiler_il::IsolationBoundaryId as Boundary;

    #[test]
    fn unregister_removes_from_analysis_list_and_store() {
        let mut registry = ModuleRegistry::new();
        registry.register_module(ModuleId(1), Boundary(1), "Asm".into(), ModuleVersionId(0));
        assert_eq!(registry.analysis_list(), &[ModuleId(1)]);
        registry.unregister_module(ModuleId(1));
        assert!(registry.analysis_list().is_empty());
        assert!(registry.store.get(ModuleId(1)).is_none());
    }

    #[test]
    fn boundary_is_empty_once_last_module_unloads() {
        let mut registry = ModuleRegistry::new();
        registry.register_module(ModuleId(1), Boundary(9), "Asm".into(), ModuleVersionId(0));
        assert!(!registry.boundary_is_empty(Boundary(9)));
        registry.unregister_module(ModuleId(1));
        assert!(registry.boundary_is_empty(Boundary(9)));
    }
}
