//! Per-module metadata cache (spec §3, §4.2).

use std::collections::{HashMap, HashSet};

use crate::ids::{IsolationBoundaryId, ModuleId, ModuleVersionId};

/// A cross-module member reference, as resolved by the rewriter's
/// ensure-wrapper-ref flow. Modeled as an opaque token; the rewriter is
/// the only consumer that needs to know it names a `MemberRef` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemberRefToken(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeRefToken(pub u32);

/// Per-module caches from spec §3: resolved wrapper member/type
/// references, and the negative cache of member keys that will never be
/// retried for this module's lifetime.
#[derive(Debug, Default)]
pub struct PerModuleCache {
    wrapper_member_refs: HashMap<String, MemberRefToken>,
    wrapper_type_refs: HashMap<String, TypeRefToken>,
    failed_wrapper_member_keys: HashSet<String>,
}

impl PerModuleCache {
    pub fn try_get_wrapper_member_ref(&self, key: &str) -> Option<MemberRefToken> {
        self.wrapper_member_refs.get(key).copied()
    }

    pub fn put_wrapper_member_ref(&mut self, key: String, reference: MemberRefToken) {
        self.wrapper_member_refs.insert(key, reference);
    }

    pub fn try_get_wrapper_parent_type_ref(&self, key: &str) -> Option<TypeRefToken> {
        self.wrapper_type_refs.get(key).copied()
    }

    pub fn put_wrapper_parent_type_ref(&mut self, key: String, reference: TypeRefToken) {
        self.wrapper_type_refs.insert(key, reference);
    }

    /// Strictly monotonic: once marked failed, a key is never retried for
    /// this module's lifetime (spec §3 invariant).
    pub fn mark_failed_wrapper_member_key(&mut self, key: String) {
        self.failed_wrapper_member_keys.insert(key);
    }

    pub fn is_failed_wrapper_member_key(&self, key: &str) -> bool {
        self.failed_wrapper_member_keys.contains(key)
    }
}

/// Everything the controller and the rewriter need about one loaded
/// module. Lifetime exactly brackets the module's load (spec §3).
#[derive(Debug)]
pub struct ModuleMetadata {
    pub module_id: ModuleId,
    pub boundary: IsolationBoundaryId,
    pub assembly_name: String,
    pub module_version_id: ModuleVersionId,
    pub cache: PerModuleCache,
}

impl ModuleMetadata {
    pub fn new(module_id: ModuleId, boundary: IsolationBoundaryId, assembly_name: String, module_version_id: ModuleVersionId) -> Self {
        Self {
            module_id,
            boundary,
            assembly_name,
            module_version_id,
            cache: PerModuleCache::default(),
        }
    }
}

/// Map keyed by module id holding per-module metadata and caches.
/// Access is serialized by the controller's coarse lock (spec §5); this
/// type itself holds no lock — callers are expected to wrap it (see
/// `profiler-core::process_state`).
#[derive(Debug, Default)]
pub struct ModuleMetadataStore {
    modules: HashMap<ModuleId, ModuleMetadata>,
}

impl ModuleMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, metadata: ModuleMetadata) {
        self.modules.insert(metadata.module_id, metadata);
    }

    /// Destroys the module's cache. Per spec §3's invariant, the module's
    /// metadata lives exactly as long as the module load — this must be
    /// called from `ModuleUnloadStarted` before any further use of the
    /// module id.
    pub fn remove(&mut self, module_id: ModuleId) -> Option<ModuleMetadata> {
        self.modules.remove(&module_id)
    }

    pub fn get(&self, module_id: ModuleId) -> Option<&ModuleMetadata> {
        self.modules.get(&module_id)
    }

    pub fn get_mut(&mut self, module_id: ModuleId) -> Option<&mut ModuleMetadata> {
        self.modules.get_mut(&module_id)
    }

    pub fn try_get_wrapper_member_ref(&self, module_id: ModuleId, key: &str) -> Option<MemberRefToken> {
        self.modules.get(&module_id)?.cache.try_get_wrapper_member_ref(key)
    }

    pub fn try_get_wrapper_parent_type_ref(&self, module_id: ModuleId, key: &str) -> Option<TypeRefToken> {
        self.modules.get(&module_id)?.cache.try_get_wrapper_parent_type_ref(key)
    }

    pub fn mark_failed_wrapper_member_key(&mut self, module_id: ModuleId, key: String) {
        if let Some(module) = self.modules.get_mut(&module_id) {
            module.cache.mark_failed_wrapper_member_key(key);
        }
    }

    pub fn is_failed_wrapper_member_key(&self, module_id: ModuleId, key: &str) -> bool {
        self.modules
            .get(&module_id)
            .map(|m| m.cache.is_failed_wrapper_member_key(key))
            .unwrap_or(false)
    }

    /// Modules still loaded in the given boundary — used by
    /// `ModuleUnloadStarted` to decide whether to drop the boundary from
    /// the loaded/injected sets.
    pub fn modules_in_boundary(&self, boundary: IsolationBoundaryId) -> impl Iterator<Item = ModuleId> + '_ {
        self.modules
            .values()
            .filter(move |m| m.boundary == boundary)
            .map(|m| m.module_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(id: u64) -> ModuleMetadata {
        ModuleMetadata::new(ModuleId(id), IsolationBoundaryId(1), "Asm".into(), ModuleVersionId(0))
    }

    #[test]
    fn negative_cache_is_sticky() {
        let mut store = ModuleMetadataStore::new();
        store.insert(module(1));
        store.mark_failed_wrapper_member_key(ModuleId(1), "k".into());
        assert!(store.is_failed_wrapper_member_key(ModuleId(1), "k"));
        // Simulate a caller re-checking before attempting resolution again.
        assert!(store.is_failed_wrapper_member_key(ModuleId(1), "k"));
    }

    #[test]
    fn resolved_ref_is_stable_across_queries() {
        let mut store = ModuleMetadataStore::new();
        store.insert(module(1));
        store
            .get_mut(ModuleId(1))
            .unwrap()
            .cache
            .put_wrapper_member_ref("k".into(), MemberRefToken(0x0A000001));
        assert_eq!(
            store.try_get_wrapper_member_ref(ModuleId(1), "k"),
            Some(MemberRefToken(0x0A000001))
        );
        assert_eq!(
            store.try_get_wrapper_member_ref(ModuleId(1), "k"),
            Some(MemberRefToken(0x0A000001))
        );
    }

    #[test]
    fn unload_destroys_cache_before_further_use() {
        let mut store = ModuleMetadataStore::new();
        store.insert(module(1));
        store.mark_failed_wrapper_member_key(ModuleId(1), "k".into());
        store.remove(ModuleId(1));
        assert!(!store.is_failed_wrapper_member_key(ModuleId(1), "k"));
        assert!(store.get(ModuleId(1)).is_none());
    }

    #[test]
    fn modules_in_boundary_filters_correctly() {
        let mut store = ModuleMetadataStore::new();
        store.insert(ModuleMetadata::new(ModuleId(1), IsolationBoundaryId(1), "A".into(), ModuleVersionId(0)));
        store.insert(ModuleMetadata::new(ModuleId(2), IsolationBoundaryId(2), "B".into(), ModuleVersionId(0)));
        let in_boundary_one: Vec<_> = store.modules_in_boundary(IsolationBoundaryId(1)).collect();
        assert_eq!(in_boundary_one, vec![ModuleId(1)]);
    }
}
