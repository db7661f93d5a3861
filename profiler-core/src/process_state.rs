//! The engine's one piece of retained global state (spec §9: "the
//! singleton controller pointer ... must be retained because the host
//! ABI requires them; isolate them behind a small `process_state`
//! module with explicit `init`/`teardown` and no other hidden
//! globals").
//!
//! `ProfilerController` owns one `ProcessState` for its lifetime rather
//! than reaching for a `static`: the host ABI's requirement is that
//! *some* single instance exists for the process, which is the
//! responsibility of whatever out-of-scope binary crate links a
//! concrete `RuntimeHost` and holds the one live controller for the
//! process (see DESIGN.md's Open Question on this note) — this module
//! supplies the explicit `init`/`teardown` lifecycle that singleton
//! wraps, rather than reimplementing a generic-static here.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use profiler_il::{IsolationBoundaryId, MethodReplacement};

use crate::registry::ModuleRegistry;

/// Process-wide isolation-boundary state from spec §3: which
/// boundaries have the managed payload loaded, which already have the
/// loader stub injected, and whether the payload is also visible
/// domain-neutrally.
#[derive(Debug, Default)]
pub struct BoundaryState {
    loaded: HashSet<IsolationBoundaryId>,
    injected: HashSet<IsolationBoundaryId>,
    domain_neutral: bool,
}

impl BoundaryState {
    pub fn mark_loaded(&mut self, boundary: IsolationBoundaryId) {
        self.loaded.insert(boundary);
    }

    pub fn is_loaded(&self, boundary: IsolationBoundaryId) -> bool {
        self.loaded.contains(&boundary)
    }

    /// `AppDomainShutdownFinished` / the last module leaving a
    /// boundary: drop it from both sets. Per spec §3's invariant, this
    /// is the only path that removes a boundary from `injected`.
    pub fn remove_boundary(&mut self, boundary: IsolationBoundaryId) {
        self.loaded.remove(&boundary);
        self.injected.remove(&boundary);
    }

    /// `loader_injected(B)` transitions 0->1 at most once (spec §8):
    /// returns `true` only the first time this boundary is marked.
    pub fn mark_injected(&mut self, boundary: IsolationBoundaryId) -> bool {
        self.injected.insert(boundary)
    }

    pub fn is_injected(&self, boundary: IsolationBoundaryId) -> bool {
        self.injected.contains(&boundary)
    }

    pub fn set_domain_neutral(&mut self, value: bool) {
        self.domain_neutral = value;
    }

    pub fn is_domain_neutral(&self) -> bool {
        self.domain_neutral
    }
}

/// Everything guarded by spec §5's single coarse lock, plus the
/// `attached` flag every mutating callback double-checks before doing
/// any work.
pub struct ProcessState {
    attached: AtomicBool,
    modules: RwLock<ModuleRegistry>,
    boundaries: Mutex<BoundaryState>,
    rules: RwLock<Vec<MethodReplacement>>,
}

impl ProcessState {
    pub fn init() -> Self {
        Self {
            attached: AtomicBool::new(true),
            modules: RwLock::new(ModuleRegistry::new()),
            boundaries: Mutex::new(BoundaryState::default()),
            rules: RwLock::new(Vec::new()),
        }
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    pub fn modules(&self) -> &RwLock<ModuleRegistry> {
        &self.modules
    }

    pub fn boundaries(&self) -> &Mutex<BoundaryState> {
        &self.boundaries
    }

    pub fn rules(&self) -> &RwLock<Vec<MethodReplacement>> {
        &self.rules
    }

    /// Clears `attached` and drops every module's cache, matching
    /// spec §5's cancellation note: "on shutdown, `attached` is
    /// cleared ... after join, in-flight rewrites are no-ops because
    /// their entry lookups see an empty map."
    pub fn teardown(&self) {
        self.attached.store(false, Ordering::Release);
        *self.modules.write() = ModuleRegistry::new();
        *self.boundaries.lock() = BoundaryState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_injected_transitions_once() {
        let mut state = BoundaryState::default();
        assert!(state.mark_injected(IsolationBoundaryId(1)));
        assert!(!state.mark_injected(IsolationBoundaryId(1)));
    }

    #[test]
    fn teardown_clears_attached_and_modules() {
        let state = ProcessState::init();
        assert!(state.is_attached());
        state.modules().write().register_module(
            profiler_il::ModuleId(1),
            IsolationBoundaryId(1),
            "Asm".into(),
            profiler_il::ModuleVersionId(0),
        );
        state.teardown();
        assert!(!state.is_attached());
        assert!(state.modules().read().store.get(profiler_il::ModuleId(1)).is_none());
    }
}
