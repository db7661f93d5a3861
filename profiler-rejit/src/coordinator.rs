//! The ReJIT Coordinator (spec §4.7): a thread-safe
//! `module_id -> method_token -> RejitHandlerModuleMethod` registry fed
//! by a dedicated worker thread that drains a blocking queue of rejit
//! items, plus the host callbacks that drive an actual rewrite.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Mutex, RwLock};
use profiler_il::{FunctionId, MethodReplacement, MethodToken, ModuleId};

use crate::errors::{RejitError, Result};
use crate::method::RejitHandlerModuleMethod;
use crate::module::RejitHandlerModule;
use crate::queue::{rejit_count_promise, RejitCountFuture, RejitQueueItem};
use crate::host::RejitHost;

#[derive(Default)]
struct ModulesTable<FC> {
    entries: Vec<Arc<RejitHandlerModule<FC>>>,
    index: HashMap<ModuleId, usize>,
}

impl<FC> ModulesTable<FC> {
    fn get_or_add(&mut self, module_id: ModuleId) -> Arc<RejitHandlerModule<FC>> {
        if let Some(&idx) = self.index.get(&module_id) {
            return self.entries[idx].clone();
        }
        let entry = Arc::new(RejitHandlerModule::new(module_id));
        let idx = self.entries.len();
        self.entries.push(entry.clone());
        self.index.insert(module_id, idx);
        entry
    }

    fn get(&self, module_id: ModuleId) -> Option<Arc<RejitHandlerModule<FC>>> {
        self.index.get(&module_id).map(|&idx| self.entries[idx].clone())
    }

    fn remove(&mut self, module_id: ModuleId) {
        // Arena removal is index invalidation, not compaction: the slot
        // is simply dropped from the index so no live lookup can reach
        // it, while the vector keeps its length stable for any lookups
        // already in flight holding a clone of the Arc.
        self.index.remove(&module_id);
    }
}

/// Callback the coordinator invokes once a rejit's function-control
/// object has arrived and the rewrite can proceed. Receives the module
/// and method entries so it can read the stashed function-control and
/// method-replacement, and perform the actual bytecode rewrite.
pub type RewriteCallback<FC> = dyn Fn(&RejitHandlerModule<FC>, &RejitHandlerModuleMethod<FC>) + Send + Sync;

pub struct RejitHandler<H: RejitHost> {
    modules: RwLock<ModulesTable<H::FunctionControl>>,
    ngen_modules: Mutex<HashSet<ModuleId>>,
    host: Arc<H>,
    rewrite_callback: Arc<RewriteCallback<H::FunctionControl>>,
    shutdown: AtomicBool,
    queue_tx: Mutex<Option<Sender<RejitQueueItem>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<H: RejitHost> RejitHandler<H> {
    pub fn new<F>(host: Arc<H>, rewrite_callback: F) -> Arc<Self>
    where
        F: Fn(&RejitHandlerModule<H::FunctionControl>, &RejitHandlerModuleMethod<H::FunctionControl>) + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::channel::<RejitQueueItem>();
        let handler = Arc::new(Self {
            modules: RwLock::new(ModulesTable::default()),
            ngen_modules: Mutex::new(HashSet::new()),
            host,
            rewrite_callback: Arc::new(rewrite_callback),
            shutdown: AtomicBool::new(false),
            queue_tx: Mutex::new(Some(tx)),
            worker: Mutex::new(None),
        });

        let worker_handler = handler.clone();
        let join = std::thread::Builder::new()
            .name("rejit-queue".into())
            .spawn(move || worker_handler.drain_queue(rx))
            .expect("failed to spawn rejit worker thread");
        *handler.worker.lock() = Some(join);
        handler
    }

    fn drain_queue(&self, rx: mpsc::Receiver<RejitQueueItem>) {
        for item in rx {
            match item {
                RejitQueueItem::End => break,
                RejitQueueItem::ProcessModule { modules, integrations, promise } => {
                    let count = self.process_module_for_rejit(&modules, &integrations);
                    if let Some(promise) = promise {
                        promise.fulfill(count);
                    }
                }
                RejitQueueItem::Rejit { modules, method_defs } => {
                    self.request_rejit(&modules, &method_defs);
                }
            }
        }
    }

    /// `GetOrAddModule`: returns the existing arena entry for
    /// `module_id`, creating one if this is the module's first mention.
    pub fn get_or_add_module(&self, module_id: ModuleId) -> Arc<RejitHandlerModule<H::FunctionControl>> {
        self.modules.write().get_or_add(module_id)
    }

    pub fn get_module(&self, module_id: ModuleId) -> Option<Arc<RejitHandlerModule<H::FunctionControl>>> {
        self.modules.read().get(module_id)
    }

    /// `RemoveModule`: called from `ModuleUnloadStarted`. Arena slot is
    /// invalidated under the write lock; in-flight readers holding a
    /// clone of the `Arc` keep working until they drop it.
    pub fn remove_module(&self, module_id: ModuleId) {
        self.modules.write().remove(module_id);
    }

    pub fn has_module_and_method(&self, module_id: ModuleId, method_token: MethodToken) -> bool {
        self.modules
            .read()
            .get(module_id)
            .map(|m| m.contains_method(method_token))
            .unwrap_or(false)
    }

    /// `AddNGenModule`: remember that `module_id` carries precompiled
    /// native images, so methods rejitted later also get their inliners
    /// in this module re-rejitted.
    pub fn add_ngen_module(&self, module_id: ModuleId) {
        self.ngen_modules.lock().insert(module_id);
    }

    fn ngen_modules_snapshot(&self) -> Vec<ModuleId> {
        self.ngen_modules.lock().iter().copied().collect()
    }

    /// Enqueues a `ProcessModule` item and blocks on its promise, the
    /// path `InitializeProfiler` uses to report back a rejit count.
    pub fn enqueue_process_module(&self, modules: Vec<ModuleId>, integrations: Arc<Vec<MethodReplacement>>) -> Result<RejitCountFuture> {
        let (promise, future) = rejit_count_promise();
        self.send(RejitQueueItem::ProcessModule { modules, integrations, promise: Some(promise) })?;
        Ok(future)
    }

    pub fn enqueue_for_rejit(&self, modules: Vec<ModuleId>, method_defs: Vec<MethodToken>) -> Result<()> {
        self.send(RejitQueueItem::Rejit { modules, method_defs })
    }

    fn send(&self, item: RejitQueueItem) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(RejitError::ShutDown);
        }
        let guard = self.queue_tx.lock();
        match guard.as_ref() {
            Some(tx) => tx.send(item).map_err(|_| RejitError::QueueDisconnected),
            None => Err(RejitError::ShutDown),
        }
    }

    /// Resolves each (module, rule) pair, records the rejit intent, and
    /// asks the host to schedule the rejits. Runs on the worker thread;
    /// it is the coordinator's only writer into the method arenas
    /// during normal operation (spec §5).
    fn process_module_for_rejit(&self, modules: &[ModuleId], integrations: &[MethodReplacement]) -> u32 {
        let mut total = 0u32;
        for &module_id in modules {
            let module = self.get_or_add_module(module_id);
            let mut tokens = Vec::new();
            for rule in integrations {
                for token in self.host.resolve_rule_methods(module_id, rule) {
                    let entry = module.get_or_add_method(token);
                    entry.set_method_replacement(rule.clone());
                    tokens.push(token);
                }
            }
            if tokens.is_empty() {
                continue;
            }
            total += self.host.request_rejit(&[module_id], &tokens);
        }
        total
    }

    fn request_rejit(&self, modules: &[ModuleId], method_defs: &[MethodToken]) -> u32 {
        for &module_id in modules {
            let module = self.get_or_add_module(module_id);
            for &token in method_defs {
                module.get_or_add_method(token);
            }
        }
        self.host.request_rejit(modules, method_defs)
    }

    /// `NotifyReJITParameters`: stash the function-control pointer; the
    /// rewrite cannot proceed without it.
    pub fn notify_rejit_parameters(&self, module_id: ModuleId, method_token: MethodToken, function_control: H::FunctionControl) -> Result<()> {
        let module = self.modules.read().get(module_id).ok_or(RejitError::UnknownModule(module_id))?;
        let method = module.get_or_add_method(method_token);
        method.set_function_control(function_control);
        Ok(())
    }

    /// `NotifyReJITCompilationStarted`: resolve (function -> module,
    /// method), locate the entry, and invoke the rewrite callback
    /// supplied at construction time.
    pub fn notify_rejit_compilation_started(&self, function: FunctionId) -> Result<()> {
        let module = self
            .modules
            .read()
            .get(function.module)
            .ok_or(RejitError::UnknownModule(function.module))?;
        let method = module
            .get_method(function.token)
            .ok_or(RejitError::UnknownMethod(function.token.0, function.module))?;

        (self.rewrite_callback)(&module, &method);
        self.request_ngen_inliner_rejit(function.module, function.token);
        Ok(())
    }

    /// After a method's body is rewritten, check every recorded NGen
    /// module for inliners of this method that haven't already been
    /// re-rejitted, and enqueue them. Supplements spec §4.7's one-line
    /// `AddNGenModule` mention with the explicit re-rejit path the
    /// original's `RequestRejitForInlinersInModule` performs.
    fn request_ngen_inliner_rejit(&self, module_id: ModuleId, method_token: MethodToken) {
        let module = match self.modules.read().get(module_id) {
            Some(m) => m,
            None => return,
        };
        let method = match module.get_method(method_token) {
            Some(m) => m,
            None => return,
        };
        for ngen_module in self.ngen_modules_snapshot() {
            if !method.mark_inliners_rejitted(ngen_module) {
                continue;
            }
            let inliners = self.host.enumerate_inliners(module_id, method_token);
            if inliners.is_empty() {
                continue;
            }
            let (inliner_modules, inliner_methods): (Vec<_>, Vec<_>) = inliners.into_iter().unzip();
            if let Err(err) = self.enqueue_for_rejit(inliner_modules, inliner_methods) {
                log::warn!("failed to enqueue inliner rejit for {module_id}/{method_token:?}: {err}");
            }
        }
    }

    /// Idempotent shutdown: set the flag, enqueue the end sentinel,
    /// join the worker. After join, in-flight rewrites are no-ops
    /// because their entry lookups see an empty map.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(tx) = self.queue_tx.lock().take() {
            let _ = tx.send(RejitQueueItem::End);
        }
        if let Some(join) = self.worker.lock().take() {
            let _ = join.join();
        }
        *self.modules.write() = ModulesTable::default();
    }
}

impl<H: RejitHost> Drop for RejitHandler<H> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct FakeHost {
        rejit_calls: StdMutex<Vec<(Vec<ModuleId>, Vec<MethodToken>)>>,
        inliners: HashMap<(ModuleId, MethodToken), Vec<(ModuleId, MethodToken)>>,
        resolved_methods: Vec<MethodToken>,
    }

    impl Default for FakeHost {
        fn default() -> Self {
            Self { rejit_calls: StdMutex::new(Vec::new()), inliners: HashMap::new(), resolved_methods: Vec::new() }
        }
    }

    impl RejitHost for FakeHost {
        type FunctionControl = u32;

        fn resolve_rule_methods(&self, _module: ModuleId, _rule: &MethodReplacement) -> Vec<MethodToken> {
            self.resolved_methods.clone()
        }

        fn request_rejit(&self, modules: &[ModuleId], methods: &[MethodToken]) -> u32 {
            self.rejit_calls.lock().unwrap().push((modules.to_vec(), methods.to_vec()));
            methods.len() as u32
        }

        fn enumerate_inliners(&self, module: ModuleId, method: MethodToken) -> Vec<(ModuleId, MethodToken)> {
            self.inliners.get(&(module, method)).cloned().unwrap_or_default()
        }
    }

    fn handler(host: FakeHost) -> Arc<RejitHandler<FakeHost>> {
        let rewritten = Arc::new(StdMutex::new(Vec::new()));
        let rewritten_clone = rewritten.clone();
        let handler = RejitHandler::new(Arc::new(host), move |module, method| {
            rewritten_clone.lock().unwrap().push((module.module_id, method.method_token));
        });
        handler
    }

    #[test]
    fn rejit_then_notify_invokes_rewrite_callback() {
        let host = FakeHost::default();
        let h = handler(host);
        h.enqueue_for_rejit(vec![ModuleId(1)], vec![MethodToken(0x06000001)]).unwrap();
        // Give the worker a chance; a real test harness would join a
        // signal instead of sleeping, but the queue is FIFO so the
        // second enqueue below only completes after the first drains.
        h.notify_rejit_parameters(ModuleId(1), MethodToken(0x06000001), 7).unwrap_or(());
        // Poll until the worker has registered the method (bounded).
        for _ in 0..1000 {
            if h.has_module_and_method(ModuleId(1), MethodToken(0x06000001)) {
                break;
            }
            std::thread::yield_now();
        }
        assert!(h.has_module_and_method(ModuleId(1), MethodToken(0x06000001)));
        h.notify_rejit_compilation_started(FunctionId { module: ModuleId(1), token: MethodToken(0x06000001) }).unwrap();
        h.shutdown();
    }

    #[test]
    fn unknown_module_notify_is_an_error() {
        let host = FakeHost::default();
        let h = handler(host);
        let err = h.notify_rejit_parameters(ModuleId(99), MethodToken(1), 0);
        assert!(matches!(err, Err(RejitError::UnknownModule(_))));
        h.shutdown();
    }

    #[test]
    fn shutdown_is_idempotent() {
        let host = FakeHost::default();
        let h = handler(host);
        h.shutdown();
        h.shutdown();
    }

    #[test]
    fn remove_module_drops_registration() {
        let host = FakeHost::default();
        let h = handler(host);
        h.get_or_add_module(ModuleId(5));
        assert!(h.get_module(ModuleId(5)).is_some());
        h.remove_module(ModuleId(5));
        assert!(h.get_module(ModuleId(5)).is_none());
        h.shutdown();
    }

    fn sample_rule() -> MethodReplacement {
        use profiler_il::rule::{AssemblyIdentity, Target, VersionWindow, Wrapper, WrapperAction};
        MethodReplacement {
            integration_name: "Sample".into(),
            target: Target {
                assembly_name: "Target.Assembly".into(),
                type_name: "Target.Type".into(),
                method_name: "Foo".into(),
                version_window: VersionWindow::default(),
                signature_types: vec![],
            },
            wrapper: Wrapper {
                assembly: AssemblyIdentity { name: "Wrapper.Assembly".into(), version: Default::default(), locale: None, public_key_token: None },
                type_name: "Wrapper.Type".into(),
                method_name: "Foo".into(),
                action: WrapperAction::ReplaceTargetMethod,
                signature: Vec::new(),
            },
        }
    }

    #[test]
    fn process_module_resolves_and_records_replacement_then_fulfills_promise() {
        let mut host = FakeHost::default();
        host.resolved_methods = vec![MethodToken(0x06000005)];
        let h = handler(host);

        let rules = Arc::new(vec![sample_rule()]);
        let future = h.enqueue_process_module(vec![ModuleId(1)], rules).unwrap();
        let count = future.wait().expect("promise fulfilled");
        assert_eq!(count, 1);

        assert!(h.has_module_and_method(ModuleId(1), MethodToken(0x06000005)));
        let module = h.get_module(ModuleId(1)).unwrap();
        let method = module.get_method(MethodToken(0x06000005)).unwrap();
        assert_eq!(method.method_replacement().unwrap().target.method_name, "Foo");
        h.shutdown();
    }

    #[test]
    fn ngen_inliners_are_rejitted_once_per_module_after_rewrite() {
        let mut host = FakeHost::default();
        host.inliners.insert((ModuleId(1), MethodToken(1)), vec![(ModuleId(2), MethodToken(2))]);
        let h = handler(host);

        h.add_ngen_module(ModuleId(9));
        h.enqueue_for_rejit(vec![ModuleId(1)], vec![MethodToken(1)]).unwrap();
        for _ in 0..1000 {
            if h.has_module_and_method(ModuleId(1), MethodToken(1)) {
                break;
            }
            std::thread::yield_now();
        }

        h.notify_rejit_compilation_started(FunctionId { module: ModuleId(1), token: MethodToken(1) }).unwrap();

        for _ in 0..1000 {
            if h.has_module_and_method(ModuleId(2), MethodToken(2)) {
                break;
            }
            std::thread::yield_now();
        }
        assert!(h.has_module_and_method(ModuleId(2), MethodToken(2)));
        h.shutdown();
    }
}
