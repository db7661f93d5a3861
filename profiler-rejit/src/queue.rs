//! The dedicated worker thread's unit of work. `RejitQueueItem` is a
//! typed sum, not an exception-style dispatch — the worker's loop is a
//! straight `match` (spec §9's "no coroutines" note).

use std::sync::mpsc::Sender;
use std::sync::Arc;

use profiler_il::{MethodReplacement, MethodToken, ModuleId};

/// A promise the worker fulfills once a `ProcessModule` item has
/// resolved every (module, rule) pair and asked the host to rejit the
/// resulting methods. Modeled as a oneshot channel rather than
/// `std::future::Future` — the coordinator's only consumer blocks on it
/// synchronously (`InitializeProfiler` awaiting a rejit count).
pub struct RejitCountPromise {
    tx: Sender<u32>,
}

impl RejitCountPromise {
    pub fn fulfill(self, count: u32) {
        let _ = self.tx.send(count);
    }
}

/// The receiving half, handed back to the caller that enqueued the
/// `ProcessModule` item.
pub struct RejitCountFuture {
    rx: std::sync::mpsc::Receiver<u32>,
}

impl RejitCountFuture {
    pub fn wait(self) -> Option<u32> {
        self.rx.recv().ok()
    }
}

pub fn rejit_count_promise() -> (RejitCountPromise, RejitCountFuture) {
    let (tx, rx) = std::sync::mpsc::channel();
    (RejitCountPromise { tx }, RejitCountFuture { rx })
}

pub enum RejitQueueItem {
    /// For each (module, rule) pair, resolve type/method, record the
    /// intent, and ask the host to rejit the methods. The resulting
    /// accepted count is fulfilled on `promise`.
    ProcessModule {
        modules: Vec<ModuleId>,
        integrations: Arc<Vec<MethodReplacement>>,
        promise: Option<RejitCountPromise>,
    },
    /// Direct rejit request for already-known method tokens; no
    /// promise, no matching step.
    Rejit { modules: Vec<ModuleId>, method_defs: Vec<MethodToken> },
    /// Sentinel that drains the worker and lets it exit its loop.
    End,
}
