//! The ReJIT Coordinator (spec §4.7): a thread-safe module/method
//! registry fed by rule ingestion and module-load events, a dedicated
//! worker thread that drains a blocking queue of rejit items, and the
//! host callbacks (`NotifyReJITParameters`, `NotifyReJITCompilationStarted`,
//! `AddNGenModule`) that drive an actual rewrite once the runtime hands
//! back a per-method function-control object.
//!
//! This crate re-architects the original's cyclic
//! `RejitHandler <-> RejitHandlerModule <-> RejitHandlerModuleMethod`
//! pointer graph as an arena: each level owns a `Vec` of entries plus a
//! lookup index, and child entries carry no pointer back to their
//! owner.

pub mod coordinator;
pub mod errors;
pub mod host;
pub mod method;
pub mod module;
pub mod queue;

pub use coordinator::{RejitHandler, RewriteCallback};
pub use errors::{RejitError, Result};
pub use host::RejitHost;
pub use method::RejitHandlerModuleMethod;
pub use module::RejitHandlerModule;
pub use queue::{RejitCountFuture, RejitCountPromise, RejitQueueItem};
