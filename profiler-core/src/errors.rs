//! The engine's error taxonomy (spec §7): every callback swallows its
//! own errors into a logged `EngineEvent` and returns success to the
//! host, except `Initialize`, which may refuse attach.

use thiserror::Error;

use profiler_il::{IlError, ModuleId};
use profiler_rejit::RejitError;
use profiler_rewrite::RewriteError;

/// Why the host should not load the profiler at all. The only error
/// kind that propagates out of the controller as a hard failure.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("refusing attach: {0}")]
    RefuseAttach(String),
    #[error(transparent)]
    Il(#[from] IlError),
    #[error(transparent)]
    Rewrite(#[from] RewriteError),
    #[error(transparent)]
    Rejit(#[from] RejitError),
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// One structured log record per spec §7's five error kinds. Every
/// variant is logged at the point it's raised and never propagates
/// past the callback that raised it — the host's original semantics
/// always apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    RefuseAttach { reason: String },
    NonFatalSkip { module: ModuleId, reason: String },
    WrapperUnresolvable { key: String, module: ModuleId },
    ExportFailed { module: ModuleId, token: u32 },
    RejitNotifyMissed { module: ModuleId, token: u32 },
}

impl EngineEvent {
    /// Emits the event to the `log` facade at the severity spec §7
    /// implies: refuse-attach and export-failed are hard problems
    /// (`error!`), the rest are expected, routine skips (`warn!`).
    pub fn log(&self) {
        match self {
            EngineEvent::RefuseAttach { reason } => log::error!("refusing attach: {reason}"),
            EngineEvent::NonFatalSkip { module, reason } => log::warn!("skip in {module}: {reason}"),
            EngineEvent::WrapperUnresolvable { key, module } => {
                log::warn!("wrapper member unresolvable in {module}: {key}")
            }
            EngineEvent::ExportFailed { module, token } => {
                log::error!("export failed in {module} for {token:#x}")
            }
            EngineEvent::RejitNotifyMissed { module, token } => {
                log::warn!("rejit notify for unknown method {module}/{token:#x}")
            }
        }
    }
}
