use thiserror::Error;

#[derive(Debug, Error)]
pub enum RejitError {
    #[error("module {0} is not registered with the coordinator")]
    UnknownModule(profiler_il::ModuleId),
    #[error("method {0:#x} in module {1} is not registered with the coordinator")]
    UnknownMethod(u32, profiler_il::ModuleId),
    #[error("rejit worker thread is already shut down")]
    ShutDown,
    #[error("rejit queue disconnected before the end sentinel was processed")]
    QueueDisconnected,
}

pub type Result<T> = std::result::Result<T, RejitError>;
