use profiler_il::IlError;
use thiserror::Error;

use crate::ids::NodeId;

#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("malformed method body: {0}")]
    MalformedBody(String),

    #[error("dangling branch target {0:?}")]
    DanglingTarget(NodeId),

    #[error("branch offset does not fit in the requested encoding width")]
    OffsetOverflow,

    #[error(transparent)]
    Il(#[from] IlError),

    #[error("target method has no matching call site for rule {0}")]
    CallSiteNotFound(String),

    #[error("wrapper signature is unresolvable for rule {0}")]
    WrapperUnresolvable(String),
}

pub type Result<T> = std::result::Result<T, RewriteError>;
