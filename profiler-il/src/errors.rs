use thiserror::Error;

#[derive(Debug, Error)]
pub enum IlError {
    #[error("dotscope error: {0}")]
    Dotscope(#[from] dotscope::Error),
    #[error("signature parse failed at blob offset {offset}")]
    SignatureParse { offset: usize },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("module {0} is not loaded")]
    UnknownModule(crate::ids::ModuleId),
}

pub type Result<T> = std::result::Result<T, IlError>;
