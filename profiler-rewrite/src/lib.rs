//! Method-body import/export and the two bytecode-production
//! strategies (inline call-site replacement, method-body wrapping).
//!
//! This crate never talks to the host profiling API directly — it
//! operates on [`body::RawMethodBody`]/[`body::MethodBody`] values the
//! caller has already pulled out of (or is about to push back into) the
//! runtime's metadata writer.

pub mod body;
pub mod cursor;
pub mod errors;
pub mod ids;
pub mod instr;
pub mod strategy;

pub use body::{export, import, EhClauseKind, ExceptionClause, LocalVarSig, MethodBody, RawExceptionClause, RawMethodBody};
pub use cursor::InstrCursor;
pub use errors::{Result, RewriteError};
pub use ids::{LocalSlot, NodeId};
pub use instr::{InstrNode, Opcode, Operand};
pub use strategy::call_site;
pub use strategy::wrap;
pub use strategy::SkipReason;
