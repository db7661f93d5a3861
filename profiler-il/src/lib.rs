//! Module identity, signature parsing, and per-module reference caching.
//!
//! This crate owns the parts of the engine that never touch a bytecode
//! stream directly: the opaque identifiers the runtime hands out, the
//! compressed-signature parser and positional matcher, and the per-module
//! cache of resolved wrapper references.

pub mod errors;
pub mod function_info;
pub mod ids;
pub mod rule;
pub mod signature;
pub mod store;

pub use errors::{IlError, Result};
pub use function_info::FunctionInfo;
pub use ids::{AssemblyId, FunctionId, IsolationBoundaryId, MethodToken, ModuleId, ModuleVersionId};
pub use rule::{AssemblyIdentity, MethodReplacement, Target, VersionTriple, VersionWindow, Wrapper, WrapperAction};
pub use signature::{BoxBeforeCall, MethodSig, ParamDesc, TypeNameResolver, TypeSig};
pub use store::{MemberRefToken, ModuleMetadata, ModuleMetadataStore, PerModuleCache, TypeRefToken};
