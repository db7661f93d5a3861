//! Opaque runtime-assigned identifiers.
//!
//! The profiling API hands out module and function identities as raw
//! integers with lifetime scoped to the load of the thing they name.
//! We newtype them so a `ModuleId` can never be passed where a
//! `MethodToken` is expected.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IsolationBoundaryId(pub u64);

/// Opaque runtime-assigned assembly identifier, as handed to
/// `AssemblyLoadFinished`. Distinct from `ModuleId`: one assembly may
/// carry several modules, though the engine only ever deals with the
/// manifest module in practice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssemblyId(pub u64);

impl fmt::Display for AssemblyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "assembly#{:#x}", self.0)
    }
}

/// A 32-bit metadata row token: type, method, member ref, type spec,
/// string, or signature, depending on its high byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodToken(pub u32);

/// Module-scoped function identity, the (module, token) pair the runtime
/// uses to name a compiled method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId {
    pub module: ModuleId,
    pub token: MethodToken,
}

/// Opaque 128-bit module identity, passed through to wrappers so they can
/// cache per-module resolutions on the managed side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleVersionId(pub u128);

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "module#{:#x}", self.0)
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:#x}", self.module, self.token.0)
    }
}
