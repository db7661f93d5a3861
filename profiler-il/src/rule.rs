//! `MethodReplacement`: the declarative instrumentation rule shape.

use std::fmt;

/// A (major, minor, patch) triple where `0` in any slot means
/// "unbounded" on that side of the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct VersionTriple {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl VersionTriple {
    pub const UNBOUNDED: VersionTriple = VersionTriple { major: 0, minor: 0, patch: 0 };

    fn as_tuple(self) -> (u16, u16, u16) {
        (self.major, self.minor, self.patch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VersionWindow {
    pub minimum: VersionTriple,
    pub maximum: VersionTriple,
}

impl VersionWindow {
    pub fn contains(&self, version: VersionTriple) -> bool {
        let below_min = self.minimum != VersionTriple::UNBOUNDED && version.as_tuple() < self.minimum.as_tuple();
        let above_max = self.maximum != VersionTriple::UNBOUNDED && version.as_tuple() > self.maximum.as_tuple();
        !below_min && !above_max
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub assembly_name: String,
    pub type_name: String,
    pub method_name: String,
    pub version_window: VersionWindow,
    /// Ordered list of expected signature type-name strings. `"_"`
    /// matches any single position.
    pub signature_types: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapperAction {
    ReplaceTargetMethod,
    InsertFirst,
    CallTargetModification,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyIdentity {
    pub name: String,
    pub version: VersionTriple,
    pub locale: Option<String>,
    pub public_key_token: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wrapper {
    pub assembly: AssemblyIdentity,
    pub type_name: String,
    /// Empty for the body-wrap (`CallTargetModification`) action: the
    /// wrapper there is a pair of static methods (`BeginMethod`/
    /// `EndMethod`), not a single named member.
    pub method_name: String,
    pub action: WrapperAction,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodReplacement {
    pub integration_name: String,
    pub target: Target,
    pub wrapper: Wrapper,
}

impl MethodReplacement {
    pub fn targets(&self, type_name: &str, method_name: &str) -> bool {
        self.target.type_name == type_name && self.target.method_name == method_name
    }

    /// Deterministic cache key for the wrapper member reference, unique
    /// per (assembly, type, method, action) — stable across modules so
    /// the per-module negative cache keys line up with the member cache.
    pub fn wrapper_member_key(&self) -> String {
        format!(
            "{}|{}|{}|{:?}",
            self.wrapper.assembly.name, self.wrapper.type_name, self.wrapper.method_name, self.wrapper.action
        )
    }

    /// Deterministic cache key for the wrapper's parent type reference.
    pub fn wrapper_type_key(&self) -> String {
        format!("{}|{}", self.wrapper.assembly.name, self.wrapper.type_name)
    }

    /// Effective target arity implied by the wrapper's synthesized
    /// signature: parsed parameter count minus the three appended
    /// markers minus one more if the wrapper is an instance method.
    ///
    /// The "at least six slots" floor (`cor_profiler.cpp:1553-1555`'s
    /// `wrapper_method_signature_size < added_parameters_count + 3`) is a
    /// floor on the *raw signature blob length* — calling-convention byte,
    /// param-count byte, return-type byte, plus the three marker bytes —
    /// not on the decoded parameter count, so it's checked against
    /// `self.wrapper.signature.len()` directly rather than against
    /// `wrapper_param_count`.
    pub fn expected_target_arity(&self, wrapper_param_count: usize, wrapper_is_instance: bool) -> Option<usize> {
        if self.wrapper.signature.len() < 6 {
            return None;
        }
        let instance_slot = usize::from(wrapper_is_instance);
        wrapper_param_count.checked_sub(3 + instance_slot)
    }
}

impl fmt::Display for MethodReplacement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}::{} -> {}::{}",
            self.target.type_name, self.target.method_name, self.wrapper.type_name, self.wrapper.method_name
        )
    }
}
