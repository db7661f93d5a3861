//! The two bytecode-production strategies: inline call-site
//! replacement (§4.5-shaped) and method-body wrapping (§4.6-shaped).
//! Both strategies are pure transforms over a [`crate::body::MethodBody`]
//! — no I/O, no locking, no host calls. Callers (the controller and the
//! ReJIT coordinator) own resolving tokens and handles before invoking
//! either one.

pub mod call_site;
pub mod wrap;

/// Why a candidate call site or method was left untouched. Every
/// variant maps to a structured, non-fatal log record at the call
/// site — an instrumentation rewrite never silently changes behavior it
/// cannot explain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NoMatchingRule,
    WrapperSignatureTooShort,
    WrapperArgumentCountMismatch,
    WrapperUnresolvable(String),
    GenericArityMismatch,
    SignatureMismatch,
    ManagedCounterpartNotLoaded,
    DomainNeutralWithoutOptIn,
    ConstrainedVirtualCallSite,
    ByRefParameterUnsupported,
    GenericValueTypeInstance,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::NoMatchingRule => write!(f, "no rule matches this call site"),
            SkipReason::WrapperSignatureTooShort => write!(f, "wrapper signature too short"),
            SkipReason::WrapperArgumentCountMismatch => write!(f, "wrapper signature's expected argument count doesn't match target's actual argument count"),
            SkipReason::WrapperUnresolvable(key) => write!(f, "wrapper member reference unresolvable: {key}"),
            SkipReason::GenericArityMismatch => write!(f, "generic type-parameter arity mismatch"),
            SkipReason::SignatureMismatch => write!(f, "actual parameter types do not match rule signature"),
            SkipReason::ManagedCounterpartNotLoaded => write!(f, "managed counterpart not yet loaded in caller boundary"),
            SkipReason::DomainNeutralWithoutOptIn => write!(f, "caller assembly is domain-neutral and opt-in is disabled"),
            SkipReason::ConstrainedVirtualCallSite => write!(f, "call site is a constrained virtual call"),
            SkipReason::ByRefParameterUnsupported => write!(f, "by-ref parameters are not supported"),
            SkipReason::GenericValueTypeInstance => write!(f, "generic value-type instance cannot be instrumented"),
        }
    }
}
