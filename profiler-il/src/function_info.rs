//! Function identity as seen by the JIT-compilation-started callback.

use crate::signature::{MethodSig, TypeSig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallingConventionFlags {
    pub has_this: bool,
    pub explicit_this: bool,
    pub generic: bool,
}

#[derive(Debug, Clone)]
pub struct FunctionInfo {
    pub type_name: String,
    pub method_name: String,
    pub calling_convention: CallingConventionFlags,
    pub return_type: TypeSig,
    pub params: Vec<TypeSig>,
    pub generic_arity: u32,
}

impl FunctionInfo {
    pub fn from_signature(type_name: String, method_name: String, sig: &MethodSig) -> Self {
        Self {
            type_name,
            method_name,
            calling_convention: CallingConventionFlags {
                has_this: sig.has_this,
                explicit_this: false,
                generic: sig.generic_param_count > 0,
            },
            return_type: sig.ret.clone(),
            params: sig.params.iter().map(|p| p.sig.clone()).collect(),
            generic_arity: sig.generic_param_count,
        }
    }

    /// True once signature parsing has run and the return is known to be
    /// a value type or an open generic instantiation — the condition the
    /// call-site strategy's edit 5 (conditional unbox) keys off of.
    pub fn returns_value_type_or_generic(&self) -> bool {
        self.return_type.is_value_type() || self.return_type.is_generic_instance()
    }

    pub fn param_type_names(&self) -> Vec<Option<&str>> {
        self.params
            .iter()
            .map(|p| p.strip_by_ref().full_name())
            .collect()
    }
}
