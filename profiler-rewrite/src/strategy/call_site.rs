//! Inline call-site replacement: every `call`/`callvirt` to a target
//! method inside a caller is substituted by a call to a wrapper,
//! trailed by three marker arguments the wrapper uses to report back to
//! the managed side (original opcode, target method token, module
//! version id).

use profiler_il::signature::{last_param_box_kind, parse_method_signature, signature_matches, BoxBeforeCall, NullResolver};
use profiler_il::{FunctionInfo, MethodReplacement};

use crate::body::MethodBody;
use crate::errors::Result;
use crate::ids::NodeId;
use crate::instr::{Opcode, Operand};
use crate::strategy::SkipReason;

/// Everything already resolved about the call site's target, before any
/// rule matching has happened.
pub struct ResolvedTarget {
    pub info: FunctionInfo,
    pub method_def_token: u32,
    pub preceded_by_constrained_prefix: bool,
    pub managed_counterpart_loaded: bool,
    pub domain_neutral_without_opt_in: bool,
}

/// What the host resolved for a matched rule's wrapper member.
pub struct WrapperResolution {
    pub member_ref_token: u32,
    /// `Some` when the target is generic: a `MethodSpec` token binding
    /// the wrapper to the target's type arguments. Its absence for a
    /// generic target is a [`SkipReason::GenericArityMismatch`].
    pub method_spec_token: Option<u32>,
}

/// Steps 1–2, 3 (arity), 5 (positional signature compare), and 7 (hard
/// skips) of the replacement pipeline: everything that can be decided
/// without touching bytecode. Step 4 (wrapper-ref resolution) and the
/// actual edit are separate so callers can record a negative-cache miss
/// without ever constructing a cursor.
pub fn find_matching_rule<'a>(
    rules: &'a [MethodReplacement],
    target: &ResolvedTarget,
) -> std::result::Result<&'a MethodReplacement, SkipReason> {
    if target.preceded_by_constrained_prefix {
        return Err(SkipReason::ConstrainedVirtualCallSite);
    }
    if target.domain_neutral_without_opt_in {
        return Err(SkipReason::DomainNeutralWithoutOptIn);
    }
    if !target.managed_counterpart_loaded {
        return Err(SkipReason::ManagedCounterpartNotLoaded);
    }

    let rule = rules
        .iter()
        .find(|r| r.targets(&target.info.type_name, &target.info.method_name))
        .ok_or(SkipReason::NoMatchingRule)?;

    let wrapper_sig = parse_method_signature(&rule.wrapper.signature, &NullResolver)
        .map_err(|_| SkipReason::WrapperSignatureTooShort)?;
    let wrapper_param_count = wrapper_sig.params.len();
    let expected_arity = match rule.expected_target_arity(wrapper_param_count, wrapper_sig.has_this) {
        Some(arity) => arity,
        None => {
            log::debug!("skip {}: {}", rule, SkipReason::WrapperSignatureTooShort);
            return Err(SkipReason::WrapperSignatureTooShort);
        }
    };
    // Independent of the later positional `signature_types` compare below:
    // `signature_types` and the wrapper's compiled signature are
    // separately authored and can disagree with each other even when
    // each individually looks plausible.
    if expected_arity != target.info.params.len() {
        log::debug!("skip {}: {}", rule, SkipReason::WrapperArgumentCountMismatch);
        return Err(SkipReason::WrapperArgumentCountMismatch);
    }

    if target.info.generic_arity > 0 && rule.target.signature_types.len() != target.info.params.len() {
        log::debug!("skip {}: {}", rule, SkipReason::GenericArityMismatch);
        return Err(SkipReason::GenericArityMismatch);
    }

    let actual_param_types: Vec<_> = target.info.params.clone();
    if !signature_matches(&rule.target.signature_types, &actual_param_types) {
        log::debug!("skip {}: {}", rule, SkipReason::SignatureMismatch);
        return Err(SkipReason::SignatureMismatch);
    }

    Ok(rule)
}

/// Everything needed to perform the five-step edit, once a rule has
/// matched and the wrapper member reference has resolved.
pub struct CallSiteEditPlan {
    pub wrapper_member_ref_token: u32,
    pub method_spec_token: Option<u32>,
    pub box_type_token: Option<u32>,
    pub unbox_type_token: Option<u32>,
    pub original_opcode_marker: i32,
    pub target_method_def_token: u32,
    pub module_version_id_bits: i64,
}

impl CallSiteEditPlan {
    /// `box_type_token` and `unbox_type_token` are resolved by the
    /// caller — minting the `TypeSpec` a generic `ReadOnlyMemory<T>`
    /// instantiation needs is a module-write operation the rewriter
    /// itself has no handle for. See [`detect_box_requirement`] for
    /// deciding whether one is needed at all.
    pub fn new(
        target: &ResolvedTarget,
        resolution: &WrapperResolution,
        original_call_was_virt: bool,
        wrapper_return_is_abstract_object: bool,
        box_type_token: Option<u32>,
        module_version_id_bits: i64,
    ) -> Self {
        let unbox_type_token = if wrapper_return_is_abstract_object && target.info.returns_value_type_or_generic() {
            raw_token_of(&target.info.return_type)
        } else {
            None
        };
        Self {
            wrapper_member_ref_token: resolution.member_ref_token,
            method_spec_token: resolution.method_spec_token,
            box_type_token,
            unbox_type_token,
            original_opcode_marker: if original_call_was_virt { 0x6F } else { 0x28 },
            target_method_def_token: target.method_def_token,
            module_version_id_bits,
        }
    }
}

/// Whether the target's last parameter needs a `box` emitted ahead of
/// the wrapper call, and which of the two recognized shapes it is.
pub fn detect_box_requirement(info: &FunctionInfo) -> Option<BoxBeforeCall> {
    let sig = profiler_il::MethodSig {
        has_this: info.calling_convention.has_this,
        generic_param_count: info.generic_arity,
        ret: info.return_type.clone(),
        params: info.params.iter().cloned().map(|sig| profiler_il::ParamDesc { sig }).collect(),
    };
    last_param_box_kind(&sig)
}

fn raw_token_of(sig: &profiler_il::TypeSig) -> Option<u32> {
    use profiler_il::TypeSig;
    match sig.strip_by_ref() {
        TypeSig::ValueType { token, .. } | TypeSig::Class { token, .. } => Some(token.0),
        _ => None,
    }
}

/// Performs the five-step edit at `call_node`, which must currently
/// hold a `call` or `callvirt` opcode. The original operand's token is
/// discarded; node identity is preserved so branch targets landing on
/// this node keep resolving correctly.
///
/// Emission order differs from the edit numbering: the marker loads
/// (edit 4) are spliced in *before* the wrapper call (edit 3) so the
/// evaluation stack holds `[args…] [box?] [markers…]` at the point of
/// the call, exactly as the wrapper's synthesized signature expects.
pub fn apply_five_step_edit(body: &mut MethodBody, call_node: NodeId, plan: &CallSiteEditPlan) -> Result<()> {
    let mut cursor = crate::cursor::InstrCursor::at(body, call_node);

    // Edit 1 — neutralize in place.
    cursor.neutralize();

    // Edit 2 — conditional box of the last argument.
    if let Some(type_token) = plan.box_type_token {
        cursor.box_value(type_token)?;
    }

    // Edit 4 — append markers (opcode, method token, module version id).
    cursor.ldc_i4(plan.original_opcode_marker)?;
    cursor.insert_after(Opcode::LdcI4(plan.target_method_def_token as i32), Operand::None, false)?;
    cursor.insert_after(Opcode::LdcI8(plan.module_version_id_bits), Operand::None, false)?;

    // Edit 3 — call the wrapper, or its method-spec instantiation.
    let call_token = plan.method_spec_token.unwrap_or(plan.wrapper_member_ref_token);
    cursor.call(call_token, false)?;

    // Edit 5 — conditional unbox of the wrapper's abstract return.
    if let Some(type_token) = plan.unbox_type_token {
        cursor.unbox_any(type_token)?;
    }

    Ok(())
}
