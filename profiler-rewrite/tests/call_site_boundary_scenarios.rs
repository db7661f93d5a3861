use profiler_il::function_info::CallingConventionFlags;
use profiler_il::rule::{AssemblyIdentity, Target, VersionWindow, Wrapper, WrapperAction};
use profiler_il::signature::{compose_void_parameterless_method_sig, RawTypeToken, TypeSig};
use profiler_il::{FunctionInfo, MethodReplacement};
use profiler_rewrite::body::{export, import, RawMethodBody};
use profiler_rewrite::strategy::call_site::{apply_five_step_edit, find_matching_rule, CallSiteEditPlan, ResolvedTarget, WrapperResolution};
use profiler_rewrite::strategy::SkipReason;
use profiler_rewrite::Opcode;

fn rule_with_arity(total_slots: usize, signature_types: Vec<String>) -> MethodReplacement {
    // Hand-build a MethodRefSig blob: calling-convention byte, compressed
    // param count, a void return, then `total_slots` Int32 parameters.
    let mut sig = vec![0x00, total_slots as u8, 0x01 /* void */];
    for _ in 0..total_slots {
        sig.push(0x08); // ELEMENT_TYPE_I4
    }
    MethodReplacement {
        integration_name: "Sample".into(),
        target: Target {
            assembly_name: "Target.Assembly".into(),
            type_name: "Target.Type".into(),
            method_name: "Foo".into(),
            version_window: VersionWindow::default(),
            signature_types,
        },
        wrapper: Wrapper {
            assembly: AssemblyIdentity { name: "Wrapper.Assembly".into(), version: Default::default(), locale: None, public_key_token: None },
            type_name: "Wrapper.Type".into(),
            method_name: "Foo".into(),
            action: WrapperAction::ReplaceTargetMethod,
            signature: sig,
        },
    }
}

fn target(type_name: &str, method_name: &str, params: Vec<TypeSig>) -> ResolvedTarget {
    ResolvedTarget {
        info: FunctionInfo {
            type_name: type_name.into(),
            method_name: method_name.into(),
            calling_convention: CallingConventionFlags { has_this: false, explicit_this: false, generic: false },
            return_type: TypeSig::Void,
            params,
            generic_arity: 0,
        },
        method_def_token: 0x06000042,
        preceded_by_constrained_prefix: false,
        managed_counterpart_loaded: true,
        domain_neutral_without_opt_in: false,
    }
}

#[test]
fn scenario_non_match_by_name_yields_zero_edits() {
    let rules = vec![rule_with_arity(6, vec!["_".into(), "_".into(), "_".into()])];
    let t = target("Target.Type", "Bar", vec![]);
    assert_eq!(find_matching_rule(&rules, &t), Err(SkipReason::NoMatchingRule));
}

#[test]
fn scenario_arity_mismatch_below_six_slots() {
    // Raw blob length 3 header + 2 params = 5 bytes, under the spec's
    // six-byte floor (this is a floor on the blob's raw length, not on
    // the decoded parameter count — see `rule.rs::expected_target_arity`).
    let rules = vec![rule_with_arity(2, vec![])];
    let t = target("Target.Type", "Foo", vec![]);
    assert_eq!(find_matching_rule(&rules, &t), Err(SkipReason::WrapperSignatureTooShort));
}

#[test]
fn scenario_wildcard_at_position_zero_matches_then_edit_applies_once() {
    // 5 parsed params - 3 markers - 0 instance = 2 expected target args,
    // matching the two-parameter target below.
    let rules = vec![rule_with_arity(5, vec!["_".into(), "System.String".into()])];
    let t = target(
        "Target.Type",
        "Foo",
        vec![
            TypeSig::Primitive("System.Int32"),
            TypeSig::Class { token: RawTypeToken(1), name: Some("System.String".into()) },
        ],
    );
    let rule = find_matching_rule(&rules, &t).expect("wildcard position should match");
    assert_eq!(rule.target.method_name, "Foo");

    let mut raw = RawMethodBody { max_stack: 4, init_locals: true, code: vec![0x28, 0, 0, 0, 0, 0x2A], ..Default::default() };
    raw.local_var_sig = Vec::new();
    let mut body = import(&raw).unwrap();
    let call_node = body.head().unwrap();

    let resolution = WrapperResolution { member_ref_token: 0x0A000099, method_spec_token: None };
    let plan = CallSiteEditPlan::new(&t, &resolution, false, false, None, 0x1122334455667788_i64);
    apply_five_step_edit(&mut body, call_node, &plan).unwrap();

    let exported = export(&body).unwrap();
    // ldc.i4(opcode) + ldc.i4(token) + ldc.i8(mvid) + call = 5+5+9+5 = 24 bytes,
    // the nop from neutralizing the original call contributes 1, plus the
    // untouched trailing ret.
    assert!(exported.code.len() > raw.code.len());
}

#[test]
fn scenario_cancellation_token_tail_emits_box_before_call() {
    use profiler_rewrite::strategy::call_site::detect_box_requirement;

    let t = target(
        "Target.Type",
        "Foo",
        vec![TypeSig::ValueType {
            token: RawTypeToken(7),
            name: Some("System.Threading.CancellationToken".into()),
        }],
    );
    let requirement = detect_box_requirement(&t.info);
    assert!(requirement.is_some());

    let mut raw = RawMethodBody { max_stack: 4, init_locals: true, code: vec![0x28, 0, 0, 0, 0, 0x2A], ..Default::default() };
    raw.local_var_sig = Vec::new();
    let mut body = import(&raw).unwrap();
    let call_node = body.head().unwrap();

    let resolution = WrapperResolution { member_ref_token: 0x0A0000AA, method_spec_token: None };
    let plan = CallSiteEditPlan::new(&t, &resolution, false, false, Some(7), 0);
    apply_five_step_edit(&mut body, call_node, &plan).unwrap();

    let node_after_nop = body.next_of(call_node).unwrap();
    assert_eq!(body.node(node_after_nop).unwrap().opcode, Opcode::Box);
}

#[test]
fn scenario_domain_neutral_without_opt_in_skips() {
    let rules = vec![rule_with_arity(6, vec![])];
    let mut t = target("Target.Type", "Foo", vec![]);
    t.domain_neutral_without_opt_in = true;
    assert_eq!(find_matching_rule(&rules, &t), Err(SkipReason::DomainNeutralWithoutOptIn));
}

#[test]
fn void_parameterless_signature_round_trips_through_parser() {
    let blob = compose_void_parameterless_method_sig().unwrap();
    assert_eq!(blob[0], 0x00);
}

#[test]
fn opcode_constant_is_stable_for_markers() {
    assert_eq!(Opcode::Ret, Opcode::Ret);
}
