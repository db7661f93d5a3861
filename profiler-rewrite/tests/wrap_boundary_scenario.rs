use profiler_rewrite::body::{LocalVarSig, MethodBody};
use profiler_rewrite::instr::{Opcode, Operand};
use profiler_rewrite::strategy::wrap::{apply_wrap, ParamShape, WrapPlan};

fn void_instance_two_args_body() -> MethodBody {
    let mut body = MethodBody::default();
    body.max_stack = 2;
    body.locals = LocalVarSig::default();
    body.push_back(Opcode::Nop, Operand::None, false);
    body.push_back(Opcode::Ret, Operand::None, false);
    body
}

fn plan() -> WrapPlan {
    WrapPlan {
        is_void: true,
        is_instance: true,
        instance_is_value_type: false,
        instance_is_generic_value_type: false,
        instance_type_token: 0,
        params: vec![ParamShape::ReferenceType, ParamShape::ReferenceType],
        begin_method_ref: 0x0A000010,
        end_method_ref: 0x0A000011,
        log_exception_ref: 0x0A000012,
        get_return_value_ref: None,
        exception_type_token: 0x01000001,
    }
}

#[test]
fn void_instance_method_two_args_boundary_scenario() {
    let mut body = void_instance_two_args_body();
    let plan = plan();
    apply_wrap(&mut body, &plan).unwrap();

    // Locals extended by exactly 3 slots: State, Return, Exception.
    assert_eq!(body.locals.types.len(), 3);

    // Three exception clauses for inner try/catch + outer catch + outer
    // finally (the begin-method try/catch is a fourth, narrower clause
    // this crate also emits around the BeginMethod call itself).
    assert_eq!(body.exception_clauses.len(), 4);

    // Original `ret` was rewritten away; exactly one trailing `ret` remains.
    let ret_count = body.iter().filter(|n| matches!(n.opcode, Opcode::Ret)).count();
    assert_eq!(ret_count, 1);

    // No `leave` instruction is left dangling: every leave target resolves
    // to a live node.
    for node in body.iter() {
        if let Operand::Target(target) = node.operand {
            assert!(body.node(target).is_some(), "dangling branch target");
        }
    }
}
