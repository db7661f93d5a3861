//! Method-body wrapping: the wrapped method itself is replaced by a
//! try/catch/finally envelope that calls `BeginMethod`/`EndMethod`/
//! `LogException` around the original body. Driven entirely by the
//! ReJIT path.
//!
//! ```text
//! begin_try:     <args…>  call BeginMethod  stloc State
//! inner_catch:   call LogException; leave_s splice_point      -- begin-method try/catch
//! splice_point:  <original body, every ret -> leave_s trailing_ret>
//! outer_catch:   stloc Exception; rethrow                      -- outer try/exception-catch
//! finally_try:   <args…>  [ldloc ReturnValue]  ldloc Exception  ldloc State
//!                call EndMethod  stloc Return
//!                [ldloca Return  call GetReturnValue  stloc ReturnValue]  -- end-method try/catch
//! finally_catch: call LogException
//! endfinally                                                   -- outer try/finally
//! trailing_ret:  [ldloc ReturnValue]
//!                ret
//! ```
//!
//! This is the nested shape a compiler emits for a single `try { B }
//! catch (Exception e) { state = e; throw; } finally { F }` block: an
//! inner `.try [begin_try, outer_catch) catch [outer_catch, finally_try)`
//! protecting `B` (the original body, preceded by the begin-method
//! try/catch) nested inside an outer `.try [begin_try, finally_try)
//! finally [finally_try, trailing_ret)`. A handler's code always
//! follows the range it protects — never the reverse — so every `leave`
//! that unwinds out of the protected range, including every rewritten
//! `ret`, targets `trailing_ret`, the first instruction past the
//! `endfinally`; the runtime walks the enclosing `finally` on the way
//! there automatically.

use crate::body::{EhClauseKind, ExceptionClause, LocalVarSig, MethodBody};
use crate::cursor::InstrCursor;
use crate::errors::Result;
use crate::ids::NodeId;
use crate::instr::{InstrNode, Opcode, Operand};
use crate::strategy::SkipReason;
use profiler_il::signature::ELEMENT_TYPE_OBJECT;

/// Parameter count at which the wrapping strategy switches from loading
/// each argument directly (fast path) to boxing them into an object
/// array (slow path). The original chooses this per-wrapper-arity
/// family at codegen time; fixed here since every wrapper shares one
/// calling convention.
pub const FASTPATH_COUNT: usize = 8;

#[derive(Debug, Clone, Copy)]
pub enum ParamShape {
    ReferenceType,
    ValueType { type_token: u32 },
    Generic { type_token: u32 },
    ByRef,
}

pub struct WrapPlan {
    pub is_void: bool,
    pub is_instance: bool,
    pub instance_is_value_type: bool,
    pub instance_is_generic_value_type: bool,
    pub instance_type_token: u32,
    pub params: Vec<ParamShape>,
    pub begin_method_ref: u32,
    pub end_method_ref: u32,
    pub log_exception_ref: u32,
    pub get_return_value_ref: Option<u32>,
    pub exception_type_token: u32,
}

#[derive(Debug)]
pub struct WrapResult {
    pub begin_try: NodeId,
    pub trailing_ret: NodeId,
}

struct Slots {
    return_value: Option<u16>,
    state: u16,
    ret: u16,
    exception: u16,
}

/// Builds the begin/end/catch/finally envelope around `body`'s existing
/// instruction chain, consuming the original head/tail and rewriting
/// every original `ret`. `body` must already hold exactly the method's
/// original instructions; locals and exception clauses are extended in
/// place.
pub fn apply_wrap(body: &mut MethodBody, plan: &WrapPlan) -> std::result::Result<WrapResult, SkipReason> {
    if plan.instance_is_generic_value_type {
        log::debug!("wrap abort: {}", SkipReason::GenericValueTypeInstance);
        return Err(SkipReason::GenericValueTypeInstance);
    }
    if plan.params.iter().any(|p| matches!(p, ParamShape::ByRef)) {
        log::debug!("wrap abort: {}", SkipReason::ByRefParameterUnsupported);
        return Err(SkipReason::ByRefParameterUnsupported);
    }

    let original_head = body.head();
    let slots = extend_locals(body, plan);

    let begin_try = seed_entry_nop(body);
    let mut cursor = InstrCursor::at(body, begin_try);

    push_args_fast_or_slow(&mut cursor, plan).map_err(into_skip)?;
    cursor.call(plan.begin_method_ref, false).map_err(into_skip)?;
    cursor.stloc(slots.state).map_err(into_skip)?;

    let inner_catch_begin = cursor.call(plan.log_exception_ref, false).map_err(into_skip)?;
    // Target back-patched once the splice point is known.
    let inner_leave = cursor.insert_after(Opcode::Leave, Operand::Target(NodeId(u32::MAX)), true).map_err(into_skip)?;

    let splice_anchor = cursor.insert_after(Opcode::Nop, Operand::None, false).map_err(into_skip)?;
    cursor.body_mut().node_mut(inner_leave).unwrap().operand = Operand::Target(splice_anchor);

    // The original body is spliced in here, between the begin-method
    // try/catch and the outer exception catch, so the outer catch's
    // handler follows (rather than contains) the code it protects.
    let mut tail = splice_anchor;
    if let Some(head) = original_head {
        splice_after(cursor.body_mut(), splice_anchor, head);
        tail = last_node(cursor.body_mut(), splice_anchor);
    }
    let pending_leaves = rewrite_returns(cursor.body_mut(), splice_anchor);

    let mut cursor = InstrCursor::at(cursor.body_mut(), tail);
    let outer_catch_begin = cursor.stloc(slots.exception).map_err(into_skip)?;
    cursor.insert_after(Opcode::Rethrow, Operand::None, false).map_err(into_skip)?;

    let finally_try = cursor.insert_after(Opcode::Nop, Operand::None, false).map_err(into_skip)?;

    let mut cursor = InstrCursor::at(cursor.body_mut(), finally_try);
    push_args_fast_or_slow(&mut cursor, plan).map_err(into_skip)?;
    if let Some(idx) = slots.return_value {
        cursor.ldloc(idx).map_err(into_skip)?;
    }
    cursor.ldloc(slots.exception).map_err(into_skip)?;
    cursor.ldloc(slots.state).map_err(into_skip)?;
    cursor.call(plan.end_method_ref, false).map_err(into_skip)?;
    cursor.stloc(slots.ret).map_err(into_skip)?;
    if let (Some(getter), Some(return_value_idx)) = (plan.get_return_value_ref, slots.return_value) {
        cursor.insert_after(Opcode::LdLocA(slots.ret), Operand::None, false).map_err(into_skip)?;
        cursor.call(getter, false).map_err(into_skip)?;
        cursor.stloc(return_value_idx).map_err(into_skip)?;
    }

    let finally_catch_begin = cursor.call(plan.log_exception_ref, false).map_err(into_skip)?;
    let endfinally_node = cursor.endfinally().map_err(into_skip)?;

    let trailing_ret = if let Some(idx) = slots.return_value {
        let ldloc = InstrCursor::at(cursor.body_mut(), endfinally_node).ldloc(idx).map_err(into_skip)?;
        InstrCursor::at(cursor.body_mut(), ldloc).insert_after(Opcode::Ret, Operand::None, false).map_err(into_skip)?
    } else {
        InstrCursor::at(cursor.body_mut(), endfinally_node)
            .insert_after(Opcode::Ret, Operand::None, false)
            .map_err(into_skip)?
    };

    let body = cursor.body_mut();
    for leave in pending_leaves {
        body.node_mut(leave).unwrap().operand = Operand::Target(trailing_ret);
    }
    body.exception_clauses.push(ExceptionClause {
        kind: EhClauseKind::Typed(plan.exception_type_token),
        try_begin: begin_try,
        try_end: Some(inner_catch_begin),
        handler_begin: inner_catch_begin,
        handler_end: Some(splice_anchor),
    });
    body.exception_clauses.push(ExceptionClause {
        kind: EhClauseKind::Typed(plan.exception_type_token),
        try_begin: finally_try,
        try_end: Some(finally_catch_begin),
        handler_begin: finally_catch_begin,
        handler_end: Some(endfinally_node),
    });
    // The outer catch protects begin_try..outer_catch_begin — the
    // begin-method try/catch plus the original body — and its handler
    // (stloc Exception; rethrow) runs immediately after that range ends,
    // not before or inside it.
    body.exception_clauses.push(ExceptionClause {
        kind: EhClauseKind::Typed(plan.exception_type_token),
        try_begin: begin_try,
        try_end: Some(outer_catch_begin),
        handler_begin: outer_catch_begin,
        handler_end: Some(finally_try),
    });
    body.exception_clauses.push(ExceptionClause {
        kind: EhClauseKind::Finally,
        try_begin: begin_try,
        try_end: Some(finally_try),
        handler_begin: finally_try,
        handler_end: Some(trailing_ret),
    });

    Ok(WrapResult { begin_try, trailing_ret })
}

fn into_skip(_: crate::errors::RewriteError) -> SkipReason {
    SkipReason::ByRefParameterUnsupported
}

/// Extends the local-var signature with the synthesized slots, in the
/// order `TReturn?, State, Return, Exception`, and records their
/// indices. All are zero-initialized at method entry via `init_locals`.
fn extend_locals(body: &mut MethodBody, plan: &WrapPlan) -> Slots {
    let base = body.locals.types.len() as u16;
    body.init_locals = true;

    let mut next = base;
    let return_value = if !plan.is_void {
        let idx = next;
        next += 1;
        Some(idx)
    } else {
        None
    };
    let state = next;
    next += 1;
    let ret = next;
    next += 1;
    let exception = next;

    let mut types = body.locals.types.clone();
    if !plan.is_void {
        // The original return value is loaded back out of the boxed
        // `Return` local via `GetReturnValue`, so `object` covers both
        // reference and value-typed returns without needing the
        // method's real return-type token here.
        types.push(ELEMENT_TYPE_OBJECT);
    }
    types.push(ELEMENT_TYPE_OBJECT); // State
    types.push(ELEMENT_TYPE_OBJECT); // Return
    types.push(ELEMENT_TYPE_OBJECT); // Exception
    body.locals = LocalVarSig { types };

    Slots { return_value, state, ret, exception }
}

fn seed_entry_nop(body: &mut MethodBody) -> NodeId {
    let old_head = body.head;
    let id = body.fresh_id();
    let node = InstrNode {
        id,
        opcode: Opcode::Nop,
        operand: Operand::None,
        short_form: false,
        prev: None,
        next: old_head,
    };
    body.nodes.insert(id, node);
    match old_head {
        Some(head) => body.nodes.get_mut(&head).unwrap().prev = Some(id),
        None => body.tail = Some(id),
    }
    body.head = Some(id);
    id
}

fn push_args_fast_or_slow(cursor: &mut InstrCursor, plan: &WrapPlan) -> Result<()> {
    if plan.is_instance {
        cursor.ldarg(0)?;
        if plan.instance_is_value_type {
            cursor.insert_after(Opcode::LdObj, Operand::Token(plan.instance_type_token), false)?;
        }
    }
    let base = if plan.is_instance { 1 } else { 0 };
    if plan.params.len() < FASTPATH_COUNT {
        for (i, shape) in plan.params.iter().enumerate() {
            cursor.ldarg((base + i) as u16)?;
            if let ParamShape::ValueType { type_token } | ParamShape::Generic { type_token } = shape {
                cursor.box_value(*type_token)?;
            }
        }
    } else {
        cursor.ldc_i4(plan.params.len() as i32)?;
        cursor.insert_after(Opcode::NewArr, Operand::Token(0x01000000), false)?;
        for (i, shape) in plan.params.iter().enumerate() {
            cursor.dup()?;
            cursor.ldc_i4(i as i32)?;
            cursor.ldarg((base + i) as u16)?;
            if let ParamShape::ValueType { type_token } | ParamShape::Generic { type_token } = shape {
                cursor.box_value(*type_token)?;
            }
            cursor.stelem_ref()?;
        }
    }
    Ok(())
}

/// Rewrites every `ret` after `from` — i.e. in the spliced-in original
/// body, which at this point runs to the current tail of `body` — to
/// `leave_s`. The leave's real target (`trailing_ret`, the instruction
/// past the outer `endfinally`) doesn't exist yet; callers must
/// back-patch the returned node ids once it does. A `leave` may never
/// target an instruction inside a handler, so the placeholder must not
/// be mistaken for a resolved target — it carries the same
/// `NodeId(u32::MAX)` sentinel the begin-method catch's leave uses
/// before its own target is known.
fn rewrite_returns(body: &mut MethodBody, from: NodeId) -> Vec<NodeId> {
    let mut ids = Vec::new();
    let mut cur = body.next_of(from);
    while let Some(id) = cur {
        ids.push(id);
        cur = body.next_of(id);
    }

    let mut rewritten = Vec::new();
    for id in ids {
        if !matches!(body.node(id).map(|n| n.opcode), Some(Opcode::Ret)) {
            continue;
        }
        body.node_mut(id).unwrap().opcode = Opcode::Leave;
        body.node_mut(id).unwrap().operand = Operand::Target(NodeId(u32::MAX));
        body.node_mut(id).unwrap().short_form = true;
        rewritten.push(id);
    }
    rewritten
}

fn last_node(body: &MethodBody, from: NodeId) -> NodeId {
    let mut tail = from;
    let mut cur = body.next_of(from);
    while let Some(id) = cur {
        tail = id;
        cur = body.next_of(id);
    }
    tail
}

fn splice_after(body: &mut MethodBody, after: NodeId, spliced_head: NodeId) {
    let after_next = body.node(after).and_then(|n| n.next);
    body.node_mut(after).unwrap().next = Some(spliced_head);
    body.node_mut(spliced_head).unwrap().prev = Some(after);
    let spliced_tail = last_node(body, spliced_head);
    if let Some(next) = after_next {
        body.node_mut(spliced_tail).unwrap().next = Some(next);
        body.node_mut(next).unwrap().prev = Some(spliced_tail);
    } else {
        body.tail = Some(spliced_tail);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::{LocalVarSig, MethodBody};

    fn void_two_arg_plan() -> WrapPlan {
        WrapPlan {
            is_void: true,
            is_instance: true,
            instance_is_value_type: false,
            instance_is_generic_value_type: false,
            instance_type_token: 0,
            params: vec![ParamShape::ReferenceType, ParamShape::ReferenceType],
            begin_method_ref: 0x0A000001,
            end_method_ref: 0x0A000002,
            log_exception_ref: 0x0A000003,
            get_return_value_ref: None,
            exception_type_token: 0x01000010,
        }
    }

    fn original_void_body() -> MethodBody {
        let mut body = MethodBody::default();
        body.max_stack = 1;
        body.locals = LocalVarSig::default();
        body.push_back(Opcode::Ret, Operand::None, false);
        body
    }

    #[test]
    fn void_instance_method_gets_three_locals_and_four_clauses() {
        let mut body = original_void_body();
        let plan = void_two_arg_plan();
        let result = apply_wrap(&mut body, &plan).unwrap();
        assert!(body.node(result.begin_try).is_some());
        // State, Return, Exception -- no ReturnValue slot for a void method.
        assert_eq!(body.locals.types.len(), 3);
        assert_eq!(body.exception_clauses.len(), 4);
        assert_eq!(body.node(result.trailing_ret).unwrap().opcode, Opcode::Ret);
    }

    #[test]
    fn generic_value_type_instance_aborts() {
        let mut body = original_void_body();
        let mut plan = void_two_arg_plan();
        plan.instance_is_value_type = true;
        plan.instance_is_generic_value_type = true;
        assert!(matches!(apply_wrap(&mut body, &plan), Err(SkipReason::GenericValueTypeInstance)));
    }

    #[test]
    fn by_ref_parameter_aborts() {
        let mut body = original_void_body();
        let mut plan = void_two_arg_plan();
        plan.params.push(ParamShape::ByRef);
        assert!(matches!(apply_wrap(&mut body, &plan), Err(SkipReason::ByRefParameterUnsupported)));
    }

    #[test]
    fn only_one_ret_remains_after_rewrite() {
        let mut body = original_void_body();
        let plan = void_two_arg_plan();
        apply_wrap(&mut body, &plan).unwrap();
        let ret_count = body.iter().filter(|n| matches!(n.opcode, Opcode::Ret)).count();
        assert_eq!(ret_count, 1);
    }

    /// The outer exception catch is the only clause whose handler opens
    /// with `stloc Exception` — both the begin-method catch and the
    /// finally's own catch open with `call LogException`.
    fn outer_catch_clause(body: &MethodBody, exception_slot: u16) -> ExceptionClause {
        body.exception_clauses
            .iter()
            .find(|c| matches!(body.node(c.handler_begin).unwrap().opcode, Opcode::StLoc(i) if i == exception_slot))
            .unwrap()
            .clone()
    }

    #[test]
    fn rewritten_leave_targets_trailing_ret_not_a_handler_entry() {
        let mut body = original_void_body();
        let plan = void_two_arg_plan();
        let result = apply_wrap(&mut body, &plan).unwrap();

        let handler_starts: Vec<NodeId> = body.exception_clauses.iter().map(|c| c.handler_begin).collect();
        let body_leave = body
            .iter()
            .find(|n| matches!(n.opcode, Opcode::Leave) && n.target() == Some(result.trailing_ret))
            .expect("the rewritten original-body `ret` must leave straight to trailing_ret");
        assert!(!handler_starts.contains(&body_leave.target().unwrap()), "leave must never target a handler's first instruction");
    }

    #[test]
    fn outer_catch_handler_follows_its_protected_range() {
        let mut body = original_void_body();
        let plan = void_two_arg_plan();
        apply_wrap(&mut body, &plan).unwrap();

        // Locals are pushed in order State, Return, Exception (no
        // ReturnValue slot for this void plan), so Exception is slot 2.
        let outer_catch = outer_catch_clause(&body, 2);
        let try_end = outer_catch.try_end.unwrap();
        assert_eq!(try_end, outer_catch.handler_begin, "handler must begin exactly where its try region ends");

        // The original body's spliced `ret`-turned-`leave` must fall
        // strictly before the handler, never inside or after it.
        let mut cur = body.head();
        let mut seen_try_end = false;
        while let Some(id) = cur {
            if id == try_end {
                seen_try_end = true;
            }
            if id == outer_catch.handler_begin {
                assert!(seen_try_end, "handler begins before its protected range ends");
                break;
            }
            cur = body.next_of(id);
        }
    }

    #[test]
    fn slow_path_stores_each_argument_with_stelem_ref() {
        let mut body = original_void_body();
        let mut plan = void_two_arg_plan();
        plan.params = vec![ParamShape::ReferenceType; FASTPATH_COUNT + 1];
        apply_wrap(&mut body, &plan).unwrap();
        let stelem_count = body.iter().filter(|n| matches!(n.opcode, Opcode::StElemRef)).count();
        assert_eq!(stelem_count, plan.params.len());
        let newarr_count = body.iter().filter(|n| matches!(n.opcode, Opcode::NewArr)).count();
        assert_eq!(newarr_count, 1);
    }
}
