//! A cursor-based editor over a [`MethodBody`]'s linked instruction
//! list. Every insertion returns the [`NodeId`] of the new node so
//! callers can wire up branch targets without re-walking the list.

use crate::body::MethodBody;
use crate::errors::Result;
use crate::ids::NodeId;
use crate::instr::{Opcode, Operand};

pub struct InstrCursor<'a> {
    body: &'a mut MethodBody,
    pub current: NodeId,
}

impl<'a> InstrCursor<'a> {
    pub fn at(body: &'a mut MethodBody, current: NodeId) -> Self {
        Self { body, current }
    }

    pub fn body(&self) -> &MethodBody {
        self.body
    }

    pub fn body_mut(&mut self) -> &mut MethodBody {
        self.body
    }

    /// Replace the current node's opcode/operand in place, preserving
    /// its `NodeId` — this is what makes NOP neutralization safe for
    /// any outstanding branch target or exception-clause boundary that
    /// already points at this node.
    pub fn replace_in_place(&mut self, opcode: Opcode, operand: Operand, short_form: bool) {
        let node = self.body.node_mut(self.current).expect("cursor points at a live node");
        node.opcode = opcode;
        node.operand = operand;
        node.short_form = short_form;
    }

    pub fn neutralize(&mut self) {
        self.replace_in_place(Opcode::Nop, Operand::None, false);
    }

    /// Insert a node after the current position and move the cursor to
    /// it. Returns the new node's id.
    pub fn insert_after(&mut self, opcode: Opcode, operand: Operand, short_form: bool) -> Result<NodeId> {
        let id = self.body.insert_after(self.current, opcode, operand, short_form)?;
        self.current = id;
        Ok(id)
    }

    pub fn ldarg(&mut self, index: u16) -> Result<NodeId> {
        self.insert_after(Opcode::LdArg(index), Operand::None, index < 4)
    }

    pub fn ldloc(&mut self, index: u16) -> Result<NodeId> {
        self.insert_after(Opcode::LdLoc(index), Operand::None, index < 4)
    }

    pub fn stloc(&mut self, index: u16) -> Result<NodeId> {
        self.insert_after(Opcode::StLoc(index), Operand::None, index < 4)
    }

    pub fn ldnull(&mut self) -> Result<NodeId> {
        self.insert_after(Opcode::LdNull, Operand::None, false)
    }

    pub fn ldc_i4(&mut self, value: i32) -> Result<NodeId> {
        self.insert_after(Opcode::LdcI4(value), Operand::None, (-1..=8).contains(&value))
    }

    pub fn call(&mut self, method_token: u32, is_virt: bool) -> Result<NodeId> {
        self.insert_after(Opcode::Call { is_virt }, Operand::Token(method_token), false)
    }

    pub fn box_value(&mut self, type_token: u32) -> Result<NodeId> {
        self.insert_after(Opcode::Box, Operand::Token(type_token), false)
    }

    pub fn unbox_any(&mut self, type_token: u32) -> Result<NodeId> {
        self.insert_after(Opcode::UnboxAny, Operand::Token(type_token), false)
    }

    pub fn dup(&mut self) -> Result<NodeId> {
        self.insert_after(Opcode::Dup, Operand::None, false)
    }

    pub fn pop(&mut self) -> Result<NodeId> {
        self.insert_after(Opcode::Pop, Operand::None, false)
    }

    /// `stelem.ref`: pops `[array, index, value]` and stores `value` into
    /// `array[index]`.
    pub fn stelem_ref(&mut self) -> Result<NodeId> {
        self.insert_after(Opcode::StElemRef, Operand::None, false)
    }

    /// Emit a `leave.s` to `target`. The caller back-patches `target`
    /// once the real destination node exists (e.g. the handler's first
    /// instruction hasn't been built yet at emission time) by calling
    /// [`MethodBody::node_mut`] and overwriting the operand.
    pub fn leave_s(&mut self, target: NodeId) -> Result<NodeId> {
        self.insert_after(Opcode::Leave, Operand::Target(target), true)
    }

    pub fn endfinally(&mut self) -> Result<NodeId> {
        self.insert_after(Opcode::EndFinally, Operand::None, false)
    }
}
