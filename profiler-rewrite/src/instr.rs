//! The instruction vocabulary the rewriter edits. Not a full CIL opcode
//! table — just the opcodes the call-site and wrapping strategies read,
//! emit, or need to preserve byte-for-byte across an untouched round trip.

use crate::ids::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Nop,
    Dup,
    Pop,
    LdArg(u16),
    LdLoc(u16),
    StLoc(u16),
    LdLocA(u16),
    LdNull,
    LdcI4(i32),
    LdcI8(i64),
    /// Operand carries the `#US` heap token.
    LdStr,
    /// Operand carries a `TypeDefOrRefOrSpec` token.
    Box,
    UnboxAny,
    NewArr,
    LdObj,
    /// `stelem.ref` — stores the value on top of the stack into the
    /// object-array element addressed by `[array, index]` below it.
    StElemRef,
    /// Operand carries a `MethodDefOrRefOrSpec` token.
    Call { is_virt: bool },
    /// `constrained.` prefix; operand carries the constraining type
    /// token, and always precedes a `callvirt` node.
    ConstrainedPrefix,
    Ret,
    /// Operand carries the branch target. `short_form` governs whether
    /// `Export` re-emits the 1-byte or 4-byte encoding.
    Leave,
    Br,
    BrTrue,
    BrFalse,
    Rethrow,
    EndFinally,
}

impl Opcode {
    pub fn is_branch(&self) -> bool {
        matches!(self, Opcode::Leave | Opcode::Br | Opcode::BrTrue | Opcode::BrFalse)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    None,
    Token(u32),
    Target(NodeId),
}

/// One node in the method body's doubly linked instruction list.
///
/// `short_form` only means something for branch opcodes: it records
/// whether the instruction was (or should be, on export) encoded with a
/// 1-byte or 4-byte offset. Non-branch opcodes ignore it.
#[derive(Debug, Clone)]
pub struct InstrNode {
    pub id: NodeId,
    pub opcode: Opcode,
    pub operand: Operand,
    pub short_form: bool,
    pub(crate) prev: Option<NodeId>,
    pub(crate) next: Option<NodeId>,
}

impl InstrNode {
    pub fn target(&self) -> Option<NodeId> {
        match self.operand {
            Operand::Target(id) => Some(id),
            _ => None,
        }
    }

    pub fn token(&self) -> Option<u32> {
        match self.operand {
            Operand::Token(tok) => Some(tok),
            _ => None,
        }
    }
}
