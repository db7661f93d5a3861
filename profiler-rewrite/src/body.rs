//! Method body import/export: the boundary between the profiling API's
//! raw byte representation and the rewriter's linked-list representation.
//!
//! Re-encoding always canonicalizes each opcode to its shortest
//! equivalent form (e.g. `ldarg.1` rather than `ldarg.s 1`), rather than
//! preserving whatever verbosity the input happened to use. A body that
//! was itself canonically encoded — true of every fixture a real build
//! pipeline emits — therefore round-trips byte-for-byte through
//! `Import`/`Export` with no edits applied.
//!
//! `dotscope`'s own CIL surface (`method.blocks()`'s basic-block
//! disassembly, `MethodBuilder`'s from-scratch assembler) covers reading
//! a method into control-flow blocks and building a new body in one
//! pass; neither fits what the strategies here need, which is inserting
//! and back-patching individual nodes at arbitrary points in an
//! already-decoded stream across several edit passes while leaving every
//! untouched byte alone. That editable middle ground — a flat, mutable
//! node list addressable by id — stays hand-written for the same reason
//! `signature.rs`'s coded-token walk does: dotscope's parse and build
//! entry points assume the whole method, not a splice into the middle of
//! one already read.

use std::collections::HashMap;

use crate::errors::{RewriteError, Result};
use crate::ids::NodeId;
use crate::instr::{InstrNode, Opcode, Operand};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EhClauseKind {
    Typed(u32),
    Filter,
    Finally,
    Fault,
}

#[derive(Debug, Clone)]
pub struct ExceptionClause {
    pub kind: EhClauseKind,
    pub try_begin: NodeId,
    /// Exclusive. `None` means "end of method body".
    pub try_end: Option<NodeId>,
    pub handler_begin: NodeId,
    pub handler_end: Option<NodeId>,
}

#[derive(Debug, Clone, Default)]
pub struct LocalVarSig {
    pub types: Vec<u8>,
}

/// Raw, byte-level representation as handed across the profiling API
/// boundary: a header-less code stream, exception clauses expressed as
/// byte offsets, and an opaque local-var-sig blob.
#[derive(Debug, Clone, Default)]
pub struct RawMethodBody {
    pub max_stack: u16,
    pub init_locals: bool,
    pub code: Vec<u8>,
    pub exception_clauses: Vec<RawExceptionClause>,
    pub local_var_sig: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
pub struct RawExceptionClause {
    pub kind: EhClauseKind,
    pub try_offset: u32,
    pub try_length: u32,
    pub handler_offset: u32,
    pub handler_length: u32,
}

/// The linked-list representation the rewriter operates on.
#[derive(Debug, Default)]
pub struct MethodBody {
    pub(crate) nodes: HashMap<NodeId, InstrNode>,
    pub(crate) head: Option<NodeId>,
    pub(crate) tail: Option<NodeId>,
    pub(crate) next_id: u32,
    pub max_stack: u16,
    pub init_locals: bool,
    pub exception_clauses: Vec<ExceptionClause>,
    pub locals: LocalVarSig,
}

impl MethodBody {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn head(&self) -> Option<NodeId> {
        self.head
    }

    pub fn tail(&self) -> Option<NodeId> {
        self.tail
    }

    pub fn node(&self, id: NodeId) -> Option<&InstrNode> {
        self.nodes.get(&id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut InstrNode> {
        self.nodes.get_mut(&id)
    }

    pub fn next_of(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(&id).and_then(|n| n.next)
    }

    pub fn prev_of(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(&id).and_then(|n| n.prev)
    }

    pub fn iter(&self) -> impl Iterator<Item = &InstrNode> {
        let mut cur = self.head;
        std::iter::from_fn(move || {
            let id = cur?;
            let node = self.nodes.get(&id)?;
            cur = node.next;
            Some(node)
        })
    }

    pub(crate) fn fresh_id(&mut self) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Append a node at the tail, returning its id. Used by both the
    /// decoder and the cursor's insertion primitives.
    pub(crate) fn push_back(&mut self, opcode: Opcode, operand: Operand, short_form: bool) -> NodeId {
        let id = self.fresh_id();
        let node = InstrNode {
            id,
            opcode,
            operand,
            short_form,
            prev: self.tail,
            next: None,
        };
        if let Some(tail) = self.tail {
            self.nodes.get_mut(&tail).unwrap().next = Some(id);
        } else {
            self.head = Some(id);
        }
        self.tail = Some(id);
        self.nodes.insert(id, node);
        id
    }

    /// Insert a freshly built node immediately after `after`.
    pub(crate) fn insert_after(&mut self, after: NodeId, opcode: Opcode, operand: Operand, short_form: bool) -> Result<NodeId> {
        let next = self.nodes.get(&after).ok_or(RewriteError::DanglingTarget(after))?.next;
        let id = self.fresh_id();
        let node = InstrNode {
            id,
            opcode,
            operand,
            short_form,
            prev: Some(after),
            next,
        };
        self.nodes.insert(id, node);
        self.nodes.get_mut(&after).unwrap().next = Some(id);
        match next {
            Some(next_id) => self.nodes.get_mut(&next_id).unwrap().prev = Some(id),
            None => self.tail = Some(id),
        }
        Ok(id)
    }
}

pub fn import(raw: &RawMethodBody) -> Result<MethodBody> {
    let mut body = MethodBody::empty();
    body.max_stack = raw.max_stack;
    body.init_locals = raw.init_locals;
    body.locals = LocalVarSig { types: raw.local_var_sig.clone() };

    let mut offset_to_node: HashMap<u32, NodeId> = HashMap::new();
    // First pass: decode opcodes, remembering each node's starting
    // offset and (for branches) the raw operand as a byte offset to
    // resolve in the second pass.
    let mut pending_branches: Vec<(NodeId, i64)> = Vec::new();
    let mut cursor = 0u32;
    let code = &raw.code;
    while (cursor as usize) < code.len() {
        let start = cursor;
        let byte = read_u8(code, &mut cursor)?;
        let (opcode, operand, short_form, branch_rel) = match byte {
            0x00 => (Opcode::Nop, Operand::None, false, None),
            0x25 => (Opcode::Dup, Operand::None, false, None),
            0x26 => (Opcode::Pop, Operand::None, false, None),
            0x02..=0x05 => (Opcode::LdArg((byte - 0x02) as u16), Operand::None, true, None),
            0x0E => (Opcode::LdArg(read_u8(code, &mut cursor)? as u16), Operand::None, false, None),
            0x06..=0x09 => (Opcode::LdLoc((byte - 0x06) as u16), Operand::None, true, None),
            0x11 => (Opcode::LdLoc(read_u8(code, &mut cursor)? as u16), Operand::None, false, None),
            0x0A..=0x0D => (Opcode::StLoc((byte - 0x0A) as u16), Operand::None, true, None),
            0x13 => (Opcode::StLoc(read_u8(code, &mut cursor)? as u16), Operand::None, false, None),
            0x12 => (Opcode::LdLocA(read_u8(code, &mut cursor)? as u16), Operand::None, false, None),
            0x14 => (Opcode::LdNull, Operand::None, false, None),
            0x15 => (Opcode::LdcI4(-1), Operand::None, true, None),
            0x16..=0x1E => (Opcode::LdcI4((byte - 0x16) as i32), Operand::None, true, None),
            0x1F => (Opcode::LdcI4(read_u8(code, &mut cursor)? as i8 as i32), Operand::None, false, None),
            0x20 => (Opcode::LdcI4(read_i32(code, &mut cursor)?), Operand::None, false, None),
            0x21 => (Opcode::LdcI8(read_i64(code, &mut cursor)?), Operand::None, false, None),
            0x72 => (Opcode::LdStr, Operand::Token(read_u32(code, &mut cursor)?), false, None),
            0x8C => (Opcode::Box, Operand::Token(read_u32(code, &mut cursor)?), false, None),
            0xA5 => (Opcode::UnboxAny, Operand::Token(read_u32(code, &mut cursor)?), false, None),
            0x8D => (Opcode::NewArr, Operand::Token(read_u32(code, &mut cursor)?), false, None),
            0x71 => (Opcode::LdObj, Operand::Token(read_u32(code, &mut cursor)?), false, None),
            0xA2 => (Opcode::StElemRef, Operand::None, false, None),
            0x28 => (Opcode::Call { is_virt: false }, Operand::Token(read_u32(code, &mut cursor)?), false, None),
            0x6F => (Opcode::Call { is_virt: true }, Operand::Token(read_u32(code, &mut cursor)?), false, None),
            0x2A => (Opcode::Ret, Operand::None, false, None),
            0xDC => (Opcode::EndFinally, Operand::None, false, None),
            0xDE => {
                let rel = read_u8(code, &mut cursor)? as i8 as i64;
                (Opcode::Leave, Operand::None, true, Some(rel))
            }
            0xDD => {
                let rel = read_i32(code, &mut cursor)? as i64;
                (Opcode::Leave, Operand::None, false, Some(rel))
            }
            0x2B => (Opcode::Br, Operand::None, true, Some(read_u8(code, &mut cursor)? as i8 as i64)),
            0x2C => (Opcode::BrFalse, Operand::None, true, Some(read_u8(code, &mut cursor)? as i8 as i64)),
            0x2D => (Opcode::BrTrue, Operand::None, true, Some(read_u8(code, &mut cursor)? as i8 as i64)),
            0x38 => (Opcode::Br, Operand::None, false, Some(read_i32(code, &mut cursor)? as i64)),
            0x39 => (Opcode::BrFalse, Operand::None, false, Some(read_i32(code, &mut cursor)? as i64)),
            0x3A => (Opcode::BrTrue, Operand::None, false, Some(read_i32(code, &mut cursor)? as i64)),
            0xFE => {
                let sub = read_u8(code, &mut cursor)?;
                match sub {
                    0x09 => (Opcode::LdArg(read_u16(code, &mut cursor)?), Operand::None, false, None),
                    0x0C => (Opcode::LdLoc(read_u16(code, &mut cursor)?), Operand::None, false, None),
                    0x0E => (Opcode::StLoc(read_u16(code, &mut cursor)?), Operand::None, false, None),
                    0x0D => (Opcode::LdLocA(read_u16(code, &mut cursor)?), Operand::None, false, None),
                    0x16 => (Opcode::ConstrainedPrefix, Operand::Token(read_u32(code, &mut cursor)?), false, None),
                    0x1A => (Opcode::Rethrow, Operand::None, false, None),
                    other => return Err(RewriteError::MalformedBody(format!("unsupported 2-byte opcode 0xFE{:02X}", other))),
                }
            }
            other => return Err(RewriteError::MalformedBody(format!("unsupported opcode 0x{:02X} at offset {}", other, start))),
        };

        let id = body.push_back(opcode, operand, short_form);
        offset_to_node.insert(start, id);
        if let Some(rel) = branch_rel {
            let target_offset = cursor as i64 + rel;
            pending_branches.push((id, target_offset));
        }
    }

    let end_offset = cursor;
    for (id, target_offset) in pending_branches {
        let target = if target_offset == end_offset as i64 {
            None
        } else {
            let off = u32::try_from(target_offset).map_err(|_| RewriteError::MalformedBody("negative branch target".into()))?;
            Some(*offset_to_node.get(&off).ok_or(RewriteError::MalformedBody(format!("branch target offset {} has no instruction", off)))?)
        };
        let node = body.nodes.get_mut(&id).unwrap();
        node.operand = match target {
            Some(t) => Operand::Target(t),
            None => Operand::Target(NodeId(u32::MAX)), // resolved lazily to "end" by exporter; see resolve_end below
        };
    }

    let resolve_offset = |off: u32| -> Option<NodeId> {
        if off == end_offset {
            None
        } else {
            offset_to_node.get(&off).copied()
        }
    };

    for raw_clause in &raw.exception_clauses {
        let try_begin = resolve_offset(raw_clause.try_offset).ok_or_else(|| RewriteError::MalformedBody("try clause begin outside body".into()))?;
        let handler_begin = resolve_offset(raw_clause.handler_offset).ok_or_else(|| RewriteError::MalformedBody("handler begin outside body".into()))?;
        body.exception_clauses.push(ExceptionClause {
            kind: raw_clause.kind,
            try_begin,
            try_end: resolve_offset(raw_clause.try_offset + raw_clause.try_length),
            handler_begin,
            handler_end: resolve_offset(raw_clause.handler_offset + raw_clause.handler_length),
        });
    }

    Ok(body)
}

pub fn export(body: &MethodBody) -> Result<RawMethodBody> {
    // Pass 1: assign provisional byte offsets assuming branch operands
    // take their node's recorded encoding width.
    let mut offsets: HashMap<NodeId, u32> = HashMap::new();
    let mut cursor = body.head;
    let mut pos = 0u32;
    while let Some(id) = cursor {
        let node = body.nodes.get(&id).unwrap();
        offsets.insert(id, pos);
        pos += encoded_len(node);
        cursor = node.next;
    }
    let end_offset = pos;

    let mut code = Vec::with_capacity(end_offset as usize);
    let mut cursor = body.head;
    while let Some(id) = cursor {
        let node = body.nodes.get(&id).unwrap();
        let next_pos = offsets[&id] + encoded_len(node);
        encode_node(node, &offsets, end_offset, next_pos, &mut code)?;
        cursor = node.next;
    }

    let resolve_exclusive = |n: Option<NodeId>| -> u32 {
        match n {
            Some(id) => offsets[&id],
            None => end_offset,
        }
    };

    let exception_clauses = body
        .exception_clauses
        .iter()
        .map(|c| {
            let try_offset = offsets[&c.try_begin];
            let try_end = resolve_exclusive(c.try_end);
            let handler_offset = offsets[&c.handler_begin];
            let handler_end = resolve_exclusive(c.handler_end);
            RawExceptionClause {
                kind: c.kind,
                try_offset,
                try_length: try_end - try_offset,
                handler_offset,
                handler_length: handler_end - handler_offset,
            }
        })
        .collect();

    Ok(RawMethodBody {
        max_stack: body.max_stack,
        init_locals: body.init_locals,
        code,
        exception_clauses,
        local_var_sig: body.locals.types.clone(),
    })
}

fn encoded_len(node: &InstrNode) -> u32 {
    match node.opcode {
        Opcode::Nop | Opcode::Dup | Opcode::Pop | Opcode::LdNull | Opcode::Ret | Opcode::EndFinally | Opcode::Rethrow | Opcode::StElemRef => 1,
        Opcode::LdArg(i) | Opcode::LdLoc(i) | Opcode::StLoc(i) => {
            if i < 4 {
                1
            } else if i <= u8::MAX as u16 {
                2
            } else {
                3
            }
        }
        Opcode::LdLocA(i) => {
            if i <= u8::MAX as u16 {
                2
            } else {
                3
            }
        }
        Opcode::LdcI4(v) => {
            if (-1..=8).contains(&v) {
                1
            } else if i8::try_from(v).is_ok() {
                2
            } else {
                5
            }
        }
        Opcode::LdcI8(_) => 9,
        Opcode::LdStr | Opcode::Box | Opcode::UnboxAny | Opcode::NewArr | Opcode::LdObj | Opcode::Call { .. } => 5,
        Opcode::ConstrainedPrefix => 6,
        Opcode::Leave | Opcode::Br | Opcode::BrTrue | Opcode::BrFalse => {
            if node.short_form {
                2
            } else {
                5
            }
        }
    }
}

fn encode_node(node: &InstrNode, offsets: &HashMap<NodeId, u32>, end_offset: u32, next_pos: u32, out: &mut Vec<u8>) -> Result<()> {
    match node.opcode {
        Opcode::Nop => out.push(0x00),
        Opcode::Dup => out.push(0x25),
        Opcode::Pop => out.push(0x26),
        Opcode::LdArg(i) => encode_indexed(out, i, [0x02, 0x03, 0x04, 0x05], 0x0E, 0xFE09),
        Opcode::LdLoc(i) => encode_indexed(out, i, [0x06, 0x07, 0x08, 0x09], 0x11, 0xFE0C),
        Opcode::StLoc(i) => encode_indexed(out, i, [0x0A, 0x0B, 0x0C, 0x0D], 0x13, 0xFE0E),
        Opcode::LdLocA(i) => {
            if i <= u8::MAX as u16 {
                out.push(0x12);
                out.push(i as u8);
            } else {
                out.push(0xFE);
                out.push(0x0D);
                out.extend_from_slice(&i.to_le_bytes());
            }
        }
        Opcode::LdNull => out.push(0x14),
        Opcode::LdcI4(v) => {
            if (0..=8).contains(&v) {
                out.push(0x16 + v as u8);
            } else if v == -1 {
                out.push(0x15);
            } else if let Ok(b) = i8::try_from(v) {
                out.push(0x1F);
                out.push(b as u8);
            } else {
                out.push(0x20);
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        Opcode::LdcI8(v) => {
            out.push(0x21);
            out.extend_from_slice(&v.to_le_bytes());
        }
        Opcode::LdStr => encode_token(out, 0x72, node.token()),
        Opcode::Box => encode_token(out, 0x8C, node.token()),
        Opcode::UnboxAny => encode_token(out, 0xA5, node.token()),
        Opcode::NewArr => encode_token(out, 0x8D, node.token()),
        Opcode::LdObj => encode_token(out, 0x71, node.token()),
        Opcode::StElemRef => out.push(0xA2),
        Opcode::Call { is_virt: false } => encode_token(out, 0x28, node.token()),
        Opcode::Call { is_virt: true } => encode_token(out, 0x6F, node.token()),
        Opcode::ConstrainedPrefix => {
            out.push(0xFE);
            out.push(0x16);
            let tok = node.token().ok_or_else(|| RewriteError::MalformedBody("constrained. prefix missing token".into()))?;
            out.extend_from_slice(&tok.to_le_bytes());
        }
        Opcode::Ret => out.push(0x2A),
        Opcode::EndFinally => out.push(0xDC),
        Opcode::Rethrow => {
            out.push(0xFE);
            out.push(0x1A);
        }
        Opcode::Leave | Opcode::Br | Opcode::BrTrue | Opcode::BrFalse => {
            let target_off = match node.operand {
                Operand::Target(t) if t.0 == u32::MAX => end_offset,
                Operand::Target(t) => *offsets.get(&t).ok_or(RewriteError::DanglingTarget(t))?,
                _ => return Err(RewriteError::MalformedBody("branch node missing target operand".into())),
            };
            let rel = target_off as i64 - next_pos as i64;
            if node.short_form {
                let rel8 = i8::try_from(rel).map_err(|_| RewriteError::OffsetOverflow)?;
                out.push(short_branch_opcode(node.opcode));
                out.push(rel8 as u8);
            } else {
                let rel32 = i32::try_from(rel).map_err(|_| RewriteError::OffsetOverflow)?;
                long_branch_opcode(node.opcode, out);
                out.extend_from_slice(&rel32.to_le_bytes());
            }
        }
    }
    Ok(())
}

fn encode_indexed(out: &mut Vec<u8>, i: u16, short_table: [u8; 4], byte_form: u8, two_byte_form: u16) {
    if i < 4 {
        out.push(short_table[i as usize]);
    } else if i <= u8::MAX as u16 {
        out.push(byte_form);
        out.push(i as u8);
    } else {
        out.push((two_byte_form >> 8) as u8);
        out.push((two_byte_form & 0xFF) as u8);
        out.extend_from_slice(&i.to_le_bytes());
    }
}

fn encode_token(out: &mut Vec<u8>, opcode_byte: u8, token: Option<u32>) {
    out.push(opcode_byte);
    out.extend_from_slice(&token.unwrap_or(0).to_le_bytes());
}

fn short_branch_opcode(opcode: Opcode) -> u8 {
    match opcode {
        Opcode::Leave => 0xDE,
        Opcode::Br => 0x2B,
        Opcode::BrFalse => 0x2C,
        Opcode::BrTrue => 0x2D,
        _ => unreachable!(),
    }
}

fn long_branch_opcode(opcode: Opcode, out: &mut Vec<u8>) {
    match opcode {
        Opcode::Leave => out.push(0xDD),
        Opcode::Br => out.push(0x38),
        Opcode::BrFalse => out.push(0x39),
        Opcode::BrTrue => out.push(0x3A),
        _ => unreachable!(),
    }
}

fn read_u8(code: &[u8], cursor: &mut u32) -> Result<u8> {
    let byte = *code.get(*cursor as usize).ok_or_else(|| RewriteError::MalformedBody("truncated instruction stream".into()))?;
    *cursor += 1;
    Ok(byte)
}

fn read_u16(code: &[u8], cursor: &mut u32) -> Result<u16> {
    let b0 = read_u8(code, cursor)? as u16;
    let b1 = read_u8(code, cursor)? as u16;
    Ok(b0 | (b1 << 8))
}

fn read_u32(code: &[u8], cursor: &mut u32) -> Result<u32> {
    let mut buf = [0u8; 4];
    for b in &mut buf {
        *b = read_u8(code, cursor)?;
    }
    Ok(u32::from_le_bytes(buf))
}

fn read_i32(code: &[u8], cursor: &mut u32) -> Result<i32> {
    Ok(read_u32(code, cursor)? as i32)
}

fn read_i64(code: &[u8], cursor: &mut u32) -> Result<i64> {
    let lo = read_u32(code, cursor)? as u64;
    let hi = read_u32(code, cursor)? as u64;
    Ok((lo | (hi << 32)) as i64)
}
