/// Stable identity of one instruction node in a method body's doubly
/// linked list. Node identity survives in-place edits (in particular,
/// NOP neutralization), which is how branch targets keep resolving to
/// the same instruction across an edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalSlot(pub u16);
