//! The graph that the register allocator operates on.
//!
//! A [Graph] is a sequence of [Block]s in their final layout order. Each block contains zero or
//! more phis, zero or more nodes, and exactly one control node. Graphs are created with a
//! [GraphBuilder], which numbers nodes in layout order, computes predecessors, and decides which
//! blocks need a merge state: after that the only parts of a graph that change are the
//! allocation fields the register allocator fills in and the gap moves it inserts.

use crate::regalloc::MergeState;
use index_vec::IndexVec;
use smallvec::SmallVec;
use static_assertions::const_assert;
use std::fmt;

mod builder;
mod print;
mod well_formed;

pub use builder::{GraphBuilder, NodeSpec, Term};

/// The maximum number of allocatable registers a graph can have.
pub const MAX_REGS: usize = 64;
const_assert!(MAX_REGS <= u64::BITS as usize);

index_vec::define_index_type! {
    /// An index into [Graph::blocks], which is also the block's layout position.
    pub struct BlockIdx = u32;
}

index_vec::define_index_type! {
    /// An index into [Graph::nodes].
    pub struct NodeIdx = u32;
}

/// A node's position in the linear order of the graph. Ids are assigned in layout order, within a
/// block in the order phis, nodes, control node. The id 0 is never assigned.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    /// "No id": used for "no next use" and "no live range".
    pub const INVALID: NodeId = NodeId(0);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// The id directly after this one.
    pub(crate) fn next(self) -> NodeId {
        NodeId(self.0 + 1)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An allocatable register, identified by its index in `0..num_regs`.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Reg(u8);

impl Reg {
    pub fn new(idx: usize) -> Self {
        assert!(idx < MAX_REGS);
        Reg(u8::try_from(idx).unwrap())
    }

    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// A set of registers.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RegSet(u64);

impl RegSet {
    /// Create a [RegSet] with no registers set.
    pub fn blank() -> Self {
        Self(0)
    }

    /// Create a [RegSet] with registers `0..num_regs` set.
    pub fn with_first(num_regs: usize) -> Self {
        debug_assert!(num_regs <= MAX_REGS);
        if num_regs == MAX_REGS {
            Self(u64::MAX)
        } else {
            Self((1 << num_regs) - 1)
        }
    }

    pub fn is_set(&self, reg: Reg) -> bool {
        self.0 & (1 << reg.index()) != 0
    }

    pub fn set(&mut self, reg: Reg) {
        self.0 |= 1 << reg.index();
    }

    pub fn unset(&mut self, reg: Reg) {
        self.0 &= !(1 << reg.index());
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        usize::try_from(self.0.count_ones()).unwrap()
    }

    /// The lowest numbered register in the set.
    pub fn first(&self) -> Option<Reg> {
        if self.0 == 0 {
            None
        } else {
            Some(Reg::new(usize::try_from(self.0.trailing_zeros()).unwrap()))
        }
    }

    /// The set containing the lowest `n` registers in this set.
    pub fn lowest(&self, n: usize) -> RegSet {
        let mut out = RegSet::blank();
        for reg in self.iter().take(n) {
            out.set(reg);
        }
        out
    }

    /// Iterate over the registers in this set, lowest first.
    pub fn iter(&self) -> impl Iterator<Item = Reg> {
        let mut bits = self.0;
        std::iter::from_fn(move || {
            if bits == 0 {
                None
            } else {
                let idx = bits.trailing_zeros();
                bits &= bits - 1;
                Some(Reg::new(usize::try_from(idx).unwrap()))
            }
        })
    }
}

impl From<Reg> for RegSet {
    fn from(reg: Reg) -> Self {
        Self(1 << reg.index())
    }
}

impl fmt::Display for RegSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let regs = self.iter().map(|x| x.to_string()).collect::<Vec<_>>();
        write!(f, "{{{}}}", regs.join(", "))
    }
}

/// A concrete location for a value.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Operand {
    Reg(Reg),
    /// A stack slot. Slots `>= 0` are spill slots handed out by the allocator; negative slots are
    /// fixed incoming frame locations such as parameters.
    Stack(i32),
}

impl Operand {
    pub fn is_reg(&self) -> bool {
        matches!(self, Operand::Reg(_))
    }

    pub fn reg(&self) -> Option<Reg> {
        match self {
            Operand::Reg(reg) => Some(*reg),
            Operand::Stack(_) => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Reg(reg) => write!(f, "{reg}"),
            Operand::Stack(slot) => write!(f, "s{slot}"),
        }
    }
}

/// Constraints on where an input or result must be placed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OperandPolicy {
    /// Wherever the value currently is.
    RegisterOrSlot,
    /// As [OperandPolicy::RegisterOrSlot]: this allocator has no constants.
    RegisterOrSlotOrConstant,
    /// Exactly this register.
    FixedRegister(Reg),
    /// Any register.
    MustHaveRegister,
    /// Results only: the register chosen for the given input.
    SameAsInput(usize),
    /// Results only: a fixed incoming frame slot, which must be negative.
    FixedSlot(i32),
    /// Not supported by this allocator.
    MustHaveSlot,
    /// Not supported by this allocator.
    None,
}

/// The use of a value by a node.
#[derive(Clone, Debug)]
pub struct Input {
    /// The node whose value is used.
    pub(crate) node: NodeIdx,
    pub(crate) policy: OperandPolicy,
    /// The id of the value's next use after this one, or [NodeId::INVALID] if this is the last.
    pub(crate) next_use_id: NodeId,
    /// Where this input was placed by the allocator.
    pub(crate) allocated: Option<Operand>,
}

impl Input {
    pub(crate) fn new(node: NodeIdx, policy: OperandPolicy) -> Self {
        Self {
            node,
            policy,
            next_use_id: NodeId::INVALID,
            allocated: None,
        }
    }

    pub fn node(&self) -> NodeIdx {
        self.node
    }

    pub fn policy(&self) -> OperandPolicy {
        self.policy
    }

    pub fn next_use_id(&self) -> NodeId {
        self.next_use_id
    }

    pub fn allocated(&self) -> Option<Operand> {
        self.allocated
    }
}

/// Identifies one [Input] record in a graph, wherever it is stored.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum InputSite {
    /// Input `usize` of a phi or node.
    Node(NodeIdx, usize),
    /// Input `usize` of a block's control node.
    Control(BlockIdx, usize),
    /// Live-through use `usize` of a block's loop jump.
    LiveThrough(BlockIdx, usize),
}

/// Whatever holds a set of temporaries.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum TempSite {
    Node(NodeIdx),
    Control(BlockIdx),
}

/// The allocation bookkeeping for a node which produces a value.
#[derive(Clone, Debug)]
pub struct Value {
    /// Where the result must be placed.
    pub(crate) policy: OperandPolicy,
    /// Where the result was placed.
    pub(crate) result: Option<Operand>,
    /// The registers currently holding this value.
    pub(crate) regs: RegSet,
    /// The stack slot this value has been spilled to, if any. Once spilled, a value stays spilled.
    pub(crate) spill: Option<Operand>,
    /// The id of the next unprocessed use, or [NodeId::INVALID] if the value is dead.
    pub(crate) next_use: NodeId,
    /// The id of the value's last use, or [NodeId::INVALID] if it has no uses.
    pub(crate) live_range_end: NodeId,
}

impl Value {
    pub(crate) fn new(policy: OperandPolicy) -> Self {
        Self {
            policy,
            result: None,
            regs: RegSet::blank(),
            spill: None,
            next_use: NodeId::INVALID,
            live_range_end: NodeId::INVALID,
        }
    }

    pub fn policy(&self) -> OperandPolicy {
        self.policy
    }

    pub fn result(&self) -> Option<Operand> {
        self.result
    }

    pub fn regs(&self) -> RegSet {
        self.regs
    }

    pub fn spill(&self) -> Option<Operand> {
        self.spill
    }

    pub fn next_use(&self) -> NodeId {
        self.next_use
    }

    pub fn live_range_end(&self) -> NodeId {
        self.live_range_end
    }

    pub fn is_dead(&self) -> bool {
        !self.next_use.is_valid()
    }

    pub fn has_register(&self) -> bool {
        !self.regs.is_empty()
    }

    pub fn is_spilled(&self) -> bool {
        self.spill.is_some()
    }

    pub fn has_valid_live_range(&self) -> bool {
        self.live_range_end.is_valid()
    }

    /// The value's current location: its first register if it has one, otherwise its spill slot.
    ///
    /// # Panics
    ///
    /// If the value is neither in a register nor spilled.
    pub fn allocation(&self) -> Operand {
        if let Some(reg) = self.regs.first() {
            Operand::Reg(reg)
        } else if let Some(spill) = self.spill {
            spill
        } else {
            panic!("Value has neither a register nor a spill slot");
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct OpProperties {
    /// Calls clobber every register.
    pub is_call: bool,
    /// Deopts need every live value to have a stack location.
    pub can_deopt: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NodeKind {
    /// An operation, named only for display purposes.
    Op(String),
    Phi,
    /// A move inserted by the allocator.
    GapMove { from: Operand, to: Operand },
}

#[derive(Clone, Debug)]
pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) kind: NodeKind,
    pub(crate) inputs: SmallVec<[Input; 2]>,
    pub(crate) props: OpProperties,
    pub(crate) num_temporaries: usize,
    /// The registers handed out as temporaries.
    pub(crate) temporaries: RegSet,
    /// Present iff this node produces a value.
    pub(crate) value: Option<Value>,
}

impl Node {
    pub(crate) fn gap_move(from: Operand, to: Operand) -> Self {
        Self {
            id: NodeId::INVALID,
            kind: NodeKind::GapMove { from, to },
            inputs: SmallVec::new(),
            props: OpProperties::default(),
            num_temporaries: 0,
            temporaries: RegSet::blank(),
            value: None,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn inputs(&self) -> &[Input] {
        &self.inputs
    }

    pub fn props(&self) -> OpProperties {
        self.props
    }

    pub fn temporaries(&self) -> RegSet {
        self.temporaries
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn is_gap_move(&self) -> bool {
        matches!(self.kind, NodeKind::GapMove { .. })
    }
}

#[derive(Clone, Debug)]
pub enum ControlKind {
    Jump {
        target: BlockIdx,
    },
    /// A jump backwards to a loop header.
    JumpLoop {
        target: BlockIdx,
        /// Values defined before the loop header and used inside the loop: these are used again
        /// at the loop jump so that they stay alive for the next iteration.
        live_through: Vec<Input>,
    },
    Branch {
        if_true: BlockIdx,
        if_false: BlockIdx,
    },
    Return,
}

impl ControlKind {
    /// The target of an unconditional control node.
    pub fn unconditional_target(&self) -> Option<BlockIdx> {
        match self {
            ControlKind::Jump { target } | ControlKind::JumpLoop { target, .. } => Some(*target),
            ControlKind::Branch { .. } | ControlKind::Return => None,
        }
    }

    pub fn successors(&self) -> SmallVec<[BlockIdx; 2]> {
        match self {
            ControlKind::Jump { target } | ControlKind::JumpLoop { target, .. } => {
                SmallVec::from_slice(&[*target])
            }
            ControlKind::Branch { if_true, if_false } => SmallVec::from_slice(&[*if_true, *if_false]),
            ControlKind::Return => SmallVec::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ControlNode {
    pub(crate) id: NodeId,
    pub(crate) kind: ControlKind,
    pub(crate) inputs: SmallVec<[Input; 2]>,
    pub(crate) props: OpProperties,
    pub(crate) num_temporaries: usize,
    pub(crate) temporaries: RegSet,
}

impl ControlNode {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> &ControlKind {
        &self.kind
    }

    pub fn inputs(&self) -> &[Input] {
        &self.inputs
    }

    pub fn props(&self) -> OpProperties {
        self.props
    }

    pub fn temporaries(&self) -> RegSet {
        self.temporaries
    }
}

#[derive(Clone, Debug)]
pub struct Block {
    pub(crate) phis: Vec<NodeIdx>,
    /// The block's nodes, including any gap moves inserted by the allocator.
    pub(crate) nodes: Vec<NodeIdx>,
    pub(crate) control: ControlNode,
    /// The id of the first phi, or the first node, or the control node.
    pub(crate) first_id: NodeId,
    /// Predecessors in layout order. Phi inputs are in the same order.
    pub(crate) predecessors: Vec<BlockIdx>,
    /// If this block ends in an unconditional control node, this block's position in its
    /// target's predecessor list.
    pub(crate) predecessor_id: usize,
    /// An edge-splitting block with no phis or nodes, ending in a jump.
    pub(crate) is_empty_block: bool,
    pub(crate) is_loop_header: bool,
    /// Present iff the allocator must agree on register contents at the start of this block.
    pub(crate) state: Option<MergeState>,
}

impl Block {
    pub fn phis(&self) -> &[NodeIdx] {
        &self.phis
    }

    pub fn nodes(&self) -> &[NodeIdx] {
        &self.nodes
    }

    pub fn control(&self) -> &ControlNode {
        &self.control
    }

    pub fn first_id(&self) -> NodeId {
        self.first_id
    }

    pub fn predecessors(&self) -> &[BlockIdx] {
        &self.predecessors
    }

    pub fn predecessor_id(&self) -> usize {
        self.predecessor_id
    }

    pub fn is_empty_block(&self) -> bool {
        self.is_empty_block
    }

    pub fn is_loop_header(&self) -> bool {
        self.is_loop_header
    }

    pub fn state(&self) -> Option<&MergeState> {
        self.state.as_ref()
    }
}

#[derive(Debug)]
pub struct Graph {
    pub(crate) num_regs: usize,
    pub(crate) blocks: IndexVec<BlockIdx, Block>,
    pub(crate) nodes: IndexVec<NodeIdx, Node>,
    /// The number of spill slots used, set by the allocator.
    pub(crate) stack_slots: u32,
    pub(crate) allocated: bool,
}

impl Graph {
    pub fn num_regs(&self) -> usize {
        self.num_regs
    }

    /// The number of spill slots the allocated graph needs.
    pub fn stack_slots(&self) -> u32 {
        self.stack_slots
    }

    pub fn is_allocated(&self) -> bool {
        self.allocated
    }

    pub fn block(&self, bidx: BlockIdx) -> &Block {
        &self.blocks[bidx]
    }

    pub fn blocks(&self) -> impl Iterator<Item = (BlockIdx, &Block)> {
        self.blocks.iter_enumerated()
    }

    pub fn node(&self, nidx: NodeIdx) -> &Node {
        &self.nodes[nidx]
    }

    /// The value produced by `nidx`.
    ///
    /// # Panics
    ///
    /// If `nidx` does not produce a value.
    pub fn value(&self, nidx: NodeIdx) -> &Value {
        match &self.nodes[nidx].value {
            Some(x) => x,
            None => panic!("Node {} does not produce a value", self.nodes[nidx].id),
        }
    }

    pub(crate) fn value_mut(&mut self, nidx: NodeIdx) -> &mut Value {
        let id = self.nodes[nidx].id;
        match &mut self.nodes[nidx].value {
            Some(x) => x,
            None => panic!("Node {id} does not produce a value"),
        }
    }

    pub(crate) fn input(&self, site: InputSite) -> &Input {
        match site {
            InputSite::Node(nidx, i) => &self.nodes[nidx].inputs[i],
            InputSite::Control(bidx, i) => &self.blocks[bidx].control.inputs[i],
            InputSite::LiveThrough(bidx, i) => match &self.blocks[bidx].control.kind {
                ControlKind::JumpLoop { live_through, .. } => &live_through[i],
                _ => panic!("b{} does not end in a loop jump", bidx.index()),
            },
        }
    }

    pub(crate) fn input_mut(&mut self, site: InputSite) -> &mut Input {
        match site {
            InputSite::Node(nidx, i) => &mut self.nodes[nidx].inputs[i],
            InputSite::Control(bidx, i) => &mut self.blocks[bidx].control.inputs[i],
            InputSite::LiveThrough(bidx, i) => match &mut self.blocks[bidx].control.kind {
                ControlKind::JumpLoop { live_through, .. } => &mut live_through[i],
                _ => panic!("b{} does not end in a loop jump", bidx.index()),
            },
        }
    }

    pub(crate) fn temporaries_mut(&mut self, site: TempSite) -> (usize, &mut RegSet) {
        match site {
            TempSite::Node(nidx) => {
                let n = &mut self.nodes[nidx];
                (n.num_temporaries, &mut n.temporaries)
            }
            TempSite::Control(bidx) => {
                let c = &mut self.blocks[bidx].control;
                (c.num_temporaries, &mut c.temporaries)
            }
        }
    }

    /// The id of the first phi or non-gap-move node of `bidx`, or of its control node if it has
    /// neither.
    pub fn first_non_gap_move_id(&self, bidx: BlockIdx) -> NodeId {
        let b = &self.blocks[bidx];
        if let Some(phi) = b.phis.first() {
            return self.nodes[*phi].id;
        }
        b.nodes
            .iter()
            .map(|x| &self.nodes[*x])
            .find(|x| !x.is_gap_move())
            .map(|x| x.id)
            .unwrap_or(b.control.id)
    }

    /// Does the unconditional control node of `bidx` fall through to `target`, i.e. does
    /// `target` start directly after it?
    pub fn is_fallthrough(&self, bidx: BlockIdx, target: BlockIdx) -> bool {
        self.blocks[bidx].control.id.next() == self.blocks[target].first_id
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn regset() {
        let mut x = RegSet::blank();
        assert!(x.is_empty());
        x.set(Reg::new(3));
        x.set(Reg::new(0));
        x.set(Reg::new(63));
        assert!(x.is_set(Reg::new(0)) && x.is_set(Reg::new(3)) && x.is_set(Reg::new(63)));
        assert!(!x.is_set(Reg::new(1)));
        assert_eq!(x.len(), 3);
        assert_eq!(x.first(), Some(Reg::new(0)));
        assert_eq!(
            x.iter().collect::<Vec<_>>(),
            vec![Reg::new(0), Reg::new(3), Reg::new(63)]
        );
        assert_eq!(x.lowest(2), {
            let mut y = RegSet::from(Reg::new(0));
            y.set(Reg::new(3));
            y
        });
        x.unset(Reg::new(0));
        assert_eq!(x.first(), Some(Reg::new(3)));
        assert_eq!(x.to_string(), "{r3, r63}");
        assert_eq!(RegSet::with_first(3).len(), 3);
        assert_eq!(RegSet::with_first(MAX_REGS).len(), MAX_REGS);
        assert_eq!(RegSet::with_first(0).first(), None);
    }

    #[test]
    fn value_allocation() {
        let mut v = Value::new(OperandPolicy::RegisterOrSlot);
        assert!(v.is_dead());
        v.spill = Some(Operand::Stack(2));
        assert_eq!(v.allocation(), Operand::Stack(2));
        v.regs.set(Reg::new(4));
        v.regs.set(Reg::new(1));
        assert_eq!(v.allocation(), Operand::Reg(Reg::new(1)));
    }

    #[test]
    #[should_panic]
    fn value_allocation_nowhere() {
        Value::new(OperandPolicy::RegisterOrSlot).allocation();
    }
}
