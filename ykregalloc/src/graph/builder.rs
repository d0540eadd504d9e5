//! Build a [Graph].
//!
//! Blocks are created in layout order. Nodes are appended to blocks in program order and each
//! block is finished with a [Term]. [GraphBuilder::build] then validates the graph, numbers it,
//! and computes the use information the allocator needs.

use super::{
    Block, BlockIdx, ControlKind, ControlNode, Graph, Input, Node, NodeId, NodeIdx, NodeKind,
    OpProperties, OperandPolicy, RegSet, Value, MAX_REGS,
};
use crate::{errors::GraphError, liveness, regalloc::MergeState};
use index_vec::IndexVec;
use smallvec::SmallVec;

/// A description of a (non-phi) node to be added to a block.
#[derive(Clone, Debug)]
pub struct NodeSpec {
    name: String,
    inputs: Vec<(NodeIdx, OperandPolicy)>,
    result: Option<OperandPolicy>,
    props: OpProperties,
    temporaries: usize,
}

impl NodeSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            inputs: Vec::new(),
            result: None,
            props: OpProperties::default(),
            temporaries: 0,
        }
    }

    pub fn input(mut self, node: NodeIdx, policy: OperandPolicy) -> Self {
        self.inputs.push((node, policy));
        self
    }

    /// This node produces a value which must be placed according to `policy`.
    pub fn result(mut self, policy: OperandPolicy) -> Self {
        self.result = Some(policy);
        self
    }

    pub fn call(mut self) -> Self {
        self.props.is_call = true;
        self
    }

    pub fn deopt(mut self) -> Self {
        self.props.can_deopt = true;
        self
    }

    pub fn temporaries(mut self, n: usize) -> Self {
        self.temporaries = n;
        self
    }
}

#[derive(Clone, Debug)]
enum TermKind {
    Jump(BlockIdx),
    JumpLoop(BlockIdx),
    Branch(BlockIdx, BlockIdx),
    Return,
}

/// A description of a block's control node.
#[derive(Clone, Debug)]
pub struct Term {
    kind: TermKind,
    inputs: Vec<(NodeIdx, OperandPolicy)>,
    props: OpProperties,
    temporaries: usize,
}

impl Term {
    fn new(kind: TermKind) -> Self {
        Self {
            kind,
            inputs: Vec::new(),
            props: OpProperties::default(),
            temporaries: 0,
        }
    }

    pub fn jump(target: BlockIdx) -> Self {
        Self::new(TermKind::Jump(target))
    }

    pub fn jump_loop(target: BlockIdx) -> Self {
        Self::new(TermKind::JumpLoop(target))
    }

    pub fn branch(if_true: BlockIdx, if_false: BlockIdx) -> Self {
        Self::new(TermKind::Branch(if_true, if_false))
    }

    pub fn ret() -> Self {
        Self::new(TermKind::Return)
    }

    pub fn input(mut self, node: NodeIdx, policy: OperandPolicy) -> Self {
        self.inputs.push((node, policy));
        self
    }

    pub fn call(mut self) -> Self {
        self.props.is_call = true;
        self
    }

    pub fn deopt(mut self) -> Self {
        self.props.can_deopt = true;
        self
    }

    pub fn temporaries(mut self, n: usize) -> Self {
        self.temporaries = n;
        self
    }
}

#[derive(Debug, Default)]
struct PartialBlock {
    phis: Vec<NodeIdx>,
    nodes: Vec<NodeIdx>,
    term: Option<Term>,
    is_empty_block: bool,
}

#[derive(Debug)]
pub struct GraphBuilder {
    num_regs: usize,
    blocks: IndexVec<BlockIdx, PartialBlock>,
    nodes: IndexVec<NodeIdx, Node>,
}

impl GraphBuilder {
    /// Start building a graph whose values will be allocated to registers `0..num_regs`.
    pub fn new(num_regs: usize) -> Self {
        Self {
            num_regs,
            blocks: IndexVec::new(),
            nodes: IndexVec::new(),
        }
    }

    /// Append a new block to the layout.
    pub fn block(&mut self) -> BlockIdx {
        self.blocks.push(PartialBlock::default())
    }

    /// Append a new empty block: an edge-splitting block which must contain nothing but a jump.
    pub fn empty_block(&mut self) -> BlockIdx {
        self.blocks.push(PartialBlock {
            is_empty_block: true,
            ..Default::default()
        })
    }

    fn push_node(
        &mut self,
        kind: NodeKind,
        inputs: SmallVec<[Input; 2]>,
        result: Option<OperandPolicy>,
        props: OpProperties,
        num_temporaries: usize,
    ) -> NodeIdx {
        self.nodes.push(Node {
            id: NodeId::INVALID,
            kind,
            inputs,
            props,
            num_temporaries,
            temporaries: RegSet::blank(),
            value: result.map(Value::new),
        })
    }

    /// Append the node described by `spec` to `bidx`.
    pub fn node(&mut self, bidx: BlockIdx, spec: NodeSpec) -> NodeIdx {
        let inputs = spec
            .inputs
            .iter()
            .map(|(n, p)| Input::new(*n, *p))
            .collect();
        let nidx = self.push_node(
            NodeKind::Op(spec.name),
            inputs,
            spec.result,
            spec.props,
            spec.temporaries,
        );
        self.blocks[bidx].nodes.push(nidx);
        nidx
    }

    /// Append a parameter to `bidx`: a value which lives in the incoming frame slot `slot`.
    pub fn param(&mut self, bidx: BlockIdx, slot: i32) -> NodeIdx {
        self.node(
            bidx,
            NodeSpec::new("param").result(OperandPolicy::FixedSlot(slot)),
        )
    }

    /// Add a phi to `bidx`. `inputs` are given in the order of the block's predecessors; more can
    /// be added later with [GraphBuilder::add_phi_input].
    pub fn phi(&mut self, bidx: BlockIdx, inputs: &[NodeIdx]) -> NodeIdx {
        let inputs = inputs
            .iter()
            .map(|x| Input::new(*x, OperandPolicy::RegisterOrSlot))
            .collect();
        let nidx = self.push_node(
            NodeKind::Phi,
            inputs,
            Some(OperandPolicy::RegisterOrSlot),
            OpProperties::default(),
            0,
        );
        self.blocks[bidx].phis.push(nidx);
        nidx
    }

    pub fn add_phi_input(&mut self, phi: NodeIdx, input: NodeIdx) {
        assert_eq!(self.nodes[phi].kind, NodeKind::Phi);
        self.nodes[phi]
            .inputs
            .push(Input::new(input, OperandPolicy::RegisterOrSlot));
    }

    /// Finish `bidx` with the control node described by `term`.
    ///
    /// # Panics
    ///
    /// If `bidx` has already been terminated.
    pub fn terminate(&mut self, bidx: BlockIdx, term: Term) {
        let b = &mut self.blocks[bidx];
        assert!(b.term.is_none(), "b{} terminated twice", bidx.index());
        b.term = Some(term);
    }

    pub fn jump(&mut self, bidx: BlockIdx, target: BlockIdx) {
        self.terminate(bidx, Term::jump(target));
    }

    pub fn jump_loop(&mut self, bidx: BlockIdx, target: BlockIdx) {
        self.terminate(bidx, Term::jump_loop(target));
    }

    pub fn branch(&mut self, bidx: BlockIdx, if_true: BlockIdx, if_false: BlockIdx) {
        self.terminate(bidx, Term::branch(if_true, if_false));
    }

    pub fn ret(&mut self, bidx: BlockIdx) {
        self.terminate(bidx, Term::ret());
    }

    /// Validate and finish the graph.
    pub fn build(self) -> Result<Graph, GraphError> {
        if self.num_regs == 0 || self.num_regs > MAX_REGS {
            return Err(GraphError::RegisterCount {
                num_regs: self.num_regs,
                max: MAX_REGS,
            });
        }
        if self.blocks.is_empty() {
            return Err(GraphError::NoBlocks);
        }

        let nblocks = self.blocks.len();
        let mut blocks = IndexVec::with_capacity(nblocks);
        for (bidx, pb) in self.blocks.into_iter_enumerated() {
            let Some(term) = pb.term else {
                return Err(GraphError::Unterminated(bidx.index()));
            };
            let kind = match term.kind {
                TermKind::Jump(target) => ControlKind::Jump { target },
                TermKind::JumpLoop(target) => ControlKind::JumpLoop {
                    target,
                    live_through: Vec::new(),
                },
                TermKind::Branch(if_true, if_false) => ControlKind::Branch { if_true, if_false },
                TermKind::Return => ControlKind::Return,
            };
            for target in kind.successors() {
                if target.index() >= nblocks {
                    return Err(GraphError::UnknownBlock {
                        block: bidx.index(),
                        target: target.index(),
                    });
                }
            }
            blocks.push(Block {
                phis: pb.phis,
                nodes: pb.nodes,
                control: ControlNode {
                    id: NodeId::INVALID,
                    kind,
                    inputs: term
                        .inputs
                        .iter()
                        .map(|(n, p)| Input::new(*n, *p))
                        .collect(),
                    props: term.props,
                    num_temporaries: term.temporaries,
                    temporaries: RegSet::blank(),
                },
                first_id: NodeId::INVALID,
                predecessors: Vec::new(),
                predecessor_id: 0,
                is_empty_block: pb.is_empty_block,
                is_loop_header: false,
                state: None,
            });
        }

        let mut g = Graph {
            num_regs: self.num_regs,
            blocks,
            nodes: self.nodes,
            stack_slots: 0,
            allocated: false,
        };
        link_predecessors(&mut g);
        liveness::number(&mut g);
        g.check_well_formed()?;
        create_merge_states(&mut g);
        liveness::analyse(&mut g);
        Ok(g)
    }
}

/// Fill in predecessor lists, predecessor ids, and loop headers.
fn link_predecessors(g: &mut Graph) {
    for bidx in g.blocks.indices() {
        for target in g.blocks[bidx].control.kind.successors() {
            g.blocks[target].predecessors.push(bidx);
        }
        if let ControlKind::JumpLoop { target, .. } = g.blocks[bidx].control.kind {
            g.blocks[target].is_loop_header = true;
        }
    }
    for bidx in g.blocks.indices() {
        if let Some(target) = g.blocks[bidx].control.kind.unconditional_target() {
            // Every block is in its target's predecessor list, so this can't fail.
            let pred_id = g.blocks[target]
                .predecessors
                .iter()
                .position(|x| *x == bidx)
                .unwrap();
            g.blocks[bidx].predecessor_id = pred_id;
        }
    }
}

/// Give every block that the allocator must merge register contents into a [MergeState]. That
/// is: the targets of unconditional control nodes, non-fallthrough conditional targets, loop
/// headers, and blocks with several predecessors. Empty blocks never need one.
fn create_merge_states(g: &mut Graph) {
    for bidx in g.blocks.indices() {
        let b = &g.blocks[bidx];
        if b.is_empty_block {
            continue;
        }
        let needs_state = b.is_loop_header
            || b.predecessors.len() > 1
            || b.predecessors
                .iter()
                .any(|pred| match g.blocks[*pred].control.kind {
                    ControlKind::Jump { .. } | ControlKind::JumpLoop { .. } => true,
                    ControlKind::Branch { .. } => {
                        g.blocks[*pred].control.id.next() != b.first_id
                    }
                    ControlKind::Return => unreachable!(),
                });
        if needs_state {
            let state = MergeState::new(b.predecessors.len(), g.num_regs);
            g.blocks[bidx].state = Some(state);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::graph::{Operand, Reg};

    #[test]
    fn numbering() {
        let mut gb = GraphBuilder::new(4);
        let b0 = gb.block();
        let b1 = gb.block();
        let b2 = gb.block();
        let p = gb.param(b0, -1);
        let x = gb.node(
            b0,
            NodeSpec::new("x")
                .input(p, OperandPolicy::RegisterOrSlot)
                .result(OperandPolicy::MustHaveRegister),
        );
        gb.jump(b0, b1);
        gb.jump(b1, b2);
        let phi = gb.phi(b2, &[x]);
        gb.terminate(b2, Term::ret().input(phi, OperandPolicy::RegisterOrSlot));
        let g = gb.build().unwrap();

        assert_eq!(g.node(p).id(), NodeId(1));
        assert_eq!(g.node(x).id(), NodeId(2));
        assert_eq!(g.block(b0).control().id(), NodeId(3));
        assert_eq!(g.block(b0).first_id(), NodeId(1));
        assert_eq!(g.block(b1).first_id(), NodeId(4));
        assert_eq!(g.block(b1).control().id(), NodeId(4));
        assert_eq!(g.node(phi).id(), NodeId(5));
        assert_eq!(g.block(b2).first_id(), NodeId(5));
        assert_eq!(g.block(b2).control().id(), NodeId(6));
        assert!(g.is_fallthrough(b0, b1));
        assert_eq!(g.first_non_gap_move_id(b2), NodeId(5));
        assert_eq!(g.first_non_gap_move_id(b1), NodeId(4));
        assert_eq!(
            g.value(p).policy(),
            OperandPolicy::FixedSlot(-1)
        );
        assert!(g.value(p).result().is_none());
        assert_ne!(Operand::Reg(Reg::new(0)), Operand::Stack(0));
    }

    #[test]
    fn predecessors_and_states() {
        // b0: branch b1 b3
        // b1: branch b2 b4(empty)
        // b2: jump b5
        // b3: jump b5
        // b4: jump b5
        // b5: loop header, jump-loop from b6 (via b5 -> b6 fallthrough)
        // b6: branch b7 b8
        // b7: jump-loop b5
        // b8: return
        let mut gb = GraphBuilder::new(2);
        let b0 = gb.block();
        let b1 = gb.block();
        let b2 = gb.block();
        let b3 = gb.block();
        let b4 = gb.empty_block();
        let b5 = gb.block();
        let b6 = gb.block();
        let b7 = gb.block();
        let b8 = gb.block();
        gb.branch(b0, b1, b3);
        gb.branch(b1, b2, b4);
        gb.jump(b2, b5);
        gb.jump(b3, b5);
        gb.jump(b4, b5);
        gb.jump(b5, b6);
        gb.branch(b6, b7, b8);
        gb.jump_loop(b7, b5);
        gb.ret(b8);
        let g = gb.build().unwrap();

        assert_eq!(g.block(b5).predecessors(), &[b2, b3, b4, b7]);
        assert_eq!(g.block(b2).predecessor_id(), 0);
        assert_eq!(g.block(b3).predecessor_id(), 1);
        assert_eq!(g.block(b4).predecessor_id(), 2);
        assert_eq!(g.block(b7).predecessor_id(), 3);
        assert!(g.block(b5).is_loop_header());
        assert!(g.block(b4).is_empty_block());

        let has_state = g
            .blocks()
            .filter(|(_, b)| b.state().is_some())
            .map(|(bidx, _)| bidx)
            .collect::<Vec<_>>();
        // b1, b2 and b7 are fallthrough conditional targets; b4 is an empty block.
        assert_eq!(has_state, vec![b3, b5, b6, b8]);
        assert_eq!(g.block(b5).state().unwrap().predecessor_count(), 4);
    }

    #[test]
    fn bad_graphs() {
        let mut gb = GraphBuilder::new(0);
        let b0 = gb.block();
        gb.ret(b0);
        assert_eq!(
            gb.build().unwrap_err(),
            GraphError::RegisterCount {
                num_regs: 0,
                max: MAX_REGS
            }
        );

        assert_eq!(GraphBuilder::new(2).build().unwrap_err(), GraphError::NoBlocks);

        let mut gb = GraphBuilder::new(2);
        gb.block();
        assert_eq!(gb.build().unwrap_err(), GraphError::Unterminated(0));

        let mut gb = GraphBuilder::new(2);
        let b0 = gb.block();
        gb.jump(b0, BlockIdx::new(7));
        assert_eq!(
            gb.build().unwrap_err(),
            GraphError::UnknownBlock {
                block: 0,
                target: 7
            }
        );
    }
}
