//! Agreeing on register contents where control flow joins.
//!
//! A block with a [MergeState] records, for each register, which value the block expects to find
//! there on entry. The first predecessor to reach the block fixes the expected contents. Later
//! predecessors which disagree turn a register into a [RegisterMerge], which records where each
//! predecessor keeps the value so that moves can be inserted on the incoming edges.

use super::RegAlloc;
use crate::graph::{BlockIdx, Graph, NodeIdx, Operand, Reg, RegSet};
use smallvec::SmallVec;

/// What a block expects a register to hold on entry.
#[derive(Clone, Debug, PartialEq)]
pub enum RegisterState {
    /// No predecessor has reached the block yet.
    Uninitialized,
    Empty,
    /// Every predecessor so far has the value in this register.
    Single(NodeIdx),
    Merge(RegisterMerge),
}

impl RegisterState {
    /// The value expected in this register, if any.
    pub fn node(&self) -> Option<NodeIdx> {
        match self {
            RegisterState::Uninitialized | RegisterState::Empty => None,
            RegisterState::Single(n) => Some(*n),
            RegisterState::Merge(m) => Some(m.node),
        }
    }
}

/// A register whose value is in different places in different predecessors.
#[derive(Clone, Debug, PartialEq)]
pub struct RegisterMerge {
    pub(crate) node: NodeIdx,
    /// For each predecessor, where it keeps `node`.
    pub(crate) operands: Vec<Operand>,
}

impl RegisterMerge {
    pub fn node(&self) -> NodeIdx {
        self.node
    }

    pub fn operand(&self, pred: usize) -> Operand {
        self.operands[pred]
    }

    pub fn operands(&self) -> &[Operand] {
        &self.operands
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MergeState {
    predecessor_count: usize,
    /// One entry per register.
    registers: Vec<RegisterState>,
}

impl MergeState {
    pub(crate) fn new(predecessor_count: usize, num_regs: usize) -> Self {
        Self {
            predecessor_count,
            registers: vec![RegisterState::Uninitialized; num_regs],
        }
    }

    pub fn predecessor_count(&self) -> usize {
        self.predecessor_count
    }

    /// Has any predecessor been merged in yet?
    pub fn is_initialized(&self) -> bool {
        !matches!(self.registers.first(), Some(RegisterState::Uninitialized))
    }

    pub fn registers(&self) -> &[RegisterState] {
        &self.registers
    }

    pub fn register(&self, reg: Reg) -> &RegisterState {
        &self.registers[reg.index()]
    }
}

/// Is `v` live on entry to `target` when reached from the control node of `source`?
///
/// On forward edges a value is live if its live range reaches `target`. On back edges only values
/// defined before the loop header can be live, since everything else is redefined by the next
/// iteration.
pub(crate) fn is_live_at_target(g: &Graph, v: NodeIdx, source: BlockIdx, target: BlockIdx) -> bool {
    let value = g.value(v);
    if value.is_dead() {
        return false;
    }
    if g.blocks[target].control.id <= g.blocks[source].control.id {
        return g.nodes[v].id < g.first_non_gap_move_id(target);
    }
    value.live_range_end >= g.blocks[target].first_id
}

/// The parts of the register allocator which deal with block boundaries.
impl RegAlloc<'_> {
    /// Make the register file match the merge state of `bidx`.
    pub(super) fn restore_merge_state(&mut self, bidx: BlockIdx) {
        for (_, v) in self.regs.occupied() {
            self.g.value_mut(v).regs = RegSet::blank();
        }
        self.regs.clear_all();
        let nodes = match &self.g.blocks[bidx].state {
            Some(state) => state
                .registers
                .iter()
                .map(|x| x.node())
                .collect::<SmallVec<[_; 16]>>(),
            None => panic!("b{} has no merge state", bidx.index()),
        };
        for (i, v) in nodes.into_iter().enumerate() {
            let reg = Reg::new(i);
            match v {
                Some(v) => {
                    debug_assert!(!self.g.value(v).is_dead());
                    self.regs.set(reg, v, self.g.value_mut(v));
                }
                None => {
                    self.regs.release(reg);
                }
            }
        }
    }

    /// Fill in the uninitialized `state` of `target` from the current register file.
    fn init_state(&self, source: BlockIdx, target: BlockIdx, state: &mut MergeState) {
        debug_assert!(!state.is_initialized());
        for (i, rs) in state.registers.iter_mut().enumerate() {
            *rs = match self.regs.get(Reg::new(i)) {
                Some(v) if is_live_at_target(self.g, v, source, target) => RegisterState::Single(v),
                _ => RegisterState::Empty,
            };
        }
    }

    /// Initialize the merge state of `target`, which has a single (conditional) predecessor.
    fn init_branch_target(&mut self, source: BlockIdx, target: BlockIdx) {
        let Some(mut state) = self.g.blocks[target].state.take() else {
            panic!("b{} has no merge state", target.index());
        };
        self.init_state(source, target, &mut state);
        self.g.blocks[target].state = Some(state);
    }

    /// Merge the current register file into the state of `target`, reached from `source` which is
    /// predecessor number `pred` of `target`.
    pub(super) fn merge_register_values(&mut self, source: BlockIdx, target: BlockIdx, pred: usize) {
        let Some(mut state) = self.g.blocks[target].state.take() else {
            panic!("b{} has no merge state", target.index());
        };
        if state.is_initialized() {
            for i in 0..state.registers.len() {
                self.merge_register(source, target, pred, Reg::new(i), &mut state);
            }
        } else {
            self.init_state(source, target, &mut state);
        }
        self.trace(|g, _| {
            format!(
                "merge into b{}: {}",
                target.index(),
                g.merge_state_to_string(&state)
            )
        });
        self.g.blocks[target].state = Some(state);
    }

    fn merge_register(
        &self,
        source: BlockIdx,
        target: BlockIdx,
        pred: usize,
        reg: Reg,
        state: &mut MergeState,
    ) {
        let g: &Graph = self.g;
        let register_info = Operand::Reg(reg);
        let incoming = self
            .regs
            .get(reg)
            .filter(|v| is_live_at_target(g, *v, source, target));
        debug_assert_ne!(state.registers[reg.index()], RegisterState::Uninitialized);
        let node = state.registers[reg.index()]
            .node()
            .filter(|v| is_live_at_target(g, *v, source, target));

        if incoming == node {
            // Same value in the same register: nothing to do unless we already disagreed with an
            // earlier predecessor.
            if let RegisterState::Merge(m) = &mut state.registers[reg.index()] {
                m.operands[pred] = register_info;
            }
            return;
        }

        if let RegisterState::Merge(m) = &mut state.registers[reg.index()] {
            m.operands[pred] = match node {
                Some(n) => g.value(n).allocation(),
                None => register_info,
            };
            if let Some(inc) = incoming {
                if !g.value(inc).is_spilled() {
                    self.ensure_in_register(state, inc);
                }
            }
            return;
        }

        let merge = match (node, incoming) {
            (Some(n), _) => {
                // Earlier predecessors had `n` in this register.
                let mut operands = vec![register_info; state.predecessor_count];
                operands[pred] = g.value(n).allocation();
                RegisterMerge { node: n, operands }
            }
            (None, Some(inc)) => {
                let Some(spill) = g.value(inc).spill else {
                    // The value must then be in another register of the target.
                    self.ensure_in_register(state, inc);
                    return;
                };
                // Earlier predecessors can only have kept `inc` in its spill slot.
                let mut operands = vec![spill; state.predecessor_count];
                operands[pred] = register_info;
                RegisterMerge {
                    node: inc,
                    operands,
                }
            }
            (None, None) => unreachable!(),
        };
        state.registers[reg.index()] = RegisterState::Merge(merge);
    }

    /// A live incoming value that isn't spilled must be expected in some register of the target.
    fn ensure_in_register(&self, state: &MergeState, v: NodeIdx) {
        debug_assert!(
            state.registers.iter().any(|x| x.node() == Some(v)),
            "v{} is live but not in a register of the merge state",
            self.g.node(v).id()
        );
    }

    /// Record where each phi of `target` finds its input from `pred`.
    pub(super) fn inject_phi_inputs(&mut self, pred: BlockIdx, target: BlockIdx) {
        let pred_id = self.g.blocks[pred].predecessor_id;
        for i in 0..self.g.blocks[target].phis.len() {
            let phi = self.g.blocks[target].phis[i];
            let v = self.g.nodes[phi].inputs[pred_id].node;
            let loc = self.g.value(v).allocation();
            self.g.nodes[phi].inputs[pred_id].allocated = Some(loc);
            self.trace(|g, _| {
                format!(
                    "phi input: v{} <- v{}:{loc}",
                    g.node(phi).id(),
                    g.node(v).id()
                )
            });
        }
    }

    /// Prepare the conditional edge from `source` to `target`.
    pub(super) fn init_conditional_branch(&mut self, source: BlockIdx, target: BlockIdx) {
        let tb = &self.g.blocks[target];
        if tb.is_empty_block {
            // Merge straight into the empty block's own target. The register file is only
            // correct for this edge now, so phi inputs are recorded now too.
            let Some(real) = tb.control.kind.unconditional_target() else {
                unreachable!();
            };
            let pred = tb.predecessor_id;
            self.inject_phi_inputs(target, real);
            self.merge_register_values(source, real, pred);
        } else if tb.state.is_some() {
            self.init_branch_target(source, target);
        } else {
            // The fallthrough target inherits the register file: drop what's dead there.
            debug_assert!(self.g.is_fallthrough(source, target));
            for (_, v) in self.regs.occupied() {
                if !is_live_at_target(self.g, v, source, target) {
                    self.free_registers(v);
                }
            }
        }
    }
}
