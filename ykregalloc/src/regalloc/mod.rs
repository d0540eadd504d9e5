//! A single pass, forward register allocator.
//!
//! The allocator walks a graph's blocks in layout order and each block's nodes in order, keeping
//! track of which value is in which register. No global interference analysis is performed:
//! decisions are made greedily from the information computed when the graph was built, most
//! importantly each value's next use.
//!
//!
//! ## Nodes
//!
//! For each node the allocator places the inputs according to their [OperandPolicy]s, hands out
//! temporaries, records that each input has been used (freeing values which have thus died),
//! spills values around calls and deopts, and finally places the node's result. Whenever a value
//! has to change location, a gap move is inserted into the block before the node.
//!
//! When a register is needed and none is free, the value whose next use is furthest away is
//! evicted, and spilled if that register was its only location. Once a value is spilled it stays
//! spilled: its spill slot is only reclaimed when the value dies.
//!
//!
//! ## Block boundaries
//!
//! Blocks which can be reached other than by falling through from the previous block have a
//! [MergeState] describing what each register holds on entry. The first predecessor to be
//! allocated fixes the state; later predecessors which keep a value somewhere else turn that
//! register into a [RegisterMerge], which records the location of the value in every predecessor
//! so that the code generator can emit moves on the incoming edges. Loop headers are allocated
//! before their back edge, so the back edge's locations are recorded in the same way.
//!
//! Each phi is placed, in order of preference: in a register that one of its inputs is in, in a
//! free register, or in a spill slot.

use crate::{
    errors::RegAllocError,
    graph::{
        BlockIdx, ControlKind, Graph, InputSite, Node, NodeIdx, Operand, OperandPolicy, Reg,
        RegSet, TempSite,
    },
    holes::PostDomHoles,
    log::{Log, TraceSink, Verbosity},
};
use smallvec::SmallVec;

mod merge;
mod regfile;
mod spill;

pub use merge::{MergeState, RegisterMerge, RegisterState};
use regfile::RegFile;
use spill::SpillSlots;

/// Allocate registers for `g`, writing a trace of the allocator's decisions to the log configured
/// by the `YKRA_LOG` environment variable.
pub fn allocate_registers(g: &mut Graph) -> Result<(), RegAllocError> {
    let mut log = Log::from_env()?;
    let r = if log.level() >= Verbosity::RegAlloc {
        allocate_registers_with(g, Some(&mut log))
    } else {
        allocate_registers_with(g, None)
    };
    if let Err(e) = &r {
        log.log(Verbosity::Error, &e.to_string());
    }
    r
}

/// Allocate registers for `g`, writing a trace of the allocator's decisions to `sink` (if it is
/// not `None`).
pub fn allocate_registers_with<'a>(
    g: &'a mut Graph,
    sink: Option<&'a mut dyn TraceSink>,
) -> Result<(), RegAllocError> {
    if g.allocated {
        return Err(RegAllocError::AlreadyAllocated);
    }
    RegAlloc::new(g, sink).run();
    Ok(())
}

pub(crate) struct RegAlloc<'a> {
    g: &'a mut Graph,
    holes: PostDomHoles,
    regs: RegFile,
    slots: SpillSlots,
    /// Gap moves `(from, to)` to be inserted before the node currently being allocated.
    moves: Vec<(Operand, Operand)>,
    /// The inputs of the current node placed so far.
    assigned: SmallVec<[InputSite; 4]>,
    /// Registers holding inputs of the current node which must be in a register. These are never
    /// evicted until the node's inputs and temporaries have been placed.
    blocked: RegSet,
    sink: Option<&'a mut dyn TraceSink>,
}

impl<'a> RegAlloc<'a> {
    fn new(g: &'a mut Graph, sink: Option<&'a mut dyn TraceSink>) -> Self {
        let holes = PostDomHoles::new(g);
        let regs = RegFile::new(g.num_regs);
        Self {
            g,
            holes,
            regs,
            slots: SpillSlots::default(),
            moves: Vec::new(),
            assigned: SmallVec::new(),
            blocked: RegSet::blank(),
            sink,
        }
    }

    fn run(mut self) {
        for bidx in self.g.blocks.indices() {
            self.allocate_block(bidx);
        }
        self.g.stack_slots = self.slots.top();
        self.g.allocated = true;
    }

    /// Write the line produced by `f` to the trace, if there is one.
    fn trace<F>(&mut self, f: F)
    where
        F: FnOnce(&Graph, &RegFile) -> String,
    {
        if let Some(sink) = self.sink.as_mut() {
            sink.trace(&f(self.g, &self.regs));
        }
    }

    fn add_move(&mut self, from: Operand, to: Operand) {
        self.moves.push((from, to));
    }

    /// Turn the pending moves into gap move nodes appended to `out`.
    fn flush_moves(&mut self, out: &mut Vec<NodeIdx>) {
        for (from, to) in self.moves.drain(..) {
            out.push(self.g.nodes.push(Node::gap_move(from, to)));
        }
    }

    fn allocate_block(&mut self, bidx: BlockIdx) {
        if self.g.blocks[bidx].state.is_some() {
            self.restore_merge_state(bidx);
        }
        if self.sink.is_some() {
            self.trace(|_, _| format!("block b{}", bidx.index()));
            self.trace(|g, regs| regs.to_string(g));
            if let Some(holes) = self.holes.chain_to_string(self.g, bidx) {
                self.trace(|_, _| format!("[holes:{holes}]"));
            }
        }

        if !self.g.blocks[bidx].phis.is_empty() {
            self.allocate_phis(bidx);
        }

        let nodes = std::mem::take(&mut self.g.blocks[bidx].nodes);
        let mut out = Vec::with_capacity(nodes.len());
        for nidx in nodes {
            self.allocate_node(nidx);
            self.flush_moves(&mut out);
            out.push(nidx);
            self.trace(|g, _| g.node_to_string(nidx));
            self.trace(|g, regs| regs.to_string(g));
        }

        self.allocate_control(bidx);
        self.flush_moves(&mut out);
        self.g.blocks[bidx].nodes = out;
        self.trace(|g, _| g.control_to_string(bidx));
        self.trace(|g, regs| regs.to_string(g));
    }

    fn allocate_phis(&mut self, bidx: BlockIdx) {
        let nphis = self.g.blocks[bidx].phis.len();
        for i in 0..nphis {
            let phi = self.g.blocks[bidx].phis[i];
            self.try_allocate_to_input(phi);
        }
        for i in 0..nphis {
            let phi = self.g.blocks[bidx].phis[i];
            if self.g.value(phi).result.is_some() {
                continue;
            }
            if let Some(op) = self.try_allocate_reg(phi) {
                self.g.value_mut(phi).result = Some(op);
                self.trace(|g, _| format!("phi v{} (new reg) {op}", g.node(phi).id()));
            }
        }
        for i in 0..nphis {
            let phi = self.g.blocks[bidx].phis[i];
            if self.g.value(phi).result.is_none() {
                self.spill(phi);
                let value = self.g.value_mut(phi);
                value.result = value.spill;
                self.trace(|g, _| {
                    format!(
                        "phi v{} (stack) {}",
                        g.node(phi).id(),
                        g.value(phi).allocation()
                    )
                });
            }
            if !self.g.value(phi).has_valid_live_range() {
                self.release_value(phi);
            }
        }
        self.trace(|g, regs| regs.to_string(g));
    }

    /// Put `phi` in the register holding one of its (already allocated) inputs, if that register
    /// is free. The first such input wins.
    fn try_allocate_to_input(&mut self, phi: NodeIdx) {
        for i in 0..self.g.nodes[phi].inputs.len() {
            if let Some(Operand::Reg(reg)) = self.g.nodes[phi].inputs[i].allocated {
                if self.regs.get(reg).is_none() {
                    let op = self.force_allocate(reg, phi);
                    self.g.value_mut(phi).result = Some(op);
                    self.trace(|g, _| format!("phi v{} (reuse) {op}", g.node(phi).id()));
                    return;
                }
            }
        }
    }

    fn allocate_node(&mut self, nidx: NodeIdx) {
        let ninputs = self.g.nodes[nidx].inputs.len();
        self.assign_inputs((0..ninputs).map(|i| InputSite::Node(nidx, i)).collect());
        self.assign_temporaries(TempSite::Node(nidx));
        self.assigned.clear();
        self.blocked = RegSet::blank();
        for i in 0..ninputs {
            self.update_input_use(InputSite::Node(nidx, i));
        }

        let props = self.g.nodes[nidx].props;
        if props.is_call {
            self.spill_and_clear_registers();
        }
        if props.can_deopt {
            self.spill_registers();
        }
        if self.g.nodes[nidx].value.is_some() {
            self.allocate_node_result(nidx);
        }
        #[cfg(debug_assertions)]
        self.assert_consistent();
    }

    fn allocate_control(&mut self, bidx: BlockIdx) {
        let ninputs = self.g.blocks[bidx].control.inputs.len();
        self.assign_inputs((0..ninputs).map(|i| InputSite::Control(bidx, i)).collect());
        self.assign_temporaries(TempSite::Control(bidx));
        self.assigned.clear();
        self.blocked = RegSet::blank();
        for i in 0..ninputs {
            self.update_input_use(InputSite::Control(bidx, i));
        }

        let props = self.g.blocks[bidx].control.props;
        if props.is_call {
            self.spill_and_clear_registers();
        }

        let is_empty_block = self.g.blocks[bidx].is_empty_block;
        let pred = self.g.blocks[bidx].predecessor_id;
        let (target, nlive) = match &self.g.blocks[bidx].control.kind {
            ControlKind::Jump { target } => (Some(*target), 0),
            ControlKind::JumpLoop {
                target,
                live_through,
            } => (Some(*target), live_through.len()),
            ControlKind::Branch { .. } | ControlKind::Return => (None, 0),
        };
        if let Some(target) = target {
            // Phi inputs through an empty block were recorded at the conditional branch.
            if !is_empty_block {
                self.inject_phi_inputs(bidx, target);
            }
            for i in 0..self.g.blocks[target].phis.len() {
                let phi = self.g.blocks[target].phis[i];
                self.update_input_use(InputSite::Node(phi, pred));
            }
        }

        if props.can_deopt {
            self.spill_registers();
        }

        match self.g.blocks[bidx].control.kind {
            ControlKind::Jump { target } | ControlKind::JumpLoop { target, .. } => {
                if !is_empty_block {
                    self.merge_register_values(bidx, target, pred);
                }
                // Live-through values stay alive until the back edge has been merged.
                for i in 0..nlive {
                    self.update_input_use(InputSite::LiveThrough(bidx, i));
                }
            }
            ControlKind::Branch { if_true, if_false } => {
                // A fallthrough target takes over the register file, so it must come last.
                let tb = &self.g.blocks[if_true];
                if !tb.is_empty_block && tb.state.is_none() {
                    self.init_conditional_branch(bidx, if_false);
                    self.init_conditional_branch(bidx, if_true);
                } else {
                    self.init_conditional_branch(bidx, if_true);
                    self.init_conditional_branch(bidx, if_false);
                }
            }
            ControlKind::Return => (),
        }
        #[cfg(debug_assertions)]
        self.assert_consistent();
    }

    /// Place a node's inputs. Fixed register inputs go first, so that they cannot take a register
    /// from an input placed earlier.
    fn assign_inputs(&mut self, sites: SmallVec<[InputSite; 4]>) {
        let (fixed, others): (SmallVec<[_; 4]>, SmallVec<[_; 4]>) =
            sites.into_iter().partition(|x| {
                matches!(self.g.input(*x).policy, OperandPolicy::FixedRegister(_))
            });
        for site in fixed.into_iter().chain(others) {
            self.assign_input(site);
        }
    }

    /// Place the value used by `site` according to the input's policy.
    fn assign_input(&mut self, site: InputSite) {
        let input = self.g.input(site);
        let (v, policy) = (input.node, input.policy);
        let location = self.g.value(v).allocation();
        let allocated = match policy {
            OperandPolicy::RegisterOrSlot | OperandPolicy::RegisterOrSlotOrConstant => location,
            OperandPolicy::FixedRegister(reg) => self.force_allocate(reg, v),
            OperandPolicy::MustHaveRegister => {
                // Prefer a register another input of this node already holds `v` in.
                let held = self.g.value(v).regs.iter().find(|x| self.blocked.is_set(*x));
                match held {
                    Some(reg) => Operand::Reg(reg),
                    None if location.is_reg() => location,
                    None => self.allocate_reg(v),
                }
            }
            OperandPolicy::SameAsInput(_)
            | OperandPolicy::FixedSlot(_)
            | OperandPolicy::MustHaveSlot
            | OperandPolicy::None => panic!("Unsupported input policy {policy:?}"),
        };
        self.g.input_mut(site).allocated = Some(allocated);
        self.assigned.push(site);
        if let Operand::Reg(reg) = allocated {
            if matches!(
                policy,
                OperandPolicy::FixedRegister(_) | OperandPolicy::MustHaveRegister
            ) {
                self.blocked.set(reg);
            }
        }
        if location != allocated {
            self.trace(|_, _| format!("gap move: {allocated} <- {location}"));
            self.add_move(location, allocated);
        }
    }

    /// `v` has been moved out of `reg`: inputs of the current node which were placed there must
    /// follow it.
    pub(super) fn displaced(&mut self, v: NodeIdx, reg: Reg) {
        debug_assert!(!self.blocked.is_set(reg));
        for i in 0..self.assigned.len() {
            let site = self.assigned[i];
            let input = self.g.input(site);
            if input.node == v && input.allocated == Some(Operand::Reg(reg)) {
                let location = self.g.value(v).allocation();
                self.g.input_mut(site).allocated = Some(location);
            }
        }
    }

    /// Record that the use at `site` has happened. If it was the value's last use, the value
    /// dies: its registers and spill slot are freed.
    fn update_input_use(&mut self, site: InputSite) {
        let input = self.g.input(site);
        let (v, next_use_id) = (input.node, input.next_use_id);
        let value = self.g.value_mut(v);
        if value.is_dead() {
            return;
        }
        debug_assert!(!next_use_id.is_valid() || next_use_id >= value.next_use);
        value.next_use = next_use_id;
        if value.is_dead() {
            self.release_value(v);
        }
    }

    /// Free the registers and spill slot of `v`, which has no further uses.
    fn release_value(&mut self, v: NodeIdx) {
        self.free_registers(v);
        if let Some(Operand::Stack(slot)) = self.g.value(v).spill {
            if slot >= 0 {
                self.slots.free(slot);
            }
        }
    }

    fn allocate_node_result(&mut self, nidx: NodeIdx) {
        let policy = self.g.value(nidx).policy;
        let result = match policy {
            OperandPolicy::FixedSlot(slot) => {
                debug_assert!(slot < 0);
                let op = Operand::Stack(slot);
                let value = self.g.value_mut(nidx);
                value.result = Some(op);
                value.spill = Some(op);
                return;
            }
            OperandPolicy::FixedRegister(reg) => self.force_allocate(reg, nidx),
            OperandPolicy::MustHaveRegister => self.allocate_reg(nidx),
            OperandPolicy::SameAsInput(i) => {
                let Some(Operand::Reg(reg)) = self.g.nodes[nidx].inputs[i].allocated else {
                    panic!(
                        "Input {i} of v{} is not in a register",
                        self.g.nodes[nidx].id
                    );
                };
                self.force_allocate(reg, nidx)
            }
            OperandPolicy::RegisterOrSlot | OperandPolicy::RegisterOrSlotOrConstant => {
                match self.try_allocate_reg(nidx) {
                    Some(op) => op,
                    None => {
                        self.spill(nidx);
                        self.g.value(nidx).allocation()
                    }
                }
            }
            OperandPolicy::MustHaveSlot | OperandPolicy::None => {
                panic!("Unsupported result policy {policy:?}")
            }
        };
        self.g.value_mut(nidx).result = Some(result);
        if !self.g.value(nidx).has_valid_live_range() {
            self.release_value(nidx);
        }
    }
}
