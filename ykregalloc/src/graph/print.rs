//! Human readable output for graphs, used by the allocator's trace and by tests.

use super::{BlockIdx, ControlKind, Graph, Input, NodeIdx, NodeKind, RegSet};
use crate::regalloc::{MergeState, RegisterState};
use std::fmt;

impl Graph {
    fn input_to_string(&self, input: &Input) -> String {
        let id = self.nodes[input.node].id;
        match input.allocated {
            Some(op) => format!("v{id}:{op}"),
            None => format!("v{id}"),
        }
    }

    fn inputs_to_string(&self, inputs: &[Input]) -> String {
        inputs
            .iter()
            .map(|x| self.input_to_string(x))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn temps_to_string(temps: RegSet) -> String {
        if temps.is_empty() {
            String::new()
        } else {
            format!(" temps {temps}")
        }
    }

    pub fn node_to_string(&self, nidx: NodeIdx) -> String {
        let node = &self.nodes[nidx];
        let id = node.id;
        let inputs = self.inputs_to_string(&node.inputs);
        let temps = Self::temps_to_string(node.temporaries);
        let result = match node.value.as_ref().and_then(|x| x.result) {
            Some(op) => format!(" -> {op}"),
            None => String::new(),
        };
        match &node.kind {
            NodeKind::GapMove { from, to } => format!("gap move {to} <- {from}"),
            NodeKind::Phi => format!("v{id} = phi({inputs}){result}"),
            NodeKind::Op(name) => {
                if node.value.is_some() {
                    format!("v{id} = {name}({inputs}){result}{temps}")
                } else {
                    format!("{id}: {name}({inputs}){temps}")
                }
            }
        }
    }

    pub fn control_to_string(&self, bidx: BlockIdx) -> String {
        let c = &self.blocks[bidx].control;
        let inputs = self.inputs_to_string(&c.inputs);
        let temps = Self::temps_to_string(c.temporaries);
        let id = c.id;
        match &c.kind {
            ControlKind::Jump { target } => {
                format!("{id}: jump({inputs}) b{}{temps}", target.index())
            }
            ControlKind::JumpLoop {
                target,
                live_through,
            } => {
                let live = if live_through.is_empty() {
                    String::new()
                } else {
                    format!(" live [{}]", self.inputs_to_string(live_through))
                };
                format!("{id}: jump-loop({inputs}) b{}{live}{temps}", target.index())
            }
            ControlKind::Branch { if_true, if_false } => format!(
                "{id}: branch({inputs}) b{} b{}{temps}",
                if_true.index(),
                if_false.index()
            ),
            ControlKind::Return => format!("{id}: return({inputs}){temps}"),
        }
    }

    /// Render a merge state as e.g. `r0: v3, r1: merge v4 [r1, s0]`.
    pub fn merge_state_to_string(&self, state: &MergeState) -> String {
        if !state.is_initialized() {
            return "uninitialized".to_owned();
        }
        let regs = state
            .registers()
            .iter()
            .enumerate()
            .filter_map(|(i, rs)| match rs {
                RegisterState::Uninitialized | RegisterState::Empty => None,
                RegisterState::Single(n) => Some(format!("r{i}: v{}", self.nodes[*n].id)),
                RegisterState::Merge(m) => {
                    let ops = m
                        .operands
                        .iter()
                        .map(|x| x.to_string())
                        .collect::<Vec<_>>();
                    Some(format!(
                        "r{i}: merge v{} [{}]",
                        self.nodes[m.node].id,
                        ops.join(", ")
                    ))
                }
            })
            .collect::<Vec<_>>();
        if regs.is_empty() {
            "empty".to_owned()
        } else {
            regs.join(", ")
        }
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (bidx, b) in self.blocks.iter_enumerated() {
            write!(f, "b{}:", bidx.index())?;
            if !b.predecessors.is_empty() {
                let preds = b
                    .predecessors
                    .iter()
                    .map(|x| format!("b{}", x.index()))
                    .collect::<Vec<_>>();
                write!(f, " <- {}", preds.join(", "))?;
            }
            if b.is_loop_header {
                write!(f, " (loop header)")?;
            }
            if b.is_empty_block {
                write!(f, " (empty)")?;
            }
            writeln!(f)?;
            if let Some(state) = &b.state {
                writeln!(f, "  state: {}", self.merge_state_to_string(state))?;
            }
            for nidx in b.phis.iter().chain(b.nodes.iter()) {
                writeln!(f, "  {}", self.node_to_string(*nidx))?;
            }
            writeln!(f, "  {}", self.control_to_string(bidx))?;
        }
        Ok(())
    }
}
