//! Well-formedness checks for graphs. After [Graph::check_well_formed] succeeds, the allocator can
//! safely assume:
//!
//!   * Forward jumps and branches target later blocks; loop jumps target the same or an earlier
//!     block.
//!   * Every block other than the first has at least one predecessor.
//!   * Conditional targets have a single predecessor unless they are empty blocks, and empty
//!     blocks have no phis or nodes, end in a jump, and have a single conditional predecessor.
//!   * Each phi has one input per predecessor of its block.
//!   * Every input refers to a value defined before it is used (phi inputs: before the end of the
//!     corresponding predecessor).
//!   * Fixed registers are in range, same-as-input results refer to an existing input, fixed
//!     slots are negative.
//!   * No register is fixed for two different inputs of a node, and a node's fixed register
//!     inputs, must-have-register inputs, and temporaries together fit in the register file.

use super::{ControlKind, Graph, Input, NodeId, NodeIdx, NodeKind, OperandPolicy, Reg, RegSet};
use crate::errors::GraphError;
use smallvec::SmallVec;

impl Graph {
    pub(crate) fn check_well_formed(&self) -> Result<(), GraphError> {
        for (bidx, b) in self.blocks.iter_enumerated() {
            match &b.control.kind {
                ControlKind::Jump { target } => {
                    if *target <= bidx {
                        return Err(GraphError::BackwardJump {
                            block: bidx.index(),
                            target: target.index(),
                        });
                    }
                }
                ControlKind::JumpLoop { target, .. } => {
                    if *target > bidx {
                        return Err(GraphError::ForwardLoopJump {
                            block: bidx.index(),
                            target: target.index(),
                        });
                    }
                }
                ControlKind::Branch { if_true, if_false } => {
                    for target in [*if_true, *if_false] {
                        if target <= bidx {
                            return Err(GraphError::BackwardJump {
                                block: bidx.index(),
                                target: target.index(),
                            });
                        }
                        let tb = &self.blocks[target];
                        if tb.predecessors.len() != 1 && !tb.is_empty_block {
                            return Err(GraphError::CriticalEdge {
                                block: bidx.index(),
                                target: target.index(),
                            });
                        }
                    }
                }
                ControlKind::Return => (),
            }

            if bidx.index() > 0 && b.predecessors.is_empty() {
                return Err(GraphError::Unreachable(bidx.index()));
            }

            if b.is_empty_block {
                let single_cond_pred = match b.predecessors[..] {
                    [pred] => matches!(self.blocks[pred].control.kind, ControlKind::Branch { .. }),
                    _ => false,
                };
                if !b.phis.is_empty()
                    || !b.nodes.is_empty()
                    || !matches!(b.control.kind, ControlKind::Jump { .. })
                    || !single_cond_pred
                {
                    return Err(GraphError::MalformedEmptyBlock(bidx.index()));
                }
            }

            for phi in &b.phis {
                let node = &self.nodes[*phi];
                debug_assert_eq!(node.kind, NodeKind::Phi);
                if node.inputs.len() != b.predecessors.len() {
                    return Err(GraphError::PhiArity {
                        phi: node.id.as_u32(),
                        block: bidx.index(),
                        inputs: node.inputs.len(),
                        preds: b.predecessors.len(),
                    });
                }
                for (input, pred) in node.inputs.iter().zip(&b.predecessors) {
                    let pred_end = self.blocks[*pred].control.id;
                    self.check_input(node.id.as_u32(), input, |def| def < pred_end)?;
                }
            }

            for nidx in &b.nodes {
                let node = &self.nodes[*nidx];
                let user = node.id;
                for input in &node.inputs {
                    self.check_input(user.as_u32(), input, |def| def < user)?;
                }
                self.check_node_policies(*nidx)?;
                self.check_register_pressure(user.as_u32(), &node.inputs, node.num_temporaries)?;
            }

            let user = b.control.id;
            for input in &b.control.inputs {
                self.check_input(user.as_u32(), input, |def| def < user)?;
            }
            self.check_register_pressure(
                user.as_u32(),
                &b.control.inputs,
                b.control.num_temporaries,
            )?;
        }
        Ok(())
    }

    /// Check that `input` of the node with id `user` refers to a value whose definition satisfies
    /// `defined_before`, and that its policy is sensible.
    fn check_input<F>(&self, user: u32, input: &Input, defined_before: F) -> Result<(), GraphError>
    where
        F: Fn(NodeId) -> bool,
    {
        let def = &self.nodes[input.node];
        if def.value.is_none() {
            return Err(GraphError::NotAValue {
                node: user,
                input: def.id.as_u32(),
            });
        }
        if !defined_before(def.id) {
            return Err(GraphError::UseBeforeDef {
                node: user,
                input: def.id.as_u32(),
            });
        }
        if let OperandPolicy::FixedRegister(reg) = input.policy {
            if reg.index() >= self.num_regs {
                return Err(GraphError::BadRegister {
                    node: user,
                    reg: reg.index(),
                    num_regs: self.num_regs,
                });
            }
        }
        Ok(())
    }

    /// Check that the register inputs and temporaries of the node with id `user` fit in the
    /// register file at the same time, and that no register is fixed for two different values.
    fn check_register_pressure(
        &self,
        user: u32,
        inputs: &[Input],
        temps: usize,
    ) -> Result<(), GraphError> {
        let mut fixed = RegSet::blank();
        let mut in_fixed: SmallVec<[(NodeIdx, Reg); 4]> = SmallVec::new();
        for input in inputs {
            if let OperandPolicy::FixedRegister(reg) = input.policy {
                match in_fixed.iter().find(|(_, r)| *r == reg) {
                    Some((v, _)) if *v != input.node => {
                        return Err(GraphError::ConflictingFixedRegister {
                            node: user,
                            reg: reg.index(),
                        });
                    }
                    Some(_) => (),
                    None => {
                        fixed.set(reg);
                        in_fixed.push((input.node, reg));
                    }
                }
            }
        }
        let mut must: SmallVec<[NodeIdx; 4]> = SmallVec::new();
        for input in inputs {
            if input.policy == OperandPolicy::MustHaveRegister
                && !in_fixed.iter().any(|(v, _)| *v == input.node)
                && !must.contains(&input.node)
            {
                must.push(input.node);
            }
        }
        let needed = fixed.len() + must.len() + temps;
        if needed > self.num_regs {
            return Err(GraphError::TooManyRegisters {
                node: user,
                needed,
                num_regs: self.num_regs,
            });
        }
        Ok(())
    }

    fn check_node_policies(&self, nidx: NodeIdx) -> Result<(), GraphError> {
        let node = &self.nodes[nidx];
        let Some(value) = &node.value else {
            return Ok(());
        };
        match value.policy {
            OperandPolicy::FixedRegister(reg) if reg.index() >= self.num_regs => {
                Err(GraphError::BadRegister {
                    node: node.id.as_u32(),
                    reg: reg.index(),
                    num_regs: self.num_regs,
                })
            }
            OperandPolicy::SameAsInput(i) if i >= node.inputs.len() => {
                Err(GraphError::BadSameAsInput {
                    node: node.id.as_u32(),
                    input: i,
                })
            }
            OperandPolicy::FixedSlot(slot) if slot >= 0 => Err(GraphError::BadFixedSlot {
                node: node.id.as_u32(),
                slot,
            }),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod test {
    use crate::{
        errors::GraphError,
        graph::{GraphBuilder, NodeSpec, OperandPolicy, Reg, Term},
    };

    #[test]
    fn critical_edge() {
        let mut gb = GraphBuilder::new(2);
        let b0 = gb.block();
        let b1 = gb.block();
        let b2 = gb.block();
        gb.branch(b0, b1, b2);
        gb.jump(b1, b2);
        gb.ret(b2);
        assert_eq!(
            gb.build().unwrap_err(),
            GraphError::CriticalEdge {
                block: 0,
                target: 2
            }
        );
    }

    #[test]
    fn malformed_empty_block() {
        let mut gb = GraphBuilder::new(2);
        let b0 = gb.block();
        let b1 = gb.empty_block();
        let b2 = gb.block();
        gb.jump(b0, b1);
        gb.jump(b1, b2);
        gb.ret(b2);
        assert_eq!(
            gb.build().unwrap_err(),
            GraphError::MalformedEmptyBlock(1)
        );

        let mut gb = GraphBuilder::new(2);
        let b0 = gb.block();
        let b1 = gb.empty_block();
        let b2 = gb.block();
        let b3 = gb.block();
        gb.branch(b0, b1, b2);
        gb.node(b1, NodeSpec::new("x"));
        gb.jump(b1, b3);
        gb.jump(b2, b3);
        gb.ret(b3);
        assert_eq!(
            gb.build().unwrap_err(),
            GraphError::MalformedEmptyBlock(1)
        );
    }

    #[test]
    fn backward_and_unreachable() {
        let mut gb = GraphBuilder::new(2);
        let b0 = gb.block();
        let b1 = gb.block();
        gb.jump(b0, b1);
        gb.jump(b1, b0);
        assert_eq!(
            gb.build().unwrap_err(),
            GraphError::BackwardJump {
                block: 1,
                target: 0
            }
        );

        let mut gb = GraphBuilder::new(2);
        let b0 = gb.block();
        let b1 = gb.block();
        gb.jump_loop(b0, b1);
        gb.ret(b1);
        assert_eq!(
            gb.build().unwrap_err(),
            GraphError::ForwardLoopJump {
                block: 0,
                target: 1
            }
        );

        let mut gb = GraphBuilder::new(2);
        let b0 = gb.block();
        let b1 = gb.block();
        gb.ret(b0);
        gb.ret(b1);
        assert_eq!(gb.build().unwrap_err(), GraphError::Unreachable(1));
    }

    #[test]
    fn phis() {
        let mut gb = GraphBuilder::new(2);
        let b0 = gb.block();
        let b1 = gb.block();
        let x = gb.node(b0, NodeSpec::new("x").result(OperandPolicy::MustHaveRegister));
        gb.jump(b0, b1);
        gb.phi(b1, &[x, x]);
        gb.ret(b1);
        assert_eq!(
            gb.build().unwrap_err(),
            GraphError::PhiArity {
                phi: 3,
                block: 1,
                inputs: 2,
                preds: 1
            }
        );

        // A loop phi may use a value defined later in the loop.
        let mut gb = GraphBuilder::new(2);
        let b0 = gb.block();
        let b1 = gb.block();
        let b2 = gb.block();
        let b3 = gb.block();
        let x = gb.node(b0, NodeSpec::new("x").result(OperandPolicy::MustHaveRegister));
        gb.jump(b0, b1);
        let phi = gb.phi(b1, &[x]);
        let y = gb.node(
            b1,
            NodeSpec::new("y")
                .input(phi, OperandPolicy::MustHaveRegister)
                .result(OperandPolicy::MustHaveRegister),
        );
        gb.add_phi_input(phi, y);
        gb.branch(b1, b2, b3);
        gb.jump_loop(b2, b1);
        gb.ret(b3);
        assert!(gb.build().is_ok());
    }

    #[test]
    fn inputs_and_policies() {
        let mut gb = GraphBuilder::new(2);
        let b0 = gb.block();
        let x = gb.node(b0, NodeSpec::new("x"));
        gb.node(b0, NodeSpec::new("y").input(x, OperandPolicy::RegisterOrSlot));
        gb.ret(b0);
        assert_eq!(
            gb.build().unwrap_err(),
            GraphError::NotAValue { node: 2, input: 1 }
        );

        let mut gb = GraphBuilder::new(2);
        let b0 = gb.block();
        let x = gb.node(b0, NodeSpec::new("x").result(OperandPolicy::MustHaveRegister));
        gb.node(
            b0,
            NodeSpec::new("y").input(x, OperandPolicy::FixedRegister(Reg::new(2))),
        );
        gb.ret(b0);
        assert_eq!(
            gb.build().unwrap_err(),
            GraphError::BadRegister {
                node: 2,
                reg: 2,
                num_regs: 2
            }
        );

        let mut gb = GraphBuilder::new(2);
        let b0 = gb.block();
        gb.node(b0, NodeSpec::new("x").result(OperandPolicy::SameAsInput(0)));
        gb.ret(b0);
        assert_eq!(
            gb.build().unwrap_err(),
            GraphError::BadSameAsInput { node: 1, input: 0 }
        );

        let mut gb = GraphBuilder::new(2);
        let b0 = gb.block();
        gb.param(b0, 0);
        gb.ret(b0);
        assert_eq!(
            gb.build().unwrap_err(),
            GraphError::BadFixedSlot { node: 1, slot: 0 }
        );

        let mut gb = GraphBuilder::new(2);
        let b0 = gb.block();
        gb.terminate(b0, Term::ret().temporaries(3));
        assert_eq!(
            gb.build().unwrap_err(),
            GraphError::TooManyRegisters {
                node: 1,
                needed: 3,
                num_regs: 2
            }
        );
    }

    #[test]
    fn register_pressure() {
        let reg = |i| OperandPolicy::FixedRegister(Reg::new(i));
        let mut gb = GraphBuilder::new(2);
        let b0 = gb.block();
        let x = gb.node(b0, NodeSpec::new("x").result(OperandPolicy::MustHaveRegister));
        let y = gb.node(b0, NodeSpec::new("y").result(OperandPolicy::MustHaveRegister));
        gb.node(b0, NodeSpec::new("z").input(x, reg(0)).input(y, reg(0)));
        gb.ret(b0);
        assert_eq!(
            gb.build().unwrap_err(),
            GraphError::ConflictingFixedRegister { node: 3, reg: 0 }
        );

        // The same value may be fixed to a register twice, and a must-have-register input of a
        // fixed value needs no register of its own.
        let mut gb = GraphBuilder::new(2);
        let b0 = gb.block();
        let x = gb.node(b0, NodeSpec::new("x").result(OperandPolicy::MustHaveRegister));
        let y = gb.node(b0, NodeSpec::new("y").result(OperandPolicy::MustHaveRegister));
        gb.node(
            b0,
            NodeSpec::new("z")
                .input(x, reg(0))
                .input(x, reg(0))
                .input(x, OperandPolicy::MustHaveRegister)
                .input(y, OperandPolicy::MustHaveRegister)
                .input(y, OperandPolicy::MustHaveRegister),
        );
        gb.ret(b0);
        assert!(gb.build().is_ok());

        let mut gb = GraphBuilder::new(2);
        let b0 = gb.block();
        let x = gb.node(b0, NodeSpec::new("x").result(OperandPolicy::MustHaveRegister));
        let y = gb.node(b0, NodeSpec::new("y").result(OperandPolicy::MustHaveRegister));
        gb.node(
            b0,
            NodeSpec::new("z")
                .input(x, reg(1))
                .input(y, OperandPolicy::MustHaveRegister)
                .temporaries(1),
        );
        gb.ret(b0);
        assert_eq!(
            gb.build().unwrap_err(),
            GraphError::TooManyRegisters {
                node: 3,
                needed: 3,
                num_regs: 2
            }
        );

        // Values which may live on the stack don't count.
        let mut gb = GraphBuilder::new(1);
        let b0 = gb.block();
        let x = gb.node(b0, NodeSpec::new("x").result(OperandPolicy::MustHaveRegister));
        let y = gb.node(b0, NodeSpec::new("y").result(OperandPolicy::MustHaveRegister));
        gb.terminate(
            b0,
            Term::ret()
                .input(x, OperandPolicy::MustHaveRegister)
                .input(y, OperandPolicy::RegisterOrSlot),
        );
        assert!(gb.build().is_ok());
    }
}
