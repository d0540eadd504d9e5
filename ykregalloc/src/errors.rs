//! Errors that can be reported to users of the allocator.
//!
//! Malformed input graphs and bad configuration are reported as errors. Violations of the
//! allocator's internal invariants indicate bugs and cause a panic.

use thiserror::Error;

/// Reasons that a graph handed to [crate::graph::GraphBuilder::build] is rejected.
#[derive(Debug, Error, PartialEq)]
pub enum GraphError {
    #[error("A graph must have between 1 and {max} registers: {num_regs} were requested")]
    RegisterCount { num_regs: usize, max: usize },
    #[error("A graph must have at least one block")]
    NoBlocks,
    #[error("Block b{0} has no control node")]
    Unterminated(usize),
    #[error("Block b{block} refers to unknown block b{target}")]
    UnknownBlock { block: usize, target: usize },
    #[error("Block b{block} jumps backwards to b{target} without a loop jump")]
    BackwardJump { block: usize, target: usize },
    #[error("Block b{block} has a loop jump to b{target} which is not at or before it")]
    ForwardLoopJump { block: usize, target: usize },
    #[error("Block b{0} is not reachable from its predecessors")]
    Unreachable(usize),
    #[error(
        "Conditional target b{target} of b{block} has several predecessors and is not an empty block"
    )]
    CriticalEdge { block: usize, target: usize },
    #[error("Empty block b{0} must have no phis or nodes, end in a jump, and have exactly one conditional predecessor")]
    MalformedEmptyBlock(usize),
    #[error("Phi v{phi} in b{block} has {inputs} inputs but its block has {preds} predecessors")]
    PhiArity {
        phi: u32,
        block: usize,
        inputs: usize,
        preds: usize,
    },
    #[error("Node {node} uses node {input} which does not produce a value")]
    NotAValue { node: u32, input: u32 },
    #[error("Node {node} uses v{input} before it is defined")]
    UseBeforeDef { node: u32, input: u32 },
    #[error("Node {node} refers to register r{reg} but the graph only has {num_regs} registers")]
    BadRegister { node: u32, reg: usize, num_regs: usize },
    #[error("Node {node} has a same-as-input result referring to missing input {input}")]
    BadSameAsInput { node: u32, input: usize },
    #[error("Node {node} has a fixed slot result at non-negative index {slot}")]
    BadFixedSlot { node: u32, slot: i32 },
    #[error("Node {node} fixes register {reg} for two different values")]
    ConflictingFixedRegister { node: u32, reg: usize },
    #[error("Node {node} needs {needed} registers but the graph only has {num_regs}")]
    TooManyRegisters {
        node: u32,
        needed: usize,
        num_regs: usize,
    },
}

/// Errors reported by [crate::allocate_registers].
#[derive(Debug, Error)]
pub enum RegAllocError {
    #[error("Invalid graph: {0}")]
    Graph(#[from] GraphError),
    #[error("Invalid YKRA_LOG: {0}")]
    LogConfig(String),
    #[error("Graph has already been register allocated")]
    AlreadyAllocated,
}
