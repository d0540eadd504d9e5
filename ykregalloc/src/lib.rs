//! A fast, single pass register allocator for JIT compiled code.
//!
//! A [Graph] of basic blocks is built with a [GraphBuilder], which numbers every node in layout
//! order and records, for each use of a value, where the value is next used. [allocate_registers]
//! then walks the graph once, forwards, assigning every value a register or a stack slot and
//! inserting gap moves where values have to change location. Where control flow joins, each
//! register's expected contents are recorded in the target block's [MergeState] for the code
//! generator to reconcile.
//!
//! The `YKRA_LOG` environment variable controls logging: see [log::Log].

#![allow(clippy::comparison_chain)]
#![allow(clippy::new_without_default)]

pub mod errors;
pub mod graph;
pub mod holes;
mod liveness;
pub mod log;
pub mod regalloc;
#[cfg(test)]
mod testing;

pub use errors::{GraphError, RegAllocError};
pub use graph::{
    Block, BlockIdx, ControlKind, Graph, GraphBuilder, Input, Node, NodeId, NodeIdx, NodeKind,
    NodeSpec, Operand, OperandPolicy, Reg, RegSet, Term, Value,
};
pub use regalloc::{
    allocate_registers, allocate_registers_with, MergeState, RegisterMerge, RegisterState,
};
