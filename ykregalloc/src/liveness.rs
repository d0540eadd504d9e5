//! Number a graph's nodes and compute the use information that the register allocator relies on.
//!
//! Nodes are numbered in layout order starting at 1. Each use of a value is then linked to the
//! value's next use, so that as the allocator walks forwards it always knows how far away the
//! next use of a value is, and when a value dies. The uses at a control node are, in order: its
//! own inputs, the inputs of its target's phis that correspond to this edge, and, for loop jumps,
//! the loop's live-through values.

use crate::graph::{
    BlockIdx, ControlKind, Graph, Input, InputSite, NodeId, NodeIdx, OperandPolicy,
};
use index_vec::{index_vec, IndexVec};
use vob::Vob;

/// Assign ids to every phi, node, and control node, and record each block's first id.
pub(crate) fn number(g: &mut Graph) {
    let mut next = NodeId(1);
    for b in g.blocks.iter_mut() {
        let mut first = None;
        for nidx in b.phis.iter().chain(b.nodes.iter()) {
            g.nodes[*nidx].id = next;
            first.get_or_insert(next);
            next = next.next();
        }
        b.control.id = next;
        b.first_id = first.unwrap_or(next);
        next = next.next();
    }
}

/// Compute live-through values for loops and then link every use to the next use of the same
/// value.
pub(crate) fn analyse(g: &mut Graph) {
    for bidx in g.blocks.indices() {
        add_live_through(g, bidx);
    }

    let mut next_use: IndexVec<NodeIdx, NodeId> = index_vec![NodeId::INVALID; g.nodes.len()];
    let mut last_use: IndexVec<NodeIdx, NodeId> = index_vec![NodeId::INVALID; g.nodes.len()];
    for (id, site) in use_sites(g).into_iter().rev() {
        let input = g.input_mut(site);
        let v = input.node;
        input.next_use_id = next_use[v];
        if !last_use[v].is_valid() {
            last_use[v] = id;
        }
        next_use[v] = id;
    }

    for (nidx, node) in g.nodes.iter_mut_enumerated() {
        if let Some(value) = &mut node.value {
            value.next_use = next_use[nidx];
            value.live_range_end = last_use[nidx];
        }
    }
}

/// Every use in the graph, in the order the allocator will process them.
fn use_sites(g: &Graph) -> Vec<(NodeId, InputSite)> {
    let mut sites = Vec::new();
    for (bidx, b) in g.blocks.iter_enumerated() {
        for nidx in &b.nodes {
            let node = &g.nodes[*nidx];
            for i in 0..node.inputs.len() {
                sites.push((node.id, InputSite::Node(*nidx, i)));
            }
        }
        let c = &b.control;
        for i in 0..c.inputs.len() {
            sites.push((c.id, InputSite::Control(bidx, i)));
        }
        if let Some(target) = c.kind.unconditional_target() {
            for phi in &g.blocks[target].phis {
                sites.push((c.id, InputSite::Node(*phi, b.predecessor_id)));
            }
        }
        if let ControlKind::JumpLoop { live_through, .. } = &c.kind {
            for i in 0..live_through.len() {
                sites.push((c.id, InputSite::LiveThrough(bidx, i)));
            }
        }
    }
    sites
}

/// If `bidx` ends in a loop jump, record every value defined before the loop header and used
/// between the header and the loop jump.
fn add_live_through(g: &mut Graph, bidx: BlockIdx) {
    let ControlKind::JumpLoop { target, .. } = g.blocks[bidx].control.kind else {
        return;
    };
    let start = g.blocks[target].first_id;
    let end = g.blocks[bidx].control.id;
    let mut seen = Vob::from_elem(false, g.nodes.len());
    let mut live = Vec::new();
    for (id, site) in use_sites(g) {
        if id < start || id > end {
            continue;
        }
        let v = g.input(site).node;
        if g.nodes[v].id < start && !seen[v.index()] {
            seen.set(v.index(), true);
            live.push(Input::new(v, OperandPolicy::RegisterOrSlot));
        }
    }
    if let ControlKind::JumpLoop { live_through, .. } = &mut g.blocks[bidx].control.kind {
        *live_through = live;
    }
}
