//! Post-dominating holes.
//!
//! A "hole" is a control node after which execution does not simply continue with the next node
//! in the layout: a non-fallthrough jump, a loop jump, or a return. For every control node we
//! compute the nearest hole that all paths from that node must pass through. Code emitted
//! "at the end of the current straight-line region" can be placed there.

use crate::graph::{BlockIdx, ControlKind, Graph};
use index_vec::{index_vec, IndexVec};

#[derive(Debug)]
pub struct PostDomHoles {
    /// For each block whose control node is a jump or branch, the nearest hole that post
    /// dominates it. Loop jumps and returns are holes themselves and have no entry.
    next: IndexVec<BlockIdx, Option<BlockIdx>>,
}

impl PostDomHoles {
    /// Compute the holes of `g`. Control nodes are visited in reverse layout order so that every
    /// forward target has been processed before anything that jumps to it.
    pub fn new(g: &Graph) -> Self {
        let mut holes = Self {
            next: index_vec![None; g.blocks.len()],
        };
        for bidx in g.blocks.indices().rev() {
            match &g.blocks[bidx].control.kind {
                ControlKind::Jump { target } => {
                    holes.next[bidx] = Some(holes.nearest(g, *target));
                }
                ControlKind::Branch { if_true, if_false } => {
                    let mut first = holes.nearest(g, *if_true);
                    let mut second = holes.nearest(g, *if_false);
                    let hole = loop {
                        if first == second {
                            break first;
                        }
                        if g.blocks[first].control.id > g.blocks[second].control.id {
                            std::mem::swap(&mut first, &mut second);
                        }
                        // If the earlier hole ends its paths, the later one must be the nearest
                        // shared hole.
                        match g.blocks[first].control.kind {
                            ControlKind::Return | ControlKind::JumpLoop { .. } => break second,
                            ControlKind::Jump { .. } => (),
                            ControlKind::Branch { .. } => unreachable!(),
                        }
                        first = holes.next(first);
                    };
                    holes.next[bidx] = Some(hole);
                }
                ControlKind::JumpLoop { .. } | ControlKind::Return => (),
            }
        }
        holes
    }

    /// The next hole after the (jump) hole at the end of `bidx`.
    fn next(&self, bidx: BlockIdx) -> BlockIdx {
        match self.next[bidx] {
            Some(x) => x,
            None => panic!("b{} has no post-dominating hole", bidx.index()),
        }
    }

    /// The block whose control node is the nearest hole post-dominating the control node of
    /// `bidx` (which may be `bidx` itself).
    pub fn nearest(&self, g: &Graph, bidx: BlockIdx) -> BlockIdx {
        match &g.blocks[bidx].control.kind {
            ControlKind::Branch { .. } => self.next(bidx),
            ControlKind::Jump { target } if g.is_fallthrough(bidx, *target) => self.next(bidx),
            ControlKind::Jump { .. } | ControlKind::JumpLoop { .. } | ControlKind::Return => bidx,
        }
    }

    /// The chain of holes starting at the nearest hole of `bidx`, e.g. ` 5-7 9.` for a jump from
    /// id 5 to id 7 followed by a return at id 9 (loop jumps are shown as `^`). Returns `None` if
    /// the nearest hole is a loop jump.
    pub fn chain_to_string(&self, g: &Graph, bidx: BlockIdx) -> Option<String> {
        let mut hole = self.nearest(g, bidx);
        if let ControlKind::JumpLoop { .. } = g.blocks[hole].control.kind {
            return None;
        }
        let mut out = String::new();
        loop {
            let c = &g.blocks[hole].control;
            match &c.kind {
                ControlKind::Jump { target } => {
                    out.push_str(&format!(" {}-{}", c.id, g.blocks[*target].first_id));
                    hole = self.next(hole);
                }
                ControlKind::Return => {
                    out.push_str(&format!(" {}.", c.id));
                    break;
                }
                ControlKind::JumpLoop { .. } => {
                    out.push_str(&format!(" {}^", c.id));
                    break;
                }
                ControlKind::Branch { .. } => unreachable!(),
            }
        }
        Some(out)
    }
}
