//! Helpers shared by the crate's tests.

use crate::graph::{BlockIdx, Graph, GraphBuilder, NodeIdx, NodeSpec, OperandPolicy, Reg, Term};
use fm::{FMBuilder, FMatcher};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref PTN_RE: Regex = Regex::new(r"\{\{.+?\}\}").unwrap();
    static ref TEXT_RE: Regex = Regex::new(r"[a-zA-Z0-9\._]+").unwrap();
}

pub(crate) fn fmatcher(ptn: &str) -> FMatcher<'_> {
    FMBuilder::new(ptn)
        .unwrap()
        .name_matcher(PTN_RE.clone(), TEXT_RE.clone())
        .build()
        .unwrap()
}

/// A small deterministic pseudo-random number generator (splitmix64).
struct Rng(u64);

impl Rng {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    fn below(&mut self, n: usize) -> usize {
        usize::try_from(self.next() % u64::try_from(n).unwrap()).unwrap()
    }

    fn pick(&mut self, xs: &[NodeIdx]) -> NodeIdx {
        xs[self.below(xs.len())]
    }
}

/// Generate a well-formed graph from `seed`: nested diamonds, loops, early returns, and edges
/// split by empty blocks, with values only used where their definitions dominate.
pub(crate) fn gen_graph(seed: u64, num_regs: usize) -> Graph {
    let mut gen = Gen {
        gb: GraphBuilder::new(num_regs),
        rng: Rng(seed),
        num_regs,
        budget: 10,
    };
    let b0 = gen.gb.block();
    let mut avail = vec![gen.gb.param(b0, -1)];
    let end = gen.region(b0, &mut avail, 0);
    let ret = gen.rng.pick(&avail);
    gen.gb
        .terminate(end, Term::ret().input(ret, OperandPolicy::RegisterOrSlot));
    gen.gb.build().unwrap()
}

struct Gen {
    gb: GraphBuilder,
    rng: Rng,
    num_regs: usize,
    /// How many more control flow structures may be created.
    budget: usize,
}

impl Gen {
    /// Fill `cur` and any blocks that follow it, returning the (unterminated) block that control
    /// flow continues in. Values defined in blocks that dominate the returned block are added to
    /// `avail`.
    fn region(&mut self, mut cur: BlockIdx, avail: &mut Vec<NodeIdx>, depth: usize) -> BlockIdx {
        for _ in 0..1 + self.rng.below(3) {
            self.straight(cur, avail);
            if depth >= 3 || self.budget == 0 {
                continue;
            }
            self.budget -= 1;
            cur = match self.rng.below(5) {
                0 => self.diamond(cur, avail, depth),
                1 => self.loop_(cur, avail, depth),
                2 => self.early_return(cur, avail, depth),
                3 => self.split_edge(cur, avail, depth),
                _ => cur,
            };
        }
        cur
    }

    /// Pick an input policy. `free` is the number of registers not yet claimed by the node's
    /// other inputs and temporaries: once it reaches zero, only policies allowing a stack slot are
    /// picked.
    fn policy(&mut self, allow_fixed: &mut bool, free: &mut usize) -> OperandPolicy {
        let p = match self.rng.below(5) {
            0 => return OperandPolicy::RegisterOrSlot,
            1 => return OperandPolicy::RegisterOrSlotOrConstant,
            2 if *allow_fixed => {
                *allow_fixed = false;
                OperandPolicy::FixedRegister(Reg::new(self.rng.below(self.num_regs)))
            }
            _ => OperandPolicy::MustHaveRegister,
        };
        if *free == 0 {
            return OperandPolicy::RegisterOrSlot;
        }
        *free -= 1;
        p
    }

    fn straight(&mut self, b: BlockIdx, avail: &mut Vec<NodeIdx>) {
        for _ in 0..self.rng.below(4) {
            let mut spec = NodeSpec::new("op");
            let mut free = self.num_regs;
            spec = match self.rng.below(8) {
                0 => spec.call(),
                1 => spec.deopt(),
                2 => {
                    free -= 1;
                    spec.temporaries(1)
                }
                _ => spec,
            };
            let mut allow_fixed = true;
            for _ in 0..self.rng.below(3) {
                let v = self.rng.pick(avail);
                let p = self.policy(&mut allow_fixed, &mut free);
                spec = spec.input(v, p);
            }
            let result = match self.rng.below(6) {
                0 => None,
                1 => Some(OperandPolicy::FixedRegister(Reg::new(0))),
                2 => Some(OperandPolicy::RegisterOrSlot),
                _ => Some(OperandPolicy::MustHaveRegister),
            };
            match result {
                Some(p) => {
                    let n = self.gb.node(b, spec.result(p));
                    avail.push(n);
                }
                None => {
                    self.gb.node(b, spec);
                }
            }
        }
    }

    fn branch(&mut self, b: BlockIdx, avail: &[NodeIdx], if_true: BlockIdx, if_false: BlockIdx) {
        let mut term = Term::branch(if_true, if_false);
        if self.rng.below(2) == 0 {
            term = term.input(self.rng.pick(avail), OperandPolicy::MustHaveRegister);
        }
        term = match self.rng.below(8) {
            0 => term.call(),
            1 => term.deopt(),
            _ => term,
        };
        self.gb.terminate(b, term);
    }

    fn diamond(&mut self, cur: BlockIdx, avail: &mut Vec<NodeIdx>, depth: usize) -> BlockIdx {
        let t = self.gb.block();
        let mut t_avail = avail.clone();
        let t_end = self.region(t, &mut t_avail, depth + 1);
        let f = self.gb.block();
        self.branch(cur, avail, t, f);
        let mut f_avail = avail.clone();
        let f_end = self.region(f, &mut f_avail, depth + 1);
        let join = self.gb.block();
        self.gb.jump(t_end, join);
        self.gb.jump(f_end, join);
        for _ in 0..self.rng.below(3) {
            let inputs = [self.rng.pick(&t_avail), self.rng.pick(&f_avail)];
            let phi = self.gb.phi(join, &inputs);
            avail.push(phi);
        }
        join
    }

    fn split_edge(&mut self, cur: BlockIdx, avail: &mut Vec<NodeIdx>, depth: usize) -> BlockIdx {
        let e = self.gb.empty_block();
        let f = self.gb.block();
        self.branch(cur, avail, e, f);
        let mut f_avail = avail.clone();
        let f_end = self.region(f, &mut f_avail, depth + 1);
        let join = self.gb.block();
        self.gb.jump(e, join);
        self.gb.jump(f_end, join);
        // Phis may only take values from the incoming edges, not each other.
        let e_avail = avail.clone();
        for _ in 0..self.rng.below(3) {
            let inputs = [self.rng.pick(&e_avail), self.rng.pick(&f_avail)];
            let phi = self.gb.phi(join, &inputs);
            avail.push(phi);
        }
        join
    }

    fn early_return(&mut self, cur: BlockIdx, avail: &mut Vec<NodeIdx>, depth: usize) -> BlockIdx {
        let r = self.gb.block();
        let mut r_avail = avail.clone();
        let r_end = self.region(r, &mut r_avail, depth + 1);
        let ret = self.rng.pick(&r_avail);
        self.gb
            .terminate(r_end, Term::ret().input(ret, OperandPolicy::RegisterOrSlot));
        let c = self.gb.block();
        self.branch(cur, avail, r, c);
        c
    }

    fn loop_(&mut self, cur: BlockIdx, avail: &mut Vec<NodeIdx>, depth: usize) -> BlockIdx {
        let header = self.gb.block();
        self.gb.jump(cur, header);
        let mut phis = Vec::new();
        for _ in 0..self.rng.below(3) {
            let input = self.rng.pick(avail);
            phis.push(self.gb.phi(header, &[input]));
        }
        let mut body_avail = avail.clone();
        body_avail.extend(&phis);
        let body_end = self.region(header, &mut body_avail, depth + 1);
        let back = self.gb.block();
        let exit = self.gb.block();
        self.branch(body_end, &body_avail, back, exit);
        for phi in &phis {
            let input = self.rng.pick(&body_avail);
            self.gb.add_phi_input(*phi, input);
        }
        self.gb.jump_loop(back, header);
        avail.extend(phis);
        exit
    }
}
