//! The register file and the parts of the allocator that move values in and out of it.

use super::RegAlloc;
use crate::graph::{Graph, NodeIdx, Operand, Reg, RegSet, TempSite, Value};
use smallvec::SmallVec;

/// What each register currently holds.
#[derive(Debug)]
pub(crate) struct RegFile {
    values: Vec<Option<NodeIdx>>,
    /// The registers available for allocation. Outside of [RegAlloc::free_reg] this is exactly
    /// the set of registers holding no value.
    free: RegSet,
}

impl RegFile {
    pub(crate) fn new(num_regs: usize) -> Self {
        Self {
            values: vec![None; num_regs],
            free: RegSet::with_first(num_regs),
        }
    }

    pub(crate) fn num_regs(&self) -> usize {
        self.values.len()
    }

    pub(crate) fn get(&self, reg: Reg) -> Option<NodeIdx> {
        self.values[reg.index()]
    }

    pub(crate) fn free_regs(&self) -> RegSet {
        self.free
    }

    /// The occupied registers and their values, lowest register first.
    pub(crate) fn occupied(&self) -> SmallVec<[(Reg, NodeIdx); 16]> {
        self.values
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.map(|v| (Reg::new(i), v)))
            .collect()
    }

    /// Record that `reg` holds `v`, whose bookkeeping is `value`.
    pub(crate) fn set(&mut self, reg: Reg, v: NodeIdx, value: &mut Value) {
        debug_assert!(
            self.values[reg.index()].is_none() || self.values[reg.index()] == Some(v),
            "{reg} is already occupied"
        );
        self.values[reg.index()] = Some(v);
        self.free.unset(reg);
        value.regs.set(reg);
    }

    /// Empty `reg` without making it available for allocation.
    fn detach(&mut self, reg: Reg) -> Option<NodeIdx> {
        self.values[reg.index()].take()
    }

    /// Empty `reg` and make it available for allocation.
    pub(crate) fn release(&mut self, reg: Reg) -> Option<NodeIdx> {
        self.free.set(reg);
        self.values[reg.index()].take()
    }

    /// Empty every register, making none of them available: the caller must then [Self::set] or
    /// [Self::release] each register.
    pub(crate) fn clear_all(&mut self) {
        self.values.iter_mut().for_each(|x| *x = None);
        self.free = RegSet::blank();
    }

    /// Render the occupied registers as e.g. `live regs: r0=v3, r2=v7`.
    pub(crate) fn to_string(&self, g: &Graph) -> String {
        let regs = self
            .occupied()
            .iter()
            .map(|(reg, v)| format!("{reg}=v{}", g.node(*v).id()))
            .collect::<Vec<_>>();
        if regs.is_empty() {
            "live regs: none".to_owned()
        } else {
            format!("live regs: {}", regs.join(", "))
        }
    }
}

/// The parts of the register allocator which place values in registers and spill them.
impl RegAlloc<'_> {
    /// Remove `v` from every register it is in.
    pub(super) fn free_registers(&mut self, v: NodeIdx) {
        let value = self.g.value_mut(v);
        for reg in value.regs.iter() {
            let old = self.regs.release(reg);
            debug_assert_eq!(old, Some(v));
        }
        value.regs = RegSet::blank();
    }

    /// Empty `reg`, which is not made available for allocation: the caller must immediately put
    /// a value in it. If this was the only location of its value, the value is moved to a free
    /// register (emitting a gap move) or, if there are none, spilled.
    fn free_reg(&mut self, reg: Reg) {
        let Some(v) = self.regs.detach(reg) else {
            return;
        };
        let value = self.g.value_mut(v);
        value.regs.unset(reg);
        if !value.has_register() && !value.is_spilled() {
            if let Some(target) = self.regs.free_regs().first() {
                self.regs.set(target, v, value);
                self.trace(|g, _| format!("gap move: v{}: {target} <- {reg}", g.node(v).id()));
                self.add_move(Operand::Reg(reg), Operand::Reg(target));
            } else {
                self.spill(v);
            }
        }
        self.displaced(v, reg);
    }

    /// Put `v` in `reg`, evicting anything already there.
    pub(super) fn force_allocate(&mut self, reg: Reg, v: NodeIdx) -> Operand {
        match self.regs.get(reg) {
            Some(x) if x == v => return Operand::Reg(reg),
            Some(_) => {
                debug_assert!(!self.blocked.is_set(reg), "{reg} is needed by another input");
                self.free_reg(reg);
                debug_assert!(self.regs.get(reg).is_none());
            }
            None => (),
        }
        self.regs.set(reg, v, self.g.value_mut(v));
        Operand::Reg(reg)
    }

    /// Put `v` in the lowest free register, if there is one.
    pub(super) fn try_allocate_reg(&mut self, v: NodeIdx) -> Option<Operand> {
        let reg = self.regs.free_regs().first()?;
        self.regs.set(reg, v, self.g.value_mut(v));
        Some(Operand::Reg(reg))
    }

    /// Put `v` in a register, evicting another value if necessary.
    pub(super) fn allocate_reg(&mut self, v: NodeIdx) -> Operand {
        if self.regs.free_regs().is_empty() {
            self.evict_furthest();
        }
        match self.try_allocate_reg(v) {
            Some(x) => x,
            None => panic!("No register available after eviction"),
        }
    }

    /// Free the register whose value's next use is furthest away. Ties go to the lowest numbered
    /// register. Registers holding the current node's register inputs are never chosen. If the
    /// register was the value's only location, the value is spilled.
    ///
    /// # Panics
    ///
    /// If no register can be evicted.
    pub(super) fn evict_furthest(&mut self) {
        let mut victim = None;
        let mut furthest = None;
        for (reg, v) in self.regs.occupied() {
            if self.blocked.is_set(reg) {
                continue;
            }
            let next_use = self.g.value(v).next_use;
            if furthest.map_or(true, |x| next_use > x) {
                furthest = Some(next_use);
                victim = Some((reg, v));
            }
        }
        let Some((reg, v)) = victim else {
            panic!("Cannot evict a register: no unblocked register holds a value");
        };
        self.trace(|g, _| format!("evict: {reg} (v{})", g.node(v).id()));
        self.regs.release(reg);
        let value = self.g.value_mut(v);
        value.regs.unset(reg);
        if !value.has_register() && !value.is_spilled() {
            self.spill(v);
        }
        self.displaced(v, reg);
    }

    /// Give `v` a spill slot if it doesn't already have one.
    pub(super) fn spill(&mut self, v: NodeIdx) {
        if self.g.value(v).is_spilled() {
            return;
        }
        let slot = Operand::Stack(self.slots.alloc());
        self.g.value_mut(v).spill = Some(slot);
        self.trace(|g, _| format!("spill: {slot} <- v{}", g.node(v).id()));
    }

    /// Spill every value in a register, leaving the registers untouched.
    pub(super) fn spill_registers(&mut self) {
        for (_, v) in self.regs.occupied() {
            self.spill(v);
        }
    }

    /// Spill every value in a register and then empty all registers.
    pub(super) fn spill_and_clear_registers(&mut self) {
        for (_, v) in self.regs.occupied() {
            self.spill(v);
            self.free_registers(v);
        }
    }

    /// Give `site` the temporaries it needs: the lowest free registers, after evicting values if
    /// there are too few.
    pub(super) fn assign_temporaries(&mut self, site: TempSite) {
        let (needed, _) = self.g.temporaries_mut(site);
        if needed == 0 {
            return;
        }
        let free = self.regs.free_regs().len();
        for _ in free..needed {
            self.evict_furthest();
        }
        let temps = self.regs.free_regs().lowest(needed);
        debug_assert_eq!(temps.len(), needed);
        *self.g.temporaries_mut(site).1 = temps;
    }

    /// Check that the register file and the values' register sets agree, and that no two live
    /// values share a spill slot.
    #[cfg(debug_assertions)]
    pub(super) fn assert_consistent(&self) {
        for i in 0..self.regs.num_regs() {
            let reg = Reg::new(i);
            match self.regs.get(reg) {
                Some(v) => {
                    assert!(!self.regs.free_regs().is_set(reg), "{reg} is occupied and free");
                    assert!(self.g.value(v).regs.is_set(reg));
                }
                None => assert!(self.regs.free_regs().is_set(reg), "{reg} is lost"),
            }
        }
        for (nidx, node) in self.g.nodes.iter_enumerated() {
            if let Some(value) = &node.value {
                for reg in value.regs.iter() {
                    assert_eq!(
                        self.regs.get(reg),
                        Some(nidx),
                        "v{} thinks it is in {reg}",
                        node.id
                    );
                }
            }
        }

        let mut in_use = self.slots.in_use();
        for node in self.g.nodes.iter() {
            let Some(value) = &node.value else {
                continue;
            };
            if let Some(Operand::Stack(slot)) = value.spill {
                if slot >= 0 && !value.is_dead() {
                    let slot = usize::try_from(slot).unwrap();
                    assert!(in_use[slot], "v{} is spilled to free slot s{slot}", node.id);
                    in_use.set(slot, false);
                }
            }
        }
    }
}
