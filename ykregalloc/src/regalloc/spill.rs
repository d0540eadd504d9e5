//! The spill slot allocator.
//!
//! Spill slots are numbered from 0 upwards. A slot is returned to a free list when the value
//! spilled to it dies, and freed slots are reused (most recently freed first) before the frame is
//! grown.

#[cfg(any(test, debug_assertions))]
use vob::Vob;

#[derive(Debug, Default)]
pub(crate) struct SpillSlots {
    /// The number of slots the frame needs: every slot handed out is `< top`.
    top: u32,
    /// Slots which have been freed and can be reused.
    free: Vec<u32>,
}

impl SpillSlots {
    /// Allocate a spill slot.
    pub(crate) fn alloc(&mut self) -> i32 {
        let slot = match self.free.pop() {
            Some(x) => x,
            None => {
                self.top += 1;
                self.top - 1
            }
        };
        i32::try_from(slot).unwrap()
    }

    /// Return `slot` to the free list.
    pub(crate) fn free(&mut self, slot: i32) {
        let slot = u32::try_from(slot).unwrap();
        debug_assert!(slot < self.top);
        debug_assert!(!self.free.contains(&slot), "s{slot} freed twice");
        self.free.push(slot);
    }

    /// How many slots does the frame need?
    pub(crate) fn top(&self) -> u32 {
        self.top
    }

    /// Which slots are currently in use?
    #[cfg(any(test, debug_assertions))]
    pub(crate) fn in_use(&self) -> Vob {
        let mut used = Vob::from_elem(true, usize::try_from(self.top).unwrap());
        for x in &self.free {
            used.set(usize::try_from(*x).unwrap(), false);
        }
        used
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reuse() {
        let mut sa = SpillSlots::default();
        assert_eq!(sa.alloc(), 0);
        assert_eq!(sa.alloc(), 1);
        assert_eq!(sa.alloc(), 2);
        sa.free(0);
        sa.free(2);
        assert_eq!(sa.in_use().iter().collect::<Vec<_>>(), vec![false, true, false]);
        assert_eq!(sa.alloc(), 2);
        assert_eq!(sa.alloc(), 0);
        assert_eq!(sa.alloc(), 3);
        assert_eq!(sa.top(), 4);
    }

    #[test]
    #[should_panic]
    fn double_free() {
        let mut sa = SpillSlots::default();
        sa.alloc();
        sa.free(0);
        sa.free(0);
    }
}
