//! Ring bookkeeping shared by the CPU and device allocator variants.
//!
//! Slots are handed out in ring order at `(rear_it + count) % ring_size`.
//! Each slot carries a reference count: `allocate` starts it at 1, `share`
//! raises it, `deallocate` lowers it. A slot whose count reaches 0 is dead;
//! if it is not the rear slot it stays in place (the window cannot shrink
//! around it), and the sweep reclaims the whole leading dead run the next
//! time the rear goes dead.

use std::slice;
use std::sync::atomic::{AtomicU32, Ordering};

use shared::layout::RingState;

use crate::spin;

/// Spin iterations before the allocator lock starts yielding.
const RING_SPIN_LIMIT: u32 = 64;

pub(crate) struct RingCtl<'a> {
    state: &'a RingState,
    refs: &'a [AtomicU32],
}

impl<'a> RingCtl<'a> {
    /// # Safety
    /// `refs_ptr` must point at `state.ring_size` consecutive `AtomicU32`
    /// words inside the same mapping as `state`, valid for `'a`.
    pub(crate) unsafe fn new(state: &'a RingState, refs_ptr: *const AtomicU32) -> Self {
        let refs = unsafe { slice::from_raw_parts(refs_ptr, state.ring_size as usize) };
        RingCtl { state, refs }
    }

    /// Claim the next slot, or `None` when every slot is live (NO_SPACE is
    /// a normal outcome, not an error).
    pub(crate) fn allocate(&self) -> Option<u32> {
        let _g = spin::acquire(&self.state.lock, RING_SPIN_LIMIT);
        let count = self.state.count.load(Ordering::Relaxed);
        if count == self.state.ring_size {
            return None;
        }
        let slot = (self.state.rear_it.load(Ordering::Relaxed) + count) % self.state.ring_size;
        self.refs[slot as usize].store(1, Ordering::Relaxed);
        self.state.count.store(count + 1, Ordering::Relaxed);
        Some(slot)
    }

    /// Add a holder to a live slot.
    pub(crate) fn share(&self, slot: u32) {
        let _g = spin::acquire(&self.state.lock, RING_SPIN_LIMIT);
        let refs = &self.refs[slot as usize];
        debug_assert!(refs.load(Ordering::Relaxed) > 0, "share of a dead slot");
        refs.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop a holder. When the slot goes dead and the rear is (or becomes)
    /// dead, the rear sweeps forward over the whole dead run.
    pub(crate) fn deallocate(&self, slot: u32) {
        let _g = spin::acquire(&self.state.lock, RING_SPIN_LIMIT);
        let refs = &self.refs[slot as usize];
        debug_assert!(refs.load(Ordering::Relaxed) > 0, "deallocate of a dead slot");
        if refs.fetch_sub(1, Ordering::Relaxed) != 1 {
            return;
        }
        let ring = self.state.ring_size;
        let mut rear = self.state.rear_it.load(Ordering::Relaxed);
        let mut count = self.state.count.load(Ordering::Relaxed);
        while count > 0 && self.refs[rear as usize].load(Ordering::Relaxed) == 0 {
            rear = (rear + 1) % ring;
            count -= 1;
        }
        self.state.rear_it.store(rear, Ordering::Relaxed);
        self.state.count.store(count, Ordering::Relaxed);
    }

    /// `(count, rear_it)` under the lock; used by tests and diagnostics.
    pub(crate) fn snapshot(&self) -> (u32, u32) {
        let _g = spin::acquire(&self.state.lock, RING_SPIN_LIMIT);
        (
            self.state.count.load(Ordering::Relaxed),
            self.state.rear_it.load(Ordering::Relaxed),
        )
    }
}
