//! Segment storage for the segmented mailbox.
//!
//! A segment is one fixed-capacity link in the mailbox's append-only chain.
//! Each slot carries its own state byte, so producers and the consumer never
//! share an in-segment index:
//!
//! - `EMPTY`: untouched, or reserved with the store still in flight
//! - `READY`: the producer's value is in the cell
//! - `CONSUMED`: the consumer moved the value out
//!
//! A slot only ever moves `EMPTY -> READY -> CONSUMED`, each step written by
//! exactly one thread. The `READY` store is the release that publishes the
//! value; the `CONSUMED` mark is read again only during teardown, which the
//! handle refcount serializes.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicU8, Ordering};

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};

const EMPTY: u8 = 0;
const READY: u8 = 1;
const CONSUMED: u8 = 2;

/// One slot: a state byte plus the value cell it guards.
struct Slot<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

/// A fixed block of slots covering global indices
/// `start .. start + capacity`.
pub(super) struct Segment<T> {
    /// Global index of slot 0.
    pub(super) start: u64,
    /// Preceding segment, null only for the first. Written once at
    /// construction; walked by producers whose hint overshot.
    pub(super) prev: Atomic<Segment<T>>,
    /// Succeeding segment, null until exactly one linking CAS wins.
    pub(super) next: Atomic<Segment<T>>,
    slots: Box<[Slot<T>]>,
}

impl<T> Segment<T> {
    pub(super) fn new(start: u64, capacity: usize, prev: Shared<'_, Self>) -> Self {
        Self {
            start,
            prev: Atomic::from(prev),
            next: Atomic::null(),
            slots: std::iter::repeat_with(Slot::new).take(capacity).collect(),
        }
    }

    /// Publishes `value` at `offset`.
    ///
    /// # Safety
    ///
    /// The caller must hold the unique reservation for the global index that
    /// maps to `offset`, so this runs at most once per slot.
    #[inline]
    pub(super) unsafe fn write(&self, offset: usize, value: T) {
        let slot = &self.slots[offset];
        unsafe {
            ptr::write((*slot.value.get()).as_mut_ptr(), value);
        }
        slot.state.store(READY, Ordering::Release);
    }

    /// Returns whether the slot at `offset` holds a published value.
    #[inline]
    pub(super) fn is_ready(&self, offset: usize) -> bool {
        self.slots[offset].state.load(Ordering::Acquire) == READY
    }

    /// Moves the value out of `offset` and marks the slot consumed.
    ///
    /// # Safety
    ///
    /// The caller must be the single consumer and must have observed
    /// [`is_ready`](Self::is_ready) for this offset.
    #[inline]
    pub(super) unsafe fn take(&self, offset: usize) -> T {
        let slot = &self.slots[offset];
        let value = unsafe { ptr::read((*slot.value.get()).as_ptr()) };
        slot.state.store(CONSUMED, Ordering::Relaxed);
        value
    }

    /// Links `new` as this segment's successor unless another producer beat
    /// us to it; returns the canonical successor either way.
    pub(super) fn try_link_next<'g>(
        &self,
        new: Owned<Self>,
        guard: &'g Guard,
    ) -> Shared<'g, Self> {
        match self.next.compare_exchange(
            Shared::null(),
            new,
            Ordering::AcqRel,
            Ordering::Acquire,
            guard,
        ) {
            Ok(linked) => linked,
            Err(lost) => {
                // The loser's allocation is redundant; the winner's segment
                // is the one the chain keeps.
                drop(lost.new);
                lost.current
            }
        }
    }
}

impl<T> Drop for Segment<T> {
    fn drop(&mut self) {
        // Exclusive access here. Values live only in READY slots: EMPTY never
        // held one and take() already moved CONSUMED ones out.
        for slot in &*self.slots {
            if slot.state.load(Ordering::Relaxed) == READY {
                unsafe {
                    ptr::drop_in_place((*slot.value.get()).as_mut_ptr());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_epoch as epoch;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn slots_start_empty() {
        let seg = Segment::<u64>::new(0, 8, Shared::null());
        for offset in 0..8 {
            assert!(!seg.is_ready(offset));
        }
    }

    #[test]
    fn write_publishes_value() {
        let seg = Segment::<u64>::new(0, 4, Shared::null());

        unsafe { seg.write(2, 42) };
        assert!(seg.is_ready(2));
        assert!(!seg.is_ready(1));

        assert_eq!(unsafe { seg.take(2) }, 42);
        assert!(!seg.is_ready(2));
    }

    #[test]
    fn link_next_decided_by_one_cas() {
        let guard = &epoch::pin();
        let seg = Segment::<u64>::new(0, 4, Shared::null());

        let winner = seg.try_link_next(Owned::new(Segment::new(4, 4, Shared::null())), guard);
        let rerun = seg.try_link_next(Owned::new(Segment::new(4, 4, Shared::null())), guard);
        assert_eq!(winner.as_raw(), rerun.as_raw());

        // The linked segment belongs to the chain; no mailbox manages this
        // one, so free it by hand.
        unsafe { drop(winner.into_owned()) };
    }

    struct DropCounter(Arc<AtomicUsize>);
    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn drop_releases_unconsumed_values() {
        let drops = Arc::new(AtomicUsize::new(0));
        let seg = Segment::new(0, 4, Shared::null());

        unsafe {
            seg.write(0, DropCounter(Arc::clone(&drops)));
            seg.write(1, DropCounter(Arc::clone(&drops)));
            seg.write(2, DropCounter(Arc::clone(&drops)));
        }

        // Consumed by hand; this value drops now, not with the segment.
        let taken = unsafe { seg.take(0) };
        drop(taken);
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        // Segment drop releases the two still-READY values and skips both
        // the consumed slot and the untouched one.
        drop(seg);
        assert_eq!(drops.load(Ordering::SeqCst), 3);
    }
}
