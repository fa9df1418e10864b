//! Segmented unbounded MPSC mailbox.
//!
//! Any number of producers send concurrently; exactly one consumer polls.
//! A send reserves a global index with one `fetch_add`, finds the segment
//! that owns the index starting from a shared hint pointer, and publishes
//! the value with a release store into that segment's slot. The consumer
//! walks the chain in index order and retires each segment once it is fully
//! drained. Values travel in fixed-capacity blocks, so the common send
//! touches no allocator and the consumer reads contiguous memory.
//!
//! # Example
//!
//! ```
//! use carrier_mailbox::segmented;
//! use std::thread;
//!
//! let (tx, mut rx) = segmented::mailbox::<u64>();
//! let tx2 = tx.clone();
//!
//! let h1 = thread::spawn(move || {
//!     for i in 0..100 {
//!         tx.send(i);
//!     }
//! });
//! let h2 = thread::spawn(move || {
//!     for i in 100..200 {
//!         tx2.send(i);
//!     }
//! });
//!
//! let mut received = 0;
//! while received < 200 {
//!     if rx.poll().is_some() {
//!         received += 1;
//!     }
//! }
//!
//! h1.join().unwrap();
//! h2.join().unwrap();
//! assert!(rx.is_empty());
//! ```
//!
//! # How a send finds its slot
//!
//! ```text
//! counter: fetch_add -> index i
//!
//! write_hint
//!     │
//!     v
//! ┌──────────┐   next   ┌──────────┐   next   ┌───────────┐
//! │ start 64 │ -------> │ start 96 │ -------> │ start 128 │ --> null
//! └──────────┘ <------- └──────────┘ <------- └───────────┘
//!                 prev                  prev
//!
//! i <  start:            walk prev (the hint overshot)
//! i >= start + capacity: walk next, or link a fresh segment
//! otherwise:             write the slot at offset i - start
//! ```
//!
//! The hint may lag the true tail arbitrarily; it is corrected by walking,
//! never trusted. A producer that writes the grow-threshold offset of its
//! segment pre-links the successor, so the chain usually grows off the
//! senders' hot path. The hint only ever moves forward along the chain.
//!
//! # Ordering and waiting
//!
//! Delivery order is exactly reservation order. The consumer never returns a
//! later value over an earlier one still in flight: it waits, with bounded
//! backoff, for the single store owed at its position. That wait is limited
//! by one producer's store latency, not by queue depth. `send` never waits
//! for the consumer; segment-link races cost a bounded number of CAS
//! retries.
//!
//! # Memory reclamation
//!
//! Drained segments are handed to `crossbeam-epoch`. Producers pin for the
//! duration of a send and dereference chain pointers only while pinned. The
//! consumer swings the hint past a drained segment before deferring its
//! destruction, so a newly pinned producer cannot reach it through the
//! hint, and a pinned straggler keeps it alive through the grace period.
//! Pinning also rules out address reuse under the hint CAS.
//!
//! # Performance notes
//!
//! The counter and the hint sit on their own cache lines; the rest of the
//! shared state is per-segment and written once. A send is one `fetch_add`,
//! an epoch pin, and one release store in the common case.

mod segment;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use crossbeam_utils::{Backoff, CachePadded};

use segment::Segment;

/// Slots per segment used by [`mailbox`].
pub const DEFAULT_SEGMENT_CAPACITY: usize = 32;

/// Grow threshold used by [`mailbox`]: writing this offset pre-links the
/// next segment.
pub const DEFAULT_GROW_THRESHOLD: usize = 16;

/// Creates an unbounded mailbox with the default segment geometry.
///
/// # Example
///
/// ```
/// use carrier_mailbox::segmented;
///
/// let (tx, mut rx) = segmented::mailbox();
///
/// tx.send("wake up");
/// assert_eq!(rx.poll(), Some("wake up"));
/// assert_eq!(rx.poll(), None);
/// ```
pub fn mailbox<T>() -> (Sender<T>, Receiver<T>) {
    mailbox_with_config(DEFAULT_SEGMENT_CAPACITY, DEFAULT_GROW_THRESHOLD)
}

/// Creates an unbounded mailbox with `capacity` slots per segment, growing
/// eagerly once a producer writes the `grow_threshold` offset.
///
/// Small segments reclaim memory sooner; large segments amortize allocation
/// over more sends. A lower threshold hides more allocation latency at the
/// cost of running slightly ahead on memory.
///
/// # Panics
///
/// Panics if `capacity` is zero or if `grow_threshold` is not below
/// `capacity`.
///
/// # Example
///
/// ```
/// use carrier_mailbox::segmented;
///
/// let (tx, mut rx) = segmented::mailbox_with_config(128, 64);
/// assert_eq!(tx.capacity(), 128);
///
/// tx.send(1u32);
/// assert_eq!(rx.poll(), Some(1));
/// ```
pub fn mailbox_with_config<T>(capacity: usize, grow_threshold: usize) -> (Sender<T>, Receiver<T>) {
    assert!(capacity > 0, "segment capacity must be non-zero");
    assert!(
        grow_threshold < capacity,
        "grow threshold must lie within the segment (0..capacity)"
    );

    let inner = Arc::new(Inner {
        counter: CachePadded::new(AtomicU64::new(0)),
        write_hint: CachePadded::new(Atomic::null()),
        capacity,
        grow_threshold,
        read_segment: Atomic::null(),
    });

    // Safety: nothing is shared yet; handing the first segment to the chain
    // needs no pin.
    let first = Owned::new(Segment::new(0, capacity, Shared::null()))
        .into_shared(unsafe { epoch::unprotected() });
    inner.write_hint.store(first, Ordering::Relaxed);

    let receiver = Receiver {
        inner: Arc::clone(&inner),
        read: first.as_raw(),
        cursor: 0,
    };

    (Sender { inner }, receiver)
}

/// State shared by every handle of one mailbox.
struct Inner<T> {
    /// Next global index to reserve. Monotone, dense: every `fetch_add`
    /// result names exactly one slot in the chain.
    counter: CachePadded<AtomicU64>,
    /// Producers' segment search origin. May lag the tail, never leads it,
    /// and only ever moves forward.
    write_hint: CachePadded<Atomic<Segment<T>>>,
    /// Slots per segment.
    capacity: usize,
    /// In-segment offset whose write pre-links the successor.
    grow_threshold: usize,
    /// The receiver's final segment, published by `Receiver::drop` so
    /// teardown knows where the undrained chain begins.
    read_segment: Atomic<Segment<T>>,
}

// Safety: all cross-thread chain state is accessed through atomics; slot
// values are published by release stores and moved out exactly once, either
// by the single consumer or by teardown, which the refcount serializes.
unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

impl<T> Inner<T> {
    /// Steps past a full segment, linking a fresh one if the chain ends
    /// here. Returns the canonical successor.
    #[cold]
    fn advance_tail<'g>(
        &self,
        seg: Shared<'g, Segment<T>>,
        corrected: bool,
        guard: &'g Guard,
    ) -> Shared<'g, Segment<T>> {
        // Safety: pinned, and `seg` was reached through the live chain.
        let s = unsafe { seg.deref() };

        let next = s.next.load(Ordering::Acquire, guard);
        let resolved = if next.is_null() {
            let fresh = Owned::new(Segment::new(
                s.start + self.capacity as u64,
                self.capacity,
                seg,
            ));
            s.try_link_next(fresh, guard)
        } else {
            next
        };

        if !corrected {
            // Only producers that never walked backward may swing the hint,
            // and a swing installs the successor of a segment the consumer
            // has not retired, so the hint stays monotone and never lands on
            // a deferred segment. Failure means someone else moved it.
            let _ = self.write_hint.compare_exchange(
                seg,
                resolved,
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            );
        }

        resolved
    }

    /// Pre-links the successor of `seg` so the boundary crossing stays off
    /// the senders' hot path. Losing the race just discards the allocation.
    #[cold]
    fn grow_ahead<'g>(&self, seg: Shared<'g, Segment<T>>, guard: &'g Guard) {
        // Safety: pinned, and `seg` was reached through the live chain.
        let s = unsafe { seg.deref() };
        if s.next.load(Ordering::Relaxed, guard).is_null() {
            let fresh = Owned::new(Segment::new(
                s.start + self.capacity as u64,
                self.capacity,
                seg,
            ));
            let _ = s.try_link_next(fresh, guard);
        }
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        // Last handle gone, access is exclusive. Walk what is left of the
        // chain from the receiver's final position, dropping unpolled
        // values. Segments the receiver already retired went through the
        // collector and are not reachable from here.
        unsafe {
            let guard = epoch::unprotected();
            let mut seg = self.read_segment.load(Ordering::Relaxed, guard);
            while !seg.is_null() {
                let next = seg.deref().next.load(Ordering::Relaxed, guard);
                drop(seg.into_owned());
                seg = next;
            }
        }
    }
}

/// The sending half of a mailbox.
///
/// Clones freely; all clones feed the same receiver.
pub struct Sender<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Sender<T> {
    /// Enqueues `value` for the receiver.
    ///
    /// Never blocks and never fails: the chain grows as needed, and a
    /// mailbox whose receiver is gone still accepts values (they are
    /// released when the last handle drops).
    ///
    /// # Example
    ///
    /// ```
    /// use carrier_mailbox::segmented;
    ///
    /// let (tx, mut rx) = segmented::mailbox();
    /// tx.send(String::from("ping"));
    /// assert_eq!(rx.poll().as_deref(), Some("ping"));
    /// ```
    #[inline]
    pub fn send(&self, value: T) {
        let inner = &*self.inner;

        // The reservation fixes this value's delivery position; everything
        // after is finding the slot it names.
        let index = inner.counter.fetch_add(1, Ordering::Relaxed);

        let guard = epoch::pin();
        let mut seg = inner.write_hint.load(Ordering::Acquire, &guard);
        let mut corrected = false;

        loop {
            // Safety: chain pointers stay valid while pinned; see the module
            // docs on reclamation.
            let s = unsafe { seg.deref() };

            if index < s.start {
                // The hint overshot this reservation; back up. Predecessors
                // exist whenever start > 0.
                seg = s.prev.load(Ordering::Relaxed, &guard);
                corrected = true;
                continue;
            }

            let offset = (index - s.start) as usize;
            if offset >= inner.capacity {
                seg = inner.advance_tail(seg, corrected, &guard);
                continue;
            }

            // Safety: `index` is uniquely reserved, so this slot is written
            // exactly once.
            unsafe { s.write(offset, value) };

            // Eager growth is reserved for producers plausibly extending the
            // true tail; one that walked backward is not.
            if offset == inner.grow_threshold && !corrected {
                inner.grow_ahead(seg, &guard);
            }
            return;
        }
    }

    /// Returns the number of slots per segment.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("capacity", &self.capacity())
            .finish_non_exhaustive()
    }
}

/// The receiving half of a mailbox.
///
/// There is exactly one: it cannot be cloned, and it is deliberately not
/// `Sync`, so a second concurrent consumer cannot be expressed.
pub struct Receiver<T> {
    inner: Arc<Inner<T>>,

    /// Oldest segment with unconsumed slots. Only this receiver retires
    /// segments, so the pointee is live until `advance_segment` replaces it.
    read: *const Segment<T>,
    /// Offset of the oldest unconsumed slot within `read`.
    cursor: usize,
}

// Safety: the receiver owns its cursor and segment pointer outright; moving
// it to another thread moves that ownership wholesale. It stays !Sync on
// purpose: even the advisory queries are consumer-side operations.
unsafe impl<T: Send> Send for Receiver<T> {}

impl<T> Receiver<T> {
    /// Returns the oldest value, or `None` if nothing is reserved past the
    /// read position.
    ///
    /// Values come back exactly in send order. If the oldest reservation's
    /// store is still in flight, this waits it out with bounded backoff
    /// rather than returning a later value first; the wait is limited by
    /// that one store, never by queue depth.
    ///
    /// # Example
    ///
    /// ```
    /// use carrier_mailbox::segmented;
    ///
    /// let (tx, mut rx) = segmented::mailbox();
    ///
    /// tx.send(1);
    /// tx.send(2);
    ///
    /// assert_eq!(rx.poll(), Some(1));
    /// assert_eq!(rx.poll(), Some(2));
    /// assert_eq!(rx.poll(), None);
    /// ```
    #[inline]
    pub fn poll(&mut self) -> Option<T> {
        loop {
            // Safety: the read segment is live until we retire it below.
            let seg = unsafe { &*self.read };
            let position = seg.start + self.cursor as u64;

            // Nothing reserved at or past our position: truly empty.
            if position == self.inner.counter.load(Ordering::Acquire) {
                return None;
            }

            if self.cursor == self.inner.capacity {
                self.advance_segment(seg);
                continue;
            }

            if !seg.is_ready(self.cursor) {
                self.wait_for_slot(seg);
            }

            // Safety: READY was observed with acquire and we are the only
            // consumer, so the slot holds an unread value.
            let value = unsafe { seg.take(self.cursor) };
            self.cursor += 1;
            return Some(value);
        }
    }

    /// Returns whether nothing is waiting. Advisory: a concurrent send can
    /// invalidate the answer immediately.
    ///
    /// # Example
    ///
    /// ```
    /// use carrier_mailbox::segmented;
    ///
    /// let (tx, rx) = segmented::mailbox();
    /// assert!(rx.is_empty());
    ///
    /// tx.send(9);
    /// assert!(!rx.is_empty());
    /// ```
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.position() == self.inner.counter.load(Ordering::Acquire)
    }

    /// Returns whether at least one value is reserved for this receiver.
    /// Advisory, like [`is_empty`](Self::is_empty); once a value is present
    /// and unconsumed, only `poll` can make this `false` again.
    #[inline]
    pub fn non_empty(&self) -> bool {
        !self.is_empty()
    }

    /// Returns how many values are reserved but not yet polled, counting
    /// sends whose store is still in flight.
    ///
    /// # Example
    ///
    /// ```
    /// use carrier_mailbox::segmented;
    ///
    /// let (tx, mut rx) = segmented::mailbox();
    ///
    /// tx.send('a');
    /// tx.send('b');
    /// assert_eq!(rx.len(), 2);
    ///
    /// rx.poll();
    /// assert_eq!(rx.len(), 1);
    /// ```
    #[inline]
    pub fn len(&self) -> usize {
        (self.inner.counter.load(Ordering::Acquire) - self.position()) as usize
    }

    /// Returns the number of slots per segment.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Absolute index of the oldest unconsumed slot.
    #[inline]
    fn position(&self) -> u64 {
        // Safety: the read segment is live until this receiver retires it.
        let seg = unsafe { &*self.read };
        seg.start + self.cursor as u64
    }

    /// Spins with bounded backoff until the producer that reserved the
    /// current slot finishes its store.
    #[cold]
    fn wait_for_slot(&self, seg: &Segment<T>) {
        let backoff = Backoff::new();
        while !seg.is_ready(self.cursor) {
            backoff.snooze();
        }
    }

    /// Moves to the successor segment and retires the drained one. A missing
    /// link here means its producer is mid-growth: something is reserved
    /// past this segment, so the link is owed and the wait is bounded.
    #[cold]
    fn advance_segment(&mut self, seg: &Segment<T>) {
        let guard = epoch::pin();

        let backoff = Backoff::new();
        let next = loop {
            let next = seg.next.load(Ordering::Acquire, &guard);
            if !next.is_null() {
                break next;
            }
            backoff.snooze();
        };

        let retired: Shared<'_, Segment<T>> = Shared::from(self.read);

        // Unlink from the producers' search path first: once the hint is
        // past this segment, no newly pinned producer can reach it.
        let _ = self.inner.write_hint.compare_exchange(
            retired,
            next,
            Ordering::AcqRel,
            Ordering::Acquire,
            &guard,
        );

        // Safety: every slot here is consumed, so no producer still owes a
        // store, and unwritten reservations all sit at or past `next.start`.
        // Pinned walkers that entered before the hint moved are covered by
        // the grace period.
        unsafe { guard.defer_destroy(retired) };

        self.read = next.as_raw();
        self.cursor = 0;
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        // Hand the final read position to teardown. The refcount release
        // that follows is the synchronization edge.
        self.inner
            .read_segment
            .store(Shared::from(self.read), Ordering::Relaxed);
    }
}

impl<T> fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
