//! Linked unbounded MPSC mailbox.
//!
//! The footprint-first sibling of [`segmented`](crate::segmented): one node
//! per value, two words of standing state, nothing allocated up front. An
//! idle mailbox is a placeholder node and two pointers, which matters when
//! hundreds of thousands of mailboxes sit empty at once. The trade is one
//! allocation per send and a pointer chase per poll, where the segmented
//! mailbox amortizes both across a block.
//!
//! # Example
//!
//! ```
//! use carrier_mailbox::linked;
//! use std::thread;
//!
//! let (tx, mut rx) = linked::mailbox::<u64>();
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
//! # Design
//!
//! A singly linked chain headed by a spent placeholder node. Producers
//! append in two steps: swap the write end to the new node, then link the
//! old end forward. The swap serializes appends, so delivery order is the
//! swap order. The consumer follows `next` from the placeholder, takes the
//! value out of the successor, and the successor becomes the new
//! placeholder.
//!
//! ```text
//!  read                                          write
//!    │                                             │
//!    v                                             v
//! ┌───────┐  next   ┌───────┐  next   ┌───────┐
//! │ spent │ ------> │ v = 7 │ ------> │ v = 8 │ --> null
//! └───────┘         └───────┘         └───────┘
//! ```
//!
//! A poll that lands between a producer's two steps can find the chain
//! mid-link and report empty; the value is visible as soon as that producer
//! finishes its second store. Callers that schedule work on send rather
//! than spin on poll never notice.

use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, Ordering};

use crossbeam_utils::CachePadded;

/// Creates an unbounded linked mailbox.
///
/// # Example
///
/// ```
/// use carrier_mailbox::linked;
///
/// let (tx, mut rx) = linked::mailbox();
///
/// tx.send("wake up");
/// assert_eq!(rx.poll(), Some("wake up"));
/// assert_eq!(rx.poll(), None);
/// ```
pub fn mailbox<T>() -> (Sender<T>, Receiver<T>) {
    let placeholder = Box::into_raw(Box::new(Node::<T> {
        next: AtomicPtr::new(ptr::null_mut()),
        value: UnsafeCell::new(MaybeUninit::uninit()),
    }));

    let inner = Arc::new(Inner {
        write: CachePadded::new(AtomicPtr::new(placeholder)),
        read_head: AtomicPtr::new(ptr::null_mut()),
    });

    let receiver = Receiver {
        inner: Arc::clone(&inner),
        read: placeholder,
    };

    (Sender { inner }, receiver)
}

/// One value in the chain. The head node's value slot is always spent.
struct Node<T> {
    next: AtomicPtr<Node<T>>,
    value: UnsafeCell<MaybeUninit<T>>,
}

struct Inner<T> {
    /// The newest node. Producers contend here and nowhere else.
    write: CachePadded<AtomicPtr<Node<T>>>,
    /// The receiver's placeholder, published by `Receiver::drop` so
    /// teardown knows where the undrained chain begins.
    read_head: AtomicPtr<Node<T>>,
}

// Safety: the chain is accessed through atomics; each value is written
// before its node is linked and moved out exactly once, by the single
// consumer or by teardown, which the refcount serializes.
unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let head = *self.read_head.get_mut();
        if head.is_null() {
            return;
        }

        // Last handle gone, access is exclusive, and no producer is
        // mid-append, so the chain is fully linked. The head's value slot
        // is spent; every node after it holds a live value.
        unsafe {
            let mut head = Box::from_raw(head);
            let mut next = *head.next.get_mut();
            drop(head);

            while !next.is_null() {
                let mut node = Box::from_raw(next);
                node.value.get_mut().assume_init_drop();
                next = *node.next.get_mut();
                drop(node);
            }
        }
    }
}

/// The sending half of a linked mailbox.
///
/// Clones freely; all clones feed the same receiver.
pub struct Sender<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Sender<T> {
    /// Enqueues `value` for the receiver.
    ///
    /// Never blocks and never fails; one allocation, one swap, one store.
    ///
    /// # Example
    ///
    /// ```
    /// use carrier_mailbox::linked;
    ///
    /// let (tx, mut rx) = linked::mailbox();
    /// tx.send(String::from("ping"));
    /// assert_eq!(rx.poll().as_deref(), Some("ping"));
    /// ```
    #[inline]
    pub fn send(&self, value: T) {
        let node = Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            value: UnsafeCell::new(MaybeUninit::new(value)),
        }));

        // The swap hands each producer exactly one predecessor, so every
        // node gains exactly one forward link.
        let prev = self.inner.write.swap(node, Ordering::AcqRel);

        // Safety: `prev` was the newest node, so its link is still null and
        // the consumer cannot have freed it; the consumer frees a node only
        // after loading a non-null link out of it.
        unsafe { (*prev).next.store(node, Ordering::Release) };
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
        f.debug_struct("Sender").finish_non_exhaustive()
    }
}

/// The receiving half of a linked mailbox.
///
/// There is exactly one: it cannot be cloned, and it is deliberately not
/// `Sync`, so a second concurrent consumer cannot be expressed.
pub struct Receiver<T> {
    inner: Arc<Inner<T>>,

    /// The placeholder node. Only this receiver frees chain nodes, so the
    /// pointee is live until `poll` replaces it.
    read: *mut Node<T>,
}

// Safety: the receiver owns the placeholder pointer outright; moving it to
// another thread moves that ownership wholesale. It stays !Sync on purpose.
unsafe impl<T: Send> Send for Receiver<T> {}

impl<T> Receiver<T> {
    /// Returns the oldest value, or `None` if none is linked in.
    ///
    /// Values come back in the order their sends serialized. A send caught
    /// between its two steps is not yet visible, so `None` here does not
    /// prove the mailbox has quiesced; see the module docs.
    ///
    /// # Example
    ///
    /// ```
    /// use carrier_mailbox::linked;
    ///
    /// let (tx, mut rx) = linked::mailbox();
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
        // Safety: the placeholder is live until this receiver replaces it,
        // and a linked successor's value is fully written.
        unsafe {
            let head = self.read;
            let next = (*head).next.load(Ordering::Acquire);
            if next.is_null() {
                return None;
            }

            let value = (*(*next).value.get()).assume_init_read();

            // The successor is the new placeholder, its value slot now
            // spent. Nothing can reach the old one.
            drop(Box::from_raw(head));
            self.read = next;

            Some(value)
        }
    }

    /// Returns whether no value is linked in. Advisory: concurrent sends
    /// invalidate the answer immediately, and a mid-link send is not
    /// counted yet.
    ///
    /// # Example
    ///
    /// ```
    /// use carrier_mailbox::linked;
    ///
    /// let (tx, rx) = linked::mailbox();
    /// assert!(rx.is_empty());
    ///
    /// tx.send(9);
    /// assert!(!rx.is_empty());
    /// ```
    #[inline]
    pub fn is_empty(&self) -> bool {
        // Safety: the placeholder is live while this receiver is.
        unsafe { (*self.read).next.load(Ordering::Acquire).is_null() }
    }

    /// Returns whether at least one value is linked in. Advisory, like
    /// [`is_empty`](Self::is_empty).
    #[inline]
    pub fn non_empty(&self) -> bool {
        !self.is_empty()
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        // Hand the placeholder to teardown. The refcount release that
        // follows is the synchronization edge.
        self.inner.read_head.store(self.read, Ordering::Relaxed);
    }
}

impl<T> fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("is_empty", &self.is_empty())
            .finish_non_exhaustive()
    }
}
