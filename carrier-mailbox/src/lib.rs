//! # carrier-mailbox
//!
//! Unbounded lock-free MPSC mailbox queues for actor and fiber runtimes,
//! where every task owns an inbox and most inboxes are quiet.
//!
//! ## Features
//!
//! - **Segmented**: block-allocated mailbox with strict delivery order and
//!   amortized allocation
//! - **Linked**: node-per-value mailbox with a two-word idle footprint
//!
//! ## Design Goals
//!
//! - One atomic reservation per send on the hot path
//! - Delivery in exactly the order sends serialized
//! - No locks, no syscalls, bounded retries under contention
//! - Cache-line isolation between the contended producer atomics
//! - Safe teardown from either side, in any order, without leaking values
//!
//! ## Example
//!
//! ```
//! use carrier_mailbox::segmented;
//!
//! let (tx, mut rx) = segmented::mailbox::<u64>();
//!
//! // Send from any number of threads
//! tx.send(42);
//!
//! // One consumer drains in send order
//! assert_eq!(rx.poll(), Some(42));
//! assert_eq!(rx.poll(), None);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod linked;
pub mod segmented;
