//! Per-node message queues with lease-based delivery.
//!
//! Each node in a running workflow owns one [`NodeMessageQueue`]: a typed
//! facade over a fixed-capacity [`CircularBuffer`] plus a coalescing signal
//! channel that wakes the node's worker. Messages that exhaust their retry
//! budget, or fail fatally, land in the shared [`DeadLetterQueue`].
//!
//! # Delivery contract
//!
//! - A message successfully enqueued is eventually either acknowledged or
//!   moved to the dead-letter queue (barring workflow cancellation).
//! - No message is processed by two workers concurrently: checkout grants a
//!   time-bounded lease, and an envelope becomes visible again only through
//!   acknowledge/requeue/dead-letter/lease-expiry recovery.
//! - FIFO among Ready envelopes of the same payload type; no cross-type
//!   ordering.

mod circular_buffer;
mod dead_letter;
mod node_queue;

pub use circular_buffer::CircularBuffer;
pub use dead_letter::{DeadLetterEntry, DeadLetterQueue};
pub use node_queue::{AbandonOutcome, LeasedMessage, NodeMessageQueue, QueueError};
