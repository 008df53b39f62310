//! Typed per-node queue facade with a coalescing wake-up channel.
//!
//! One `NodeMessageQueue` exists per node in a running workflow. It wraps
//! a [`CircularBuffer`], carries the node's visibility-timeout and
//! max-retries defaults, and owns a capacity-1 flume signal channel
//! (drop-new when full). Exactly one worker observes each successful
//! enqueue signal; because the channel coalesces, workers must re-check
//! queue state after a wake-up rather than assuming a token corresponds
//! to a specific message.

use chrono::Utc;
use miette::Diagnostic;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;

use crate::envelope::{EnvelopeStatus, MessageEnvelope};
use crate::messages::WorkflowMessage;
use crate::queue::{CircularBuffer, DeadLetterQueue};

/// Errors surfaced by queue operations.
#[derive(Debug, Error, Diagnostic)]
pub enum QueueError {
    /// The queue was closed because its workflow reached a terminal state.
    #[error("queue for node `{node_id}` is closed")]
    #[diagnostic(
        code(flowloom::queue::closed),
        help("The owning workflow reached a terminal state; no further messages are accepted.")
    )]
    Closed { node_id: String },
}

/// Outcome of [`NodeMessageQueue::abandon`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbandonOutcome {
    /// Retry budget remained; the envelope was requeued with back-off.
    Requeued,
    /// Budget exhausted; the envelope was moved to the dead-letter queue.
    DeadLettered,
}

/// A checked-out envelope held by a worker until completed, abandoned,
/// or dead-lettered.
#[derive(Clone, Debug)]
pub struct LeasedMessage {
    envelope: MessageEnvelope,
}

impl LeasedMessage {
    #[must_use]
    pub fn message_id(&self) -> &str {
        &self.envelope.message_id
    }

    #[must_use]
    pub fn payload(&self) -> &WorkflowMessage {
        &self.envelope.payload
    }

    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.envelope.retry_count
    }

    #[must_use]
    pub fn envelope(&self) -> &MessageEnvelope {
        &self.envelope
    }
}

/// Typed facade over one node's circular buffer.
pub struct NodeMessageQueue {
    node_id: String,
    buffer: CircularBuffer,
    visibility_timeout: Duration,
    max_retries: u32,
    dead_letter: Arc<DeadLetterQueue>,
    signal_tx: flume::Sender<()>,
    signal_rx: flume::Receiver<()>,
    closed: AtomicBool,
}

impl NodeMessageQueue {
    #[must_use]
    pub fn new(
        node_id: &str,
        capacity: usize,
        visibility_timeout: Duration,
        max_retries: u32,
        dead_letter: Arc<DeadLetterQueue>,
    ) -> Self {
        // Capacity-1, drop-new: one pending token is enough to wake the
        // worker, which re-scans the buffer anyway.
        let (signal_tx, signal_rx) = flume::bounded(1);
        Self {
            node_id: node_id.to_string(),
            buffer: CircularBuffer::new(capacity),
            visibility_timeout,
            max_retries,
            dead_letter,
            signal_tx,
            signal_rx,
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Receiver half of the coalescing signal channel, for the worker loop.
    #[must_use]
    pub fn signal(&self) -> flume::Receiver<()> {
        self.signal_rx.clone()
    }

    /// Wrap a message in a Ready envelope and enqueue it, then signal.
    pub fn enqueue(&self, message: Arc<WorkflowMessage>) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed {
                node_id: self.node_id.clone(),
            });
        }
        let envelope = MessageEnvelope::new(message, self.max_retries);
        self.buffer.enqueue(envelope);
        self.wake();
        Ok(())
    }

    /// Enqueue with deduplication: any queued envelope carrying the same
    /// key (Ready or InFlight) is superseded before the new one lands.
    pub fn enqueue_deduplicated(
        &self,
        message: Arc<WorkflowMessage>,
        dedupe_key: &str,
    ) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed {
                node_id: self.node_id.clone(),
            });
        }
        let envelope = MessageEnvelope::new(message, self.max_retries);
        self.buffer.replace(envelope, dedupe_key);
        self.wake();
        Ok(())
    }

    /// Claim the oldest eligible envelope of any known payload type.
    #[must_use]
    pub fn lease(&self, handler_id: &str) -> Option<LeasedMessage> {
        for type_name in WorkflowMessage::TYPE_NAMES {
            if let Some(envelope) =
                self.buffer
                    .checkout(type_name, handler_id, self.visibility_timeout)
            {
                return Some(LeasedMessage { envelope });
            }
        }
        None
    }

    /// Acknowledge a lease; the message is done.
    pub fn complete(&self, lease: &LeasedMessage) -> bool {
        self.buffer.acknowledge(lease.message_id())
    }

    /// Give up the current attempt. While retry budget remains the
    /// envelope is requeued invisible for one visibility timeout; once
    /// the incremented retry count exceeds the budget it is removed and
    /// dead-lettered.
    pub fn abandon(&self, lease: &LeasedMessage) -> AbandonOutcome {
        let attempted = lease.retry_count() + 1;
        if attempted > self.max_retries {
            if let Some(envelope) = self.buffer.remove(lease.message_id()) {
                self.dead_letter.push(
                    envelope,
                    format!(
                        "message for node `{}` exceeded max retries ({})",
                        self.node_id, self.max_retries
                    ),
                    None,
                );
            }
            AbandonOutcome::DeadLettered
        } else {
            let not_before = Utc::now()
                + chrono::Duration::from_std(self.visibility_timeout).unwrap_or_default();
            self.buffer.requeue(lease.message_id(), Some(not_before));
            self.wake();
            AbandonOutcome::Requeued
        }
    }

    /// Fatal path: remove the envelope and dead-letter it without retry.
    pub fn move_to_dead_letter(&self, lease: &LeasedMessage, reason: impl Into<String>) {
        if let Some(envelope) = self.buffer.remove(lease.message_id()) {
            self.dead_letter.push(envelope, reason, None);
        }
    }

    /// Restore an envelope verbatim (status and lease preserved) from a
    /// checkpoint. Signals the worker iff the envelope is Ready and
    /// currently visible.
    pub fn restore_from_checkpoint(&self, envelope: MessageEnvelope) {
        let should_signal =
            envelope.status == EnvelopeStatus::Ready && envelope.is_eligible(Utc::now());
        self.buffer.restore(envelope);
        if should_signal {
            self.wake();
        }
    }

    /// Snapshot of pending envelopes for checkpointing.
    #[must_use]
    pub fn pending(&self) -> Vec<MessageEnvelope> {
        self.buffer.get_all()
    }

    /// Count of live (Ready or InFlight) envelopes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Stop accepting messages; used once the workflow is terminal.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn wake(&self) {
        // Drop-new semantics: a full channel already guarantees a wake-up.
        let _ = self.signal_tx.try_send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::NodeExecutionContext;
    use crate::messages::{NodeCompleteMessage, NodeFailMessage};

    fn queue(max_retries: u32) -> NodeMessageQueue {
        NodeMessageQueue::new(
            "worker",
            16,
            Duration::from_millis(50),
            max_retries,
            Arc::new(DeadLetterQueue::new(16)),
        )
    }

    fn complete_msg() -> Arc<WorkflowMessage> {
        Arc::new(WorkflowMessage::NodeComplete(NodeCompleteMessage::new(
            "src",
            "",
            NodeExecutionContext::new(),
        )))
    }

    #[test]
    fn enqueue_signals_once_and_coalesces() {
        let q = queue(3);
        q.enqueue(complete_msg()).unwrap();
        q.enqueue(complete_msg()).unwrap();
        q.enqueue(complete_msg()).unwrap();

        let rx = q.signal();
        assert!(rx.try_recv().is_ok());
        // Tokens coalesced; at most one was pending.
        assert!(rx.try_recv().is_err());
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn lease_complete_roundtrip() {
        let q = queue(3);
        q.enqueue(complete_msg()).unwrap();
        let lease = q.lease("w1").unwrap();
        assert_eq!(lease.payload().type_name(), "NodeComplete");
        assert!(q.complete(&lease));
        assert!(q.is_empty());
    }

    #[test]
    fn lease_scans_all_payload_types() {
        let q = queue(3);
        q.enqueue(Arc::new(WorkflowMessage::NodeFail(NodeFailMessage::new(
            "src", "boom",
        ))))
        .unwrap();
        let lease = q.lease("w1").unwrap();
        assert_eq!(lease.payload().type_name(), "NodeFail");
    }

    #[test]
    fn abandon_requeues_until_budget_then_dead_letters() {
        let dlq = Arc::new(DeadLetterQueue::new(16));
        let q = NodeMessageQueue::new("flaky", 16, Duration::from_millis(0), 1, dlq.clone());
        q.enqueue(complete_msg()).unwrap();

        let lease = q.lease("w1").unwrap();
        assert_eq!(q.abandon(&lease), AbandonOutcome::Requeued);
        assert!(dlq.is_empty());

        let lease = q.lease("w1").unwrap();
        assert_eq!(lease.retry_count(), 1);
        assert_eq!(q.abandon(&lease), AbandonOutcome::DeadLettered);
        assert_eq!(dlq.len(), 1);
        assert!(dlq.list()[0].reason.contains("exceeded max retries"));
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn move_to_dead_letter_skips_retry() {
        let dlq = Arc::new(DeadLetterQueue::new(16));
        let q = NodeMessageQueue::new("fatal", 16, Duration::from_millis(50), 5, dlq.clone());
        q.enqueue(complete_msg()).unwrap();
        let lease = q.lease("w1").unwrap();
        q.move_to_dead_letter(&lease, "Failed to construct node `fatal`");
        assert_eq!(dlq.len(), 1);
        assert!(q.is_empty());
    }

    #[test]
    fn deduplicated_enqueue_supersedes_older_copies() {
        let q = queue(3);
        q.enqueue_deduplicated(complete_msg(), "progress/src").unwrap();
        q.enqueue_deduplicated(complete_msg(), "progress/src").unwrap();
        q.enqueue_deduplicated(complete_msg(), "progress/src").unwrap();
        // Only the newest copy is live; older ones are superseded.
        assert_eq!(q.len(), 1);
        let lease = q.lease("w1").unwrap();
        assert!(q.complete(&lease));
        assert!(q.lease("w1").is_none());
    }

    #[test]
    fn closed_queue_rejects_enqueue() {
        let q = queue(3);
        q.close();
        assert!(matches!(
            q.enqueue(complete_msg()),
            Err(QueueError::Closed { .. })
        ));
    }

    #[test]
    fn restore_ready_signals_worker() {
        let q = queue(3);
        let envelope = MessageEnvelope::new(complete_msg(), 3);
        q.restore_from_checkpoint(envelope);
        assert!(q.signal().try_recv().is_ok());
        assert_eq!(q.len(), 1);
    }
}
