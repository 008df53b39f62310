//! Fixed-capacity envelope store with a lease state machine.
//!
//! The buffer is the sole correctness-critical shared structure in the
//! queueing layer: every envelope status transition happens under its one
//! internal mutex, and no lock is ever held across node execution.
//!
//! Eviction policy on a full buffer: Superseded tombstones first, then the
//! oldest Ready envelope, and only if every slot is InFlight the oldest
//! slot outright. Callers must tolerate loss of very-old unprocessed
//! signals; unbounded growth is not allowed.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;

use crate::envelope::{EnvelopeStatus, MessageEnvelope};

/// Linear back-off step applied per retry during lease-expiry recovery.
const RETRY_BACKOFF_STEP: Duration = Duration::from_secs(2);

/// Fixed-capacity in-memory queue of [`MessageEnvelope`]s with lease
/// semantics.
///
/// All operations take the internal mutex; readers (`len`, `get_all`)
/// included. Ordering among Ready envelopes of the same type is FIFO by
/// `enqueued_at`, ties broken by insertion sequence.
pub struct CircularBuffer {
    inner: Mutex<BufferInner>,
}

struct BufferInner {
    slots: VecDeque<MessageEnvelope>,
    capacity: usize,
    next_sequence: u64,
}

impl CircularBuffer {
    /// Create a buffer holding at most `capacity` envelopes. Capacity is
    /// clamped to at least 1.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(BufferInner {
                slots: VecDeque::with_capacity(capacity.max(1)),
                capacity: capacity.max(1),
                next_sequence: 0,
            }),
        }
    }

    /// Insert an envelope at the write head, evicting if full.
    pub fn enqueue(&self, mut envelope: MessageEnvelope) -> bool {
        let mut inner = self.inner.lock();
        envelope.sequence = inner.bump_sequence();
        inner.make_room();
        inner.slots.push_back(envelope);
        true
    }

    /// Claim the oldest eligible envelope of the given payload type.
    ///
    /// Before scanning, performs just-in-time recovery: every InFlight
    /// envelope whose lease has lapsed is either returned to Ready with an
    /// incremented retry count and a linear back-off (`retry_count * 2s`),
    /// or, once the retry budget is spent, marked Superseded.
    pub fn checkout(
        &self,
        message_type: &str,
        handler_id: &str,
        lease_duration: Duration,
    ) -> Option<MessageEnvelope> {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        inner.recover_expired(now);

        let candidate = inner
            .slots
            .iter_mut()
            .filter(|env| env.message_type == message_type && env.is_eligible(now))
            .min_by_key(|env| (env.enqueued_at, env.sequence))?;
        candidate.check_out(handler_id, lease_duration);
        Some(candidate.clone())
    }

    /// Acknowledge an InFlight envelope; the slot is reclaimed. Returns
    /// `true` if the envelope was found in flight.
    pub fn acknowledge(&self, message_id: &str) -> bool {
        let mut inner = self.inner.lock();
        let Some(idx) = inner.position_of(message_id) else {
            return false;
        };
        if inner.slots[idx].status != EnvelopeStatus::InFlight {
            return false;
        }
        inner.slots[idx].status = EnvelopeStatus::Completed;
        inner.slots.remove(idx);
        true
    }

    /// Transition an InFlight envelope back to Ready, clearing its lease
    /// and bumping the retry count. Returns `true` on success.
    pub fn requeue(&self, message_id: &str, not_before: Option<DateTime<Utc>>) -> bool {
        let mut inner = self.inner.lock();
        let Some(idx) = inner.position_of(message_id) else {
            return false;
        };
        if inner.slots[idx].status != EnvelopeStatus::InFlight {
            return false;
        }
        inner.slots[idx].requeue(not_before);
        true
    }

    /// Supersede any envelope carrying the deduplication key (Ready or
    /// InFlight) and enqueue the replacement tagged with that key.
    pub fn replace(&self, envelope: MessageEnvelope, dedupe_key: &str) {
        let mut inner = self.inner.lock();
        for env in inner
            .slots
            .iter_mut()
            .filter(|env| env.dedupe_key.as_deref() == Some(dedupe_key))
        {
            if matches!(env.status, EnvelopeStatus::Ready | EnvelopeStatus::InFlight) {
                env.status = EnvelopeStatus::Superseded;
            }
        }
        let mut envelope = envelope.with_dedupe_key(dedupe_key);
        envelope.sequence = inner.bump_sequence();
        inner.make_room();
        inner.slots.push_back(envelope);
    }

    /// Remove an envelope regardless of status (dead-letter path).
    pub fn remove(&self, message_id: &str) -> Option<MessageEnvelope> {
        let mut inner = self.inner.lock();
        let idx = inner.position_of(message_id)?;
        inner.slots.remove(idx)
    }

    /// Re-insert an envelope preserving its status and lease verbatim.
    /// Used by checkpoint restore; InFlight snapshots flow through the
    /// just-in-time recovery on the next checkout.
    pub fn restore(&self, mut envelope: MessageEnvelope) {
        let mut inner = self.inner.lock();
        envelope.sequence = inner.bump_sequence();
        inner.make_room();
        inner.slots.push_back(envelope);
    }

    /// Snapshot of all non-Completed envelopes.
    #[must_use]
    pub fn get_all(&self) -> Vec<MessageEnvelope> {
        self.inner
            .lock()
            .slots
            .iter()
            .filter(|env| env.status != EnvelopeStatus::Completed)
            .cloned()
            .collect()
    }

    /// Count of live (Ready or InFlight) envelopes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .slots
            .iter()
            .filter(|env| {
                matches!(env.status, EnvelopeStatus::Ready | EnvelopeStatus::InFlight)
            })
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total slot usage including tombstones. Never exceeds capacity.
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.inner.lock().slots.len()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }
}

impl BufferInner {
    fn bump_sequence(&mut self) -> u64 {
        let seq = self.next_sequence;
        self.next_sequence += 1;
        seq
    }

    fn position_of(&self, message_id: &str) -> Option<usize> {
        self.slots.iter().position(|env| env.message_id == message_id)
    }

    /// Free one slot if the buffer is at capacity.
    fn make_room(&mut self) {
        if self.slots.len() < self.capacity {
            return;
        }
        // Tombstones are free to drop.
        if let Some(idx) = self
            .slots
            .iter()
            .position(|env| env.status == EnvelopeStatus::Superseded)
        {
            self.slots.remove(idx);
            return;
        }
        // Oldest Ready envelope next (FIFO eviction).
        if let Some((idx, _)) = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, env)| env.status == EnvelopeStatus::Ready)
            .min_by_key(|(_, env)| (env.enqueued_at, env.sequence))
        {
            let evicted = self.slots.remove(idx);
            if let Some(env) = evicted {
                tracing::warn!(
                    target: "flowloom::queue",
                    message_id = %env.message_id,
                    message_type = %env.message_type,
                    "buffer full; evicted oldest ready envelope"
                );
            }
            return;
        }
        // Every slot is InFlight: force-overwrite the oldest slot.
        if let Some(env) = self.slots.pop_front() {
            tracing::warn!(
                target: "flowloom::queue",
                message_id = %env.message_id,
                "buffer full of in-flight envelopes; force-evicted oldest slot"
            );
        }
    }

    /// Just-in-time lease recovery: requeue expired InFlight envelopes
    /// while budget remains, supersede the rest.
    fn recover_expired(&mut self, now: DateTime<Utc>) {
        for env in self.slots.iter_mut() {
            if !env.is_lease_expired(now) {
                continue;
            }
            if env.retry_count < env.max_retries {
                env.retry_count += 1;
                env.status = EnvelopeStatus::Ready;
                env.lease = None;
                let backoff = RETRY_BACKOFF_STEP * env.retry_count;
                env.not_before =
                    Some(now + chrono::Duration::from_std(backoff).unwrap_or_default());
                tracing::debug!(
                    target: "flowloom::queue",
                    message_id = %env.message_id,
                    retry_count = env.retry_count,
                    "lease expired; envelope requeued with back-off"
                );
            } else {
                env.status = EnvelopeStatus::Superseded;
                tracing::warn!(
                    target: "flowloom::queue",
                    message_id = %env.message_id,
                    retry_count = env.retry_count,
                    "lease expired past retry budget; envelope superseded"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::NodeExecutionContext;
    use crate::messages::{NodeCompleteMessage, WorkflowMessage};
    use std::sync::Arc;

    fn complete_msg(node: &str) -> Arc<WorkflowMessage> {
        Arc::new(WorkflowMessage::NodeComplete(NodeCompleteMessage::new(
            node,
            "",
            NodeExecutionContext::new(),
        )))
    }

    fn env(node: &str) -> MessageEnvelope {
        MessageEnvelope::new(complete_msg(node), 3)
    }

    #[test]
    fn checkout_is_fifo_within_type() {
        let buf = CircularBuffer::new(8);
        let first = env("a");
        let first_id = first.message_id.clone();
        buf.enqueue(first);
        buf.enqueue(env("b"));

        let leased = buf
            .checkout("NodeComplete", "w1", Duration::from_secs(5))
            .unwrap();
        assert_eq!(leased.message_id, first_id);
    }

    #[test]
    fn checkout_filters_by_type() {
        let buf = CircularBuffer::new(8);
        buf.enqueue(env("a"));
        assert!(buf.checkout("NodeFail", "w1", Duration::from_secs(5)).is_none());
        assert!(buf
            .checkout("NodeComplete", "w1", Duration::from_secs(5))
            .is_some());
    }

    #[test]
    fn in_flight_is_invisible_until_lease_expires() {
        let buf = CircularBuffer::new(8);
        buf.enqueue(env("a"));
        let leased = buf
            .checkout("NodeComplete", "w1", Duration::from_secs(60))
            .unwrap();
        assert!(buf
            .checkout("NodeComplete", "w2", Duration::from_secs(60))
            .is_none());
        assert!(buf.acknowledge(&leased.message_id));
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn expired_lease_recovers_with_backoff() {
        let buf = CircularBuffer::new(8);
        buf.enqueue(env("a"));
        let leased = buf
            .checkout("NodeComplete", "w1", Duration::from_millis(0))
            .unwrap();

        // The next checkout runs recovery first: the envelope becomes Ready
        // with retry_count=1 and not_before ~2s out, so it is not yet
        // eligible.
        std::thread::sleep(Duration::from_millis(5));
        assert!(buf
            .checkout("NodeComplete", "w2", Duration::from_secs(5))
            .is_none());
        let all = buf.get_all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].message_id, leased.message_id);
        assert_eq!(all[0].status, EnvelopeStatus::Ready);
        assert_eq!(all[0].retry_count, 1);
        assert!(all[0].not_before.is_some());
    }

    #[test]
    fn expired_lease_past_budget_is_superseded() {
        let buf = CircularBuffer::new(8);
        let mut envelope = env("a");
        envelope.max_retries = 0;
        buf.enqueue(envelope);
        buf.checkout("NodeComplete", "w1", Duration::from_millis(0))
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(buf
            .checkout("NodeComplete", "w2", Duration::from_secs(5))
            .is_none());
        let all = buf.get_all();
        assert_eq!(all[0].status, EnvelopeStatus::Superseded);
    }

    #[test]
    fn eviction_prefers_oldest_ready() {
        let buf = CircularBuffer::new(2);
        let first = env("a");
        let first_id = first.message_id.clone();
        buf.enqueue(first);
        buf.enqueue(env("b"));
        buf.enqueue(env("c"));
        assert_eq!(buf.len(), 2);
        assert!(buf.get_all().iter().all(|e| e.message_id != first_id));
        assert!(buf.slot_count() <= buf.capacity());
    }

    #[test]
    fn force_eviction_when_all_in_flight() {
        let buf = CircularBuffer::new(2);
        buf.enqueue(env("a"));
        buf.enqueue(env("b"));
        buf.checkout("NodeComplete", "w1", Duration::from_secs(60))
            .unwrap();
        buf.checkout("NodeComplete", "w1", Duration::from_secs(60))
            .unwrap();
        buf.enqueue(env("c"));
        assert!(buf.slot_count() <= buf.capacity());
    }

    #[test]
    fn replace_supersedes_matching_key() {
        let buf = CircularBuffer::new(8);
        buf.enqueue(env("a").with_dedupe_key("progress/a"));
        let replacement = env("a");
        let replacement_id = replacement.message_id.clone();
        buf.replace(replacement, "progress/a");

        let eligible: Vec<_> = buf
            .get_all()
            .into_iter()
            .filter(|e| e.status == EnvelopeStatus::Ready)
            .collect();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].message_id, replacement_id);
        assert_eq!(eligible[0].dedupe_key.as_deref(), Some("progress/a"));
    }

    #[test]
    fn requeue_clears_lease_and_bumps_retry() {
        let buf = CircularBuffer::new(8);
        buf.enqueue(env("a"));
        let leased = buf
            .checkout("NodeComplete", "w1", Duration::from_secs(60))
            .unwrap();
        assert!(buf.requeue(&leased.message_id, None));
        let again = buf
            .checkout("NodeComplete", "w1", Duration::from_secs(60))
            .unwrap();
        assert_eq!(again.message_id, leased.message_id);
        assert_eq!(again.retry_count, 1);
    }

    #[test]
    fn restore_preserves_status_and_lease() {
        let buf = CircularBuffer::new(8);
        let mut envelope = env("a");
        envelope.check_out("w1", Duration::from_secs(60));
        let id = envelope.message_id.clone();
        buf.restore(envelope);
        let all = buf.get_all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].message_id, id);
        assert_eq!(all[0].status, EnvelopeStatus::InFlight);
        assert!(all[0].lease.is_some());
    }
}
