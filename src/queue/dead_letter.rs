//! Bounded tail of permanently-failed messages.
//!
//! The dead-letter queue is purely diagnostic: routing decisions never
//! consult it. Entries carry the failed envelope plus a human-readable
//! reason and optional detail so operators can see why delivery gave up.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use uuid::Uuid;

use crate::envelope::MessageEnvelope;

/// One dead-lettered message with diagnostic metadata.
#[derive(Clone, Debug)]
pub struct DeadLetterEntry {
    pub entry_id: String,
    pub envelope: MessageEnvelope,
    pub reason: String,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Bounded FIFO of dead-lettered messages; overflow evicts the oldest.
pub struct DeadLetterQueue {
    inner: Mutex<VecDeque<DeadLetterEntry>>,
    capacity: usize,
}

impl DeadLetterQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Append an entry, evicting the oldest if at capacity. Returns the
    /// entry id.
    pub fn push(
        &self,
        envelope: MessageEnvelope,
        reason: impl Into<String>,
        detail: Option<String>,
    ) -> String {
        let entry = DeadLetterEntry {
            entry_id: Uuid::new_v4().to_string(),
            envelope,
            reason: reason.into(),
            detail,
            timestamp: Utc::now(),
        };
        let id = entry.entry_id.clone();
        tracing::warn!(
            target: "flowloom::queue",
            entry_id = %id,
            message_id = %entry.envelope.message_id,
            reason = %entry.reason,
            "message moved to dead-letter queue"
        );
        let mut inner = self.inner.lock();
        if inner.len() >= self.capacity {
            inner.pop_front();
        }
        inner.push_back(entry);
        id
    }

    /// Snapshot of all entries, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<DeadLetterEntry> {
        self.inner.lock().iter().cloned().collect()
    }

    #[must_use]
    pub fn get(&self, entry_id: &str) -> Option<DeadLetterEntry> {
        self.inner
            .lock()
            .iter()
            .find(|e| e.entry_id == entry_id)
            .cloned()
    }

    pub fn remove(&self, entry_id: &str) -> Option<DeadLetterEntry> {
        let mut inner = self.inner.lock();
        let idx = inner.iter().position(|e| e.entry_id == entry_id)?;
        inner.remove(idx)
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::NodeExecutionContext;
    use crate::messages::{NodeCompleteMessage, WorkflowMessage};
    use std::sync::Arc;

    fn envelope() -> MessageEnvelope {
        MessageEnvelope::new(
            Arc::new(WorkflowMessage::NodeComplete(NodeCompleteMessage::new(
                "n",
                "",
                NodeExecutionContext::new(),
            ))),
            0,
        )
    }

    #[test]
    fn push_get_remove() {
        let dlq = DeadLetterQueue::new(4);
        let id = dlq.push(envelope(), "exceeded max retries (3)", None);
        assert_eq!(dlq.len(), 1);
        let entry = dlq.get(&id).unwrap();
        assert!(entry.reason.contains("exceeded max retries"));
        assert!(dlq.remove(&id).is_some());
        assert!(dlq.is_empty());
    }

    #[test]
    fn overflow_evicts_oldest() {
        let dlq = DeadLetterQueue::new(2);
        let first = dlq.push(envelope(), "one", None);
        dlq.push(envelope(), "two", None);
        dlq.push(envelope(), "three", None);
        assert_eq!(dlq.len(), 2);
        assert!(dlq.get(&first).is_none());
        let reasons: Vec<_> = dlq.list().into_iter().map(|e| e.reason).collect();
        assert_eq!(reasons, vec!["two", "three"]);
    }
}
