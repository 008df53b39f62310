//! Queue-level wrapper around a workflow message.
//!
//! An envelope carries the lease, retry, and deduplication metadata the
//! [`CircularBuffer`](crate::queue::CircularBuffer) needs to provide
//! at-most-once-per-message delivery. The payload is shared (`Arc`) so that
//! router fan-out to N targets wraps one payload in N envelopes.
//!
//! Status machine:
//!
//! ```text
//! Ready ──checkout──▶ InFlight ──acknowledge──▶ Completed
//!   ▲                    │
//!   └──requeue/expiry────┘        expiry past budget ──▶ Superseded
//! ```
//!
//! Only `Ready` envelopes whose `not_before` has passed and that are not
//! superseded are eligible for checkout; only `InFlight` envelopes may be
//! acknowledged, abandoned, or moved to the dead-letter queue.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::messages::WorkflowMessage;

/// Delivery state of an envelope inside a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EnvelopeStatus {
    /// Eligible for checkout once `not_before` has passed.
    Ready,
    /// Leased to a handler; invisible until the lease expires.
    InFlight,
    /// Acknowledged; the slot is reclaimable.
    Completed,
    /// Replaced by a newer envelope or abandoned past its retry budget.
    Superseded,
}

/// A time-bounded exclusive claim on an envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lease {
    /// Identifier of the worker holding the claim.
    pub handler_id: String,
    pub checked_out_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    #[must_use]
    pub fn new(handler_id: &str, duration: Duration) -> Self {
        let now = Utc::now();
        Self {
            handler_id: handler_id.to_string(),
            checked_out_at: now,
            expires_at: now + chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero()),
        }
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// The queue entry: one message plus its delivery bookkeeping.
#[derive(Clone, Debug)]
pub struct MessageEnvelope {
    pub message_id: String,
    /// Stable payload type name; checkout filters match against this.
    pub message_type: String,
    pub payload: Arc<WorkflowMessage>,
    pub status: EnvelopeStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub lease: Option<Lease>,
    pub dedupe_key: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    /// Earliest instant this envelope may be checked out (retry back-off).
    pub not_before: Option<DateTime<Utc>>,
    /// Monotonic insertion sequence; tie-breaker after `enqueued_at`.
    pub sequence: u64,
}

impl MessageEnvelope {
    /// Wrap a message in a fresh Ready envelope.
    #[must_use]
    pub fn new(payload: Arc<WorkflowMessage>, max_retries: u32) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            message_type: payload.type_name().to_string(),
            payload,
            status: EnvelopeStatus::Ready,
            retry_count: 0,
            max_retries,
            lease: None,
            dedupe_key: None,
            enqueued_at: Utc::now(),
            not_before: None,
            sequence: 0,
        }
    }

    #[must_use]
    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    /// Eligible for checkout: Ready, not superseded, and visible.
    #[must_use]
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == EnvelopeStatus::Ready
            && self.not_before.is_none_or(|nb| nb <= now)
    }

    /// The lease has lapsed while the envelope was in flight.
    #[must_use]
    pub fn is_lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == EnvelopeStatus::InFlight
            && self.lease.as_ref().is_some_and(|l| l.is_expired(now))
    }

    /// Claim this envelope for a handler.
    pub(crate) fn check_out(&mut self, handler_id: &str, lease_duration: Duration) {
        self.status = EnvelopeStatus::InFlight;
        self.lease = Some(Lease::new(handler_id, lease_duration));
    }

    /// Return this envelope to the Ready pool, bumping the retry count.
    pub(crate) fn requeue(&mut self, not_before: Option<DateTime<Utc>>) {
        self.status = EnvelopeStatus::Ready;
        self.lease = None;
        self.retry_count += 1;
        self.not_before = not_before;
    }
}
