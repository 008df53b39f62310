//! Message types exchanged between workflow nodes.
//!
//! Workers emit exactly one result message per execution (`NodeComplete`,
//! `NodeFail`, or `NodeCancel`); iterating control-flow nodes additionally
//! emit `NodeNext` mid-execution; `Progress` messages are observational.
//! The router maps each message to a [`TriggerKind`] and delivers it to the
//! queues of downstream nodes.
//!
//! All messages carry the emitting node id, a message id, and a timestamp.
//! Payloads are immutable from the router's point of view: fan-out to N
//! targets shares one `Arc`'d payload across N envelopes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::context::NodeExecutionContext;
use crate::types::TriggerKind;

/// A typed signal emitted by a worker and delivered through the router.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum WorkflowMessage {
    NodeComplete(NodeCompleteMessage),
    NodeFail(NodeFailMessage),
    NodeNext(NodeNextMessage),
    NodeCancel(NodeCancelMessage),
    Progress(ProgressMessage),
}

impl WorkflowMessage {
    /// Stable type names, in the order queues scan them during `lease()`.
    pub const TYPE_NAMES: [&'static str; 5] = [
        "NodeComplete",
        "NodeFail",
        "NodeNext",
        "NodeCancel",
        "Progress",
    ];

    /// The stable name used for envelope type filtering and persistence.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::NodeComplete(_) => "NodeComplete",
            Self::NodeFail(_) => "NodeFail",
            Self::NodeNext(_) => "NodeNext",
            Self::NodeCancel(_) => "NodeCancel",
            Self::Progress(_) => "Progress",
        }
    }

    /// The trigger kind connections match against; `None` for `Progress`,
    /// which is observational and never routed.
    #[must_use]
    pub fn trigger_kind(&self) -> Option<TriggerKind> {
        match self {
            Self::NodeComplete(_) => Some(TriggerKind::Complete),
            Self::NodeFail(_) => Some(TriggerKind::Fail),
            Self::NodeNext(_) => Some(TriggerKind::Next),
            Self::NodeCancel(_) => Some(TriggerKind::Cancel),
            Self::Progress(_) => None,
        }
    }

    #[must_use]
    pub fn message_id(&self) -> &str {
        match self {
            Self::NodeComplete(m) => &m.message_id,
            Self::NodeFail(m) => &m.message_id,
            Self::NodeNext(m) => &m.message_id,
            Self::NodeCancel(m) => &m.message_id,
            Self::Progress(m) => &m.message_id,
        }
    }

    /// Id of the node that emitted this message.
    #[must_use]
    pub fn node_id(&self) -> &str {
        match self {
            Self::NodeComplete(m) => &m.node_id,
            Self::NodeFail(m) => &m.node_id,
            Self::NodeNext(m) => &m.node_id,
            Self::NodeCancel(m) => &m.node_id,
            Self::Progress(m) => &m.node_id,
        }
    }

    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::NodeComplete(m) => m.timestamp,
            Self::NodeFail(m) => m.timestamp,
            Self::NodeNext(m) => m.timestamp,
            Self::NodeCancel(m) => m.timestamp,
            Self::Progress(m) => m.timestamp,
        }
    }

    /// The outcome port this message was emitted on; empty = default port.
    #[must_use]
    pub fn source_port(&self) -> &str {
        match self {
            Self::NodeComplete(m) => &m.source_port,
            Self::NodeNext(m) => &m.source_port,
            _ => "",
        }
    }

    /// Execution context snapshot carried by the message, if any. Guard
    /// expressions on connections evaluate against this snapshot.
    #[must_use]
    pub fn context(&self) -> Option<&NodeExecutionContext> {
        match self {
            Self::NodeComplete(m) => Some(&m.context),
            Self::NodeNext(m) => Some(&m.context),
            _ => None,
        }
    }
}

/// Successful completion of a node execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeCompleteMessage {
    pub message_id: String,
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    /// Outcome port chosen by the node (`True`, `LoopBody`, a case key, …).
    #[serde(default)]
    pub source_port: String,
    /// Context snapshot at completion; `output` becomes downstream `input`.
    #[serde(default)]
    pub context: NodeExecutionContext,
}

impl NodeCompleteMessage {
    #[must_use]
    pub fn new(node_id: &str, source_port: &str, context: NodeExecutionContext) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            node_id: node_id.to_string(),
            timestamp: Utc::now(),
            source_port: source_port.to_string(),
            context,
        }
    }
}

/// Failed node execution. Routed to `Fail`-trigger connections when an
/// error path exists; otherwise it eventually fails the workflow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeFailMessage {
    pub message_id: String,
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    pub error: String,
    /// Rendered cause detail, when available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl NodeFailMessage {
    #[must_use]
    pub fn new(node_id: &str, error: impl Into<String>) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            node_id: node_id.to_string(),
            timestamp: Utc::now(),
            error: error.into(),
            detail: None,
        }
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// One iteration emitted by ForEach/While toward the loop body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeNextMessage {
    pub message_id: String,
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    pub iteration_index: u64,
    /// The element bound for this iteration (ForEach) or `Null` (While).
    #[serde(default)]
    pub item: Value,
    #[serde(default)]
    pub source_port: String,
    /// Iteration context: a copy of the loop node's input plus the bound
    /// item and iteration metadata.
    #[serde(default)]
    pub context: NodeExecutionContext,
}

impl NodeNextMessage {
    #[must_use]
    pub fn new(
        node_id: &str,
        iteration_index: u64,
        item: Value,
        source_port: &str,
        context: NodeExecutionContext,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            node_id: node_id.to_string(),
            timestamp: Utc::now(),
            iteration_index,
            item,
            source_port: source_port.to_string(),
            context,
        }
    }
}

/// Cancelled node execution (cooperative cancellation or timeout).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeCancelMessage {
    pub message_id: String,
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub reason: String,
}

impl NodeCancelMessage {
    #[must_use]
    pub fn new(node_id: &str, reason: impl Into<String>) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            node_id: node_id.to_string(),
            timestamp: Utc::now(),
            reason: reason.into(),
        }
    }
}

/// Observational progress signal; never routed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressMessage {
    pub message_id: String,
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    pub percent: f64,
    pub status: String,
}

impl ProgressMessage {
    #[must_use]
    pub fn new(node_id: &str, percent: f64, status: impl Into<String>) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            node_id: node_id.to_string(),
            timestamp: Utc::now(),
            percent: percent.clamp(0.0, 100.0),
            status: status.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::NodeExecutionContext;

    #[test]
    fn type_names_cover_every_variant() {
        let complete = WorkflowMessage::NodeComplete(NodeCompleteMessage::new(
            "a",
            "",
            NodeExecutionContext::new(),
        ));
        let fail = WorkflowMessage::NodeFail(NodeFailMessage::new("a", "boom"));
        let next = WorkflowMessage::NodeNext(NodeNextMessage::new(
            "a",
            0,
            Value::Null,
            "LoopBody",
            NodeExecutionContext::new(),
        ));
        let cancel = WorkflowMessage::NodeCancel(NodeCancelMessage::new("a", "shutdown"));
        let progress = WorkflowMessage::Progress(ProgressMessage::new("a", 50.0, "halfway"));

        for msg in [&complete, &fail, &next, &cancel, &progress] {
            assert!(WorkflowMessage::TYPE_NAMES.contains(&msg.type_name()));
        }
    }

    #[test]
    fn trigger_kind_mapping() {
        let fail = WorkflowMessage::NodeFail(NodeFailMessage::new("n", "x"));
        assert_eq!(fail.trigger_kind(), Some(TriggerKind::Fail));
        let progress = WorkflowMessage::Progress(ProgressMessage::new("n", 10.0, "warming up"));
        assert_eq!(progress.trigger_kind(), None);
    }

    #[test]
    fn progress_percent_is_clamped() {
        let msg = ProgressMessage::new("n", 150.0, "over");
        assert_eq!(msg.percent, 100.0);
        let msg = ProgressMessage::new("n", -3.0, "under");
        assert_eq!(msg.percent, 0.0);
    }

    #[test]
    fn serde_roundtrip() {
        let msg = WorkflowMessage::NodeComplete(NodeCompleteMessage::new(
            "worker",
            "True",
            NodeExecutionContext::new(),
        ));
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: WorkflowMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, parsed);
    }
}
