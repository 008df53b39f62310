use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An observability event emitted during workflow execution.
///
/// Observers see, for any single node instance, `Started` before exactly
/// one of `Completed`/`Failed`/`Cancelled`. Events are emitted
/// synchronously on the worker that produced them and must be consumed
/// without blocking.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum Event {
    Node(NodeLifecycleEvent),
    Workflow(WorkflowLifecycleEvent),
    Progress(ProgressEvent),
    Diagnostic(DiagnosticEvent),
}

impl Event {
    pub fn diagnostic(scope: impl Into<String>, message: impl Into<String>) -> Self {
        Event::Diagnostic(DiagnosticEvent {
            scope: scope.into(),
            message: message.into(),
        })
    }

    pub fn node_created(node_id: impl Into<String>, runtime_type: impl Into<String>) -> Self {
        Event::Node(NodeLifecycleEvent::Created {
            node_id: node_id.into(),
            runtime_type: runtime_type.into(),
        })
    }

    pub fn node_started(node_id: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Event::Node(NodeLifecycleEvent::Started {
            node_id: node_id.into(),
            instance_id: instance_id.into(),
        })
    }

    pub fn node_completed(
        node_id: impl Into<String>,
        instance_id: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Event::Node(NodeLifecycleEvent::Completed {
            node_id: node_id.into(),
            instance_id: instance_id.into(),
            duration_ms,
        })
    }

    pub fn node_failed(
        node_id: impl Into<String>,
        instance_id: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Event::Node(NodeLifecycleEvent::Failed {
            node_id: node_id.into(),
            instance_id: instance_id.into(),
            error: error.into(),
        })
    }

    pub fn node_cancelled(
        node_id: impl Into<String>,
        instance_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Event::Node(NodeLifecycleEvent::Cancelled {
            node_id: node_id.into(),
            instance_id: instance_id.into(),
            reason: reason.into(),
        })
    }

    pub fn progress(
        key: impl Into<String>,
        percent: f64,
        status: impl Into<String>,
    ) -> Self {
        Event::Progress(ProgressEvent {
            key: key.into(),
            percent: percent.clamp(0.0, 100.0),
            status: status.into(),
            timestamp: Utc::now(),
        })
    }

    /// The node this event concerns, if any.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Event::Node(node) => Some(node.node_id()),
            _ => None,
        }
    }

    pub fn scope_label(&self) -> &str {
        match self {
            Event::Node(node) => node.phase_label(),
            Event::Workflow(wf) => wf.phase_label(),
            Event::Progress(_) => "progress",
            Event::Diagnostic(diag) => &diag.scope,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Event::Node(node) => node.describe(),
            Event::Workflow(wf) => wf.describe(),
            Event::Progress(p) => format!("[{}] {:.0}% {}", p.key, p.percent, p.status),
            Event::Diagnostic(diag) => diag.message.clone(),
        }
    }

    /// Convert to a structured JSON value with a normalized schema:
    /// `{"type", "scope", "message", "timestamp", "payload"}`.
    pub fn to_json_value(&self) -> Value {
        use serde_json::json;
        let event_type = match self {
            Event::Node(_) => "node",
            Event::Workflow(_) => "workflow",
            Event::Progress(_) => "progress",
            Event::Diagnostic(_) => "diagnostic",
        };
        json!({
            "type": event_type,
            "scope": self.scope_label(),
            "message": self.message(),
            "timestamp": Utc::now().to_rfc3339(),
            "payload": serde_json::to_value(self).unwrap_or(Value::Null),
        })
    }

    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_json_value())
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.to_json_value())
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.node_id() {
            Some(id) => write!(f, "[{id}] {}", self.message()),
            None => write!(f, "{}", self.message()),
        }
    }
}

/// Lifecycle of a single node instance.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum NodeLifecycleEvent {
    Created {
        node_id: String,
        runtime_type: String,
    },
    Started {
        node_id: String,
        instance_id: String,
    },
    Completed {
        node_id: String,
        instance_id: String,
        duration_ms: u64,
    },
    Failed {
        node_id: String,
        instance_id: String,
        error: String,
    },
    Cancelled {
        node_id: String,
        instance_id: String,
        reason: String,
    },
}

impl NodeLifecycleEvent {
    pub fn node_id(&self) -> &str {
        match self {
            Self::Created { node_id, .. }
            | Self::Started { node_id, .. }
            | Self::Completed { node_id, .. }
            | Self::Failed { node_id, .. }
            | Self::Cancelled { node_id, .. } => node_id,
        }
    }

    pub fn instance_id(&self) -> Option<&str> {
        match self {
            Self::Created { .. } => None,
            Self::Started { instance_id, .. }
            | Self::Completed { instance_id, .. }
            | Self::Failed { instance_id, .. }
            | Self::Cancelled { instance_id, .. } => Some(instance_id),
        }
    }

    pub fn phase_label(&self) -> &'static str {
        match self {
            Self::Created { .. } => "node_created",
            Self::Started { .. } => "node_started",
            Self::Completed { .. } => "node_completed",
            Self::Failed { .. } => "node_failed",
            Self::Cancelled { .. } => "node_cancelled",
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Created { runtime_type, .. } => format!("created ({runtime_type})"),
            Self::Started { .. } => "started".to_string(),
            Self::Completed { duration_ms, .. } => format!("completed in {duration_ms}ms"),
            Self::Failed { error, .. } => format!("failed: {error}"),
            Self::Cancelled { reason, .. } => format!("cancelled: {reason}"),
        }
    }

    /// Re-scope this event under a parent namespace (`parent/child`).
    /// Containers and subflows use this when re-broadcasting child
    /// lifecycle events upward.
    #[must_use]
    pub fn namespaced(mut self, prefix: &str) -> Self {
        let node_id = match &mut self {
            Self::Created { node_id, .. }
            | Self::Started { node_id, .. }
            | Self::Completed { node_id, .. }
            | Self::Failed { node_id, .. }
            | Self::Cancelled { node_id, .. } => node_id,
        };
        *node_id = format!("{prefix}/{node_id}");
        self
    }
}

/// Terminal transitions of a workflow instance.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum WorkflowLifecycleEvent {
    Started {
        instance_id: String,
        workflow_id: String,
    },
    Completed {
        instance_id: String,
        workflow_id: String,
    },
    Failed {
        instance_id: String,
        workflow_id: String,
        errors: Vec<String>,
    },
    Cancelled {
        instance_id: String,
        workflow_id: String,
        reason: String,
    },
}

impl WorkflowLifecycleEvent {
    pub fn phase_label(&self) -> &'static str {
        match self {
            Self::Started { .. } => "workflow_started",
            Self::Completed { .. } => "workflow_completed",
            Self::Failed { .. } => "workflow_failed",
            Self::Cancelled { .. } => "workflow_cancelled",
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Started { workflow_id, .. } => format!("workflow `{workflow_id}` started"),
            Self::Completed { workflow_id, .. } => format!("workflow `{workflow_id}` completed"),
            Self::Failed { workflow_id, errors, .. } => format!(
                "workflow `{workflow_id}` failed: {}",
                errors.join("; ")
            ),
            Self::Cancelled { workflow_id, reason, .. } => {
                format!("workflow `{workflow_id}` cancelled: {reason}")
            }
        }
    }
}

/// Progress signal with a hierarchical key (`container/child` for nested
/// graphs).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProgressEvent {
    pub key: String,
    pub percent: f64,
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

/// Free-form diagnostic for workflow telemetry.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiagnosticEvent {
    pub scope: String,
    pub message: String,
}
