//! Core types for the flowloom workflow engine.
//!
//! This module defines the fundamental enums used throughout the system:
//! workflow and node lifecycle statuses, the runtime type of a node, and
//! the trigger kind carried by a connection. These are the core domain
//! concepts that define what a workflow *is*; runtime infrastructure types
//! (envelopes, leases) live in [`crate::envelope`].
//!
//! # Examples
//!
//! ```rust
//! use flowloom::types::{RuntimeType, TriggerKind, WorkflowStatus};
//!
//! let rt = RuntimeType::While;
//! assert_eq!(rt.encode(), "While");
//! assert_eq!(RuntimeType::decode("While"), Some(RuntimeType::While));
//!
//! assert!(WorkflowStatus::Completed.is_terminal());
//! assert_eq!(TriggerKind::Complete.to_string(), "Complete");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a running workflow instance.
///
/// Once a workflow reaches a terminal status (`Completed`, `Failed`,
/// `Cancelled`) it never changes again; [`is_terminal`](Self::is_terminal)
/// is the gate used by the engine's compare-and-set transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowStatus {
    /// Created but not yet started.
    Pending,
    /// Workers are active.
    Running,
    /// All reachable work drained without an unhandled failure.
    Completed,
    /// At least one node failed with no compensating route.
    Failed,
    /// Cancellation was requested and workers drained.
    Cancelled,
    /// Checkpointed mid-run; resumable.
    Paused,
}

impl WorkflowStatus {
    /// Returns `true` for `Completed`, `Failed`, and `Cancelled`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
            Self::Paused => "Paused",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle status of a single node execution.
///
/// The order is monotonic: `Pending → Running → (Completed | Failed |
/// Cancelled)`, with the last three terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl NodeStatus {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Rank in the monotonic lifecycle order; used to reject regressions.
    #[must_use]
    pub fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Completed | Self::Failed | Self::Cancelled => 2,
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
        };
        write!(f, "{s}")
    }
}

/// Identifies the runtime implementation behind a node definition.
///
/// Leaf kinds execute a unit of work directly; control-flow kinds route
/// based on an evaluated expression; `Container` and `Subflow` execute a
/// nested graph.
///
/// # Persistence
///
/// `RuntimeType` supports serialization through both serde and the
/// [`encode`](Self::encode)/[`decode`](Self::decode) string forms used by
/// definition files and checkpoints.
///
/// # Examples
///
/// ```rust
/// use flowloom::types::RuntimeType;
///
/// let rt = RuntimeType::ForEach;
/// assert_eq!(RuntimeType::decode(rt.encode()), Some(rt));
/// assert!(rt.is_control_flow());
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuntimeType {
    /// Pass-through node; completes immediately with its input as output.
    Noop,
    /// Named handler resolved from the in-process task registry.
    Task,
    /// Program evaluated through the expression service.
    Script,
    /// Single command delegated to the shell backend.
    ShellTask,
    /// Multi-line script delegated to the shell backend.
    ShellScript,
    /// Two-way branch on a boolean condition (`True`/`False` ports).
    IfElse,
    /// Multi-way branch on a string selector (case-name ports).
    Switch,
    /// Collection iteration emitting one `NodeNext` per element.
    ForEach,
    /// Feedback-loop iteration gated by a condition per pass.
    While,
    /// Nested child graph executed as a unit.
    Container,
    /// Recursive engine invocation of a child workflow definition.
    Subflow,
}

impl RuntimeType {
    pub const ALL: [RuntimeType; 11] = [
        RuntimeType::Noop,
        RuntimeType::Task,
        RuntimeType::Script,
        RuntimeType::ShellTask,
        RuntimeType::ShellScript,
        RuntimeType::IfElse,
        RuntimeType::Switch,
        RuntimeType::ForEach,
        RuntimeType::While,
        RuntimeType::Container,
        RuntimeType::Subflow,
    ];

    /// Encode into the persisted string form used by definition files.
    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            Self::Noop => "Noop",
            Self::Task => "Task",
            Self::Script => "Script",
            Self::ShellTask => "ShellTask",
            Self::ShellScript => "ShellScript",
            Self::IfElse => "IfElse",
            Self::Switch => "Switch",
            Self::ForEach => "ForEach",
            Self::While => "While",
            Self::Container => "Container",
            Self::Subflow => "Subflow",
        }
    }

    /// Decode a persisted string form; `None` for unknown encodings.
    #[must_use]
    pub fn decode(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|rt| rt.encode() == s)
    }

    /// Returns `true` for the branching/iteration/nesting kinds.
    #[must_use]
    pub fn is_control_flow(&self) -> bool {
        matches!(
            self,
            Self::IfElse
                | Self::Switch
                | Self::ForEach
                | Self::While
                | Self::Container
                | Self::Subflow
        )
    }
}

impl fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// The message kind a connection reacts to.
///
/// A connection routes a message only when the message maps to its trigger
/// kind. `Progress` messages are observational and never routed, so they
/// have no trigger kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerKind {
    Complete,
    Fail,
    Cancel,
    Next,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Complete => "Complete",
            Self::Fail => "Fail",
            Self::Cancel => "Cancel",
            Self::Next => "Next",
        };
        write!(f, "{s}")
    }
}
