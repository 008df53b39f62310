//! # Flowloom: Message-driven Workflow Execution Engine
//!
//! Flowloom executes a directed graph of nodes where each node is a unit
//! of work (task, script, control-flow primitive, sub-workflow, or
//! container). Correct concurrent execution rests on four cooperating
//! subsystems:
//!
//! - **Per-node message queues** with lease-based visibility timeouts,
//!   retry accounting, deduplication, and a dead-letter tail
//! - **A message router** delivering completion/failure/iteration signals
//!   to downstream queues after enabled/trigger/port/guard filtering
//! - **The workflow engine**: per-node worker loops, entry-point
//!   triggering, nested event propagation, and completion detection
//! - **Control-flow nodes** (if/else, switch, for-each, while, container,
//!   subflow), including the While feedback-loop iteration protocol
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use flowloom::definition::{NodeConfig, NodeConnection, NodeDefinition, WorkflowDefinition};
//! use flowloom::engine::WorkflowEngine;
//! use flowloom::types::WorkflowStatus;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let definition = WorkflowDefinition::new("greet")
//!     .with_node(NodeDefinition::new("first", NodeConfig::Noop))
//!     .with_node(NodeDefinition::new("second", NodeConfig::Noop))
//!     .with_connection(NodeConnection::complete("first", "second"));
//!
//! let engine = WorkflowEngine::new(definition);
//! let ctx = engine.start(Default::default()).await?;
//! assert_eq!(ctx.status(), WorkflowStatus::Completed);
//! # Ok(())
//! # }
//! ```
//!
//! ## Execution model
//!
//! Each node owns a fixed-capacity queue and a dedicated worker task.
//! A worker leases one message at a time (per-node serializability),
//! executes the node, emits a `NodeComplete`/`NodeFail`/`NodeCancel`
//! message tagged with the outcome port, and the router distributes it
//! to downstream queues. The cycle continues until no reachable work
//! remains; the engine then transitions the workflow to its terminal
//! status. Backpressure is by eviction: a full buffer drops its oldest
//! Ready message rather than growing without bound.
//!
//! ## Module Guide
//!
//! - [`definition`] - Workflow/node/connection definitions and validation
//! - [`loader`] - YAML/JSON definition files
//! - [`messages`] / [`envelope`] - Signals and their queue-level wrappers
//! - [`queue`] - Circular buffer, node queues, dead-letter queue
//! - [`router`] - Connection filtering and fan-out
//! - [`nodes`] - The node trait, registry, and built-in node family
//! - [`engine`] - Lifecycle, worker loops, completion detection
//! - [`expression`] - Condition/collection/selector evaluation
//! - [`event_bus`] - Observability events, synchronous dispatch, sinks
//! - [`checkpoint`] - Snapshot/restore with pluggable storage
//! - [`telemetry`] - Tracing setup and event formatting

pub mod checkpoint;
pub mod context;
pub mod definition;
pub mod engine;
pub mod envelope;
pub mod event_bus;
pub mod expression;
pub mod loader;
pub mod messages;
pub mod nodes;
pub mod queue;
pub mod router;
pub mod telemetry;
pub mod types;
