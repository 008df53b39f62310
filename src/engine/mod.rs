//! The workflow engine: lifecycle, per-node worker loops, completion
//! detection, and event fan-out.
//!
//! `start()` validates the definition, builds one queue and one worker
//! task per node, seeds the router with the definition's connections,
//! triggers the entry points with a synthetic completion message, and
//! then supervises the run until no reachable work remains or a terminal
//! condition is reached. Node failures never propagate as errors out of
//! `start()`; they are reflected in the returned context's status and
//! per-node instance records.
//!
//! # Worker loop
//!
//! One lightweight task per node; cooperative within a node (at most one
//! message processed at a time), parallel across nodes. Each iteration
//! waits on the queue's coalescing signal channel, a short idle tick
//! (which drives lease-expiry recovery), or cancellation; then drains the
//! queue one lease at a time.
//!
//! # Completion detection
//!
//! The engine counts in-flight executions (incremented on lease,
//! decremented after the result message is routed). When the counter is
//! zero and every queue is empty for a grace window, the workflow
//! transitions to Completed, or Failed when a `NodeFail` was observed
//! with no compensating Fail route.

mod config;

pub use config::EngineConfig;

use miette::Diagnostic;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::{Checkpoint, CheckpointError};
use crate::context::{
    META_ITERATION_INDEX, META_SOURCE_PORT, NodeExecutionContext, WorkflowExecutionContext,
};
use crate::definition::{DefinitionError, NodeDefinition, WorkflowDefinition};
use crate::event_bus::{Event, EventBus, EventEmitter, EventStream, WorkflowLifecycleEvent};
use crate::messages::{NodeCancelMessage, NodeCompleteMessage, NodeFailMessage, WorkflowMessage};
use crate::nodes::{NodeError, NodeRegistry, NodeRun, NodeServices, WorkflowNode};
use crate::queue::{AbandonOutcome, DeadLetterQueue, LeasedMessage, NodeMessageQueue};
use crate::router::MessageRouter;
use crate::types::{TriggerKind, WorkflowStatus};

/// Emitter node id used for synthetic entry-point trigger messages.
const START_NODE_ID: &str = "__start__";

/// Errors surfaced by the engine API before or outside a run.
///
/// Individual node failures are never raised here; they land in the
/// returned context's status and instance records.
#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Definition(#[from] DefinitionError),

    #[error("failed to construct node `{node_id}`: {source}")]
    #[diagnostic(code(flowloom::engine::node_creation))]
    NodeCreation {
        node_id: String,
        #[source]
        source: NodeError,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("checkpoint belongs to workflow `{found}`, engine runs `{expected}`")]
    #[diagnostic(code(flowloom::engine::checkpoint_mismatch))]
    CheckpointMismatch { expected: String, found: String },
}

/// Message-driven workflow engine.
///
/// One engine executes one definition per call to [`start`](Self::start)
/// or [`resume`](Self::resume). Containers and subflows construct nested
/// engines internally, inheriting config and services from the parent.
pub struct WorkflowEngine {
    definition: Arc<WorkflowDefinition>,
    config: EngineConfig,
    registry: Arc<NodeRegistry>,
    services: Arc<NodeServices>,
    event_bus: Option<EventBus>,
    emitter: Arc<dyn EventEmitter>,
    shared_variables: Option<Arc<RwLock<FxHashMap<String, Value>>>>,
    cancel: CancellationToken,
    pause_requested: Arc<AtomicBool>,
}

impl WorkflowEngine {
    /// Engine with defaults: stdout event bus, built-in node registry,
    /// default services and config.
    #[must_use]
    pub fn new(definition: WorkflowDefinition) -> Self {
        let event_bus = EventBus::default();
        let emitter = event_bus.get_emitter();
        Self {
            definition: Arc::new(definition),
            config: EngineConfig::default(),
            registry: Arc::new(NodeRegistry::with_builtins()),
            services: Arc::new(NodeServices::default()),
            event_bus: Some(event_bus),
            emitter,
            shared_variables: None,
            cancel: CancellationToken::new(),
            pause_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_registry(mut self, registry: Arc<NodeRegistry>) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub fn with_services(mut self, services: Arc<NodeServices>) -> Self {
        self.services = services;
        self
    }

    /// Replace the owned event bus (e.g. to attach channel or memory
    /// sinks before starting).
    #[must_use]
    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.emitter = event_bus.get_emitter();
        self.event_bus = Some(event_bus);
        self
    }

    /// Emit into an external emitter instead of an owned bus. Nested
    /// container/subflow engines use this to re-publish events upward.
    #[must_use]
    pub fn with_emitter(mut self, emitter: Arc<dyn EventEmitter>) -> Self {
        self.event_bus = None;
        self.emitter = emitter;
        self
    }

    /// Share an existing variables map instead of creating a fresh scope.
    #[must_use]
    pub fn with_shared_variables(
        mut self,
        variables: Arc<RwLock<FxHashMap<String, Value>>>,
    ) -> Self {
        self.shared_variables = Some(variables);
        self
    }

    /// Tie this engine's lifetime to a parent cancellation token.
    #[must_use]
    pub fn with_parent_cancellation(mut self, parent: CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    /// Token cancelling the whole run; clone it to cancel externally.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The owned event bus, when the engine has one.
    #[must_use]
    pub fn event_bus(&self) -> Option<&EventBus> {
        self.event_bus.as_ref()
    }

    /// Async tap over the owned event bus.
    #[must_use]
    pub fn subscribe(&self) -> Option<EventStream> {
        self.event_bus.as_ref().map(EventBus::subscribe)
    }

    /// Request a pause: workers drain without consuming their current
    /// leases and the run finishes with status `Paused`, ready for
    /// [`Checkpoint::capture`]. Returns `false` (and does nothing) when
    /// the definition does not allow pausing.
    pub fn request_pause(&self) -> bool {
        if !self.definition.allow_pause {
            return false;
        }
        self.pause_requested.store(true, Ordering::Release);
        self.cancel.cancel();
        true
    }

    /// Run the workflow to a terminal state and return its execution
    /// context. Refuses to start an invalid definition.
    pub async fn start(
        &self,
        initial_variables: FxHashMap<String, Value>,
    ) -> Result<Arc<WorkflowExecutionContext>, EngineError> {
        self.run(initial_variables, None).await
    }

    /// Resume a checkpointed run: restores variables, node-instance
    /// history, and queue contents (preserving envelope status and
    /// lease), then continues to a terminal state.
    pub async fn resume(
        &self,
        checkpoint: Checkpoint,
    ) -> Result<Arc<WorkflowExecutionContext>, EngineError> {
        if checkpoint.workflow_id != self.definition.workflow_id {
            return Err(EngineError::CheckpointMismatch {
                expected: self.definition.workflow_id.clone(),
                found: checkpoint.workflow_id.clone(),
            });
        }
        self.run(FxHashMap::default(), Some(checkpoint)).await
    }

    async fn run(
        &self,
        initial_variables: FxHashMap<String, Value>,
        checkpoint: Option<Checkpoint>,
    ) -> Result<Arc<WorkflowExecutionContext>, EngineError> {
        let definition = Arc::clone(&self.definition);
        definition.validate()?;

        // ---- Context assembly -------------------------------------------------
        let dead_letter = Arc::new(DeadLetterQueue::new(self.config.dead_letter_capacity));
        let mut queues: FxHashMap<String, Arc<NodeMessageQueue>> = FxHashMap::default();
        for node in &definition.nodes {
            let max_retries = if node.max_retries > 0 {
                node.max_retries
            } else {
                self.config.default_max_retries
            };
            queues.insert(
                node.node_id.clone(),
                Arc::new(NodeMessageQueue::new(
                    &node.node_id,
                    self.config.queue_capacity,
                    self.config.visibility_timeout,
                    max_retries,
                    dead_letter.clone(),
                )),
            );
        }

        let variables = self
            .shared_variables
            .clone()
            .unwrap_or_else(|| Arc::new(RwLock::new(FxHashMap::default())));
        {
            let mut vars = variables.write();
            for (k, v) in &definition.default_variables {
                vars.entry(k.clone()).or_insert_with(|| v.clone());
            }
            if let Some(cp) = &checkpoint {
                for (k, v) in &cp.variables {
                    vars.insert(k.clone(), v.clone());
                }
            }
            for (k, v) in initial_variables {
                vars.insert(k, v);
            }
        }

        let ctx = Arc::new(WorkflowExecutionContext::new_shared(
            &definition.workflow_id,
            &definition.workflow_id,
            variables,
            queues,
            dead_letter,
        ));

        let router = Arc::new(MessageRouter::new(
            &definition.connections,
            self.emitter.clone(),
        ));
        let node_run = NodeRun {
            workflow: Arc::clone(&ctx),
            router: Arc::clone(&router),
            emitter: self.emitter.clone(),
            services: Arc::clone(&self.services),
            config: self.config.clone(),
        };

        // ---- Node instantiation ----------------------------------------------
        let mut nodes: FxHashMap<String, Arc<dyn WorkflowNode>> = FxHashMap::default();
        for node_def in &definition.nodes {
            let node = self.registry.construct(node_def).map_err(|source| {
                EngineError::NodeCreation {
                    node_id: node_def.node_id.clone(),
                    source,
                }
            })?;
            let _ = self.emitter.emit(Event::node_created(
                &node_def.node_id,
                node_def.runtime_type().encode(),
            ));
            nodes.insert(node_def.node_id.clone(), node);
        }

        // ---- Checkpoint restore ----------------------------------------------
        if let Some(cp) = &checkpoint {
            for instance in &cp.node_instances {
                ctx.record_instance(instance.clone());
            }
            for (node_id, messages) in &cp.queues {
                let Some(queue) = ctx.queue(node_id) else {
                    continue;
                };
                for serialized in messages {
                    queue.restore_from_checkpoint(serialized.to_envelope()?);
                }
            }
        }

        ctx.try_transition(WorkflowStatus::Running);
        let _ = self
            .emitter
            .emit(Event::Workflow(WorkflowLifecycleEvent::Started {
                instance_id: ctx.instance_id.clone(),
                workflow_id: definition.workflow_id.clone(),
            }));

        // ---- Workers ----------------------------------------------------------
        let in_flight = Arc::new(AtomicUsize::new(0));
        let unrouted_failure = Arc::new(AtomicBool::new(false));
        let semaphore = (definition.max_concurrency > 0)
            .then(|| Arc::new(Semaphore::new(definition.max_concurrency)));

        let mut workers: Vec<JoinHandle<()>> = Vec::with_capacity(definition.nodes.len());
        for node_def in &definition.nodes {
            let worker = NodeWorker {
                node: Arc::clone(&nodes[&node_def.node_id]),
                definition: node_def.clone(),
                queue: ctx.queue(&node_def.node_id).expect("queue exists per node"),
                run: node_run.clone(),
                cancel: self.cancel.clone(),
                in_flight: Arc::clone(&in_flight),
                unrouted_failure: Arc::clone(&unrouted_failure),
                pause_requested: Arc::clone(&self.pause_requested),
                semaphore: semaphore.clone(),
                idle_tick: self.config.idle_tick,
            };
            workers.push(tokio::spawn(worker.run_loop()));
        }

        // ---- Entry-point triggers --------------------------------------------
        let completed = ctx.completed_node_ids();
        for entry in definition.entry_points() {
            if checkpoint.is_some() {
                let already_done = completed.contains(&entry.node_id);
                let has_pending = ctx
                    .queue(&entry.node_id)
                    .is_some_and(|q| !q.is_empty());
                if already_done || has_pending {
                    continue;
                }
            }
            if let Some(queue) = ctx.queue(&entry.node_id) {
                let trigger = Arc::new(WorkflowMessage::NodeComplete(NodeCompleteMessage::new(
                    START_NODE_ID,
                    "",
                    NodeExecutionContext::new(),
                )));
                if queue.enqueue(trigger).is_err() {
                    tracing::warn!(
                        target: "flowloom::engine",
                        node_id = %entry.node_id,
                        "failed to enqueue entry trigger"
                    );
                }
            }
        }

        // ---- Workflow timeout -------------------------------------------------
        let timeout_guard = definition.timeout_seconds.map(|secs| {
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                        tracing::warn!(
                            target: "flowloom::engine",
                            timeout_seconds = secs,
                            "workflow timed out; cancelling workers"
                        );
                        cancel.cancel();
                    }
                }
            })
        });

        // ---- Completion supervision ------------------------------------------
        let poll = self
            .config
            .completion_grace
            .checked_div(2)
            .unwrap_or(Duration::from_millis(25))
            .max(Duration::from_millis(5));
        let mut quiet_since: Option<Instant> = None;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let drained = in_flight.load(Ordering::Acquire) == 0
                && ctx.node_queues.values().all(|q| q.is_empty());
            if drained {
                match quiet_since {
                    None => quiet_since = Some(Instant::now()),
                    Some(at) if at.elapsed() >= self.config.completion_grace => break,
                    Some(_) => {}
                }
            } else {
                quiet_since = None;
            }
            tokio::time::sleep(poll).await;
        }

        // ---- Terminal transition ----------------------------------------------
        let event = if self.cancel.is_cancelled() {
            if self.pause_requested.load(Ordering::Acquire) {
                ctx.try_transition(WorkflowStatus::Paused);
                None
            } else {
                ctx.try_transition(WorkflowStatus::Cancelled);
                Some(WorkflowLifecycleEvent::Cancelled {
                    instance_id: ctx.instance_id.clone(),
                    workflow_id: definition.workflow_id.clone(),
                    reason: "cancellation requested".to_string(),
                })
            }
        } else if unrouted_failure.load(Ordering::Acquire) {
            ctx.try_transition(WorkflowStatus::Failed);
            Some(WorkflowLifecycleEvent::Failed {
                instance_id: ctx.instance_id.clone(),
                workflow_id: definition.workflow_id.clone(),
                errors: ctx.errors(),
            })
        } else {
            ctx.try_transition(WorkflowStatus::Completed);
            Some(WorkflowLifecycleEvent::Completed {
                instance_id: ctx.instance_id.clone(),
                workflow_id: definition.workflow_id.clone(),
            })
        };

        // Stop workers and wait for them to drain their current leases.
        self.cancel.cancel();
        for handle in workers {
            let _ = handle.await;
        }
        if let Some(guard) = timeout_guard {
            guard.abort();
        }
        // Paused queues stay open so their contents survive into the
        // checkpoint; terminal runs stop accepting messages.
        if !self.pause_requested.load(Ordering::Acquire) {
            for queue in ctx.node_queues.values() {
                queue.close();
            }
        }

        if let Some(event) = event {
            let _ = self.emitter.emit(Event::Workflow(event));
        }
        Ok(ctx)
    }
}

// ============================================================================
// Per-node worker
// ============================================================================

struct NodeWorker {
    node: Arc<dyn WorkflowNode>,
    definition: NodeDefinition,
    queue: Arc<NodeMessageQueue>,
    run: NodeRun,
    cancel: CancellationToken,
    in_flight: Arc<AtomicUsize>,
    unrouted_failure: Arc<AtomicBool>,
    pause_requested: Arc<AtomicBool>,
    semaphore: Option<Arc<Semaphore>>,
    idle_tick: Duration,
}

impl NodeWorker {
    async fn run_loop(self) {
        let signal = self.queue.signal();
        let handler_id = format!("worker-{}", self.definition.node_id);
        loop {
            if self.cancel.is_cancelled() || self.run.workflow.status().is_terminal() {
                return;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = signal.recv_async() => {}
                // Timer wake retained for lease-expiry recovery when no
                // new arrivals occur.
                _ = tokio::time::sleep(self.idle_tick) => {}
            }
            loop {
                if self.cancel.is_cancelled() || self.run.workflow.status().is_terminal() {
                    return;
                }
                let permit = match &self.semaphore {
                    Some(semaphore) => tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        permit = semaphore.clone().acquire_owned() => match permit {
                            Ok(permit) => Some(permit),
                            Err(_) => return,
                        },
                    },
                    None => None,
                };
                let Some(lease) = self.queue.lease(&handler_id) else {
                    drop(permit);
                    break;
                };
                self.in_flight.fetch_add(1, Ordering::AcqRel);
                self.process(lease).await;
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
                drop(permit);
            }
        }
    }

    /// Execute one leased message through the node and route the result.
    async fn process(&self, lease: LeasedMessage) {
        let node_id = self.definition.node_id.clone();
        let Some(input) = input_context(lease.payload()) else {
            // Progress messages are observational; nothing to execute.
            self.queue.complete(&lease);
            return;
        };

        let mut instance = crate::context::NodeInstance::new(
            &node_id,
            &self.run.workflow.instance_id,
        );
        instance.transition(crate::types::NodeStatus::Running);
        let _ = self
            .run
            .emitter
            .emit(Event::node_started(&node_id, &instance.instance_id));

        let child_cancel = self.cancel.child_token();
        let execution = self
            .node
            .execute(&self.run, input.clone(), child_cancel.clone());
        let result = match self.definition.timeout_seconds {
            Some(secs) => {
                match tokio::time::timeout(Duration::from_secs(secs), execution).await {
                    Ok(result) => result,
                    Err(_) => {
                        child_cancel.cancel();
                        Err(NodeError::cancelled(format!(
                            "node timed out after {secs}s"
                        )))
                    }
                }
            }
            None => execution.await,
        };

        match result {
            Ok(outcome) => {
                let mut context = outcome.context;
                if context.input.is_empty() {
                    context.input = input.input;
                }
                instance.context = context.clone();
                instance.complete(outcome.source_port.clone());
                let duration_ms = instance
                    .duration()
                    .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
                let _ = self.run.emitter.emit(Event::node_completed(
                    &node_id,
                    &instance.instance_id,
                    duration_ms,
                ));
                self.queue.complete(&lease);
                let message = Arc::new(WorkflowMessage::NodeComplete(NodeCompleteMessage::new(
                    &node_id,
                    &outcome.source_port,
                    context,
                )));
                self.run.router.route_message(message, &self.run.workflow);
            }
            Err(NodeError::Cancelled { reason }) => {
                if self.pause_requested.load(Ordering::Acquire) {
                    // Leave the lease in flight: the checkpoint preserves
                    // the envelope as InFlight and just-in-time recovery
                    // redelivers it on resume.
                    return;
                }
                instance.cancel();
                let _ = self.run.emitter.emit(Event::node_cancelled(
                    &node_id,
                    &instance.instance_id,
                    &reason,
                ));
                self.queue.complete(&lease);
                let message = Arc::new(WorkflowMessage::NodeCancel(NodeCancelMessage::new(
                    &node_id, &reason,
                )));
                self.run.router.route_message(message, &self.run.workflow);
                self.run.workflow.record_instance(instance);
                return;
            }
            Err(error) => {
                let rendered = error.to_string();
                instance.fail(rendered.clone());
                let _ = self.run.emitter.emit(Event::node_failed(
                    &node_id,
                    &instance.instance_id,
                    &rendered,
                ));

                let mut route_failure = true;
                if error.is_fatal() {
                    self.queue.move_to_dead_letter(
                        &lease,
                        format!("fatal error at node `{node_id}`: {rendered}"),
                    );
                } else if self.definition.max_retries > 0 {
                    match self.queue.abandon(&lease) {
                        // The message will be redelivered; hold the
                        // failure signal until the budget is spent.
                        AbandonOutcome::Requeued => route_failure = false,
                        AbandonOutcome::DeadLettered => {}
                    }
                } else {
                    self.queue.complete(&lease);
                }

                if route_failure {
                    let message = Arc::new(WorkflowMessage::NodeFail(
                        NodeFailMessage::new(&node_id, rendered),
                    ));
                    self.run.router.route_message(message, &self.run.workflow);
                    if !self
                        .run
                        .router
                        .has_route_for(&node_id, TriggerKind::Fail)
                    {
                        self.unrouted_failure.store(true, Ordering::Release);
                        if self.run.config.cancel_on_unrouted_failure {
                            self.cancel.cancel();
                        }
                    }
                }
            }
        }
        self.run.workflow.record_instance(instance);
    }
}

/// Derive the execution input context from a triggering message.
/// `None` for observational messages that should not execute the node.
fn input_context(message: &WorkflowMessage) -> Option<NodeExecutionContext> {
    let mut context = match message {
        WorkflowMessage::NodeComplete(m) => {
            // Downstream input is the upstream output captured at emit time.
            NodeExecutionContext::with_input(m.context.output.clone())
        }
        WorkflowMessage::NodeNext(m) => {
            let mut ctx = NodeExecutionContext::with_input(m.context.input.clone());
            ctx.set_metadata(META_ITERATION_INDEX, m.iteration_index.into());
            ctx
        }
        WorkflowMessage::NodeFail(m) => {
            let mut ctx = NodeExecutionContext::new();
            ctx.input.insert("error".into(), m.error.clone().into());
            ctx
        }
        WorkflowMessage::NodeCancel(_) => NodeExecutionContext::new(),
        WorkflowMessage::Progress(_) => return None,
    };
    let port = message.source_port();
    if !port.is_empty() {
        context.set_metadata(META_SOURCE_PORT, port.into());
    }
    Some(context)
}
