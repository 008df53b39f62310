//! Message routing: connection table plus filter/deliver logic.
//!
//! Given a message emitted by a source node, the router walks the source's
//! connection list and delivers the message to every target whose filters
//! all pass: connection enabled, trigger kind matches, source port matches
//! (case-insensitive, empty matches any), guard expression true (absent =
//! true, evaluation error = false). Syntactic guard errors never reach
//! here; they surface at workflow-load validation.
//!
//! Fan-out to N targets produces N independent delivery attempts sharing
//! one immutable payload. A failed delivery becomes a dead-letter entry
//! with a reason naming the target and never aborts routing to the other
//! targets.

use rustc_hash::FxHashMap;
use std::sync::Arc;

use crate::context::WorkflowExecutionContext;
use crate::definition::NodeConnection;
use crate::envelope::MessageEnvelope;
use crate::event_bus::{Event, EventEmitter};
use crate::expression::{self, Environment};
use crate::messages::WorkflowMessage;

/// Connection table keyed by source node id.
pub struct MessageRouter {
    connections: FxHashMap<String, Vec<NodeConnection>>,
    emitter: Arc<dyn EventEmitter>,
}

impl MessageRouter {
    #[must_use]
    pub fn new(connections: &[NodeConnection], emitter: Arc<dyn EventEmitter>) -> Self {
        let mut table: FxHashMap<String, Vec<NodeConnection>> = FxHashMap::default();
        for conn in connections {
            table
                .entry(conn.source_node_id.clone())
                .or_default()
                .push(conn.clone());
        }
        Self {
            connections: table,
            emitter,
        }
    }

    /// Connections leaving the given source node.
    #[must_use]
    pub fn connections_from(&self, source_node_id: &str) -> &[NodeConnection] {
        self.connections
            .get(source_node_id)
            .map_or(&[], Vec::as_slice)
    }

    /// Whether the source node has any enabled connection for the given
    /// trigger kind. The engine uses this to decide if a `NodeFail` has a
    /// compensating route.
    #[must_use]
    pub fn has_route_for(&self, source_node_id: &str, trigger: crate::types::TriggerKind) -> bool {
        self.connections_from(source_node_id)
            .iter()
            .any(|c| c.is_enabled && c.trigger_kind == trigger)
    }

    /// Deliver `message` to every matching target queue. Returns the
    /// number of successful deliveries.
    pub fn route_message(
        &self,
        message: Arc<WorkflowMessage>,
        ctx: &WorkflowExecutionContext,
    ) -> usize {
        let Some(trigger) = message.trigger_kind() else {
            return 0; // Progress messages are observational.
        };
        let source = message.node_id();
        let mut delivered = 0;

        for conn in self.connections_from(source) {
            if !conn.is_enabled || conn.trigger_kind != trigger {
                continue;
            }
            if !conn.matches_port(message.source_port()) {
                continue;
            }
            if !self.guard_passes(conn, &message, ctx) {
                continue;
            }

            let target = conn.target_node_id.as_str();
            let outcome = match ctx.queue(target) {
                Some(queue) => queue.enqueue(Arc::clone(&message)).err().map(|e| e.to_string()),
                None => Some(format!("no queue registered for node `{target}`")),
            };
            match outcome {
                None => {
                    delivered += 1;
                    tracing::debug!(
                        target: "flowloom::router",
                        source_node = source,
                        target_node = target,
                        trigger = %trigger,
                        "message routed"
                    );
                }
                Some(detail) => {
                    let envelope = MessageEnvelope::new(Arc::clone(&message), 0);
                    ctx.dead_letter.push(
                        envelope,
                        format!("Failed to route to {target}"),
                        Some(detail.clone()),
                    );
                    let _ = self.emitter.emit(Event::diagnostic(
                        "router",
                        format!("failed to route `{source}` -> `{target}`: {detail}"),
                    ));
                }
            }
        }
        delivered
    }

    /// Evaluate the connection guard against the source node's execution
    /// context. Absent guard is true; evaluation errors are false.
    fn guard_passes(
        &self,
        conn: &NodeConnection,
        message: &WorkflowMessage,
        ctx: &WorkflowExecutionContext,
    ) -> bool {
        let Some(guard) = conn.guard.as_deref() else {
            return true;
        };
        // The guard's `input` scope sees the data traveling with the
        // message: the source context's output.
        let (input, local) = match message.context() {
            Some(snapshot) => (snapshot.output.clone(), snapshot.local.clone()),
            None => (Default::default(), Default::default()),
        };
        let env = Environment::new(ctx.variables.clone(), input, local);
        match expression::evaluate_bool(guard, &env) {
            Ok(pass) => pass,
            Err(e) => {
                tracing::warn!(
                    target: "flowloom::router",
                    source_node = %conn.source_node_id,
                    target_node = %conn.target_node_id,
                    error = %e,
                    "guard evaluation failed; connection skipped"
                );
                let _ = self.emitter.emit(Event::diagnostic(
                    "router",
                    format!(
                        "guard on `{}` -> `{}` failed to evaluate: {e}",
                        conn.source_node_id, conn.target_node_id
                    ),
                ));
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::NodeExecutionContext;
    use crate::event_bus::NullEmitter;
    use crate::messages::{NodeCompleteMessage, NodeFailMessage};
    use crate::queue::{DeadLetterQueue, NodeMessageQueue};
    use crate::types::TriggerKind;
    use serde_json::json;
    use std::time::Duration;

    fn ctx_with_queues(node_ids: &[&str]) -> WorkflowExecutionContext {
        let dlq = Arc::new(DeadLetterQueue::new(16));
        let queues = node_ids
            .iter()
            .map(|id| {
                (
                    (*id).to_string(),
                    Arc::new(NodeMessageQueue::new(
                        id,
                        16,
                        Duration::from_secs(5),
                        0,
                        dlq.clone(),
                    )),
                )
            })
            .collect();
        WorkflowExecutionContext::new("wf", "wf", Default::default(), queues, dlq)
    }

    fn complete_from(node: &str, port: &str) -> Arc<WorkflowMessage> {
        Arc::new(WorkflowMessage::NodeComplete(NodeCompleteMessage::new(
            node,
            port,
            NodeExecutionContext::new(),
        )))
    }

    fn router(conns: Vec<NodeConnection>) -> MessageRouter {
        MessageRouter::new(&conns, Arc::new(NullEmitter))
    }

    #[test]
    fn fan_out_delivers_to_all_matching_targets() {
        let ctx = ctx_with_queues(&["a", "b", "c", "d"]);
        let r = router(vec![
            NodeConnection::complete("a", "b"),
            NodeConnection::complete("a", "c"),
            NodeConnection::complete("a", "d"),
        ]);
        let delivered = r.route_message(complete_from("a", ""), &ctx);
        assert_eq!(delivered, 3);
        for id in ["b", "c", "d"] {
            assert_eq!(ctx.queue(id).unwrap().len(), 1);
        }
    }

    #[test]
    fn trigger_kind_filters() {
        let ctx = ctx_with_queues(&["a", "ok", "err"]);
        let r = router(vec![
            NodeConnection::complete("a", "ok"),
            NodeConnection::new("a", "err", TriggerKind::Fail),
        ]);
        let fail = Arc::new(WorkflowMessage::NodeFail(NodeFailMessage::new("a", "boom")));
        assert_eq!(r.route_message(fail, &ctx), 1);
        assert_eq!(ctx.queue("err").unwrap().len(), 1);
        assert!(ctx.queue("ok").unwrap().is_empty());
    }

    #[test]
    fn source_port_filters_case_insensitively() {
        let ctx = ctx_with_queues(&["gate", "yes", "no"]);
        let r = router(vec![
            NodeConnection::complete("gate", "yes").on_port("true"),
            NodeConnection::complete("gate", "no").on_port("False"),
        ]);
        assert_eq!(r.route_message(complete_from("gate", "True"), &ctx), 1);
        assert_eq!(ctx.queue("yes").unwrap().len(), 1);
        assert!(ctx.queue("no").unwrap().is_empty());
    }

    #[test]
    fn disabled_connections_never_route() {
        let ctx = ctx_with_queues(&["a", "b"]);
        let r = router(vec![NodeConnection::complete("a", "b").disabled()]);
        assert_eq!(r.route_message(complete_from("a", ""), &ctx), 0);
    }

    #[test]
    fn guard_filters_and_errors_are_false() {
        let ctx = ctx_with_queues(&["a", "guarded", "broken"]);
        ctx.set_variable("threshold", json!(10));
        let r = router(vec![
            NodeConnection::complete("a", "guarded").with_guard("global.threshold > 5"),
            // References an unknown bare identifier: evaluation error.
            NodeConnection::complete("a", "broken").with_guard("nonsense > 1"),
        ]);
        assert_eq!(r.route_message(complete_from("a", ""), &ctx), 1);
        assert_eq!(ctx.queue("guarded").unwrap().len(), 1);
        assert!(ctx.queue("broken").unwrap().is_empty());
    }

    #[test]
    fn guard_sees_message_output() {
        let ctx = ctx_with_queues(&["a", "b"]);
        let mut snapshot = NodeExecutionContext::new();
        snapshot.output.insert("code".into(), json!(200));
        let msg = Arc::new(WorkflowMessage::NodeComplete(NodeCompleteMessage::new(
            "a", "", snapshot,
        )));
        let r = router(vec![
            NodeConnection::complete("a", "b").with_guard("input.code == 200"),
        ]);
        assert_eq!(r.route_message(msg, &ctx), 1);
    }

    #[test]
    fn delivery_failure_dead_letters_but_continues() {
        let ctx = ctx_with_queues(&["a", "b"]);
        // `ghost` has no queue; `b` should still receive its copy.
        let r = router(vec![
            NodeConnection::complete("a", "ghost"),
            NodeConnection::complete("a", "b"),
        ]);
        let delivered = r.route_message(complete_from("a", ""), &ctx);
        assert_eq!(delivered, 1);
        assert_eq!(ctx.dead_letter.len(), 1);
        let entry = &ctx.dead_letter.list()[0];
        assert!(entry.reason.contains("Failed to route to ghost"));
        assert_eq!(ctx.queue("b").unwrap().len(), 1);
    }

    #[test]
    fn progress_messages_are_not_routed() {
        let ctx = ctx_with_queues(&["a", "b"]);
        let r = router(vec![NodeConnection::complete("a", "b")]);
        let progress = Arc::new(WorkflowMessage::Progress(
            crate::messages::ProgressMessage::new("a", 10.0, "working"),
        ));
        assert_eq!(r.route_message(progress, &ctx), 0);
    }
}
