use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use super::event::{Event, NodeLifecycleEvent};

/// Trait representing an abstract event emitter that workers and nodes
/// can clone. Emission is synchronous and must not block.
pub trait EventEmitter: Send + Sync + fmt::Debug {
    fn emit(&self, event: Event) -> Result<(), EmitterError>;
}

/// Errors that can occur when emitting an event.
#[derive(Debug, Error)]
pub enum EmitterError {
    #[error("event bus closed")]
    Closed,
    #[error("event emission failed: {0}")]
    Other(String),
}

impl EmitterError {
    pub fn other(error: impl Into<String>) -> Self {
        Self::Other(error.into())
    }
}

/// Emitter that swallows events; used where observability is optional.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullEmitter;

impl EventEmitter for NullEmitter {
    fn emit(&self, _event: Event) -> Result<(), EmitterError> {
        Ok(())
    }
}

/// Wraps an emitter so that node/progress events are re-scoped under a
/// parent namespace before forwarding.
///
/// Containers prefix child progress keys (`[container/child] message`)
/// and subflows re-broadcast child lifecycle events namespaced by the
/// subflow node id.
#[derive(Clone, Debug)]
pub struct NamespacedEmitter {
    inner: Arc<dyn EventEmitter>,
    prefix: String,
}

impl NamespacedEmitter {
    #[must_use]
    pub fn new(inner: Arc<dyn EventEmitter>, prefix: impl Into<String>) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
        }
    }
}

impl EventEmitter for NamespacedEmitter {
    fn emit(&self, event: Event) -> Result<(), EmitterError> {
        let event = match event {
            Event::Node(node) => Event::Node(NodeLifecycleEvent::namespaced(node, &self.prefix)),
            Event::Progress(mut progress) => {
                progress.key = format!("{}/{}", self.prefix, progress.key);
                Event::Progress(progress)
            }
            // Workflow-level and diagnostic events of a child run stay
            // scoped to the child; forward untouched.
            other => other,
        };
        self.inner.emit(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug, Default)]
    struct Capture(Mutex<Vec<Event>>);

    impl EventEmitter for Capture {
        fn emit(&self, event: Event) -> Result<(), EmitterError> {
            self.0.lock().push(event);
            Ok(())
        }
    }

    #[test]
    fn namespaced_emitter_prefixes_node_ids() {
        let capture = Arc::new(Capture::default());
        let emitter = NamespacedEmitter::new(capture.clone(), "outer");
        emitter.emit(Event::node_started("inner", "i-1")).unwrap();
        emitter.emit(Event::progress("inner", 50.0, "half")).unwrap();

        let events = capture.0.lock();
        assert_eq!(events[0].node_id(), Some("outer/inner"));
        match &events[1] {
            Event::Progress(p) => assert_eq!(p.key, "outer/inner"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
