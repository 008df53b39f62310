#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use flowloom::definition::WorkflowDefinition;
use flowloom::engine::{EngineConfig, WorkflowEngine};
use flowloom::event_bus::EventBus;
use flowloom::nodes::{NodeServices, TaskRegistry};

/// Engine config tuned for fast tests: short visibility timeout so
/// retry back-off does not dominate wall-clock time.
pub fn test_config() -> EngineConfig {
    EngineConfig::default()
        .with_queue_capacity(64)
        .with_visibility_timeout(Duration::from_millis(50))
}

/// Services with the given task registry and default shell backend.
pub fn services_with_tasks(tasks: Arc<TaskRegistry>) -> Arc<NodeServices> {
    Arc::new(NodeServices {
        tasks,
        ..NodeServices::default()
    })
}

/// Quiet engine for tests: silent event bus, fast config.
pub fn test_engine(definition: WorkflowDefinition) -> WorkflowEngine {
    WorkflowEngine::new(definition)
        .with_config(test_config())
        .with_event_bus(EventBus::silent())
}

/// Quiet engine with a populated task registry.
pub fn test_engine_with_tasks(
    definition: WorkflowDefinition,
    tasks: Arc<TaskRegistry>,
) -> WorkflowEngine {
    test_engine(definition).with_services(services_with_tasks(tasks))
}
