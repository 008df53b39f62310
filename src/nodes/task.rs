//! In-process task handlers for `Task` nodes.
//!
//! The task registry is the engine's capability interface for work that
//! lives in the host process: callers register named handlers before
//! starting a workflow, and `Task` nodes resolve them by name at
//! execution time. A missing handler is a fatal error (the triggering
//! envelope is dead-lettered without retry).

use async_trait::async_trait;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::NodeError;
use crate::context::IoMap;

/// What a task handler sees: the triggering input data plus a handle to
/// the workflow variables.
pub struct TaskContext {
    pub input: IoMap,
    pub variables: Arc<RwLock<FxHashMap<String, Value>>>,
    pub cancel: CancellationToken,
}

impl TaskContext {
    #[must_use]
    pub fn get_variable(&self, name: &str) -> Option<Value> {
        self.variables.read().get(name).cloned()
    }

    pub fn set_variable(&self, name: &str, value: Value) {
        self.variables.write().insert(name.to_string(), value);
    }
}

/// A named unit of in-process work.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, ctx: TaskContext) -> Result<IoMap, NodeError>;
}

/// Blanket adapter so plain async closures can be registered directly.
pub(crate) struct FnTask<F>(pub F);

#[async_trait]
impl<F, Fut> TaskHandler for FnTask<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<IoMap, NodeError>> + Send,
{
    async fn run(&self, ctx: TaskContext) -> Result<IoMap, NodeError> {
        (self.0)(ctx).await
    }
}

/// Name → handler registry shared by all `Task` nodes of an engine run.
#[derive(Default)]
pub struct TaskRegistry {
    handlers: RwLock<FxHashMap<String, Arc<dyn TaskHandler>>>,
}

impl TaskRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, handler: Arc<dyn TaskHandler>) {
        self.handlers.write().insert(name.to_string(), handler);
    }

    /// Register an async closure as a task handler.
    pub fn register_fn<F, Fut>(&self, name: &str, f: F)
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<IoMap, NodeError>> + Send + 'static,
    {
        self.register(name, Arc::new(FnTask(f)));
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.read().get(name).cloned()
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.handlers.read().keys().cloned().collect()
    }
}
