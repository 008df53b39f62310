#![allow(dead_code)]

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use flowloom::context::IoMap;
use flowloom::nodes::{NodeError, TaskRegistry};

/// Shared log of task executions, in completion order.
#[derive(Clone, Default)]
pub struct ExecutionLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl ExecutionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, name: &str) {
        self.entries.lock().push(name.to_string());
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.entries.lock().clone()
    }
}

/// Shared start/end interval log for overlap assertions.
#[derive(Clone, Default)]
pub struct IntervalLog {
    entries: Arc<Mutex<Vec<(String, DateTime<Utc>, DateTime<Utc>)>>>,
}

impl IntervalLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<(String, DateTime<Utc>, DateTime<Utc>)> {
        self.entries.lock().clone()
    }

    /// Whether the intervals for `a` and `b` overlap in time.
    pub fn overlaps(&self, a: &str, b: &str) -> bool {
        let entries = self.entries.lock();
        let find = |name: &str| {
            entries
                .iter()
                .find(|(n, _, _)| n == name)
                .map(|(_, start, end)| (*start, *end))
        };
        match (find(a), find(b)) {
            (Some((start_a, end_a)), Some((start_b, end_b))) => {
                start_a <= end_b && start_b <= end_a
            }
            _ => false,
        }
    }
}

/// Register a task that records its name and sleeps briefly.
pub fn register_recorder(
    registry: &TaskRegistry,
    task_name: &str,
    log: &ExecutionLog,
    delay: Duration,
) {
    let log = log.clone();
    let name = task_name.to_string();
    registry.register_fn(task_name, move |_ctx| {
        let log = log.clone();
        let name = name.clone();
        async move {
            tokio::time::sleep(delay).await;
            log.record(&name);
            Ok(IoMap::new())
        }
    });
}

/// Register a task that records its execution interval.
pub fn register_interval(
    registry: &TaskRegistry,
    task_name: &str,
    log: &IntervalLog,
    delay: Duration,
) {
    let entries = log.entries.clone();
    let name = task_name.to_string();
    registry.register_fn(task_name, move |_ctx| {
        let entries = entries.clone();
        let name = name.clone();
        async move {
            let start = Utc::now();
            tokio::time::sleep(delay).await;
            entries.lock().push((name, start, Utc::now()));
            Ok(IoMap::new())
        }
    });
}

/// Register a task that always fails, counting attempts.
pub fn register_failing(registry: &TaskRegistry, task_name: &str) -> Arc<AtomicU32> {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    registry.register_fn(task_name, move |_ctx| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(NodeError::Backend {
                backend: "test",
                message: "intentional failure".to_string(),
            })
        }
    });
    attempts
}

/// Register a task that blocks until cancelled (or a long fallback).
pub fn register_gate(registry: &TaskRegistry, task_name: &str) {
    registry.register_fn(task_name, move |ctx| async move {
        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(NodeError::cancelled("gate interrupted")),
            _ = tokio::time::sleep(Duration::from_secs(30)) => Ok(IoMap::new()),
        }
    });
}

/// Register a task that completes immediately.
pub fn register_noop_task(registry: &TaskRegistry, task_name: &str) {
    registry.register_fn(task_name, move |_ctx| async move { Ok(IoMap::new()) });
}
