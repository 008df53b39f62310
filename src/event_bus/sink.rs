//! Event sinks: synchronous observers attached to the bus.
//!
//! Sinks run inline on the emitting worker, so implementations must be
//! quick and must never block on a full downstream. Anything slow sits
//! behind a [`ChannelSink`] (drained by its own consumer task) or an
//! async tap from [`EventBus::subscribe`](super::EventBus::subscribe).
//!
//! Besides the plain renderers, this module carries two workflow-aware
//! consumers: [`MemorySink`], which answers lifecycle queries per node
//! and per instance for tests and diagnostics, and [`ProgressTreeSink`],
//! which folds hierarchical `Progress` events (`container/child` keys)
//! into a live tree for progress renderers.

use std::collections::BTreeMap;
use std::io::{self, Result as IoResult, Stdout, Write};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use super::event::{Event, NodeLifecycleEvent};
use crate::telemetry::{PlainFormatter, TelemetryFormatter};

/// A synchronous consumer of dispatched events.
pub trait EventSink: Send + Sync {
    /// Handle one event. Errors are counted and logged by the bus; they
    /// never abort delivery to other sinks.
    fn handle(&mut self, event: &Event) -> IoResult<()>;

    /// Short human-friendly identifier, used in sink-failure logs.
    fn name(&self) -> String {
        let full = std::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full).to_string()
    }
}

/// Renders events to stdout through a telemetry formatter.
pub struct ConsoleSink {
    out: Stdout,
    formatter: Box<dyn TelemetryFormatter>,
}

impl Default for ConsoleSink {
    fn default() -> Self {
        Self::with_formatter(Box::new(PlainFormatter::new()))
    }
}

impl ConsoleSink {
    #[must_use]
    pub fn with_formatter(formatter: Box<dyn TelemetryFormatter>) -> Self {
        Self {
            out: io::stdout(),
            formatter,
        }
    }
}

impl EventSink for ConsoleSink {
    fn handle(&mut self, event: &Event) -> IoResult<()> {
        let mut out = self.out.lock();
        writeln!(out, "{}", self.formatter.render_event(event))?;
        out.flush()
    }
}

/// In-memory sink with lifecycle queries, for tests and diagnostics.
#[derive(Clone, Default)]
pub struct MemorySink {
    entries: Arc<Mutex<Vec<Event>>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every captured event, in dispatch order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Event> {
        self.entries.lock().clone()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Lifecycle events for one node id (namespaced ids included as-is).
    #[must_use]
    pub fn node_events(&self, node_id: &str) -> Vec<NodeLifecycleEvent> {
        self.entries
            .lock()
            .iter()
            .filter_map(|event| match event {
                Event::Node(node) if node.node_id() == node_id => Some(node.clone()),
                _ => None,
            })
            .collect()
    }

    /// The phases observed for one node instance, in dispatch order.
    /// A well-behaved run yields `started` followed by exactly one
    /// terminal phase.
    #[must_use]
    pub fn instance_phases(&self, instance_id: &str) -> Vec<&'static str> {
        self.entries
            .lock()
            .iter()
            .filter_map(|event| match event {
                Event::Node(node) if node.instance_id() == Some(instance_id) => {
                    Some(node.phase_label())
                }
                _ => None,
            })
            .collect()
    }
}

impl EventSink for MemorySink {
    fn handle(&mut self, event: &Event) -> IoResult<()> {
        self.entries.lock().push(event.clone());
        Ok(())
    }
}

/// One JSON object per line, using the normalized event schema. Suited
/// to log aggregation and scripted assertions.
pub struct JsonLinesSink {
    writer: Box<dyn Write + Send + Sync>,
}

impl JsonLinesSink {
    #[must_use]
    pub fn new(writer: Box<dyn Write + Send + Sync>) -> Self {
        Self { writer }
    }

    #[must_use]
    pub fn to_stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }

    pub fn to_file(path: impl AsRef<Path>) -> IoResult<Self> {
        let file = std::fs::File::create(path)?;
        Ok(Self::new(Box::new(file)))
    }
}

impl EventSink for JsonLinesSink {
    fn handle(&mut self, event: &Event) -> IoResult<()> {
        let line = event.to_json_string().map_err(io::Error::other)?;
        writeln!(self.writer, "{line}")?;
        self.writer.flush()
    }
}

/// Forwards events into a flume channel for async consumers.
pub struct ChannelSink {
    tx: flume::Sender<Event>,
}

impl ChannelSink {
    #[must_use]
    pub fn new(tx: flume::Sender<Event>) -> Self {
        Self { tx }
    }

    /// Sink plus its receiving half, ready to hand to a consumer task.
    #[must_use]
    pub fn pair() -> (Self, flume::Receiver<Event>) {
        let (tx, rx) = flume::unbounded();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn handle(&mut self, event: &Event) -> IoResult<()> {
        self.tx.send(event.clone()).map_err(|_| {
            io::Error::new(
                io::ErrorKind::BrokenPipe,
                "event channel consumer went away",
            )
        })
    }
}

/// Current progress of one tree entry.
#[derive(Clone, Debug, PartialEq)]
pub struct ProgressEntry {
    pub percent: f64,
    pub status: String,
}

/// Folds `Progress` events into a live hierarchical tree.
///
/// Keys are slash-separated paths (`container/child`) as produced by
/// nested containers and subflows; the snapshot is sorted by path, so a
/// renderer can indent by depth (`key.matches('/').count()`). Later
/// events for the same key replace earlier ones.
#[derive(Clone, Default)]
pub struct ProgressTreeSink {
    state: Arc<Mutex<BTreeMap<String, ProgressEntry>>>,
}

impl ProgressTreeSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All entries, sorted by hierarchical key.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, ProgressEntry)> {
        self.state
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Latest percent reported under the given key.
    #[must_use]
    pub fn percent_of(&self, key: &str) -> Option<f64> {
        self.state.lock().get(key).map(|entry| entry.percent)
    }
}

impl EventSink for ProgressTreeSink {
    fn handle(&mut self, event: &Event) -> IoResult<()> {
        if let Event::Progress(progress) = event {
            self.state.lock().insert(
                progress.key.clone(),
                ProgressEntry {
                    percent: progress.percent,
                    status: progress.status.clone(),
                },
            );
        }
        Ok(())
    }
}
