//! Central dispatch for workflow execution events.
//!
//! Dispatch is synchronous: `emit` runs on the emitting worker, invoking
//! every attached sink in registration order before returning. That is
//! the observer contract the engine relies on — a subscriber sees, for
//! any single node instance, Started strictly before its terminal event,
//! because both were dispatched inline from the same worker. The flip
//! side is that sinks must not block; slow consumers belong behind
//! [`subscribe`](EventBus::subscribe) (an async tap over a broadcast
//! channel that drops on lag instead of stalling workers) or a
//! [`ChannelSink`](crate::event_bus::ChannelSink) drained elsewhere.
//!
//! The bus also keeps per-kind counters ([`EventBusStats`]) so tests and
//! monitors can assert on event volume without attaching a sink.

use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;

use futures_util::stream::{self, BoxStream, StreamExt};

use super::emitter::{EmitterError, EventEmitter};
use super::event::Event;
use super::sink::{ConsoleSink, EventSink};

const TAP_BUFFER_CAPACITY: usize = 1024;

/// Which event kinds a sink wants delivered.
///
/// Progress-tree renderers attach with [`EventFilter::Progress`] so they
/// never pay for node/workflow lifecycle traffic.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EventFilter {
    #[default]
    All,
    Node,
    Workflow,
    Progress,
    Diagnostic,
}

impl EventFilter {
    #[must_use]
    pub fn accepts(&self, event: &Event) -> bool {
        matches!(
            (self, event),
            (Self::All, _)
                | (Self::Node, Event::Node(_))
                | (Self::Workflow, Event::Workflow(_))
                | (Self::Progress, Event::Progress(_))
                | (Self::Diagnostic, Event::Diagnostic(_))
        )
    }
}

/// Snapshot of bus activity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventBusStats {
    pub emitted: u64,
    pub node_events: u64,
    pub workflow_events: u64,
    pub progress_events: u64,
    pub diagnostics: u64,
    /// Sink `handle` calls that returned an error (event skipped for that
    /// sink, delivery to the others unaffected).
    pub sink_errors: u64,
    /// Events dropped by slow async taps.
    pub tap_lag: u64,
}

#[derive(Debug, Default)]
struct Counters {
    emitted: AtomicU64,
    node_events: AtomicU64,
    workflow_events: AtomicU64,
    progress_events: AtomicU64,
    diagnostics: AtomicU64,
    sink_errors: AtomicU64,
    tap_lag: AtomicU64,
}

struct SinkEntry {
    sink: Box<dyn EventSink>,
    filter: EventFilter,
}

struct BusInner {
    sinks: Mutex<Vec<SinkEntry>>,
    /// Broadcast tap, created lazily on first subscription.
    tap: RwLock<Option<broadcast::Sender<Event>>>,
    counters: Counters,
}

impl BusInner {
    fn dispatch(&self, event: Event) {
        self.counters.emitted.fetch_add(1, Ordering::Relaxed);
        let per_kind = match &event {
            Event::Node(_) => &self.counters.node_events,
            Event::Workflow(_) => &self.counters.workflow_events,
            Event::Progress(_) => &self.counters.progress_events,
            Event::Diagnostic(_) => &self.counters.diagnostics,
        };
        per_kind.fetch_add(1, Ordering::Relaxed);

        {
            let mut sinks = self.sinks.lock();
            for entry in sinks.iter_mut() {
                if !entry.filter.accepts(&event) {
                    continue;
                }
                if let Err(err) = entry.sink.handle(&event) {
                    self.counters.sink_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        target: "flowloom::event_bus",
                        sink = %entry.sink.name(),
                        error = %err,
                        "event sink failed; event skipped for this sink"
                    );
                }
            }
        }

        if let Some(sender) = self.tap.read().as_ref() {
            // A send error just means no tap is currently listening.
            let _ = sender.send(event);
        }
    }

    fn record_tap_lag(&self, missed: u64) {
        let missed_count = missed.max(1);
        let total = self
            .counters
            .tap_lag
            .fetch_add(missed_count, Ordering::Relaxed)
            .saturating_add(missed_count);
        tracing::warn!(
            target: "flowloom::event_bus",
            missed,
            total_dropped = total,
            "async tap lagged; events dropped"
        );
    }

    fn stats(&self) -> EventBusStats {
        EventBusStats {
            emitted: self.counters.emitted.load(Ordering::Relaxed),
            node_events: self.counters.node_events.load(Ordering::Relaxed),
            workflow_events: self.counters.workflow_events.load(Ordering::Relaxed),
            progress_events: self.counters.progress_events.load(Ordering::Relaxed),
            diagnostics: self.counters.diagnostics.load(Ordering::Relaxed),
            sink_errors: self.counters.sink_errors.load(Ordering::Relaxed),
            tap_lag: self.counters.tap_lag.load(Ordering::Relaxed),
        }
    }
}

/// Synchronous event dispatcher with an optional async tap.
///
/// The engine owns one bus per run. Workers emit through
/// [`get_emitter`](Self::get_emitter); sinks attached via
/// [`add_sink`](Self::add_sink) run inline on the emitting worker, and
/// [`subscribe`](Self::subscribe) hands out buffered async streams for
/// consumers that cannot keep pace with dispatch.
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    /// Console rendering only.
    fn default() -> Self {
        Self::with_sink(ConsoleSink::default())
    }
}

impl EventBus {
    /// Bus with no sinks; events reach async taps and counters only.
    #[must_use]
    pub fn silent() -> Self {
        Self::with_sinks(Vec::new())
    }

    #[must_use]
    pub fn with_sink<T>(sink: T) -> Self
    where
        T: EventSink + 'static,
    {
        Self::with_sinks(vec![Box::new(sink)])
    }

    #[must_use]
    pub fn with_sinks(sinks: Vec<Box<dyn EventSink>>) -> Self {
        let entries = sinks
            .into_iter()
            .map(|sink| SinkEntry {
                sink,
                filter: EventFilter::All,
            })
            .collect();
        Self {
            inner: Arc::new(BusInner {
                sinks: Mutex::new(entries),
                tap: RwLock::new(None),
                counters: Counters::default(),
            }),
        }
    }

    /// Attach a sink receiving every event.
    pub fn add_sink<T: EventSink + 'static>(&self, sink: T) {
        self.add_filtered_sink(sink, EventFilter::All);
    }

    /// Attach a sink receiving only the filtered event kind.
    pub fn add_filtered_sink<T: EventSink + 'static>(&self, sink: T, filter: EventFilter) {
        self.inner.sinks.lock().push(SinkEntry {
            sink: Box::new(sink),
            filter,
        });
    }

    /// Emitter handle for workers and nodes. Emission is infallible from
    /// the bus's point of view: sink errors are counted and logged, never
    /// surfaced to the emitting worker.
    #[must_use]
    pub fn get_emitter(&self) -> Arc<dyn EventEmitter> {
        Arc::new(BusEmitter {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Buffered async tap over all dispatched events.
    ///
    /// Slow readers lose the oldest buffered events (counted in
    /// [`EventBusStats::tap_lag`]) rather than stalling workers.
    #[must_use]
    pub fn subscribe(&self) -> EventStream {
        let mut tap = self.inner.tap.write();
        let sender = tap
            .get_or_insert_with(|| broadcast::channel(TAP_BUFFER_CAPACITY).0);
        EventStream {
            receiver: sender.subscribe(),
            bus: Arc::clone(&self.inner),
        }
    }

    #[must_use]
    pub fn stats(&self) -> EventBusStats {
        self.inner.stats()
    }
}

#[derive(Clone)]
struct BusEmitter {
    inner: Arc<BusInner>,
}

impl fmt::Debug for BusEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusEmitter").finish_non_exhaustive()
    }
}

impl EventEmitter for BusEmitter {
    fn emit(&self, event: Event) -> Result<(), EmitterError> {
        self.inner.dispatch(event);
        Ok(())
    }
}

/// Async view of the bus: a buffered stream of dispatched events.
pub struct EventStream {
    receiver: broadcast::Receiver<Event>,
    bus: Arc<BusInner>,
}

impl EventStream {
    /// Next event; `None` once the bus has been dropped. Lag is counted
    /// into the bus stats and skipped over.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    self.bus.record_tap_lag(missed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive; `None` when nothing is buffered.
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    self.bus.record_tap_lag(missed);
                }
                Err(_) => return None,
            }
        }
    }

    /// Drain everything currently buffered.
    pub fn drain(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(event) = self.try_recv() {
            events.push(event);
        }
        events
    }

    /// Next event within the deadline, else `None`.
    pub async fn next_timeout(&mut self, duration: Duration) -> Option<Event> {
        timeout(duration, self.recv()).await.ok().flatten()
    }

    /// First event matching the predicate within the deadline.
    pub async fn wait_for(
        &mut self,
        deadline: Duration,
        predicate: impl Fn(&Event) -> bool,
    ) -> Option<Event> {
        let matching = async {
            loop {
                match self.recv().await {
                    Some(event) if predicate(&event) => return Some(event),
                    Some(_) => continue,
                    None => return None,
                }
            }
        };
        timeout(deadline, matching).await.ok().flatten()
    }

    /// Adapt into a boxed `Stream` for combinator-style consumers.
    pub fn into_stream(self) -> BoxStream<'static, Event> {
        stream::unfold(self, |mut events| async move {
            events.recv().await.map(|event| (event, events))
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::MemorySink;

    #[test]
    fn dispatch_is_synchronous_and_ordered() {
        let bus = EventBus::silent();
        let sink = MemorySink::new();
        bus.add_sink(sink.clone());
        let emitter = bus.get_emitter();

        emitter.emit(Event::node_started("a", "i-1")).unwrap();
        emitter.emit(Event::node_completed("a", "i-1", 3)).unwrap();

        // Both events are visible the moment emit returns.
        let seen = sink.snapshot();
        assert_eq!(seen.len(), 2);
        assert_eq!(sink.instance_phases("i-1"), vec!["node_started", "node_completed"]);

        let stats = bus.stats();
        assert_eq!(stats.emitted, 2);
        assert_eq!(stats.node_events, 2);
        assert_eq!(stats.sink_errors, 0);
    }

    #[test]
    fn filtered_sinks_see_only_their_kind() {
        let bus = EventBus::silent();
        let progress_only = MemorySink::new();
        bus.add_filtered_sink(progress_only.clone(), EventFilter::Progress);
        let emitter = bus.get_emitter();

        emitter.emit(Event::node_started("a", "i-1")).unwrap();
        emitter.emit(Event::progress("a", 40.0, "working")).unwrap();
        emitter.emit(Event::diagnostic("router", "delivered")).unwrap();

        let seen = progress_only.snapshot();
        assert_eq!(seen.len(), 1);
        assert!(matches!(seen[0], Event::Progress(_)));
        assert_eq!(bus.stats().diagnostics, 1);
    }

    #[tokio::test]
    async fn subscribers_observe_dispatched_events() {
        let bus = EventBus::silent();
        let mut events = bus.subscribe();
        let emitter = bus.get_emitter();

        emitter.emit(Event::diagnostic("test", "one")).unwrap();
        emitter.emit(Event::diagnostic("test", "two")).unwrap();

        let drained = events.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].message(), "one");
        assert_eq!(drained[1].message(), "two");
        assert!(events.try_recv().is_none());
    }

    #[tokio::test]
    async fn wait_for_skips_non_matching_events() {
        let bus = EventBus::silent();
        let mut events = bus.subscribe();
        let emitter = bus.get_emitter();

        emitter.emit(Event::node_started("a", "i-1")).unwrap();
        emitter.emit(Event::node_completed("a", "i-1", 1)).unwrap();

        let found = events
            .wait_for(Duration::from_millis(200), |e| {
                matches!(e, Event::Node(n) if n.phase_label() == "node_completed")
            })
            .await;
        assert!(found.is_some());
    }
}
