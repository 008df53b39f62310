//! Event fan-out for workflow observability.
//!
//! Workers and nodes emit [`Event`]s through an [`EventEmitter`]. The
//! [`EventBus`] dispatches synchronously on the emitting worker — every
//! attached [`EventSink`] sees the event before `emit` returns, which is
//! what guarantees observers the Started-before-terminal ordering per
//! node instance. Consumers that cannot keep pace attach through
//! [`EventBus::subscribe`], a buffered async tap that drops on lag
//! (tracked in [`EventBusStats`]) instead of stalling workers.

mod bus;
mod emitter;
mod event;
mod sink;

pub use bus::{EventBus, EventBusStats, EventFilter, EventStream};
pub use emitter::{EmitterError, EventEmitter, NamespacedEmitter, NullEmitter};
pub use event::{
    DiagnosticEvent, Event, NodeLifecycleEvent, ProgressEvent, WorkflowLifecycleEvent,
};
pub use sink::{
    ChannelSink, ConsoleSink, EventSink, JsonLinesSink, MemorySink, ProgressEntry,
    ProgressTreeSink,
};
