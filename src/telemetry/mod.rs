//! Telemetry: tracing initialization and human-readable event rendering.

use std::io::IsTerminal;

use tracing_error::ErrorLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::event_bus::{Event, NodeLifecycleEvent, WorkflowLifecycleEvent};

/// Initialize the global tracing subscriber.
///
/// Loads `.env` first so `RUST_LOG` set there is honored; defaults to
/// `flowloom=info` when the variable is unset. Safe to call more than
/// once; subsequent calls are no-ops.
pub fn init_tracing() {
    dotenvy::dotenv().ok();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("flowloom=info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(ErrorLayer::default())
        .try_init();
}

/// Whether rendered output carries ANSI color codes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ColorMode {
    /// Color iff stdout is a terminal.
    #[default]
    Auto,
    Always,
    Never,
}

const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const DIM: &str = "\x1b[2m";
const RESET: &str = "\x1b[0m";

/// Renders one event to a display line for console-style sinks.
pub trait TelemetryFormatter: Send + Sync {
    fn render_event(&self, event: &Event) -> String;
}

/// Single-line renderer: node lifecycle lines colored by phase
/// (completed green, failed red, cancelled yellow), workflow transitions
/// highlighted, progress and diagnostics dimmed.
pub struct PlainFormatter {
    colored: bool,
}

impl Default for PlainFormatter {
    fn default() -> Self {
        Self::new()
    }
}

impl PlainFormatter {
    #[must_use]
    pub fn new() -> Self {
        Self::with_mode(ColorMode::Auto)
    }

    #[must_use]
    pub fn with_mode(mode: ColorMode) -> Self {
        let colored = match mode {
            ColorMode::Always => true,
            ColorMode::Never => false,
            ColorMode::Auto => std::io::stdout().is_terminal(),
        };
        Self { colored }
    }

    fn paint(&self, color: &str, text: String) -> String {
        if self.colored {
            format!("{color}{text}{RESET}")
        } else {
            text
        }
    }
}

impl TelemetryFormatter for PlainFormatter {
    fn render_event(&self, event: &Event) -> String {
        match event {
            Event::Node(node) => {
                let color = match node {
                    NodeLifecycleEvent::Completed { .. } => GREEN,
                    NodeLifecycleEvent::Failed { .. } => RED,
                    NodeLifecycleEvent::Cancelled { .. } => YELLOW,
                    NodeLifecycleEvent::Created { .. } | NodeLifecycleEvent::Started { .. } => DIM,
                };
                self.paint(color, format!("[{}] {}", node.node_id(), event.message()))
            }
            Event::Workflow(workflow) => {
                let color = match workflow {
                    WorkflowLifecycleEvent::Failed { .. } => RED,
                    WorkflowLifecycleEvent::Cancelled { .. } => YELLOW,
                    WorkflowLifecycleEvent::Started { .. }
                    | WorkflowLifecycleEvent::Completed { .. } => CYAN,
                };
                self.paint(color, format!("== {}", event.message()))
            }
            Event::Progress(progress) => self.paint(
                DIM,
                format!(
                    "[{}] {:>3.0}% {}",
                    progress.key, progress.percent, progress.status
                ),
            ),
            Event::Diagnostic(diag) => {
                self.paint(DIM, format!("({}) {}", diag.scope, diag.message))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain() -> PlainFormatter {
        PlainFormatter::with_mode(ColorMode::Never)
    }

    #[test]
    fn node_lines_carry_id_and_phase() {
        let line = plain().render_event(&Event::node_completed("step", "i-1", 12));
        assert_eq!(line, "[step] completed in 12ms");
        let line = plain().render_event(&Event::node_failed("step", "i-2", "boom"));
        assert_eq!(line, "[step] failed: boom");
    }

    #[test]
    fn progress_lines_show_percent_and_key() {
        let line = plain().render_event(&Event::progress("outer/inner", 42.0, "working"));
        assert_eq!(line, "[outer/inner]  42% working");
    }

    #[test]
    fn colored_mode_wraps_with_ansi() {
        let formatter = PlainFormatter::with_mode(ColorMode::Always);
        let line = formatter.render_event(&Event::diagnostic("router", "delivered"));
        assert!(line.starts_with(DIM));
        assert!(line.ends_with(RESET));
    }
}
