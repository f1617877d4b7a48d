//! Logging setup
//!
//! The host logs to stderr, human-readable or JSON. The worker has no
//! terminal of its own: [`ForwardLayer`] turns each event into a
//! [`WorkerMessage::Log`] which the host re-emits under the `worker` target.

use crate::protocol::WorkerMessage;
use std::fmt::{self, Write as _};
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt as _};
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::EnvFilter;

/// Install the host subscriber
///
/// `RUST_LOG` wins over `verbosity` (0 = info, 1 = debug, more = trace).
/// Installing twice is a no-op.
pub fn init(verbosity: u8, json: bool) {
    let default = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let registry = tracing_subscriber::registry().with(filter);
    let installed = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };
    if installed.is_err() {
        tracing::debug!("Logging already initialized");
    }
}

/// Install the worker subscriber forwarding into `outbox`
pub fn init_worker(outbox: mpsc::UnboundedSender<WorkerMessage>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(ForwardLayer::new(outbox))
        .try_init();
}

/// Layer sending every event as a log message
#[derive(Debug, Clone)]
pub struct ForwardLayer {
    outbox: mpsc::UnboundedSender<WorkerMessage>,
}

impl ForwardLayer {
    /// Forward into `outbox`
    #[must_use]
    pub fn new(outbox: mpsc::UnboundedSender<WorkerMessage>) -> Self {
        Self { outbox }
    }
}

impl<S: Subscriber> Layer<S> for ForwardLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut line = LineVisitor::default();
        event.record(&mut line);
        let _ = self.outbox.send(WorkerMessage::Log {
            level: (*event.metadata().level()).into(),
            message: line.finish(),
        });
    }
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl LineVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields
        } else {
            format!("{} {}", self.message, self.fields)
        }
    }

    fn push_field(&mut self, name: &str, value: fmt::Arguments<'_>) {
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{name}={value}");
    }
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.push_field(field.name(), format_args!("{value}"));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.push_field(field.name(), format_args!("{value:?}"));
        }
    }
}
