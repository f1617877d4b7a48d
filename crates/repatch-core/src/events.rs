//! Event sinks
//!
//! A cheap, cloneable handle that progress producers emit into. The host
//! forwards events to its caller; the worker forwards them over IPC.

use crate::progress::ProgressEvent;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Cloneable destination for [`ProgressEvent`]s
#[derive(Clone)]
pub struct EventSink {
    inner: Arc<dyn Fn(ProgressEvent) + Send + Sync>,
}

impl EventSink {
    /// Wrap a callback
    #[must_use]
    pub fn new(callback: impl Fn(ProgressEvent) + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(callback),
        }
    }

    /// Sink that drops every event
    #[must_use]
    pub fn discard() -> Self {
        Self::new(|_| {})
    }

    /// Sink that forwards into an unbounded channel
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Self::new(move |event| {
            // Receiver gone means nobody is listening anymore.
            let _ = tx.send(event);
        });
        (sink, rx)
    }

    /// Sink that records into an in-memory [`EventLog`]
    #[must_use]
    pub fn recorder() -> (Self, EventLog) {
        let log = EventLog::default();
        let writer = log.clone();
        (Self::new(move |event| writer.push(event)), log)
    }

    /// Emit one event
    #[inline]
    pub fn emit(&self, event: ProgressEvent) {
        (self.inner)(event);
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink").finish_non_exhaustive()
    }
}

/// Shared, append-only event record
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<ProgressEvent>>>,
}

impl EventLog {
    /// Append an event
    pub fn push(&self, event: ProgressEvent) {
        self.events.lock().push(event);
    }

    /// Copy of all events recorded so far
    #[must_use]
    pub fn snapshot(&self) -> Vec<ProgressEvent> {
        self.events.lock().clone()
    }

    /// Recorded events excluding `Progress`
    #[must_use]
    pub fn markers(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .iter()
            .filter(|event| !matches!(event, ProgressEvent::Progress { .. }))
            .cloned()
            .collect()
    }

    /// Progress messages recorded so far, in order
    #[must_use]
    pub fn messages(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                ProgressEvent::Progress {
                    message: Some(message),
                    ..
                } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::StepId;

    #[tokio::test]
    async fn channel_sink_delivers_in_order() {
        let (sink, mut rx) = EventSink::channel();
        sink.emit(ProgressEvent::started(StepId::ReadInput));
        sink.emit(ProgressEvent::completed(StepId::ReadInput));
        drop(sink);

        assert_eq!(rx.recv().await, Some(ProgressEvent::started(StepId::ReadInput)));
        assert_eq!(rx.recv().await, Some(ProgressEvent::completed(StepId::ReadInput)));
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn recorder_separates_markers_and_messages() {
        let (sink, log) = EventSink::recorder();
        sink.emit(ProgressEvent::started(StepId::WriteOutput));
        sink.emit(ProgressEvent::message(StepId::WriteOutput, "Writing output"));
        sink.emit(ProgressEvent::completed(StepId::WriteOutput));

        assert_eq!(log.snapshot().len(), 3);
        assert_eq!(log.markers().len(), 2);
        assert_eq!(log.messages(), vec!["Writing output".to_string()]);
    }
}
