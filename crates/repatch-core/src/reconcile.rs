//! Patch progress reconciliation
//!
//! The patch engine reports per-patch outcomes possibly out of order and
//! possibly skipping indices. [`PatchProgress`] turns those notifications into
//! a strictly increasing `Started(i) → Completed(i)` stream:
//!
//! - stale notifications (index below the cursor) are ignored
//! - skipped indices are resolved as `Started` + `Completed` in order
//! - a failure emits `Failed(ExecutePatch(i))` and aborts the session
//! - after each success the next index is started pre-emptively

use crate::events::EventSink;
use crate::progress::{ProgressEvent, RemoteError, StepId};
use std::collections::HashSet;

/// A patch reported failure; the session must abort
#[derive(Debug, Clone, thiserror::Error)]
#[error("patch \"{name}\" failed: {error}")]
pub struct PatchFailure {
    /// 0-based index in caller order
    pub index: usize,
    /// Patch name
    pub name: String,
    /// Failure record reported by the engine
    pub error: RemoteError,
}

/// Per-session reconciliation state
#[derive(Debug)]
pub struct PatchProgress {
    names: Vec<String>,
    started: HashSet<usize>,
    next_index: usize,
    sink: EventSink,
}

impl PatchProgress {
    /// Begin tracking `names`; emits `Started(ExecutePatch(0))` when non-empty
    #[must_use]
    pub fn begin(names: Vec<String>, sink: EventSink) -> Self {
        let mut progress = Self {
            names,
            started: HashSet::new(),
            next_index: 0,
            sink,
        };
        if !progress.names.is_empty() {
            progress.start(0);
        }
        progress
    }

    /// Number of patches tracked
    #[inline]
    #[must_use]
    pub fn total(&self) -> usize {
        self.names.len()
    }

    /// Lowest unresolved index
    #[inline]
    #[must_use]
    pub fn next_index(&self) -> usize {
        self.next_index
    }

    /// `true` once every index is resolved
    #[inline]
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.next_index >= self.names.len()
    }

    /// Apply an engine notification for patch `index`
    ///
    /// # Errors
    /// Returns [`PatchFailure`] when the notification reports a failure. The
    /// caller must abort the session without producing output.
    pub fn record(&mut self, index: usize, outcome: Result<(), RemoteError>) -> Result<(), PatchFailure> {
        if index < self.next_index {
            tracing::debug!("Ignoring stale notification for patch #{}", index);
            return Ok(());
        }
        if index >= self.names.len() {
            tracing::warn!(
                "Ignoring notification for patch #{} (only {} selected)",
                index,
                self.names.len()
            );
            return Ok(());
        }

        for skipped in self.next_index..index {
            self.start(skipped);
            tracing::info!("{} succeeded", self.names[skipped]);
            self.sink.emit(ProgressEvent::completed(StepId::ExecutePatch(skipped)));
        }
        self.start(index);

        match outcome {
            Err(error) => {
                let name = self.names[index].clone();
                tracing::error!("{} failed: {}", name, error);
                self.sink.emit(ProgressEvent::failed(
                    Some(StepId::ExecutePatch(index)),
                    error.clone(),
                ));
                self.next_index = index;
                Err(PatchFailure { index, name, error })
            }
            Ok(()) => {
                tracing::info!("{} succeeded", self.names[index]);
                self.sink.emit(ProgressEvent::completed(StepId::ExecutePatch(index)));
                self.next_index = index + 1;
                if self.next_index < self.names.len() {
                    self.start(self.next_index);
                }
                Ok(())
            }
        }
    }

    /// Resolve every remaining index as succeeded
    ///
    /// Called once the engine has finished without error.
    pub fn finish(&mut self) {
        while self.next_index < self.names.len() {
            let index = self.next_index;
            self.start(index);
            tracing::info!("{} succeeded", self.names[index]);
            self.sink.emit(ProgressEvent::completed(StepId::ExecutePatch(index)));
            self.next_index += 1;
        }
    }

    fn start(&mut self, index: usize) {
        if self.started.insert(index) {
            self.sink.emit(ProgressEvent::started(StepId::ExecutePatch(index)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn names(count: usize) -> Vec<String> {
        (0..count).map(|i| format!("patch-{i}")).collect()
    }

    fn started(i: usize) -> ProgressEvent {
        ProgressEvent::started(StepId::ExecutePatch(i))
    }

    fn completed(i: usize) -> ProgressEvent {
        ProgressEvent::completed(StepId::ExecutePatch(i))
    }

    #[test]
    fn empty_list_emits_nothing() {
        let (sink, log) = EventSink::recorder();
        let mut progress = PatchProgress::begin(Vec::new(), sink);
        progress.finish();
        assert!(log.snapshot().is_empty());
        assert!(progress.is_complete());
    }

    #[test]
    fn in_order_notifications() {
        let (sink, log) = EventSink::recorder();
        let mut progress = PatchProgress::begin(names(2), sink);
        progress.record(0, Ok(())).unwrap();
        progress.record(1, Ok(())).unwrap();

        assert_eq!(
            log.snapshot(),
            vec![started(0), completed(0), started(1), completed(1)]
        );
    }

    #[test]
    fn skipped_indices_are_filled_in_order() {
        let (sink, log) = EventSink::recorder();
        let mut progress = PatchProgress::begin(names(4), sink);
        progress.record(2, Ok(())).unwrap();

        assert_eq!(
            log.snapshot(),
            vec![
                started(0),
                completed(0),
                started(1),
                completed(1),
                started(2),
                completed(2),
                started(3),
            ]
        );
        assert_eq!(progress.next_index(), 3);
    }

    #[test]
    fn stale_notification_is_ignored() {
        let (sink, log) = EventSink::recorder();
        let mut progress = PatchProgress::begin(names(3), sink);
        progress.record(1, Ok(())).unwrap();
        let before = log.snapshot().len();

        progress.record(0, Err(RemoteError::new("Late", "ignored"))).unwrap();
        assert_eq!(log.snapshot().len(), before);
    }

    #[test]
    fn failure_aborts_with_failed_event() {
        let (sink, log) = EventSink::recorder();
        let mut progress = PatchProgress::begin(names(3), sink);
        let failure = progress
            .record(1, Err(RemoteError::new("Boom", "bad entry")))
            .unwrap_err();

        assert_eq!(failure.index, 1);
        assert_eq!(failure.name, "patch-1");
        let events = log.snapshot();
        assert_eq!(&events[..3], &[started(0), completed(0), started(1)]);
        assert!(matches!(
            &events[3],
            ProgressEvent::Failed { step: Some(StepId::ExecutePatch(1)), .. }
        ));
        assert_eq!(events.len(), 4);
    }

    #[test]
    fn finish_resolves_the_rest() {
        let (sink, log) = EventSink::recorder();
        let mut progress = PatchProgress::begin(names(3), sink);
        progress.record(0, Ok(())).unwrap();
        progress.finish();

        assert_eq!(
            log.snapshot(),
            vec![
                started(0),
                completed(0),
                started(1),
                completed(1),
                started(2),
                completed(2),
            ]
        );
        assert!(progress.is_complete());
    }
}
