//! Patch execution engine
//!
//! Applies patches in submission order on a blocking thread and reports each
//! outcome on a channel. Consumers must not assume one notification per
//! patch or any particular arrival order; [`repatch_core::PatchProgress`]
//! turns the stream into ordered progress.

use repatch_bundle::{Entries, Patch};
use repatch_core::RemoteError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Outcome of one patch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// 0-based index in submission order
    pub index: usize,
    /// Success, or the failure record
    pub outcome: Result<(), RemoteError>,
}

/// Running execution
#[derive(Debug)]
pub struct Execution {
    /// Per-patch outcomes; closes when execution ends
    pub notifications: mpsc::UnboundedReceiver<Notification>,
    /// Patched entries, or `None` when a patch failed
    pub result: JoinHandle<Option<Entries>>,
}

/// Start applying `patches` to `entries`
///
/// Stops at the first failing patch.
#[must_use]
pub fn execute(patches: Vec<Patch>, mut entries: Entries) -> Execution {
    let (tx, notifications) = mpsc::unbounded_channel();
    let result = tokio::task::spawn_blocking(move || {
        for (index, patch) in patches.iter().enumerate() {
            tracing::debug!("Applying {}", patch.name());
            let outcome = patch
                .apply(&mut entries)
                .map_err(|err| RemoteError::from_error("PatchError", &err));
            let failed = outcome.is_err();
            // Receiver gone means the session was abandoned.
            let _ = tx.send(Notification { index, outcome });
            if failed {
                return None;
            }
        }
        Some(entries)
    });
    Execution {
        notifications,
        result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use repatch_bundle::Operation;

    fn entries() -> Entries {
        let mut entries = Entries::new();
        entries.insert("strings.txt".into(), b"hello".to_vec());
        entries
    }

    fn replace(name: &str, find: &str) -> Patch {
        Patch::new(name).with_operation(Operation::ReplaceText {
            entry: "strings.txt".into(),
            find: find.into(),
            replace: "bye".into(),
        })
    }

    #[tokio::test]
    async fn stops_at_first_failure() {
        let mut execution = execute(
            vec![replace("a", "hello"), replace("b", "missing"), replace("c", "bye")],
            entries(),
        );

        let mut seen = Vec::new();
        while let Some(notification) = execution.notifications.recv().await {
            seen.push((notification.index, notification.outcome.is_ok()));
        }
        assert_eq!(seen, vec![(0, true), (1, false)]);
        assert!(execution.result.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn returns_patched_entries() {
        let execution = execute(vec![replace("a", "hello")], entries());
        let patched = execution.result.await.unwrap().unwrap();
        assert_eq!(patched["strings.txt"], b"bye");
    }
}
