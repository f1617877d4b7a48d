//! Runtime abstraction
//!
//! A runtime executes one [`WorkerParameters`] session at a time and relays
//! its progress into an [`EventSink`].

use crate::error::RuntimeError;
use crate::params::WorkerParameters;
use async_trait::async_trait;
use parking_lot::Mutex;
use repatch_core::EventSink;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Executes patch sessions
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Runtime name for logs
    fn name(&self) -> &'static str;

    /// Run a session to completion
    async fn execute(&self, parameters: WorkerParameters, sink: EventSink) -> Result<(), RuntimeError>;

    /// Ask a running session to stop; does nothing when idle
    fn cancel(&self);
}

/// Admits one session at a time
///
/// Each admitted session gets its own cancellation token, so a cancel only
/// ever reaches the session that was running when it was requested.
#[derive(Debug, Clone, Default)]
pub struct SessionSlot {
    current: Arc<Mutex<Option<CancellationToken>>>,
}

impl SessionSlot {
    /// Claim the slot
    ///
    /// # Errors
    /// [`RuntimeError::SessionActive`] while another session holds it.
    pub fn acquire(&self) -> Result<SessionGuard, RuntimeError> {
        let mut current = self.current.lock();
        if current.is_some() {
            return Err(RuntimeError::SessionActive);
        }
        let token = CancellationToken::new();
        *current = Some(token.clone());
        Ok(SessionGuard {
            current: self.current.clone(),
            token,
        })
    }

    /// `true` while a session holds the slot
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.current.lock().is_some()
    }

    /// Cancel the session holding the slot
    ///
    /// Returns `false` when the slot is idle.
    pub fn cancel(&self) -> bool {
        match self.current.lock().as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

/// Releases the slot on drop
#[derive(Debug)]
pub struct SessionGuard {
    current: Arc<Mutex<Option<CancellationToken>>>,
    token: CancellationToken,
}

impl SessionGuard {
    /// Cancellation token of this session
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// `true` once this session was cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        *self.current.lock() = None;
    }
}
