//! Runtime executing the pipeline inside the current process

use crate::error::RuntimeError;
use crate::params::WorkerParameters;
use crate::pipeline::run_pipeline;
use crate::runtime::{Runtime, SessionSlot};
use async_trait::async_trait;
use repatch_core::EventSink;

/// No isolation; an out-of-memory condition takes the host down with it
#[derive(Debug, Clone, Default)]
pub struct InProcessRuntime {
    slot: SessionSlot,
}

impl InProcessRuntime {
    /// New idle runtime
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Runtime for InProcessRuntime {
    fn name(&self) -> &'static str {
        "in-process"
    }

    async fn execute(&self, parameters: WorkerParameters, sink: EventSink) -> Result<(), RuntimeError> {
        let guard = self.slot.acquire()?;
        tokio::select! {
            biased;
            outcome = run_pipeline(&parameters, &sink) => outcome,
            () = guard.token().cancelled() => {
                tracing::info!("In-process session cancelled");
                Err(RuntimeError::Cancelled)
            }
        }
    }

    fn cancel(&self) {
        self.slot.cancel();
    }
}
