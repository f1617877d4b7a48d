//! Merger running inside the current process on a blocking thread

use super::capture::{LineSink, OutputCapture};
use super::modules::ModuleSet;
use super::{MergeRequest, MergeStrategy};
use crate::error::MergeError;
use async_trait::async_trait;
use std::any::Any;
use std::path::Path;
use std::sync::Arc;

/// Runs [`ModuleSet`] directly; a panic is reported as a failure
#[derive(Debug, Clone, Copy, Default)]
pub struct InProcessMerge;

#[async_trait]
impl MergeStrategy for InProcessMerge {
    fn name(&self) -> &'static str {
        "in-process"
    }

    async fn list_order(&self, modules_dir: &Path) -> Result<Vec<String>, MergeError> {
        let dir = modules_dir.to_path_buf();
        run_captured(None, move |capture| {
            let modules = ModuleSet::load(&dir, &mut |line| capture.record(line))?;
            Ok(modules.order())
        })
        .await
    }

    async fn merge(&self, request: &MergeRequest, on_line: Option<LineSink>) -> Result<(), MergeError> {
        let request = request.clone();
        run_captured(on_line, move |capture| {
            let mut log = |line: &str| capture.record(line);
            let modules = ModuleSet::load(&request.modules_dir, &mut log)?;
            modules.merge(&request.output, &request.skip, &mut log)?;
            Ok(())
        })
        .await
    }
}

async fn run_captured<T, F>(forward: Option<LineSink>, work: F) -> Result<T, MergeError>
where
    T: Send + 'static,
    F: FnOnce(&OutputCapture) -> Result<T, MergeError> + Send + 'static,
{
    let capture = Arc::new(OutputCapture::new(forward));
    let worker_capture = capture.clone();
    let joined = tokio::task::spawn_blocking(move || work(&worker_capture)).await;

    let cause = match joined {
        Ok(Ok(value)) => return Ok(value),
        Ok(Err(err)) => err.to_string(),
        Err(join) if join.is_panic() => format!("panicked: {}", panic_message(join.into_panic())),
        Err(join) => join.to_string(),
    };
    for line in cause.lines() {
        capture.record(line);
    }
    Err(MergeError::Failed(capture.failure_message("merge in-process failed")))
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn panic_becomes_failure_with_output() {
        let result: Result<(), MergeError> = run_captured(None, |capture| {
            capture.record("Merging base.apk");
            panic!("resource table overflow");
        })
        .await;

        let message = result.unwrap_err().to_string();
        assert!(message.starts_with("merge in-process failed. Merging base.apk"), "{message}");
        assert!(message.contains("resource table overflow"), "{message}");
    }

    #[tokio::test]
    async fn missing_directory_fails() {
        let err = InProcessMerge
            .list_order(Path::new("/nonexistent/modules"))
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("merge in-process failed."), "{err}");
    }
}
