//! Ordered fallback over alternative strategies
//!
//! Attempts run lazily, one after another, until one succeeds. Every failure
//! is kept so the final error can name all causes.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::future::Future;

type AttemptFn<'a, T, E> = Box<dyn FnOnce() -> BoxFuture<'a, Result<T, E>> + Send + 'a>;

/// One failed attempt
#[derive(Debug)]
pub struct AttemptFailure<E> {
    /// Strategy name
    pub strategy: String,
    /// Error it returned
    pub error: E,
}

/// Every attempt failed (or the chain stopped early)
#[derive(Debug)]
pub struct FallbackError<E> {
    failures: Vec<AttemptFailure<E>>,
}

impl<E> FallbackError<E> {
    /// Failures in attempt order
    #[must_use]
    pub fn failures(&self) -> &[AttemptFailure<E>] {
        &self.failures
    }

    /// Error of the last attempt that ran
    #[must_use]
    pub fn last(&self) -> Option<&E> {
        self.failures.last().map(|failure| &failure.error)
    }

    /// Consume, keeping the last error
    #[must_use]
    pub fn into_last(self) -> Option<E> {
        self.failures.into_iter().last().map(|failure| failure.error)
    }
}

impl<E: fmt::Display> fmt::Display for FallbackError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.failures.is_empty() {
            return f.write_str("no strategy available");
        }
        for (i, failure) in self.failures.iter().enumerate() {
            if i > 0 {
                f.write_str(". ")?;
            }
            write!(f, "{} failed: {}", failure.strategy, failure.error)?;
        }
        Ok(())
    }
}

impl<E> std::error::Error for FallbackError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.last().map(|err| err as &(dyn std::error::Error + 'static))
    }
}

/// Builder for an ordered fallback chain
pub struct Fallback<'a, T, E> {
    attempts: Vec<(String, AttemptFn<'a, T, E>)>,
}

impl<'a, T, E> Fallback<'a, T, E>
where
    T: Send + 'a,
    E: Send + 'a,
{
    /// Empty chain
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            attempts: Vec::new(),
        }
    }

    /// Append a named attempt; `run` is only invoked if reached
    #[must_use]
    pub fn attempt<F, Fut>(mut self, name: impl Into<String>, run: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = Result<T, E>> + Send + 'a,
    {
        self.attempts.push((name.into(), Box::new(move || run().boxed())));
        self
    }

    /// Number of attempts in the chain
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    /// `true` when no attempt was added
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    /// Run until one attempt succeeds
    ///
    /// # Errors
    /// Returns every failure when all attempts fail.
    pub async fn run(self) -> Result<T, FallbackError<E>> {
        self.run_while(|_| true, |_, _| {}).await
    }

    /// Run until one attempt succeeds or `retry` rejects a failure
    ///
    /// `on_retry` is told about each failure that leads to another attempt.
    ///
    /// # Errors
    /// Returns the failures collected so far when the chain is exhausted or
    /// stopped.
    pub async fn run_while<R, N>(self, mut retry: R, mut on_retry: N) -> Result<T, FallbackError<E>>
    where
        R: FnMut(&E) -> bool + Send,
        N: FnMut(&str, &E) + Send,
    {
        let total = self.attempts.len();
        let mut failures = Vec::new();

        for (position, (strategy, run)) in self.attempts.into_iter().enumerate() {
            match run().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    let has_next = position + 1 < total;
                    let keep_going = has_next && retry(&error);
                    if keep_going {
                        on_retry(&strategy, &error);
                    }
                    failures.push(AttemptFailure { strategy, error });
                    if !keep_going {
                        break;
                    }
                }
            }
        }
        Err(FallbackError { failures })
    }
}

impl<'a, T, E> Default for Fallback<'a, T, E>
where
    T: Send + 'a,
    E: Send + 'a,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn first_success_wins_and_later_attempts_never_run() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result: Result<u8, FallbackError<String>> = Fallback::new()
            .attempt("primary", || async { Ok(1) })
            .attempt("secondary", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(2)
            })
            .run()
            .await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn falls_back_after_failure() {
        let mut retried = Vec::new();
        let result: Result<u8, FallbackError<String>> = Fallback::new()
            .attempt("in-process", || async { Err("boom".to_string()) })
            .attempt("subprocess", || async { Ok(2) })
            .run_while(|_| true, |name, _| retried.push(name.to_string()))
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(retried, vec!["in-process".to_string()]);
    }

    #[tokio::test]
    async fn total_failure_names_every_cause() {
        let err = Fallback::<(), String>::new()
            .attempt("in-process", || async { Err("X".to_string()) })
            .attempt("subprocess", || async { Err("Y".to_string()) })
            .run()
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "in-process failed: X. subprocess failed: Y");
        assert_eq!(err.failures().len(), 2);
        assert_eq!(err.into_last().as_deref(), Some("Y"));
    }

    #[tokio::test]
    async fn rejected_failure_stops_the_chain() {
        let err = Fallback::<(), u32>::new()
            .attempt("isolated", || async { Err(7) })
            .attempt("in-process", || async { Ok(()) })
            .run_while(|code| *code == 134, |_, _| {})
            .await
            .unwrap_err();

        assert_eq!(err.last(), Some(&7));
    }

    #[tokio::test]
    async fn empty_chain_fails() {
        let err = Fallback::<(), String>::new().run().await.unwrap_err();
        assert_eq!(err.to_string(), "no strategy available");
    }
}
