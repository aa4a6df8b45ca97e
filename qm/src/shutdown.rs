//! Explicit, deadline-bound shutdown (spec.md §9 "Disposing with graceful
//! drain semantics" - modeled as a `close(deadline)` operation rather than
//! destructor-only cleanup for anything that performs I/O).

use std::time::Duration;

/// Outcome of a bounded shutdown attempt.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ShutdownOutcome {
    Completed,
    TimedOut,
}

/// Async shutdown with an explicit deadline, implemented by every
/// supervisor-owned component that performs I/O (spec.md §5 "Dispose of the
/// streaming client is idempotent ... waits up to 5 seconds ... then
/// forcibly closes the socket").
pub trait AsyncShutdown {
    fn shutdown(&self, deadline: Duration) -> impl Future<Output = ShutdownOutcome> + Send;
}

pub async fn with_deadline<F>(deadline: Duration, fut: F) -> ShutdownOutcome
where
    F: Future<Output = ()>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(()) => ShutdownOutcome::Completed,
        Err(_) => ShutdownOutcome::TimedOut,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_deadline_completes_when_future_finishes_in_time() {
        let outcome = with_deadline(Duration::from_secs(1), async {}).await;
        assert_eq!(outcome, ShutdownOutcome::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_deadline_times_out() {
        let outcome = with_deadline(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        })
        .await;
        assert_eq!(outcome, ShutdownOutcome::TimedOut);
    }
}
