//! Ambient plumbing shared by every other crate in the workspace: the error
//! taxonomy, the listener/channel fan-out abstraction, the sliding-window
//! rate limiter (component B), and the dashboard snapshot wrapper.

pub mod channel;
pub mod error;
pub mod rate_limit;
pub mod snapshot;

pub use error::QualityError;

/// Whether an error terminates the channel/stream it occurred on. Mirrors
/// the teacher's `Unrecoverable` trait bound on [`channel::Tx::Error`]:
/// a dropped-receiver send error is always unrecoverable, while a
/// [`QualityError`] delegates to [`QualityError::is_recoverable`].
pub trait Unrecoverable {
    fn is_unrecoverable(&self) -> bool;
}

/// External events/sec counter consumed by the quality orchestrator's
/// dashboard snapshot (spec.md §6 `MetricsSink.eventsPerSecond()`). The host
/// owns the counter - the orchestrator only reads it - since §4.J specifies
/// the figure comes "from an external counter," not a self-computed tally.
pub trait MetricsSink: Send + Sync {
    fn events_per_second(&self) -> f64;
}

/// Invoke a listener callback, catching and logging any panic so it cannot
/// unwind into the caller's detector state (spec.md §5 "Exceptions thrown by
/// a listener are caught, logged, and do not disturb detector state").
pub fn notify_listener<F>(name: &'static str, op: F)
where
    F: FnOnce(),
{
    if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(op)) {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        tracing::error!(listener = name, %message, "listener callback panicked; ignoring");
    }
}
