use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::QualityError;

/// Per-provider request admission control (spec.md §4.B).
///
/// Combines three independent gates: a sliding window cap over the last
/// `window` of wall-clock time, a minimum spacing between any two admitted
/// requests, and an optional explicit cooldown set by
/// [`RateLimiter::record_rate_limit_hit`] when a provider returns a 429.
///
/// Unlike the token-bucket limiter this crate's streaming client used to
/// reach for, the backfill worker needs the *exact* next eligible instant so
/// it can report `time_until_reset` to callers without guessing - so the
/// window is modelled explicitly as a deque of admitted instants rather than
/// a refilling counter.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    window: VecDeque<Instant>,
    max_per_window: usize,
    window_size: Duration,
    min_spacing: Duration,
    explicit_cooldown_until: Option<Instant>,
}

/// Snapshot of limiter state (spec.md §4.B `status()`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub requests_in_window: usize,
    pub max_per_window: usize,
    pub window_remaining: usize,
    pub is_explicitly_limited: bool,
    pub time_until_reset: Duration,
}

impl RateLimiter {
    pub fn new(max_per_window: usize, window_size: Duration, min_spacing: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                window: VecDeque::new(),
                max_per_window,
                window_size,
                min_spacing,
                explicit_cooldown_until: None,
            })),
        }
    }

    /// Append `now` to the window and evict entries older than
    /// `now - window_size`.
    pub async fn record_request(&self, now: Instant) {
        let mut inner = self.inner.lock().await;
        inner.evict(now);
        inner.window.push_back(now);
    }

    /// Block until all three admission gates are satisfied, then record the
    /// request and return how long the caller waited.
    ///
    /// `cancel` is polled alongside the sleep so the wait returns promptly
    /// on cancellation without mutating limiter state (spec.md §5).
    pub async fn wait_for_slot(
        &self,
        cancel: &tokio_util_lite::CancelHandle,
    ) -> Result<Duration, QualityError> {
        let started = Instant::now();
        loop {
            let next_eligible = {
                let mut inner = self.inner.lock().await;
                let now = Instant::now();
                inner.evict(now);

                match inner.next_eligible_instant(now) {
                    None => {
                        inner.window.push_back(now);
                        return Ok(now.duration_since(started));
                    }
                    Some(eligible) => eligible,
                }
            };

            let sleep_for = next_eligible.saturating_duration_since(Instant::now());
            if sleep_for.is_zero() {
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = cancel.cancelled() => return Err(QualityError::Cancelled),
            }
        }
    }

    /// Record a 429 response: `explicit_cooldown_until = now + (retry_after
    /// ?? window_size)`.
    pub async fn record_rate_limit_hit(&self, retry_after: Option<Duration>) {
        let mut inner = self.inner.lock().await;
        let delay = retry_after.unwrap_or(inner.window_size);
        inner.explicit_cooldown_until = Some(Instant::now() + delay);
    }

    pub async fn status(&self) -> RateLimitStatus {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        inner.evict(now);

        let is_explicitly_limited = inner
            .explicit_cooldown_until
            .is_some_and(|until| until > now);

        let time_until_reset = match inner.next_eligible_instant(now) {
            Some(instant) => instant.saturating_duration_since(now),
            None => Duration::ZERO,
        };

        RateLimitStatus {
            requests_in_window: inner.window.len(),
            max_per_window: inner.max_per_window,
            window_remaining: inner.max_per_window.saturating_sub(inner.window.len()),
            is_explicitly_limited,
            time_until_reset,
        }
    }
}

impl Inner {
    fn evict(&mut self, now: Instant) {
        let cutoff = now.checked_sub(self.window_size).unwrap_or(now);
        while matches!(self.window.front(), Some(instant) if *instant < cutoff) {
            self.window.pop_front();
        }
    }

    /// The next instant at which a request would be admitted, or `None` if
    /// one would be admitted right now.
    fn next_eligible_instant(&self, now: Instant) -> Option<Instant> {
        let cooldown_gate = self
            .explicit_cooldown_until
            .filter(|until| *until > now);

        let spacing_gate = self
            .window
            .back()
            .map(|last| *last + self.min_spacing)
            .filter(|next| *next > now);

        let window_gate = if self.window.len() >= self.max_per_window {
            self.window.front().map(|oldest| *oldest + self.window_size)
        } else {
            None
        };

        [cooldown_gate, spacing_gate, window_gate]
            .into_iter()
            .flatten()
            .max()
    }
}

/// Global per-day, then cross-day monotonic counter for ids that must be
/// unique within a process but cheap to generate - used by the anomaly
/// detector for `ANM-YYYYMMDD-NNNNNN` ids.
#[derive(Debug, Default)]
pub struct DailySequence {
    counter: AtomicU64,
}

impl DailySequence {
    pub fn next(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn reset(&self) {
        self.counter.store(0, Ordering::Relaxed);
    }
}

/// Minimal cooperative cancellation handle threaded through every
/// suspension point (spec.md §5): WebSocket I/O, limiter waits, backfill
/// sleeps, reconnect backoff.
///
/// A thin wrapper over a [`tokio_util::sync::CancellationToken`]-shaped API
/// without the extra dependency, since the workspace does not otherwise
/// reach for `tokio-util`.
pub mod tokio_util_lite {
    use tokio::sync::watch;

    #[derive(Clone)]
    pub struct CancelHandle {
        rx: watch::Receiver<bool>,
    }

    pub struct CancelSource {
        tx: watch::Sender<bool>,
    }

    impl CancelSource {
        pub fn new() -> (Self, CancelHandle) {
            let (tx, rx) = watch::channel(false);
            (Self { tx }, CancelHandle { rx })
        }

        pub fn cancel(&self) {
            let _ = self.tx.send(true);
        }
    }

    impl CancelHandle {
        pub async fn cancelled(&self) {
            let mut rx = self.rx.clone();
            if *rx.borrow() {
                return;
            }
            while rx.changed().await.is_ok() {
                if *rx.borrow() {
                    return;
                }
            }
            std::future::pending::<()>().await
        }

        pub fn is_cancelled(&self) -> bool {
            *self.rx.borrow()
        }
    }
}
