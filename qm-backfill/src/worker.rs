//! Concurrency-limited backfill worker pool (spec.md §4.M).
//!
//! A single long-lived loop dequeues [`BackfillRequest`]s, gates each one
//! behind a counting semaphore and the destination provider's sliding-window
//! rate limiter, and spawns a `process_request` task that owns its semaphore
//! permit until the request reaches a terminal status.

use crate::progress::ProgressTracker;
use crate::queue::BackfillQueue;
use crate::request::{BackfillRequest, BackfillStatus, Granularity, HistoricalBar, RequestId};
use crate::retry::{looks_like_rate_limit, parse_retry_after};
use async_trait::async_trait;
use qm_instrument::{Provider, SessionDate, Symbol};
use qm_integration::rate_limit::tokio_util_lite::{CancelHandle, CancelSource};
use qm_integration::rate_limit::RateLimiter;
use qm_integration::{channel, QualityError};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;

/// Historical bar provider (spec.md §6 `HistoricalProvider.getDailyBars`).
#[async_trait]
pub trait HistoricalProvider: Send + Sync {
    async fn get_daily_bars(
        &self,
        symbol: &Symbol,
        from: SessionDate,
        to: SessionDate,
        granularity: Granularity,
    ) -> Result<Vec<HistoricalBar>, QualityError>;
}

/// Destination for successfully retrieved bars (spec.md §6
/// `StorageSink.writeBars`).
#[async_trait]
pub trait StorageSink: Send + Sync {
    async fn write_bars(&self, symbol: &Symbol, bars: &[HistoricalBar]) -> Result<(), QualityError>;
}

#[derive(Debug, Clone)]
pub struct BackfillWorkerConfig {
    /// Counting semaphore size, 1-100 inclusive (spec.md §4.M, §6).
    pub max_concurrent_requests: usize,
    pub auto_pause_on_rate_limit: bool,
    pub auto_resume_after_rate_limit: bool,
    pub max_rate_limit_wait: Duration,
    pub max_retry_attempts_per_request: u32,
}

impl Default for BackfillWorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 4,
            auto_pause_on_rate_limit: true,
            auto_resume_after_rate_limit: true,
            max_rate_limit_wait: Duration::from_secs(5 * 60),
            max_retry_attempts_per_request: DEFAULT_MAX_RETRY_ATTEMPTS,
        }
    }
}

impl BackfillWorkerConfig {
    /// Validates the §6 bound on `max_concurrent_requests` at construction,
    /// per the "validated immutable configuration value" design note.
    pub fn validate(self) -> Result<Self, QualityError> {
        if !(1..=100).contains(&self.max_concurrent_requests) {
            return Err(QualityError::Configuration(format!(
                "max_concurrent_requests must be in 1..=100, got {}",
                self.max_concurrent_requests
            )));
        }
        Ok(self)
    }
}

/// Bounded request queue, concurrency-limited worker pool, and per-provider
/// rate-limit gating (component M). Owns the queue exclusively; rate-limit
/// state is shared with, and only mutated through, the per-provider
/// [`RateLimiter`]s (spec.md §3 "Ownership").
pub struct BackfillWorker {
    queue: BackfillQueue,
    semaphore: Arc<Semaphore>,
    providers: HashMap<Provider, RateLimiter>,
    completed_tx: channel::UnboundedTx<BackfillRequest>,
    completed_rx: AsyncMutex<Option<channel::UnboundedRx<BackfillRequest>>>,
    progress: ProgressTracker,
    config: BackfillWorkerConfig,
    historical: Arc<dyn HistoricalProvider>,
    storage: Arc<dyn StorageSink>,
    cancel_source: CancelSource,
    cancel: CancelHandle,
}

impl BackfillWorker {
    pub fn new(
        config: BackfillWorkerConfig,
        providers: HashMap<Provider, RateLimiter>,
        historical: Arc<dyn HistoricalProvider>,
        storage: Arc<dyn StorageSink>,
    ) -> Result<Arc<Self>, QualityError> {
        let config = config.validate()?;
        let (cancel_source, cancel) = CancelSource::new();
        let (completed_tx, completed_rx) = channel::mpsc_unbounded();

        Ok(Arc::new(Self {
            queue: BackfillQueue::new(),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_requests)),
            providers,
            completed_tx,
            completed_rx: AsyncMutex::new(Some(completed_rx)),
            progress: ProgressTracker::new(),
            config,
            historical,
            storage,
            cancel_source,
            cancel,
        }))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn enqueue(
        &self,
        symbol: Symbol,
        from_date: SessionDate,
        to_date: SessionDate,
        granularity: Granularity,
        provider: Provider,
        priority: u8,
    ) -> RequestId {
        self.queue.enqueue(symbol, from_date, to_date, granularity, provider, priority)
    }

    pub fn progress(&self, symbol: &Symbol) -> Option<crate::progress::SymbolProgress> {
        self.progress.get(symbol)
    }

    /// Takes ownership of the completed-request receiver; callable once.
    pub async fn take_completed(&self) -> Option<channel::UnboundedRx<BackfillRequest>> {
        self.completed_rx.lock().await.take()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Requests cancellation. Callers should then await [`Self::drain`] to
    /// observe orderly shutdown (spec.md §5 "Dispose of the backfill worker
    /// cancels outstanding sleeps and waits for the worker loop and
    /// completion loop to return").
    pub fn stop(&self) {
        self.cancel_source.cancel();
    }

    /// Waits for every in-flight `process_request` task to release its
    /// semaphore permit. Acquiring the full semaphore capacity is only
    /// possible once nothing is still holding a slot, which gives orderly
    /// drain semantics without a separate task-tracking structure.
    pub async fn drain(&self) {
        let _ = self
            .semaphore
            .clone()
            .acquire_many_owned(self.config.max_concurrent_requests as u32)
            .await;
    }

    /// The worker's single long-lived loop (spec.md §4.M "Worker loop").
    /// Returns once [`Self::stop`] has been called and no request is
    /// in-flight.
    pub async fn run(self: Arc<Self>) {
        let mut empty_polls: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            let permit = {
                let semaphore = Arc::clone(&self.semaphore);
                tokio::select! {
                    result = semaphore.acquire_owned() => match result {
                        Ok(permit) => permit,
                        Err(_) => return,
                    },
                    _ = self.cancel.cancelled() => return,
                }
            };

            match self.queue.try_dequeue() {
                Some(request) => {
                    empty_polls = 0;
                    let worker = Arc::clone(&self);
                    tokio::spawn(async move {
                        worker.process_request(request, permit).await;
                    });
                }
                None => {
                    drop(permit);
                    empty_polls += 1;

                    if let Some(wait) = self.shortest_reset_if_all_limited().await {
                        let wait = if self.config.auto_pause_on_rate_limit {
                            wait.min(self.config.max_rate_limit_wait)
                        } else {
                            wait
                        };
                        if self.sleep_cancellable(wait).await {
                            return;
                        }
                    } else if self.sleep_cancellable(empty_poll_backoff(empty_polls)).await {
                        return;
                    }
                }
            }
        }
    }

    /// `None` unless *every* configured provider is currently under an
    /// explicit rate-limit cooldown, in which case the shortest
    /// `time_until_reset` across them (spec.md §4.M step 2).
    async fn shortest_reset_if_all_limited(&self) -> Option<Duration> {
        if self.providers.is_empty() {
            return None;
        }
        let mut shortest = None;
        for limiter in self.providers.values() {
            let status = limiter.status().await;
            if !status.is_explicitly_limited {
                return None;
            }
            shortest = Some(match shortest {
                None => status.time_until_reset,
                Some(current) => current.min(status.time_until_reset),
            });
        }
        shortest
    }

    /// Sleeps for `dur`, or returns early if cancelled. Returns whether the
    /// sleep was cut short by cancellation.
    async fn sleep_cancellable(&self, dur: Duration) -> bool {
        if dur.is_zero() {
            return self.cancel.is_cancelled();
        }
        tokio::select! {
            _ = tokio::time::sleep(dur) => false,
            _ = self.cancel.cancelled() => true,
        }
    }

    /// `processRequest(req)` contract (spec.md §4.M): up to
    /// `max_retry_attempts_per_request` attempts, recording against the
    /// provider's rate limiter before each call and honouring any
    /// `Retry-After` on a rate-limit failure.
    async fn process_request(self: Arc<Self>, mut request: BackfillRequest, _permit: OwnedSemaphorePermit) {
        request.status = BackfillStatus::InFlight;

        loop {
            if self.cancel.is_cancelled() {
                self.finish_failed(request, "cancelled".to_string());
                return;
            }

            request.attempt += 1;
            if let Some(limiter) = self.providers.get(&request.provider) {
                limiter.record_request(Instant::now()).await;
            }

            let outcome = self
                .historical
                .get_daily_bars(&request.symbol, request.from_date, request.to_date, request.granularity)
                .await;

            match outcome {
                Ok(bars) => {
                    if let Err(err) = self.storage.write_bars(&request.symbol, &bars).await {
                        self.finish_failed(request, err.to_string());
                        return;
                    }
                    request.bars_retrieved = bars.len();
                    request.status = BackfillStatus::Succeeded;
                    self.progress.record_success(&request.symbol, bars.len());
                    self.completed_tx.send(request.clone()).ok();
                    return;
                }
                Err(err) => {
                    let message = err.to_string();
                    let retry_after = err.retry_after().or_else(|| parse_retry_after(&message));
                    let is_rate_limit = matches!(err, QualityError::RateLimit { .. }) || looks_like_rate_limit(&message);

                    if is_rate_limit {
                        if let Some(limiter) = self.providers.get(&request.provider) {
                            limiter.record_rate_limit_hit(retry_after).await;
                        }

                        if request.attempt < self.config.max_retry_attempts_per_request {
                            let delay = retry_after.unwrap_or_else(|| retry_backoff(request.attempt));
                            if self.sleep_cancellable(delay).await {
                                self.finish_failed(request, "cancelled".to_string());
                                return;
                            }
                            continue;
                        }
                    }

                    self.finish_failed(request, message);
                    return;
                }
            }
        }
    }

    fn finish_failed(&self, mut request: BackfillRequest, reason: String) {
        self.progress.record_failure(&request.symbol, reason.clone());
        request.status = BackfillStatus::Failed { reason };
        self.completed_tx.send(request).ok();
    }
}

/// `min(200ms * 2^(k-1), 10s)` +/- 25% jitter, applied across consecutive
/// empty `tryDequeue` polls (spec.md §4.M step 2).
fn empty_poll_backoff(consecutive_empty_polls: u32) -> Duration {
    jittered(Duration::from_millis(200), Duration::from_secs(10), consecutive_empty_polls, 0.25)
}

/// `min(2s * 2^(k-1), 60s)` +/- 25% jitter, applied between retry attempts
/// on a rate-limited request with no honoured `Retry-After` (spec.md §4.M
/// `processRequest`).
fn retry_backoff(attempt: u32) -> Duration {
    jittered(Duration::from_secs(2), Duration::from_secs(60), attempt, 0.25)
}

fn jittered(base: Duration, max: Duration, exponent: u32, jitter_fraction: f64) -> Duration {
    let shift = exponent.saturating_sub(1).min(31);
    let exponential = base.saturating_mul(1u32.checked_shl(shift).unwrap_or(u32::MAX));
    let capped = exponential.min(max);
    let jitter = rand::thread_rng().gen_range(-jitter_fraction..=jitter_fraction);
    let millis = (capped.as_millis() as f64) * (1.0 + jitter);
    Duration::from_millis(millis.max(0.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::HistoricalBar;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn date(day: u32) -> SessionDate {
        NaiveDate::from_ymd_opt(2026, 1, day).unwrap()
    }

    struct AlwaysSucceeds;

    #[async_trait]
    impl HistoricalProvider for AlwaysSucceeds {
        async fn get_daily_bars(
            &self,
            _symbol: &Symbol,
            from: SessionDate,
            _to: SessionDate,
            _granularity: Granularity,
        ) -> Result<Vec<HistoricalBar>, QualityError> {
            Ok(vec![HistoricalBar {
                date: from,
                open: dec!(100),
                high: dec!(101),
                low: dec!(99),
                close: dec!(100.5),
                volume: 1000,
            }])
        }
    }

    struct FailsNTimesThenSucceeds {
        remaining_failures: AtomicU32,
        retry_after_secs: u64,
    }

    #[async_trait]
    impl HistoricalProvider for FailsNTimesThenSucceeds {
        async fn get_daily_bars(
            &self,
            _symbol: &Symbol,
            from: SessionDate,
            _to: SessionDate,
            _granularity: Granularity,
        ) -> Result<Vec<HistoricalBar>, QualityError> {
            if self.remaining_failures.fetch_sub(1, Ordering::SeqCst) > 0 {
                return Err(QualityError::RateLimit {
                    retry_after: Some(Duration::from_secs(self.retry_after_secs)),
                });
            }
            Ok(vec![HistoricalBar {
                date: from,
                open: dec!(100),
                high: dec!(101),
                low: dec!(99),
                close: dec!(100.5),
                volume: 1000,
            }])
        }
    }

    struct RecordingSink {
        writes: AtomicU32,
    }

    #[async_trait]
    impl StorageSink for RecordingSink {
        async fn write_bars(&self, _symbol: &Symbol, _bars: &[HistoricalBar]) -> Result<(), QualityError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_request_marks_succeeded() {
        let worker = BackfillWorker::new(
            BackfillWorkerConfig::default(),
            HashMap::new(),
            Arc::new(AlwaysSucceeds),
            Arc::new(RecordingSink { writes: AtomicU32::new(0) }),
        )
        .unwrap();

        worker.enqueue(Symbol::from("AAPL"), date(1), date(2), Granularity::Day, Provider::Tiingo, 0);
        let mut completed = worker.take_completed().await.unwrap();

        let handle = tokio::spawn(Arc::clone(&worker).run());
        let result = completed.rx.recv().await.unwrap();
        worker.stop();
        worker.drain().await;
        handle.abort();

        assert_eq!(result.status, BackfillStatus::Succeeded);
        assert_eq!(result.bars_retrieved, 1);
        assert_eq!(worker.progress(&Symbol::from("AAPL")).unwrap().bars_retrieved, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_retry_honors_retry_after_then_succeeds() {
        let mut providers = HashMap::new();
        providers.insert(
            Provider::Tiingo,
            RateLimiter::new(1000, Duration::from_secs(60), Duration::ZERO),
        );

        let worker = BackfillWorker::new(
            BackfillWorkerConfig::default(),
            providers,
            Arc::new(FailsNTimesThenSucceeds {
                remaining_failures: AtomicU32::new(1),
                retry_after_secs: 3,
            }),
            Arc::new(RecordingSink { writes: AtomicU32::new(0) }),
        )
        .unwrap();

        worker.enqueue(Symbol::from("AAPL"), date(1), date(2), Granularity::Day, Provider::Tiingo, 0);
        let mut completed = worker.take_completed().await.unwrap();

        let start = Instant::now();
        let handle = tokio::spawn(Arc::clone(&worker).run());
        let result = completed.rx.recv().await.unwrap();
        worker.stop();
        worker.drain().await;
        handle.abort();

        assert_eq!(result.status, BackfillStatus::Succeeded);
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retry_budget_marks_failed() {
        let mut providers = HashMap::new();
        providers.insert(
            Provider::Tiingo,
            RateLimiter::new(1000, Duration::from_secs(60), Duration::ZERO),
        );

        let worker = BackfillWorker::new(
            BackfillWorkerConfig::default(),
            providers,
            Arc::new(FailsNTimesThenSucceeds {
                remaining_failures: AtomicU32::new(10),
                retry_after_secs: 1,
            }),
            Arc::new(RecordingSink { writes: AtomicU32::new(0) }),
        )
        .unwrap();

        worker.enqueue(Symbol::from("AAPL"), date(1), date(2), Granularity::Day, Provider::Tiingo, 0);
        let mut completed = worker.take_completed().await.unwrap();

        let handle = tokio::spawn(Arc::clone(&worker).run());
        let result = completed.rx.recv().await.unwrap();
        worker.stop();
        worker.drain().await;
        handle.abort();

        assert!(matches!(result.status, BackfillStatus::Failed { .. }));
        assert_eq!(result.attempt, 3);
    }

    #[test]
    fn test_config_rejects_out_of_range_concurrency() {
        let config = BackfillWorkerConfig { max_concurrent_requests: 0, ..Default::default() };
        assert!(config.validate().is_err());

        let config = BackfillWorkerConfig { max_concurrent_requests: 200, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_poll_backoff_caps_at_ten_seconds() {
        for k in 1..20 {
            assert!(empty_poll_backoff(k) <= Duration::from_secs(10) + Duration::from_secs(10) / 4);
        }
    }
}
