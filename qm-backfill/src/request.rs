use qm_instrument::{Provider, SessionDate, Symbol};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU64, Ordering};

/// Bar size requested from a historical provider (spec.md §3
/// `BackfillRequest.granularity`).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Granularity {
    Minute,
    Hour,
    Day,
}

/// A single OHLCV bar returned by a [`crate::worker::HistoricalProvider`].
#[derive(Debug, Clone, PartialEq)]
pub struct HistoricalBar {
    pub date: SessionDate,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: u64,
}

/// Lifecycle state of a [`BackfillRequest`] (spec.md §3, §4.M).
#[derive(Debug, Clone, PartialEq)]
pub enum BackfillStatus {
    Queued,
    InFlight,
    /// All providers were rate-limited when this request would otherwise
    /// have been dequeued and auto-resume was disabled or the wait budget
    /// was exceeded (spec.md §4.M step 2).
    RateLimited,
    Succeeded,
    Failed { reason: String },
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RequestId(u64);

#[derive(Debug, Default)]
pub(crate) struct RequestIdAllocator(AtomicU64);

impl RequestIdAllocator {
    pub fn next(&self) -> RequestId {
        RequestId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

/// A queued unit of backfill work (spec.md §3 `BackfillRequest`).
#[derive(Debug, Clone, PartialEq)]
pub struct BackfillRequest {
    pub id: RequestId,
    pub symbol: Symbol,
    pub from_date: SessionDate,
    pub to_date: SessionDate,
    pub granularity: Granularity,
    pub provider: Provider,
    /// Lower value sorts first; FIFO within equal priority (spec.md §4.M
    /// "Priority queue (FIFO within priority)").
    pub priority: u8,
    pub attempt: u32,
    pub status: BackfillStatus,
    pub bars_retrieved: usize,
}

impl BackfillRequest {
    pub fn new(
        id: RequestId,
        symbol: Symbol,
        from_date: SessionDate,
        to_date: SessionDate,
        granularity: Granularity,
        provider: Provider,
        priority: u8,
    ) -> Self {
        Self {
            id,
            symbol,
            from_date,
            to_date,
            granularity,
            provider,
            priority,
            attempt: 0,
            status: BackfillStatus::Queued,
            bars_retrieved: 0,
        }
    }
}
