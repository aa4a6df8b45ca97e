use qm_instrument::{Instant, Provider, Symbol};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Which kind of event stream a detector, gap, or sequence error pertains
/// to (spec.md §3).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Trades,
    Quotes,
    Aggregates,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggressor {
    Buy,
    Sell,
    Unknown,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Timeframe {
    Second,
    Minute,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeEvent {
    pub symbol: Symbol,
    pub timestamp: Instant,
    pub price: Decimal,
    pub volume: u64,
    pub sequence: Option<i64>,
    pub provider: Option<Provider>,
    pub latency_ms: Option<u64>,
    pub venue: Option<String>,
    pub aggressor: Aggressor,
}

/// A quote event. Construction must enforce the spec.md §3 invariant "bid
/// and ask both > 0 OR the event is dropped" - expressed here via
/// [`QuoteEvent::new`] returning `None` rather than allowing an invalid
/// value to exist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteEvent {
    pub symbol: Symbol,
    pub timestamp: Instant,
    pub bid_price: Decimal,
    pub bid_size: u64,
    pub ask_price: Decimal,
    pub ask_size: u64,
    pub provider: Option<Provider>,
    pub latency_ms: Option<u64>,
}

impl QuoteEvent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: Symbol,
        timestamp: Instant,
        bid_price: Decimal,
        bid_size: u64,
        ask_price: Decimal,
        ask_size: u64,
        provider: Option<Provider>,
        latency_ms: Option<u64>,
    ) -> Option<Self> {
        if bid_price <= Decimal::ZERO || ask_price <= Decimal::ZERO {
            return None;
        }

        Some(Self {
            symbol,
            timestamp,
            bid_price,
            bid_size,
            ask_price,
            ask_size,
            provider,
            latency_ms,
        })
    }

    pub fn mid_price(&self) -> Decimal {
        (self.bid_price + self.ask_price) / Decimal::TWO
    }
}

/// An OHLCV bar. Construction enforces the spec.md §3 invariants:
/// `high >= max(open,close,low)`, `low <= min(open,close,high)`, all prices
/// `> 0`, `end_time > start_time`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateBar {
    pub symbol: Symbol,
    pub start_time: Instant,
    pub end_time: Instant,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: u64,
    pub vwap: Decimal,
    pub trade_count: u64,
    pub timeframe: Timeframe,
    pub source: Provider,
    pub sequence: i64,
}

impl AggregateBar {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: Symbol,
        start_time: Instant,
        end_time: Instant,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: u64,
        vwap: Decimal,
        trade_count: u64,
        timeframe: Timeframe,
        source: Provider,
        sequence: i64,
    ) -> Option<Self> {
        let all_positive = [open, high, low, close].iter().all(|p| *p > Decimal::ZERO);
        let high_is_max = high >= open && high >= close && high >= low;
        let low_is_min = low <= open && low <= close && low <= high;

        if !all_positive || !high_is_max || !low_is_min || end_time <= start_time {
            return None;
        }

        Some(Self {
            symbol,
            start_time,
            end_time,
            open,
            high,
            low,
            close,
            volume,
            vwap,
            trade_count,
            timeframe,
            source,
            sequence,
        })
    }
}
