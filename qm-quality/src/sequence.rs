use crate::types::EventKind;
use parking_lot::Mutex;
use qm_instrument::{Instant, Provider, Symbol};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceErrorType {
    Gap,
    OutOfOrder,
    Duplicate,
    Reset,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceError {
    pub timestamp: Instant,
    pub symbol: Symbol,
    pub event_kind: EventKind,
    pub error_type: SequenceErrorType,
    pub expected_seq: i64,
    pub actual_seq: i64,
    pub gap_size: i64,
    pub stream_id: Option<String>,
    pub provider: Option<Provider>,
}

#[derive(Clone, Copy)]
pub struct SequenceConfig {
    pub gap_threshold: i64,
    pub reset_threshold: i64,
    pub max_recent_tracked: usize,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            gap_threshold: 1,
            reset_threshold: 10_000,
            max_recent_tracked: 1000,
        }
    }
}

struct StreamState {
    last_sequence: i64,
    recent: VecDeque<i64>,
    recent_set: HashSet<i64>,
}

impl StreamState {
    fn new() -> Self {
        Self {
            last_sequence: -1,
            recent: VecDeque::new(),
            recent_set: HashSet::new(),
        }
    }

    fn remember(&mut self, seq: i64, cap: usize) {
        self.recent.push_back(seq);
        self.recent_set.insert(seq);
        while self.recent.len() > cap {
            if let Some(evicted) = self.recent.pop_front() {
                self.recent_set.remove(&evicted);
            }
        }
    }
}

type StreamKey = (Symbol, EventKind, Option<String>);

#[derive(Debug, Default)]
pub struct SequenceCounters {
    pub gap: AtomicU64,
    pub out_of_order: AtomicU64,
    pub duplicate: AtomicU64,
    pub reset: AtomicU64,
    pub total_checked: AtomicU64,
}

/// Per-(symbol, event-kind, stream-id) integer-sequence anomaly detector
/// (spec.md §4.D).
pub struct SequenceErrorTracker {
    config: SequenceConfig,
    streams: Mutex<HashMap<StreamKey, StreamState>>,
    counters: SequenceCounters,
    per_symbol_counters: Mutex<HashMap<Symbol, SequenceCounters>>,
}

impl SequenceErrorTracker {
    pub fn new(config: SequenceConfig) -> Self {
        Self {
            config,
            streams: Mutex::new(HashMap::new()),
            counters: SequenceCounters::default(),
            per_symbol_counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn check_sequence(
        &self,
        symbol: Symbol,
        event_kind: EventKind,
        seq: i64,
        timestamp: Instant,
        stream_id: Option<String>,
        provider: Option<Provider>,
    ) -> Option<SequenceError> {
        let key = (symbol.clone(), event_kind, stream_id.clone());
        let mut streams = self.streams.lock();
        let state = streams.entry(key).or_insert_with(StreamState::new);

        self.counters.total_checked.fetch_add(1, Ordering::Relaxed);
        self.bump_symbol(&symbol, |c| c.total_checked.fetch_add(1, Ordering::Relaxed));

        if state.last_sequence == -1 {
            state.last_sequence = seq;
            state.remember(seq, self.config.max_recent_tracked);
            return None;
        }

        // A duplicate is a re-delivery of the exact last-accepted sequence
        // (spec.md §8 boundary behavior: "Sequence equal to lastSeq ->
        // Duplicate, not Gap"). This takes precedence over the reset/
        // out-of-order checks below since it is the narrowest condition.
        let error = if seq == state.last_sequence {
            let expected = state.last_sequence + 1;
            self.counters.duplicate.fetch_add(1, Ordering::Relaxed);
            self.bump_symbol(&symbol, |c| c.duplicate.fetch_add(1, Ordering::Relaxed));
            Some(SequenceError {
                timestamp,
                symbol: symbol.clone(),
                event_kind,
                error_type: SequenceErrorType::Duplicate,
                expected_seq: expected,
                actual_seq: seq,
                gap_size: 0,
                stream_id: stream_id.clone(),
                provider,
            })
        } else if seq < state.last_sequence - self.config.reset_threshold {
            let expected = state.last_sequence + 1;
            state.last_sequence = seq;
            state.recent.clear();
            state.recent_set.clear();
            self.counters.reset.fetch_add(1, Ordering::Relaxed);
            self.bump_symbol(&symbol, |c| c.reset.fetch_add(1, Ordering::Relaxed));
            Some(SequenceError {
                timestamp,
                symbol: symbol.clone(),
                event_kind,
                error_type: SequenceErrorType::Reset,
                expected_seq: expected,
                actual_seq: seq,
                gap_size: 0,
                stream_id: stream_id.clone(),
                provider,
            })
        } else if seq < state.last_sequence {
            let expected = state.last_sequence + 1;
            self.counters.out_of_order.fetch_add(1, Ordering::Relaxed);
            self.bump_symbol(&symbol, |c| c.out_of_order.fetch_add(1, Ordering::Relaxed));
            Some(SequenceError {
                timestamp,
                symbol: symbol.clone(),
                event_kind,
                error_type: SequenceErrorType::OutOfOrder,
                expected_seq: expected,
                actual_seq: seq,
                gap_size: 0,
                stream_id: stream_id.clone(),
                provider,
            })
        } else if seq > state.last_sequence + self.config.gap_threshold {
            let expected = state.last_sequence + 1;
            let gap_size = seq - state.last_sequence - 1;
            state.last_sequence = seq;
            self.counters.gap.fetch_add(1, Ordering::Relaxed);
            self.bump_symbol(&symbol, |c| c.gap.fetch_add(1, Ordering::Relaxed));
            Some(SequenceError {
                timestamp,
                symbol: symbol.clone(),
                event_kind,
                error_type: SequenceErrorType::Gap,
                expected_seq: expected,
                actual_seq: seq,
                gap_size,
                stream_id: stream_id.clone(),
                provider,
            })
        } else {
            state.last_sequence = seq;
            None
        };

        state.remember(seq, self.config.max_recent_tracked);
        error
    }

    fn bump_symbol(&self, symbol: &Symbol, op: impl FnOnce(&SequenceCounters)) {
        let mut map = self.per_symbol_counters.lock();
        let counters = map.entry(symbol.clone()).or_default();
        op(counters);
    }

    /// Per-type counts plus the error rate over total events checked for
    /// `symbol` (spec.md §4.D "per-symbol summary").
    pub fn symbol_summary(&self, symbol: &Symbol) -> Option<SequenceSummary> {
        let map = self.per_symbol_counters.lock();
        let counters = map.get(symbol)?;
        let total = counters.total_checked.load(Ordering::Relaxed);
        let errors = counters.gap.load(Ordering::Relaxed)
            + counters.out_of_order.load(Ordering::Relaxed)
            + counters.duplicate.load(Ordering::Relaxed)
            + counters.reset.load(Ordering::Relaxed);

        Some(SequenceSummary {
            gap: counters.gap.load(Ordering::Relaxed),
            out_of_order: counters.out_of_order.load(Ordering::Relaxed),
            duplicate: counters.duplicate.load(Ordering::Relaxed),
            reset: counters.reset.load(Ordering::Relaxed),
            total_checked: total,
            error_rate: if total == 0 {
                0.0
            } else {
                errors as f64 / total as f64
            },
        })
    }

    pub fn global_counts(&self) -> SequenceSummary {
        SequenceSummary {
            gap: self.counters.gap.load(Ordering::Relaxed),
            out_of_order: self.counters.out_of_order.load(Ordering::Relaxed),
            duplicate: self.counters.duplicate.load(Ordering::Relaxed),
            reset: self.counters.reset.load(Ordering::Relaxed),
            total_checked: self.counters.total_checked.load(Ordering::Relaxed),
            error_rate: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SequenceSummary {
    pub gap: u64,
    pub out_of_order: u64,
    pub duplicate: u64,
    pub reset: u64,
    pub total_checked: u64,
    pub error_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn now() -> Instant {
        Utc::now()
    }

    /// spec.md §8 scenario 3: `[1,2,3,3,2,1000000,7,8]`.
    #[test]
    fn test_sequence_scenario() {
        let tracker = SequenceErrorTracker::new(SequenceConfig {
            gap_threshold: 1,
            reset_threshold: 10_000,
            max_recent_tracked: 1000,
        });
        let symbol = Symbol::from("AAPL");
        let mut errors = Vec::new();
        for seq in [1, 2, 3, 3, 2, 1_000_000, 7, 8] {
            if let Some(e) = tracker.check_sequence(
                symbol.clone(),
                EventKind::Trades,
                seq,
                now(),
                None,
                None,
            ) {
                errors.push((seq, e.error_type));
            }
        }

        assert_eq!(
            errors,
            vec![
                (3, SequenceErrorType::Duplicate),
                (2, SequenceErrorType::OutOfOrder),
                (1_000_000, SequenceErrorType::Gap),
                (7, SequenceErrorType::Reset),
            ]
        );

        let summary = tracker.symbol_summary(&symbol).unwrap();
        assert_eq!(summary.total_checked, 8);
    }

    #[test]
    fn test_duplicate_vs_out_of_order_boundary() {
        let tracker = SequenceErrorTracker::new(SequenceConfig::default());
        let symbol = Symbol::from("AAPL");
        tracker.check_sequence(symbol.clone(), EventKind::Trades, 100, now(), None, None);

        // seq == lastSeq -> Duplicate, not Gap.
        let err = tracker
            .check_sequence(symbol.clone(), EventKind::Trades, 100, now(), None, None)
            .unwrap();
        assert_eq!(err.error_type, SequenceErrorType::Duplicate);
    }

    #[test]
    fn test_reset_threshold_boundary() {
        let tracker = SequenceErrorTracker::new(SequenceConfig {
            gap_threshold: 1,
            reset_threshold: 10,
            max_recent_tracked: 1000,
        });
        let symbol = Symbol::from("AAPL");
        tracker.check_sequence(symbol.clone(), EventKind::Trades, 100, now(), None, None);

        // lastSeq - resetThreshold = 90 -> OutOfOrder (not strictly less than).
        let err = tracker
            .check_sequence(symbol.clone(), EventKind::Trades, 90, now(), None, None)
            .unwrap();
        assert_eq!(err.error_type, SequenceErrorType::OutOfOrder);
    }

    #[test]
    fn test_reset_threshold_minus_one_triggers_reset() {
        let tracker = SequenceErrorTracker::new(SequenceConfig {
            gap_threshold: 1,
            reset_threshold: 10,
            max_recent_tracked: 1000,
        });
        let symbol = Symbol::from("AAPL");
        tracker.check_sequence(symbol.clone(), EventKind::Trades, 100, now(), None, None);

        // lastSeq - resetThreshold - 1 = 89 -> Reset.
        let err = tracker
            .check_sequence(symbol.clone(), EventKind::Trades, 89, now(), None, None)
            .unwrap();
        assert_eq!(err.error_type, SequenceErrorType::Reset);
    }
}
