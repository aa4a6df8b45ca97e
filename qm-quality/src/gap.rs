use crate::types::EventKind;
use chrono::{Duration as ChronoDuration, NaiveTime};
use parking_lot::Mutex;
use qm_instrument::{
    classify_gap_severity, thresholds, GapSeverity, Instant, LiquidityProfile, SessionDate, Symbol,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// A detected gap in a (symbol, event-kind) stream (spec.md §3/§4.C).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataGap {
    pub symbol: Symbol,
    pub event_kind: EventKind,
    pub gap_start: Instant,
    pub gap_end: Instant,
    pub duration_seconds: f64,
    pub missed_seq_start: Option<i64>,
    pub missed_seq_end: Option<i64>,
    pub estimated_missed_events: u64,
    pub severity: GapSeverity,
    pub possible_cause: &'static str,
}

struct StreamState {
    last_event: Instant,
    last_sequence: Option<i64>,
}

#[derive(Clone, Copy)]
pub struct GapConfig {
    pub max_gaps_per_symbol: usize,
    pub retention_days: i64,
    /// UTC market close/open used for the "overnight" cause inference.
    pub market_close_utc: NaiveTime,
    pub market_open_utc: NaiveTime,
}

impl Default for GapConfig {
    fn default() -> Self {
        Self {
            max_gaps_per_symbol: 500,
            retention_days: 30,
            market_close_utc: NaiveTime::from_hms_opt(20, 0, 0).unwrap(),
            market_open_utc: NaiveTime::from_hms_opt(13, 30, 0).unwrap(),
        }
    }
}

type GapKey = (Symbol, EventKind);

/// Per-(symbol,event-kind) gap detection with bounded, FIFO-evicted history
/// (spec.md §4.C).
pub struct GapAnalyzer {
    config: GapConfig,
    state: Mutex<HashMap<GapKey, StreamState>>,
    gaps: Mutex<HashMap<GapKey, VecDeque<DataGap>>>,
    listener: Mutex<Option<Box<dyn Fn(&DataGap) + Send + Sync>>>,
}

impl GapAnalyzer {
    pub fn new(config: GapConfig) -> Self {
        Self {
            config,
            state: Mutex::new(HashMap::new()),
            gaps: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
        }
    }

    pub fn on_gap_detected<F>(&self, listener: F)
    where
        F: Fn(&DataGap) + Send + Sync + 'static,
    {
        *self.listener.lock() = Some(Box::new(listener));
    }

    pub fn record_event(
        &self,
        symbol: Symbol,
        event_kind: EventKind,
        timestamp: Instant,
        sequence: Option<i64>,
        profile: LiquidityProfile,
    ) {
        let key = (symbol.clone(), event_kind);
        let previous = {
            let mut state = self.state.lock();
            let entry = state.insert(
                key.clone(),
                StreamState {
                    last_event: timestamp,
                    last_sequence: sequence,
                },
            );
            entry
        };

        let Some(previous) = previous else {
            return;
        };

        let delta_seconds = (timestamp - previous.last_event).num_milliseconds() as f64 / 1000.0;
        let gap_threshold = thresholds(profile).gap_threshold_seconds as f64;

        if delta_seconds < gap_threshold {
            return;
        }

        let severity = classify_gap_severity(delta_seconds, profile);
        let expected_per_hour = thresholds(profile).expected_events_per_hour;
        let estimated_missed_events =
            ((delta_seconds / 3600.0) * expected_per_hour as f64).floor() as u64;

        let missed_seq_start = previous.last_sequence.map(|s| s + 1);
        let missed_seq_end = match (sequence, previous.last_sequence) {
            (Some(current), _) => Some(current),
            (None, Some(last)) => Some(last + estimated_missed_events as i64),
            (None, None) => None,
        };

        let possible_cause = self.infer_cause(
            previous.last_event,
            timestamp,
            delta_seconds,
            gap_threshold,
            profile,
        );

        let gap = DataGap {
            symbol: symbol.clone(),
            event_kind,
            gap_start: previous.last_event,
            gap_end: timestamp,
            duration_seconds: delta_seconds,
            missed_seq_start,
            missed_seq_end,
            estimated_missed_events,
            severity,
            possible_cause,
        };

        {
            let mut gaps = self.gaps.lock();
            let bucket = gaps.entry(key).or_default();
            bucket.push_back(gap.clone());
            while bucket.len() > self.config.max_gaps_per_symbol {
                bucket.pop_front();
            }
        }

        if let Some(listener) = self.listener.lock().as_ref() {
            qm_integration::notify_listener("gap_detected", || listener(&gap));
        }
    }

    fn infer_cause(
        &self,
        start: Instant,
        end: Instant,
        duration_seconds: f64,
        gap_threshold: f64,
        profile: LiquidityProfile,
    ) -> &'static str {
        let start_time = start.time();
        let end_time = end.time();
        let buffer = ChronoDuration::seconds(gap_threshold as i64);

        let within_post_close = start_time >= self.config.market_close_utc - buffer;
        let within_pre_open = end_time <= self.config.market_open_utc + buffer;
        let crosses_day = end.date_naive() > start.date_naive();

        if within_post_close && within_pre_open && crosses_day {
            return "Market closed overnight";
        }

        if duration_seconds <= gap_threshold * 3.0 && profile >= LiquidityProfile::Low {
            return "Normal quiet period for illiquid instrument";
        }

        let minutes = duration_seconds / 60.0;
        if (30.0..=120.0).contains(&minutes) {
            return "Possible connection interruption";
        }

        "Unknown cause - investigate provider"
    }

    pub fn gaps_for_symbol_date(&self, symbol: &Symbol, date: SessionDate) -> Vec<DataGap> {
        let gaps = self.gaps.lock();
        gaps.iter()
            .filter(|((s, _), _)| s == symbol)
            .flat_map(|(_, list)| list.iter().cloned())
            .filter(|gap| gap.gap_start.date_naive() == date || gap.gap_end.date_naive() == date)
            .collect()
    }

    pub fn gaps_for_date(&self, date: SessionDate) -> Vec<DataGap> {
        let gaps = self.gaps.lock();
        gaps.values()
            .flat_map(|list| list.iter().cloned())
            .filter(|gap| gap.gap_start.date_naive() == date || gap.gap_end.date_naive() == date)
            .collect()
    }

    pub fn recent(&self, n: usize) -> Vec<DataGap> {
        let gaps = self.gaps.lock();
        let mut all: Vec<_> = gaps.values().flat_map(|list| list.iter().cloned()).collect();
        all.sort_by_key(|gap| std::cmp::Reverse(gap.gap_end));
        all.truncate(n);
        all
    }

    pub fn statistics(&self) -> GapStatistics {
        let gaps = self.gaps.lock();
        let all: Vec<&DataGap> = gaps.values().flatten().collect();

        if all.is_empty() {
            return GapStatistics::default();
        }

        let total = all.len();
        let total_duration: f64 = all.iter().map(|g| g.duration_seconds).sum();
        let average_duration = total_duration / total as f64;
        let min_duration = all
            .iter()
            .map(|g| g.duration_seconds)
            .fold(f64::INFINITY, f64::min);
        let max_duration = all
            .iter()
            .map(|g| g.duration_seconds)
            .fold(f64::NEG_INFINITY, f64::max);

        let mut by_severity: HashMap<GapSeverity, usize> = HashMap::new();
        let mut by_symbol: HashMap<Symbol, usize> = HashMap::new();
        for gap in &all {
            *by_severity.entry(gap.severity).or_insert(0) += 1;
            *by_symbol.entry(gap.symbol.clone()).or_insert(0) += 1;
        }

        let mut top_symbols: Vec<(Symbol, usize)> = by_symbol.into_iter().collect();
        top_symbols.sort_by_key(|(_, count)| std::cmp::Reverse(*count));
        top_symbols.truncate(50);

        GapStatistics {
            total_gaps: total,
            average_duration_seconds: average_duration,
            min_duration_seconds: min_duration,
            max_duration_seconds: max_duration,
            by_severity,
            top_affected_symbols: top_symbols,
        }
    }

    /// Hourly cleanup tick: drop gaps and stream state older than
    /// `retention_days`.
    pub fn cleanup(&self, now: Instant) {
        let cutoff = now - ChronoDuration::days(self.config.retention_days);

        let mut gaps = self.gaps.lock();
        gaps.retain(|_, list| {
            list.retain(|gap| gap.gap_end >= cutoff);
            !list.is_empty()
        });

        let mut state = self.state.lock();
        state.retain(|_, s| s.last_event >= cutoff);
    }

    /// Ordered segments covering the extended trading window for `date`
    /// (spec.md §4.C timeline construction).
    pub fn timeline(
        &self,
        symbol: &Symbol,
        date: SessionDate,
        profile: LiquidityProfile,
        extended: &ExtendedHours,
    ) -> Vec<TimelineSegment> {
        let mut gaps = self.gaps_for_symbol_date(symbol, date);
        gaps.sort_by_key(|g| g.gap_start);

        let expected_per_hour = thresholds(profile).expected_events_per_hour as f64;
        let mut segments = Vec::new();

        if extended.pre_market_hours > 0.0 {
            segments.push(TimelineSegment::PreMarket {
                hours: extended.pre_market_hours,
            });
        }

        let mut cursor_hours = 0.0f64;
        let market_hours = extended.market_hours;
        for gap in &gaps {
            let gap_hours = gap.duration_seconds / 3600.0;
            let data_hours = (market_hours - cursor_hours - gap_hours).max(0.0);
            if data_hours > 0.0 {
                segments.push(TimelineSegment::DataPresent {
                    estimated_events: (data_hours * expected_per_hour).round() as u64,
                });
            }
            segments.push(TimelineSegment::Gap {
                duration_seconds: gap.duration_seconds,
            });
            cursor_hours += data_hours + gap_hours;
        }

        let remaining = (market_hours - cursor_hours).max(0.0);
        if remaining > 0.0 {
            segments.push(TimelineSegment::DataPresent {
                estimated_events: (remaining * expected_per_hour).round() as u64,
            });
        }

        if extended.after_hours_hours > 0.0 {
            segments.push(TimelineSegment::AfterHours {
                hours: extended.after_hours_hours,
            });
        }

        segments
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExtendedHours {
    pub pre_market_hours: f64,
    pub market_hours: f64,
    pub after_hours_hours: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TimelineSegment {
    PreMarket { hours: f64 },
    DataPresent { estimated_events: u64 },
    Gap { duration_seconds: f64 },
    AfterHours { hours: f64 },
}

#[derive(Debug, Clone, Default)]
pub struct GapStatistics {
    pub total_gaps: usize,
    pub average_duration_seconds: f64,
    pub min_duration_seconds: f64,
    pub max_duration_seconds: f64,
    pub by_severity: HashMap<GapSeverity, usize>,
    pub top_affected_symbols: Vec<(Symbol, usize)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn ts(s: &str) -> Instant {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%SZ")
            .unwrap()
            .and_utc()
    }

    #[test]
    fn test_no_gap_on_first_event() {
        let analyzer = GapAnalyzer::new(GapConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        analyzer.on_gap_detected(move |_| {
            calls2.fetch_add(1, Ordering::SeqCst);
        });
        analyzer.record_event(
            Symbol::from("AAPL"),
            EventKind::Trades,
            ts("2024-03-04T13:30:00Z"),
            Some(1),
            LiquidityProfile::High,
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_overnight_gap_scenario() {
        // spec.md §8 scenario 2.
        let analyzer = GapAnalyzer::new(GapConfig::default());
        let detected = Arc::new(Mutex::new(None));
        let detected2 = detected.clone();
        analyzer.on_gap_detected(move |gap| {
            *detected2.lock() = Some(gap.clone());
        });

        analyzer.record_event(
            Symbol::from("AAPL"),
            EventKind::Trades,
            ts("2024-03-04T19:59:30Z"),
            None,
            LiquidityProfile::High,
        );
        analyzer.record_event(
            Symbol::from("AAPL"),
            EventKind::Trades,
            ts("2024-03-05T13:30:30Z"),
            None,
            LiquidityProfile::High,
        );

        let gap = detected.lock().clone().expect("gap should be detected");
        assert_eq!(gap.duration_seconds, 17.0 * 3600.0 + 60.0);
        assert_eq!(gap.severity, GapSeverity::Critical);
        assert_eq!(gap.possible_cause, "Market closed overnight");
    }

    #[test]
    fn test_gap_threshold_boundary() {
        let analyzer = GapAnalyzer::new(GapConfig::default());
        let detected = Arc::new(AtomicUsize::new(0));
        let detected2 = detected.clone();
        analyzer.on_gap_detected(move |_| {
            detected2.fetch_add(1, Ordering::SeqCst);
        });

        // exactly at threshold (60s for High) => gap (Minor)
        analyzer.record_event(
            Symbol::from("MSFT"),
            EventKind::Trades,
            ts("2024-03-04T13:30:00Z"),
            None,
            LiquidityProfile::High,
        );
        analyzer.record_event(
            Symbol::from("MSFT"),
            EventKind::Trades,
            ts("2024-03-04T13:31:00Z"),
            None,
            LiquidityProfile::High,
        );
        assert_eq!(detected.load(Ordering::SeqCst), 1);

        // strictly below threshold => no gap
        analyzer.record_event(
            Symbol::from("GOOG"),
            EventKind::Trades,
            ts("2024-03-04T13:30:00Z"),
            None,
            LiquidityProfile::High,
        );
        analyzer.record_event(
            Symbol::from("GOOG"),
            EventKind::Trades,
            ts("2024-03-04T13:30:59Z"),
            None,
            LiquidityProfile::High,
        );
        assert_eq!(detected.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_bounded_history_fifo_eviction() {
        let analyzer = GapAnalyzer::new(GapConfig {
            max_gaps_per_symbol: 2,
            ..GapConfig::default()
        });

        let base = ts("2024-03-04T13:30:00Z");
        analyzer.record_event(Symbol::from("AAPL"), EventKind::Trades, base, None, LiquidityProfile::High);
        for i in 1..=4 {
            let t = base + ChronoDuration::seconds(i * 120);
            analyzer.record_event(Symbol::from("AAPL"), EventKind::Trades, t, None, LiquidityProfile::High);
        }

        let stats = analyzer.statistics();
        assert_eq!(stats.total_gaps, 2);
    }
}
