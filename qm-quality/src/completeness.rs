use crate::types::EventKind;
use chrono::{Datelike, NaiveDate, NaiveTime};
use parking_lot::Mutex;
use qm_instrument::{Instant, SessionDate, Symbol};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Configuration for the completeness calculator (spec.md §4.E).
///
/// `market_open_utc`/`market_close_utc` define the trading window used both
/// to size the expected-event count and to bound the coverage-minute
/// denominator. `default_expected_events_per_hour` is used when a symbol has
/// no per-symbol override.
#[derive(Clone, Copy)]
pub struct CompletenessConfig {
    pub market_open_utc: NaiveTime,
    pub market_close_utc: NaiveTime,
    pub default_expected_events_per_hour: u64,
    pub retention_days: i64,
}

impl Default for CompletenessConfig {
    fn default() -> Self {
        Self {
            market_open_utc: NaiveTime::from_hms_opt(13, 30, 0).unwrap(),
            market_close_utc: NaiveTime::from_hms_opt(20, 0, 0).unwrap(),
            default_expected_events_per_hour: 500,
            retention_days: 30,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum CompletenessGrade {
    A,
    B,
    C,
    D,
    F,
}

impl CompletenessGrade {
    fn from_score(score: f64) -> Self {
        if score >= 0.95 {
            CompletenessGrade::A
        } else if score >= 0.85 {
            CompletenessGrade::B
        } else if score >= 0.70 {
            CompletenessGrade::C
        } else if score >= 0.50 {
            CompletenessGrade::D
        } else {
            CompletenessGrade::F
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompletenessScore {
    pub event_count: u64,
    pub expected_events: u64,
    pub event_score: f64,
    pub coverage_score: f64,
    pub score: f64,
    pub grade: CompletenessGrade,
    pub covered_minutes: usize,
    pub market_minutes: usize,
    pub first_event: Option<Instant>,
    pub last_event: Option<Instant>,
}

type DayKey = (Symbol, EventKind, SessionDate);

struct DayState {
    event_count: u64,
    covered_minutes: HashSet<u16>,
    first_event: Option<Instant>,
    last_event: Option<Instant>,
}

impl DayState {
    fn new() -> Self {
        Self {
            event_count: 0,
            covered_minutes: HashSet::new(),
            first_event: None,
            last_event: None,
        }
    }
}

/// Tracks per-(symbol, event-kind, date) event volume and minute-level
/// coverage and turns it into a 0-1 completeness score (component E).
pub struct CompletenessCalculator {
    config: CompletenessConfig,
    days: Mutex<HashMap<DayKey, DayState>>,
    overrides: Mutex<HashMap<Symbol, u64>>,
}

impl CompletenessCalculator {
    pub fn new(config: CompletenessConfig) -> Self {
        Self {
            config,
            days: Mutex::new(HashMap::new()),
            overrides: Mutex::new(HashMap::new()),
        }
    }

    /// Overrides `expectedEventsPerHour` for a single symbol (e.g. a
    /// thinly-traded name where the market-wide default would be unfair).
    pub fn set_expected_events_per_hour(&self, symbol: Symbol, per_hour: u64) {
        self.overrides.lock().insert(symbol, per_hour);
    }

    pub fn record_event(&self, symbol: Symbol, event_kind: EventKind, timestamp: Instant) {
        let date = timestamp.date_naive();
        let key = (symbol, event_kind, date);
        let mut days = self.days.lock();
        let state = days.entry(key).or_insert_with(DayState::new);

        state.event_count += 1;
        let minute_of_day = (timestamp.time().num_seconds_from_midnight() / 60) as u16;
        state.covered_minutes.insert(minute_of_day);
        if state.first_event.is_none() {
            state.first_event = Some(timestamp);
        }
        state.last_event = Some(timestamp);
    }

    /// Computes the completeness score for `symbol` on `date` (spec.md
    /// §4.E). Returns `None` if no events have been recorded for that key.
    pub fn calculate_score(
        &self,
        symbol: &Symbol,
        event_kind: EventKind,
        date: SessionDate,
    ) -> Option<CompletenessScore> {
        let days = self.days.lock();
        let state = days.get(&(symbol.clone(), event_kind, date))?;

        let expected_per_hour = self
            .overrides
            .lock()
            .get(symbol)
            .copied()
            .unwrap_or(self.config.default_expected_events_per_hour);

        let market_minutes = self.market_minutes();
        let trading_hours = market_minutes as f64 / 60.0;
        let expected_events = (trading_hours * expected_per_hour as f64).round() as u64;

        let event_score = if expected_events == 0 {
            if state.event_count >= 1 {
                1.0
            } else {
                0.0
            }
        } else {
            (state.event_count as f64 / expected_events as f64).min(1.0)
        };

        let covered_in_market_hours = state
            .covered_minutes
            .iter()
            .filter(|m| self.is_market_minute(**m))
            .count();
        let coverage_score = if market_minutes == 0 {
            0.0
        } else {
            covered_in_market_hours as f64 / market_minutes as f64
        };

        let score = round4(0.7 * event_score + 0.3 * coverage_score);

        Some(CompletenessScore {
            event_count: state.event_count,
            expected_events,
            event_score: round4(event_score),
            coverage_score: round4(coverage_score),
            score,
            grade: CompletenessGrade::from_score(score),
            covered_minutes: covered_in_market_hours,
            market_minutes,
            first_event: state.first_event,
            last_event: state.last_event,
        })
    }

    fn market_minutes(&self) -> usize {
        let open = self.config.market_open_utc.num_seconds_from_midnight() as i64;
        let close = self.config.market_close_utc.num_seconds_from_midnight() as i64;
        ((close - open).max(0) / 60) as usize
    }

    fn is_market_minute(&self, minute_of_day: u16) -> bool {
        let open_min = self.config.market_open_utc.num_seconds_from_midnight() / 60;
        let close_min = self.config.market_close_utc.num_seconds_from_midnight() / 60;
        let m = minute_of_day as u32;
        m >= open_min && m < close_min
    }

    /// Drops per-day state older than `retention_days` relative to `today`.
    pub fn cleanup(&self, today: NaiveDate) {
        let cutoff = today - chrono::Duration::days(self.config.retention_days);
        self.days.lock().retain(|(_, _, date), _| *date >= cutoff);
    }
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};

    fn on(date: NaiveDate, hh: u32, mm: u32, ss: u32) -> Instant {
        Utc.from_utc_datetime(&date.and_hms_opt(hh, mm, ss).unwrap())
    }

    /// spec.md §8 scenario 1: "Completeness from trickle" - High-liquidity
    /// symbol, 3,250 trades evenly spaced across the 13:30-20:00 window,
    /// expected ~500 events/hour * 6.5h = 3,250, so eventScore = 1.0 but
    /// coverage is sparse (one event every ~7.2s covers one minute bucket
    /// roughly every other minute), yielding score ~0.65 and grade D.
    #[test]
    fn test_trickle_scenario() {
        let calc = CompletenessCalculator::new(CompletenessConfig::default());
        let symbol = Symbol::from("THIN");
        let date = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();

        let market_open_secs = 13 * 3600 + 30 * 60;
        let market_close_secs = 20 * 3600;
        let span_secs = (market_close_secs - market_open_secs) as f64;
        let n = 3_250u32;
        let step = span_secs / n as f64;

        for i in 0..n {
            let offset = (i as f64 * step) as i64;
            let ts = on(date, 0, 0, 0) + chrono::Duration::seconds(market_open_secs as i64 + offset);
            calc.record_event(symbol.clone(), EventKind::Trades, ts);
        }

        let score = calc
            .calculate_score(&symbol, EventKind::Trades, date)
            .unwrap();
        assert_eq!(score.expected_events, 3_250);
        assert!((score.event_score - 1.0).abs() < 0.01);
        assert!(
            score.score > 0.55 && score.score < 0.75,
            "score {} should land near 0.65 for the trickle scenario",
            score.score
        );
        assert_eq!(score.grade, CompletenessGrade::D);
    }

    #[test]
    fn test_zero_expected_events_edge_case() {
        let mut config = CompletenessConfig::default();
        config.default_expected_events_per_hour = 0;
        let calc = CompletenessCalculator::new(config);
        let symbol = Symbol::from("QUIET");
        let date = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();

        calc.record_event(symbol.clone(), EventKind::Trades, on(date, 14, 0, 0));
        let score = calc
            .calculate_score(&symbol, EventKind::Trades, date)
            .unwrap();
        assert_eq!(score.expected_events, 0);
        assert_eq!(score.event_score, 1.0);
    }

    #[test]
    fn test_full_coverage_and_volume_grades_a() {
        let calc = CompletenessCalculator::new(CompletenessConfig::default());
        let symbol = Symbol::from("AAPL");
        let date = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();

        // One event per minute across the full session plus plenty of
        // volume: full minute coverage, event_score saturates at 1.0.
        for minute in 0..390 {
            let ts = on(date, 13, 30, 0) + chrono::Duration::minutes(minute);
            for _ in 0..20 {
                calc.record_event(symbol.clone(), EventKind::Trades, ts);
            }
        }

        let score = calc
            .calculate_score(&symbol, EventKind::Trades, date)
            .unwrap();
        assert_eq!(score.event_score, 1.0);
        assert_eq!(score.coverage_score, 1.0);
        assert_eq!(score.grade, CompletenessGrade::A);
    }

    #[test]
    fn test_per_symbol_override_changes_expected_events() {
        let calc = CompletenessCalculator::new(CompletenessConfig::default());
        let symbol = Symbol::from("MICROCAP");
        calc.set_expected_events_per_hour(symbol.clone(), 10);
        let date = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        calc.record_event(symbol.clone(), EventKind::Trades, on(date, 14, 0, 0));

        let score = calc
            .calculate_score(&symbol, EventKind::Trades, date)
            .unwrap();
        assert_eq!(score.expected_events, 65);
    }

    #[test]
    fn test_no_data_returns_none() {
        let calc = CompletenessCalculator::new(CompletenessConfig::default());
        let symbol = Symbol::from("NODATA");
        let date = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        assert!(calc
            .calculate_score(&symbol, EventKind::Trades, date)
            .is_none());
    }
}
