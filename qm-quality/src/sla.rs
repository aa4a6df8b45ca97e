use chrono::Datelike;
use parking_lot::Mutex;
use qm_instrument::{Instant, Symbol};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlaState {
    NoData,
    Healthy,
    Warning,
    Violation,
    OutsideMarketHours,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaViolationEvent {
    pub symbol: Symbol,
    pub timestamp: Instant,
    pub age_seconds: u64,
    pub threshold_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaRecoveryEvent {
    pub symbol: Symbol,
    pub timestamp: Instant,
    pub violation_duration_seconds: u64,
}

/// Bitmask of weekdays, bit 0 = Monday .. bit 6 = Sunday.
pub const MARKET_WEEKDAYS_MON_FRI: u8 = 0b001_1111;

#[derive(Clone, Copy)]
pub struct SlaConfig {
    pub default_freshness_threshold_seconds: u64,
    pub critical_freshness_threshold_seconds: u64,
    pub check_interval_seconds: u64,
    pub skip_outside_market_hours: bool,
    pub market_open_utc: chrono::NaiveTime,
    pub market_close_utc: chrono::NaiveTime,
    /// Weekday mask `isMarketOpen` ANDs into the time-of-day window
    /// (spec.md §4.H "configured UTC open/close and weekday mask") -
    /// bit 0 = Monday .. bit 6 = Sunday.
    pub market_weekdays: u8,
    pub alert_cooldown_seconds: u64,
}

impl Default for SlaConfig {
    fn default() -> Self {
        Self {
            default_freshness_threshold_seconds: 60,
            critical_freshness_threshold_seconds: 300,
            check_interval_seconds: 10,
            skip_outside_market_hours: true,
            market_open_utc: chrono::NaiveTime::from_hms_opt(13, 30, 0).unwrap(),
            market_close_utc: chrono::NaiveTime::from_hms_opt(20, 0, 0).unwrap(),
            market_weekdays: MARKET_WEEKDAYS_MON_FRI,
            alert_cooldown_seconds: 300,
        }
    }
}

struct SymbolSla {
    last_event: Option<Instant>,
    state: SlaState,
    violation_count: u64,
    violation_started: Option<Instant>,
    last_alert: Option<Instant>,
}

impl SymbolSla {
    fn new() -> Self {
        Self {
            last_event: None,
            state: SlaState::NoData,
            violation_count: 0,
            violation_started: None,
            last_alert: None,
        }
    }
}

/// Per-symbol freshness SLA evaluated on a periodic tick (component H).
pub struct SlaMonitor {
    config: SlaConfig,
    symbols: Mutex<HashMap<Symbol, SymbolSla>>,
    thresholds: Mutex<HashMap<Symbol, u64>>,
    violation_listener: Mutex<Option<Box<dyn Fn(&SlaViolationEvent) + Send + Sync>>>,
    recovery_listener: Mutex<Option<Box<dyn Fn(&SlaRecoveryEvent) + Send + Sync>>>,
}

impl SlaMonitor {
    pub fn new(config: SlaConfig) -> Self {
        Self {
            config,
            symbols: Mutex::new(HashMap::new()),
            thresholds: Mutex::new(HashMap::new()),
            violation_listener: Mutex::new(None),
            recovery_listener: Mutex::new(None),
        }
    }

    pub fn on_violation<F>(&self, listener: F)
    where
        F: Fn(&SlaViolationEvent) + Send + Sync + 'static,
    {
        *self.violation_listener.lock() = Some(Box::new(listener));
    }

    pub fn on_recovery<F>(&self, listener: F)
    where
        F: Fn(&SlaRecoveryEvent) + Send + Sync + 'static,
    {
        *self.recovery_listener.lock() = Some(Box::new(listener));
    }

    /// Explicit per-symbol threshold, overriding the liquidity-derived and
    /// global defaults (spec.md §4.H "Threshold resolution ... explicit
    /// override > liquidity-derived threshold > global default").
    pub fn set_threshold_override(&self, symbol: Symbol, threshold_seconds: u64) {
        self.thresholds.lock().insert(symbol, threshold_seconds);
    }

    fn resolve_threshold(&self, symbol: &Symbol, liquidity_threshold: Option<u64>) -> u64 {
        if let Some(explicit) = self.thresholds.lock().get(symbol) {
            return *explicit;
        }
        liquidity_threshold.unwrap_or(self.config.default_freshness_threshold_seconds)
    }

    pub fn record_event(&self, symbol: Symbol, timestamp: Instant) {
        let mut symbols = self.symbols.lock();
        let entry = symbols.entry(symbol.clone()).or_insert_with(SymbolSla::new);
        entry.last_event = Some(timestamp);

        if entry.state == SlaState::Violation {
            let duration = entry
                .violation_started
                .map(|start| (timestamp - start).num_seconds().max(0) as u64)
                .unwrap_or(0);
            entry.state = SlaState::Healthy;
            entry.violation_started = None;
            drop(symbols);

            let event = SlaRecoveryEvent {
                symbol,
                timestamp,
                violation_duration_seconds: duration,
            };
            if let Some(listener) = self.recovery_listener.lock().as_ref() {
                qm_integration::notify_listener("sla_recovery", || listener(&event));
            }
        } else {
            entry.state = SlaState::Healthy;
        }
    }

    fn is_market_open(&self, now: Instant) -> bool {
        let weekday_bit = 1u8 << now.weekday().num_days_from_monday();
        if self.config.market_weekdays & weekday_bit == 0 {
            return false;
        }

        let time = now.time();
        if self.config.market_open_utc <= self.config.market_close_utc {
            time >= self.config.market_open_utc && time < self.config.market_close_utc
        } else {
            time >= self.config.market_open_utc || time < self.config.market_close_utc
        }
    }

    /// Runs one SLA evaluation pass over every tracked symbol at the
    /// configured tick (spec.md §4.H).
    pub fn check(&self, now: Instant, liquidity_threshold: impl Fn(&Symbol) -> Option<u64>) {
        let market_open = self.is_market_open(now);
        if self.config.skip_outside_market_hours && !market_open {
            return;
        }

        let mut violations = Vec::new();
        {
            let mut symbols = self.symbols.lock();
            for (symbol, entry) in symbols.iter_mut() {
                let Some(last_event) = entry.last_event else {
                    continue;
                };
                let age = (now - last_event).num_seconds().max(0) as u64;
                let threshold = self.resolve_threshold(symbol, liquidity_threshold(symbol));

                let desired = if age > threshold {
                    SlaState::Violation
                } else if (age as f64) > 0.7 * threshold as f64 {
                    SlaState::Warning
                } else if !market_open {
                    SlaState::OutsideMarketHours
                } else {
                    SlaState::Healthy
                };

                if entry.state == SlaState::Healthy && desired == SlaState::Violation {
                    let cooldown_elapsed = entry
                        .last_alert
                        .map(|last| (now - last).num_seconds().max(0) as u64)
                        .unwrap_or(u64::MAX);
                    if cooldown_elapsed >= self.config.alert_cooldown_seconds {
                        entry.last_alert = Some(now);
                        entry.violation_count += 1;
                        entry.violation_started = Some(now);
                        violations.push((symbol.clone(), age, threshold));
                    }
                }
                entry.state = desired;
            }
        }

        for (symbol, age, threshold) in violations {
            let event = SlaViolationEvent {
                symbol,
                timestamp: now,
                age_seconds: age,
                threshold_seconds: threshold,
            };
            if let Some(listener) = self.violation_listener.lock().as_ref() {
                qm_integration::notify_listener("sla_violation", || listener(&event));
            }
        }
    }

    pub fn state_of(&self, symbol: &Symbol) -> Option<SlaState> {
        self.symbols.lock().get(symbol).map(|s| s.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn ts(hh: u32, mm: u32, ss: u32) -> Instant {
        Utc.with_ymd_and_hms(2024, 3, 4, hh, mm, ss).unwrap()
    }

    #[test]
    fn test_violation_then_recovery() {
        let monitor = SlaMonitor::new(SlaConfig {
            default_freshness_threshold_seconds: 60,
            alert_cooldown_seconds: 0,
            ..SlaConfig::default()
        });
        let symbol = Symbol::from("AAPL");
        let violations = Arc::new(AtomicUsize::new(0));
        let recoveries = Arc::new(AtomicUsize::new(0));
        let v2 = violations.clone();
        let r2 = recoveries.clone();
        monitor.on_violation(move |_| {
            v2.fetch_add(1, Ordering::SeqCst);
        });
        monitor.on_recovery(move |_| {
            r2.fetch_add(1, Ordering::SeqCst);
        });

        monitor.record_event(symbol.clone(), ts(14, 0, 0));
        monitor.check(ts(14, 0, 5), |_| None);
        assert_eq!(monitor.state_of(&symbol), Some(SlaState::Healthy));

        monitor.check(ts(14, 1, 30), |_| None);
        assert_eq!(monitor.state_of(&symbol), Some(SlaState::Violation));
        assert_eq!(violations.load(Ordering::SeqCst), 1);

        monitor.record_event(symbol.clone(), ts(14, 1, 35));
        assert_eq!(monitor.state_of(&symbol), Some(SlaState::Healthy));
        assert_eq!(recoveries.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_explicit_override_wins() {
        let monitor = SlaMonitor::new(SlaConfig::default());
        let symbol = Symbol::from("THIN");
        monitor.set_threshold_override(symbol.clone(), 3600);
        monitor.record_event(symbol.clone(), ts(14, 0, 0));
        monitor.check(ts(14, 2, 0), |_| Some(10));
        assert_eq!(monitor.state_of(&symbol), Some(SlaState::Healthy));
    }

    #[test]
    fn test_weekend_inside_time_window_is_not_market_open() {
        let monitor = SlaMonitor::new(SlaConfig {
            default_freshness_threshold_seconds: 60,
            alert_cooldown_seconds: 0,
            skip_outside_market_hours: false,
            ..SlaConfig::default()
        });
        let symbol = Symbol::from("AAPL");
        // 2024-03-02 is a Saturday; 14:00 UTC sits inside the 13:30-20:00
        // time-of-day window, but the weekday mask excludes Saturday, so a
        // fresh event must still evaluate as outside market hours.
        let saturday_early_afternoon = Utc.with_ymd_and_hms(2024, 3, 2, 14, 0, 0).unwrap();
        monitor.record_event(symbol.clone(), saturday_early_afternoon);
        monitor.check(saturday_early_afternoon, |_| None);
        assert_eq!(monitor.state_of(&symbol), Some(SlaState::OutsideMarketHours));
    }

    #[test]
    fn test_skip_outside_market_hours() {
        let monitor = SlaMonitor::new(SlaConfig::default());
        let symbol = Symbol::from("AAPL");
        monitor.record_event(symbol.clone(), ts(2, 0, 0));
        // 03:00 UTC is outside the default 13:30-20:00 window.
        monitor.check(ts(3, 0, 0), |_| None);
        assert_eq!(monitor.state_of(&symbol), Some(SlaState::Healthy));
    }
}
