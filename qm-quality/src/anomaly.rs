use crate::liquidity::LiquidityProfile;
use parking_lot::Mutex;
use qm_instrument::{liquidity, Instant, Provider, SessionDate, Symbol};
use qm_integration::rate_limit::DailySequence;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// Wraps [`DailySequence`] with the per-day reset it needs to produce a
/// `NNNNNN` counter that restarts at midnight rather than growing across
/// the process lifetime.
#[derive(Default)]
struct DailyIds {
    sequence: DailySequence,
    current_date: Mutex<Option<SessionDate>>,
}

impl DailyIds {
    fn next(&self, date: SessionDate) -> u64 {
        let mut current = self.current_date.lock();
        if *current != Some(date) {
            self.sequence.reset();
            *current = Some(date);
        }
        self.sequence.next()
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalySeverity {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    PriceSpike,
    PriceDrop,
    RapidPriceChange,
    VolumeSpike,
    VolumeDrop,
    CrossedMarket,
    SpreadWide,
    StaleData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataAnomaly {
    pub id: String,
    pub timestamp: Instant,
    pub symbol: Symbol,
    pub anomaly_type: AnomalyType,
    pub severity: AnomalySeverity,
    pub description: String,
    pub expected: Option<f64>,
    pub actual: Option<f64>,
    pub deviation_percent: Option<f64>,
    pub z_score: Option<f64>,
    pub acknowledged: bool,
}

#[derive(Clone, Copy)]
pub struct AnomalyConfig {
    pub price_spike_threshold_percent: f64,
    pub volume_spike_threshold_multiplier: f64,
    pub volume_drop_threshold_multiplier: f64,
    pub spread_threshold_percent: f64,
    pub stale_data_threshold_seconds: u64,
    pub rapid_change_threshold_percent: f64,
    pub rapid_change_window_seconds: u64,
    pub z_score_threshold: f64,
    pub min_samples_for_statistics: usize,
    pub price_anomaly_enabled: bool,
    pub volume_anomaly_enabled: bool,
    pub spread_anomaly_enabled: bool,
    pub stale_data_enabled: bool,
    pub alert_cooldown_seconds: u64,
    pub max_anomalies_per_symbol: usize,
    pub retention_days: i64,
    pub cooldown_retention_seconds: u64,
    pub rolling_window_size: usize,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            price_spike_threshold_percent: 5.0,
            volume_spike_threshold_multiplier: 10.0,
            volume_drop_threshold_multiplier: 0.3,
            spread_threshold_percent: 2.0,
            stale_data_threshold_seconds: 60,
            rapid_change_threshold_percent: 1.0,
            rapid_change_window_seconds: 5,
            z_score_threshold: 3.0,
            min_samples_for_statistics: 100,
            price_anomaly_enabled: true,
            volume_anomaly_enabled: true,
            spread_anomaly_enabled: true,
            stale_data_enabled: true,
            alert_cooldown_seconds: 60,
            max_anomalies_per_symbol: 1000,
            retention_days: 7,
            cooldown_retention_seconds: 3600,
            rolling_window_size: 1000,
        }
    }
}

/// A bounded rolling sample set maintaining running sum/sum-of-squares so
/// mean and stdev are O(1) to query and O(1) to update on both push and
/// eviction (spec.md §4.F "Welford-compatible running sum and sum-of-squares
/// maintained incrementally on enqueue/evict"). This trades the classic
/// Welford-M recurrence for sum/sum-sq totals because the window must
/// support removal on eviction, which the M-based recurrence does not.
struct RollingStats {
    samples: VecDeque<f64>,
    sum: f64,
    sum_sq: f64,
    capacity: usize,
}

impl RollingStats {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            sum: 0.0,
            sum_sq: 0.0,
            capacity,
        }
    }

    fn push(&mut self, value: f64) {
        self.samples.push_back(value);
        self.sum += value;
        self.sum_sq += value * value;
        while self.samples.len() > self.capacity {
            if let Some(evicted) = self.samples.pop_front() {
                self.sum -= evicted;
                self.sum_sq -= evicted * evicted;
            }
        }
    }

    fn count(&self) -> usize {
        self.samples.len()
    }

    fn mean(&self) -> f64 {
        self.sum / self.samples.len() as f64
    }

    fn stdev(&self) -> f64 {
        let n = self.samples.len() as f64;
        if n < 2.0 {
            return 0.0;
        }
        let mean = self.mean();
        let variance = ((self.sum_sq / n) - mean * mean).max(0.0);
        variance.sqrt()
    }
}

struct SymbolState {
    price_stats: RollingStats,
    volume_stats: RollingStats,
    last_price: Option<(f64, Instant)>,
    last_event_time: Option<Instant>,
    is_stale: bool,
}

impl SymbolState {
    fn new(capacity: usize) -> Self {
        Self {
            price_stats: RollingStats::new(capacity),
            volume_stats: RollingStats::new(capacity),
            last_price: None,
            last_event_time: None,
            is_stale: false,
        }
    }
}

/// Rolling statistical anomaly detector for trades and quotes (component F).
pub struct AnomalyDetector {
    config: AnomalyConfig,
    symbols: Mutex<HashMap<Symbol, SymbolState>>,
    anomalies: Mutex<HashMap<Symbol, VecDeque<DataAnomaly>>>,
    cooldowns: Mutex<HashMap<(Symbol, AnomalyType), Instant>>,
    ids: DailyIds,
    global_count: std::sync::atomic::AtomicU64,
    listener: Mutex<Option<Box<dyn Fn(&DataAnomaly) + Send + Sync>>>,
}

impl AnomalyDetector {
    pub fn new(config: AnomalyConfig) -> Self {
        Self {
            config,
            symbols: Mutex::new(HashMap::new()),
            anomalies: Mutex::new(HashMap::new()),
            cooldowns: Mutex::new(HashMap::new()),
            ids: DailyIds::default(),
            global_count: std::sync::atomic::AtomicU64::new(0),
            listener: Mutex::new(None),
        }
    }

    pub fn on_anomaly<F>(&self, listener: F)
    where
        F: Fn(&DataAnomaly) + Send + Sync + 'static,
    {
        *self.listener.lock() = Some(Box::new(listener));
    }

    pub fn process_trade(
        &self,
        symbol: Symbol,
        ts: Instant,
        price: Decimal,
        volume: u64,
        _provider: Option<Provider>,
    ) {
        if price <= Decimal::ZERO {
            return;
        }
        let price_f = price.to_f64().unwrap_or(0.0);

        let mut symbols = self.symbols.lock();
        let state = symbols
            .entry(symbol.clone())
            .or_insert_with(|| SymbolState::new(self.config.rolling_window_size));
        state.last_event_time = Some(ts);
        state.is_stale = false;

        let eligible = state.price_stats.count() >= self.config.min_samples_for_statistics;
        if eligible && self.config.price_anomaly_enabled {
            let mean = state.price_stats.mean();
            let stdev = state.price_stats.stdev();
            let z = if stdev > 0.0 {
                (price_f - mean) / stdev
            } else {
                0.0
            };
            let dev_pct = if mean != 0.0 {
                ((price_f - mean).abs() / mean) * 100.0
            } else {
                0.0
            };

            if z.abs() > self.config.z_score_threshold
                || dev_pct > self.config.price_spike_threshold_percent
            {
                let severity = if dev_pct > 2.0 * self.config.price_spike_threshold_percent {
                    AnomalySeverity::Critical
                } else if dev_pct > self.config.price_spike_threshold_percent {
                    AnomalySeverity::Error
                } else {
                    AnomalySeverity::Warning
                };
                let anomaly_type = if price_f > mean {
                    AnomalyType::PriceSpike
                } else {
                    AnomalyType::PriceDrop
                };
                self.emit(
                    symbol.clone(),
                    ts,
                    anomaly_type,
                    severity,
                    format!(
                        "price {price_f:.4} deviates {dev_pct:.2}% from rolling mean {mean:.4}"
                    ),
                    Some(mean),
                    Some(price_f),
                    Some(dev_pct),
                    Some(z),
                );
            }
        }

        if let Some((last_price, last_ts)) = state.last_price {
            let elapsed = (ts - last_ts).num_seconds().unsigned_abs();
            if elapsed <= self.config.rapid_change_window_seconds && last_price != 0.0 {
                let delta_pct = ((price_f - last_price).abs() / last_price) * 100.0;
                if delta_pct > self.config.rapid_change_threshold_percent {
                    self.emit(
                        symbol.clone(),
                        ts,
                        AnomalyType::RapidPriceChange,
                        AnomalySeverity::Warning,
                        format!(
                            "price moved {delta_pct:.2}% within {elapsed}s (window {}s)",
                            self.config.rapid_change_window_seconds
                        ),
                        Some(last_price),
                        Some(price_f),
                        Some(delta_pct),
                        None,
                    );
                }
            }
        }
        state.last_price = Some((price_f, ts));

        if self.config.volume_anomaly_enabled
            && volume > 0
            && state.volume_stats.count() >= self.config.min_samples_for_statistics
        {
            let mean_volume = state.volume_stats.mean();
            if mean_volume > 0.0 {
                let mult = volume as f64 / mean_volume;
                if mult > self.config.volume_spike_threshold_multiplier {
                    let severity = if mult > 2.0 * self.config.volume_spike_threshold_multiplier {
                        AnomalySeverity::Error
                    } else {
                        AnomalySeverity::Warning
                    };
                    self.emit(
                        symbol.clone(),
                        ts,
                        AnomalyType::VolumeSpike,
                        severity,
                        format!("volume {volume} is {mult:.2}x the rolling mean {mean_volume:.2}"),
                        Some(mean_volume),
                        Some(volume as f64),
                        None,
                        None,
                    );
                } else if mult < self.config.volume_drop_threshold_multiplier {
                    let severity = if mult < self.config.volume_drop_threshold_multiplier / 2.0 {
                        AnomalySeverity::Error
                    } else {
                        AnomalySeverity::Warning
                    };
                    self.emit(
                        symbol.clone(),
                        ts,
                        AnomalyType::VolumeDrop,
                        severity,
                        format!("volume {volume} is {mult:.2}x the rolling mean {mean_volume:.2}"),
                        Some(mean_volume),
                        Some(volume as f64),
                        None,
                        None,
                    );
                }
            }
        }

        state.price_stats.push(price_f);
        state.volume_stats.push(volume as f64);
    }

    pub fn process_quote(
        &self,
        symbol: Symbol,
        ts: Instant,
        bid: Decimal,
        ask: Decimal,
        _provider: Option<Provider>,
    ) {
        let bid_f = bid.to_f64().unwrap_or(0.0);
        let ask_f = ask.to_f64().unwrap_or(0.0);

        let mut symbols = self.symbols.lock();
        let state = symbols
            .entry(symbol.clone())
            .or_insert_with(|| SymbolState::new(self.config.rolling_window_size));
        state.last_event_time = Some(ts);
        state.is_stale = false;

        if bid > ask {
            self.emit(
                symbol.clone(),
                ts,
                AnomalyType::CrossedMarket,
                AnomalySeverity::Error,
                format!("bid {bid_f:.4} exceeds ask {ask_f:.4}"),
                Some(ask_f),
                Some(bid_f),
                None,
                None,
            );
            return;
        }

        let mid = (bid_f + ask_f) / 2.0;
        let eligible = state.price_stats.count() >= self.config.min_samples_for_statistics;
        if self.config.spread_anomaly_enabled && eligible && mid != 0.0 {
            let spread_pct = ((ask_f - bid_f) / mid) * 100.0;
            if spread_pct > self.config.spread_threshold_percent {
                self.emit(
                    symbol.clone(),
                    ts,
                    AnomalyType::SpreadWide,
                    AnomalySeverity::Warning,
                    format!("spread {spread_pct:.2}% exceeds threshold"),
                    None,
                    Some(spread_pct),
                    None,
                    None,
                );
            }
        }

        state.price_stats.push(mid);
    }

    /// Independent 10-second cadence (spec.md §4.F): scan per-symbol last
    /// event time and flag newly-silent symbols as `StaleData`.
    pub fn check_stale_data(&self, now: Instant, profile_of: impl Fn(&Symbol) -> LiquidityProfile) {
        if !self.config.stale_data_enabled {
            return;
        }
        let mut stale_hits = Vec::new();
        {
            let mut symbols = self.symbols.lock();
            for (symbol, state) in symbols.iter_mut() {
                let Some(last) = state.last_event_time else {
                    continue;
                };
                if state.is_stale {
                    continue;
                }
                let elapsed = (now - last).num_seconds().max(0) as u64;
                let threshold = liquidity::thresholds(profile_of(symbol)).stale_data_threshold_seconds;
                let threshold = threshold.max(self.config.stale_data_threshold_seconds);
                if elapsed > threshold {
                    state.is_stale = true;
                    stale_hits.push((symbol.clone(), elapsed, threshold));
                }
            }
        }
        for (symbol, elapsed, threshold) in stale_hits {
            self.emit(
                symbol,
                now,
                AnomalyType::StaleData,
                AnomalySeverity::Warning,
                format!("no events received in {elapsed}s (threshold {threshold}s)"),
                Some(threshold as f64),
                Some(elapsed as f64),
                None,
                None,
            );
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn emit(
        &self,
        symbol: Symbol,
        ts: Instant,
        anomaly_type: AnomalyType,
        severity: AnomalySeverity,
        description: String,
        expected: Option<f64>,
        actual: Option<f64>,
        deviation_percent: Option<f64>,
        z_score: Option<f64>,
    ) {
        {
            let mut cooldowns = self.cooldowns.lock();
            let key = (symbol.clone(), anomaly_type);
            if let Some(last) = cooldowns.get(&key) {
                let elapsed = (ts - *last).num_seconds();
                if elapsed >= 0 && (elapsed as u64) < self.config.alert_cooldown_seconds {
                    return;
                }
            }
            cooldowns.insert(key, ts);
        }

        let id = format!(
            "ANM-{}-{:06}",
            ts.format("%Y%m%d"),
            self.ids.next(ts.date_naive())
        );
        let anomaly = DataAnomaly {
            id,
            timestamp: ts,
            symbol: symbol.clone(),
            anomaly_type,
            severity,
            description,
            expected,
            actual,
            deviation_percent,
            z_score,
            acknowledged: false,
        };

        {
            let mut anomalies = self.anomalies.lock();
            let list = anomalies.entry(symbol).or_default();
            list.push_back(anomaly.clone());
            while list.len() > self.config.max_anomalies_per_symbol {
                list.pop_front();
            }
        }
        self.global_count
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        if let Some(listener) = self.listener.lock().as_ref() {
            qm_integration::notify_listener("anomaly_detected", || listener(&anomaly));
        }
    }

    pub fn anomalies_for(&self, symbol: &Symbol) -> Vec<DataAnomaly> {
        self.anomalies
            .lock()
            .get(symbol)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn global_count(&self) -> u64 {
        self.global_count.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Drops anomalies older than `retention_days` and cooldown entries
    /// older than `cooldown_retention_seconds` (spec.md §4.F periodic
    /// cleanup).
    pub fn cleanup(&self, now: Instant) {
        let cutoff = now - chrono::Duration::days(self.config.retention_days);
        let mut anomalies = self.anomalies.lock();
        for list in anomalies.values_mut() {
            list.retain(|a| a.timestamp >= cutoff);
        }
        anomalies.retain(|_, list| !list.is_empty());

        let cooldown_cutoff_secs = self.config.cooldown_retention_seconds as i64;
        let mut cooldowns = self.cooldowns.lock();
        cooldowns.retain(|_, last| (now - *last).num_seconds() < cooldown_cutoff_secs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn ts(offset_secs: i64) -> Instant {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(offset_secs)
    }

    fn warm_up(detector: &AnomalyDetector, symbol: &Symbol, n: usize) {
        for i in 0..n {
            detector.process_trade(
                symbol.clone(),
                ts(i as i64),
                dec!(100.00),
                1_000,
                None,
            );
        }
    }

    #[test]
    fn test_min_samples_boundary() {
        let mut config = AnomalyConfig::default();
        config.min_samples_for_statistics = 100;
        let detector = AnomalyDetector::new(config);
        let symbol = Symbol::from("AAPL");

        warm_up(&detector, &symbol, 99);
        detector.process_trade(symbol.clone(), ts(200), dec!(200.00), 1_000, None);
        assert!(detector.anomalies_for(&symbol).is_empty());

        warm_up(&detector, &symbol, 1);
        detector.process_trade(symbol.clone(), ts(300), dec!(200.00), 1_000, None);
        assert!(!detector.anomalies_for(&symbol).is_empty());
    }

    #[test]
    fn test_price_spike_severity_escalation() {
        let detector = AnomalyDetector::new(AnomalyConfig::default());
        let symbol = Symbol::from("AAPL");
        warm_up(&detector, &symbol, 100);

        // devPct = 12% > 2x threshold(5%) -> Critical.
        detector.process_trade(symbol.clone(), ts(500), dec!(112.00), 1_000, None);
        let anomalies = detector.anomalies_for(&symbol);
        let spike = anomalies
            .iter()
            .find(|a| a.anomaly_type == AnomalyType::PriceSpike)
            .unwrap();
        assert_eq!(spike.severity, AnomalySeverity::Critical);
    }

    #[test]
    fn test_crossed_market_detected() {
        let detector = AnomalyDetector::new(AnomalyConfig::default());
        let symbol = Symbol::from("AAPL");
        detector.process_quote(symbol.clone(), ts(0), dec!(101), dec!(100), None);
        let anomalies = detector.anomalies_for(&symbol);
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].anomaly_type, AnomalyType::CrossedMarket);
        assert_eq!(anomalies[0].severity, AnomalySeverity::Error);
    }

    #[test]
    fn test_cooldown_suppresses_repeat_alerts() {
        let detector = AnomalyDetector::new(AnomalyConfig::default());
        let symbol = Symbol::from("AAPL");
        detector.process_quote(symbol.clone(), ts(0), dec!(101), dec!(100), None);
        detector.process_quote(symbol.clone(), ts(5), dec!(101), dec!(100), None);
        assert_eq!(detector.anomalies_for(&symbol).len(), 1);

        detector.process_quote(symbol.clone(), ts(61), dec!(101), dec!(100), None);
        assert_eq!(detector.anomalies_for(&symbol).len(), 2);
    }

    #[test]
    fn test_stale_data_marks_and_clears() {
        let detector = AnomalyDetector::new(AnomalyConfig::default());
        let symbol = Symbol::from("AAPL");
        detector.process_trade(symbol.clone(), ts(0), dec!(100), 1_000, None);

        detector.check_stale_data(ts(120), |_| LiquidityProfile::High);
        assert_eq!(detector.anomalies_for(&symbol).len(), 1);
        assert_eq!(
            detector.anomalies_for(&symbol)[0].anomaly_type,
            AnomalyType::StaleData
        );

        // A fresh event clears the stale flag; a second scan at the same
        // elapsed threshold should not double-fire immediately after.
        detector.process_trade(symbol.clone(), ts(125), dec!(100), 1_000, None);
        detector.check_stale_data(ts(130), |_| LiquidityProfile::High);
        assert_eq!(detector.anomalies_for(&symbol).len(), 1);
    }
}
