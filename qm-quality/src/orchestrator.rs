use crate::anomaly::{AnomalyConfig, AnomalyDetector, AnomalySeverity};
use crate::completeness::{CompletenessCalculator, CompletenessConfig};
use crate::gap::{GapAnalyzer, GapConfig};
use crate::health::{HealthMap, SymbolHealth, SymbolHealthState};
use crate::latency::{LatencyHistogram, LatencyStatistics};
use crate::report::{DailyQualityReport, ReportGenerator, ReportOptions, WeeklyQualityReport};
use crate::sequence::{SequenceConfig, SequenceErrorTracker, SequenceErrorType};
use crate::sla::{SlaConfig, SlaMonitor, SlaState};
use crate::types::{AggregateBar, EventKind, QuoteEvent, TradeEvent};
use parking_lot::Mutex;
use qm_instrument::{thresholds, Instant, LiquidityProfile, SessionDate, Symbol};
use qm_integration::MetricsSink;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

#[derive(Clone, Copy)]
pub struct QualityOrchestratorConfig {
    pub gap: GapConfig,
    pub sequence: SequenceConfig,
    pub completeness: CompletenessConfig,
    pub anomaly: AnomalyConfig,
    pub sla: SlaConfig,
}

impl Default for QualityOrchestratorConfig {
    fn default() -> Self {
        Self {
            gap: GapConfig::default(),
            sequence: SequenceConfig::default(),
            completeness: CompletenessConfig::default(),
            anomaly: AnomalyConfig::default(),
            sla: SlaConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RealTimeQualityMetrics {
    pub active_symbols: usize,
    pub overall_health_score: f64,
    pub events_per_second: f64,
    pub gaps_last_5_minutes: usize,
    pub sequence_errors_last_5_minutes: usize,
    pub anomalies_last_5_minutes: usize,
    pub average_latency_ms: f64,
    pub symbols_with_issues: usize,
    pub top_symbols: Vec<SymbolHealth>,
}

const FIVE_MINUTES_SECONDS: i64 = 300;

/// Rolling event-timestamp window used for the "last 5 minutes" counters in
/// [`RealTimeQualityMetrics`] (spec.md §4.J `getRealTimeMetrics`).
#[derive(Default)]
struct RollingWindow {
    events: Mutex<VecDeque<Instant>>,
}

impl RollingWindow {
    fn record(&self, now: Instant) {
        self.events.lock().push_back(now);
    }

    fn count_since(&self, now: Instant) -> usize {
        let mut events = self.events.lock();
        while let Some(front) = events.front() {
            if (now - *front).num_seconds() > FIVE_MINUTES_SECONDS {
                events.pop_front();
            } else {
                break;
            }
        }
        events.len()
    }
}

/// Single fan-in entrypoint for ingested market data events (component J).
/// Owns the detector instances (C-H) and the per-symbol health map, and
/// forwards every trade/quote to each detector before reconciling health
/// state (spec.md §4.J).
pub struct QualityOrchestrator {
    pub gaps: GapAnalyzer,
    pub sequence: SequenceErrorTracker,
    pub completeness: CompletenessCalculator,
    pub anomalies: AnomalyDetector,
    pub latency: LatencyHistogram,
    pub sla: SlaMonitor,
    pub health: Arc<HealthMap>,
    liquidity: Mutex<HashMap<Symbol, LiquidityProfile>>,
    metrics_sink: Mutex<Option<Arc<dyn MetricsSink>>>,
    gap_window: Arc<RollingWindow>,
    error_window: Arc<RollingWindow>,
    anomaly_window: Arc<RollingWindow>,
    metrics_listener: Mutex<Option<Box<dyn Fn(&RealTimeQualityMetrics) + Send + Sync>>>,
}

impl QualityOrchestrator {
    pub fn new(config: QualityOrchestratorConfig) -> Arc<Self> {
        let health = Arc::new(HealthMap::new());
        let gap_window = Arc::new(RollingWindow::default());
        let anomaly_window = Arc::new(RollingWindow::default());

        let orchestrator = Arc::new(Self {
            gaps: GapAnalyzer::new(config.gap),
            sequence: SequenceErrorTracker::new(config.sequence),
            completeness: CompletenessCalculator::new(config.completeness),
            anomalies: AnomalyDetector::new(config.anomaly),
            latency: LatencyHistogram::new(),
            sla: SlaMonitor::new(config.sla),
            health: Arc::clone(&health),
            liquidity: Mutex::new(HashMap::new()),
            metrics_sink: Mutex::new(None),
            gap_window: Arc::clone(&gap_window),
            error_window: Arc::new(RollingWindow::default()),
            anomaly_window: Arc::clone(&anomaly_window),
            metrics_listener: Mutex::new(None),
        });

        {
            let health = Arc::clone(&health);
            orchestrator.gaps.on_gap_detected(move |gap| {
                health.update_health(
                    gap.symbol.clone(),
                    SymbolHealthState::Degraded,
                    Some(format!("Data gap: {:?} ({:.0}s)", gap.severity, gap.duration_seconds)),
                    gap.gap_end,
                );
                gap_window.record(gap.gap_end);
            });
        }

        {
            let health = Arc::clone(&health);
            orchestrator.anomalies.on_anomaly(move |anomaly| {
                anomaly_window.record(anomaly.timestamp);
                let state = match anomaly.severity {
                    AnomalySeverity::Critical | AnomalySeverity::Error => SymbolHealthState::Unhealthy,
                    AnomalySeverity::Warning => SymbolHealthState::Degraded,
                    AnomalySeverity::Info => return,
                };
                health.update_health(
                    anomaly.symbol.clone(),
                    state,
                    Some(anomaly.description.clone()),
                    anomaly.timestamp,
                );
            });
        }

        {
            let health = Arc::clone(&health);
            orchestrator.sla.on_violation(move |violation| {
                health.update_health(
                    violation.symbol.clone(),
                    SymbolHealthState::Unhealthy,
                    Some(format!(
                        "SLA violation: {}s stale (threshold {}s)",
                        violation.age_seconds, violation.threshold_seconds
                    )),
                    violation.timestamp,
                );
            });
        }

        {
            let health = Arc::clone(&health);
            orchestrator.sla.on_recovery(move |recovery| {
                health.update_health(
                    recovery.symbol.clone(),
                    SymbolHealthState::Healthy,
                    None,
                    recovery.timestamp,
                );
            });
        }

        orchestrator
    }

    pub fn on_metrics_updated<F>(&self, listener: F)
    where
        F: Fn(&RealTimeQualityMetrics) + Send + Sync + 'static,
    {
        *self.metrics_listener.lock() = Some(Box::new(listener));
    }

    /// Registers the external events/sec counter `getRealTimeMetrics` reads
    /// from (spec.md §6 `MetricsSink.eventsPerSecond()`). Unregistered,
    /// `events_per_second` reports `0.0` rather than a self-computed tally.
    pub fn set_metrics_sink(&self, sink: Arc<dyn MetricsSink>) {
        *self.metrics_sink.lock() = Some(sink);
    }

    /// Registers the liquidity classification used to derive gap/stale/SLA
    /// thresholds for `symbol` (spec.md §4.A). Unregistered symbols fall
    /// back to `High` (the most conservative table row). Also seeds the
    /// completeness calculator's per-symbol `expectedEventsPerHour` override
    /// from the same table (spec.md §4.E "optional per-symbol
    /// expectedEventsPerHour override derived from liquidity profile").
    pub fn register_symbol_liquidity(&self, symbol: Symbol, profile: LiquidityProfile) {
        self.completeness
            .set_expected_events_per_hour(symbol.clone(), thresholds(profile).expected_events_per_hour);
        self.liquidity.lock().insert(symbol, profile);
    }

    fn liquidity_of(&self, symbol: &Symbol) -> LiquidityProfile {
        self.liquidity
            .lock()
            .get(symbol)
            .copied()
            .unwrap_or(LiquidityProfile::High)
    }

    pub fn process_trade(&self, trade: TradeEvent) {
        let profile = self.liquidity_of(&trade.symbol);

        // A healthy heartbeat is recorded first so that any detector fired
        // below (via its listener, synchronously on this call stack) can
        // downgrade the state; nothing after this point re-raises it back
        // to Healthy (spec.md §4.J: "invoke each detector in sequence and
        // then call updateHealth").
        self.health.update_health(
            trade.symbol.clone(),
            SymbolHealthState::Healthy,
            None,
            trade.timestamp,
        );

        self.gaps.record_event(
            trade.symbol.clone(),
            EventKind::Trades,
            trade.timestamp,
            trade.sequence,
            profile,
        );

        if let Some(seq) = trade.sequence {
            if let Some(error) = self.sequence.check_sequence(
                trade.symbol.clone(),
                EventKind::Trades,
                seq,
                trade.timestamp,
                None,
                trade.provider,
            ) {
                self.error_window.record(trade.timestamp);
                self.health.update_health(
                    trade.symbol.clone(),
                    SymbolHealthState::Degraded,
                    Some(sequence_error_issue(error.error_type)),
                    trade.timestamp,
                );
            }
        }

        self.completeness
            .record_event(trade.symbol.clone(), EventKind::Trades, trade.timestamp);

        self.anomalies.process_trade(
            trade.symbol.clone(),
            trade.timestamp,
            trade.price,
            trade.volume,
            trade.provider,
        );

        if let Some(latency_ms) = trade.latency_ms {
            self.latency
                .record_latency(trade.symbol.clone(), latency_ms, trade.provider);
        }

        self.sla.record_event(trade.symbol.clone(), trade.timestamp);
    }

    pub fn process_quote(&self, quote: QuoteEvent) {
        let profile = self.liquidity_of(&quote.symbol);

        self.health.update_health(
            quote.symbol.clone(),
            SymbolHealthState::Healthy,
            None,
            quote.timestamp,
        );

        self.gaps.record_event(
            quote.symbol.clone(),
            EventKind::Quotes,
            quote.timestamp,
            None,
            profile,
        );

        self.completeness
            .record_event(quote.symbol.clone(), EventKind::Quotes, quote.timestamp);

        self.anomalies.process_quote(
            quote.symbol.clone(),
            quote.timestamp,
            quote.bid_price,
            quote.ask_price,
            quote.provider,
        );

        if let Some(latency_ms) = quote.latency_ms {
            self.latency
                .record_latency(quote.symbol.clone(), latency_ms, quote.provider);
        }

        self.sla.record_event(quote.symbol, quote.timestamp);
    }

    /// Fans an aggregate bar out to the gap and completeness detectors
    /// (spec.md §4.J data flow: "J fans out to C, D, E, F, G, H"). Bars have
    /// no sequence field suitable for the sequence tracker and are not fed
    /// to the price/volume anomaly detector, which is trade/quote scoped.
    pub fn process_aggregate(&self, bar: AggregateBar) {
        let profile = self.liquidity_of(&bar.symbol);

        self.health.update_health(
            bar.symbol.clone(),
            SymbolHealthState::Healthy,
            None,
            bar.end_time,
        );

        self.gaps.record_event(
            bar.symbol.clone(),
            EventKind::Aggregates,
            bar.end_time,
            Some(bar.sequence),
            profile,
        );

        self.completeness
            .record_event(bar.symbol.clone(), EventKind::Aggregates, bar.end_time);

        self.sla.record_event(bar.symbol, bar.end_time);
    }

    /// The 5-second ticker from spec.md §4.J: refreshes `timeSinceLastEvent`,
    /// promotes newly-silent symbols to `Stale`, runs the SLA sweep and the
    /// stale-data anomaly sweep, then emits a metrics snapshot.
    pub fn tick(&self, now: Instant) {
        self.health.refresh_time_since_last_event(now);

        for entry in self.health.snapshot() {
            if entry.state == SymbolHealthState::Stale {
                continue;
            }
            let profile = self.liquidity_of(&entry.symbol);
            let stale_threshold = thresholds(profile).stale_data_threshold_seconds;
            if entry.time_since_last_event_seconds > stale_threshold {
                self.health.mark_stale(&entry.symbol, now);
            }
        }

        self.sla.check(now, |symbol| {
            Some(thresholds(self.liquidity_of(symbol)).freshness_threshold_seconds)
        });

        self.anomalies
            .check_stale_data(now, |symbol| self.liquidity_of(symbol));

        let snapshot = self.get_real_time_metrics(now);
        if let Some(listener) = self.metrics_listener.lock().as_ref() {
            qm_integration::notify_listener("metrics_updated", || listener(&snapshot));
        }
    }

    pub fn get_real_time_metrics(&self, now: Instant) -> RealTimeQualityMetrics {
        let active_symbols = self.health.len();
        let overall_health_score = self.health.overall_health_score();

        // spec.md §4.J: "events/sec from an external counter" - read
        // through the injected MetricsSink rather than a self-computed
        // tally; unregistered reports 0.0.
        let events_per_second = self
            .metrics_sink
            .lock()
            .as_ref()
            .map(|sink| sink.events_per_second())
            .unwrap_or(0.0);

        let average_latency_ms = self.latency.global_statistics().mean_ms;
        let symbols_with_issues = self
            .health
            .snapshot()
            .iter()
            .filter(|h| !h.active_issues.is_empty())
            .count();

        RealTimeQualityMetrics {
            active_symbols,
            overall_health_score,
            events_per_second,
            gaps_last_5_minutes: self.gap_window.count_since(now),
            sequence_errors_last_5_minutes: self.error_window.count_since(now),
            anomalies_last_5_minutes: self.anomaly_window.count_since(now),
            average_latency_ms,
            symbols_with_issues,
            top_symbols: self.health.top_n(50),
        }
    }

    pub fn get_dashboard(&self) -> Vec<SymbolHealth> {
        self.health.top_n(50)
    }

    pub fn get_symbol_health(&self, symbol: &Symbol) -> Option<SymbolHealth> {
        self.health.get(symbol)
    }

    pub fn get_unhealthy_symbols(&self) -> Vec<SymbolHealth> {
        self.health.unhealthy()
    }

    pub fn latency_statistics(&self) -> LatencyStatistics {
        self.latency.global_statistics()
    }

    pub fn sla_state_of(&self, symbol: &Symbol) -> Option<SlaState> {
        self.sla.state_of(symbol)
    }

    pub fn generate_daily_report(
        &self,
        date: SessionDate,
        now: Instant,
        symbols: &[Symbol],
        options: ReportOptions,
    ) -> DailyQualityReport {
        ReportGenerator {
            completeness: &self.completeness,
            gaps: &self.gaps,
            sequence: &self.sequence,
            anomalies: &self.anomalies,
            latency: &self.latency,
        }
        .generate_daily_report(date, now, symbols, options)
    }

    pub fn generate_weekly_report(
        &self,
        week_start: SessionDate,
        now: Instant,
        symbols: &[Symbol],
        options: ReportOptions,
    ) -> WeeklyQualityReport {
        ReportGenerator {
            completeness: &self.completeness,
            gaps: &self.gaps,
            sequence: &self.sequence,
            anomalies: &self.anomalies,
            latency: &self.latency,
        }
        .generate_weekly_report(week_start, now, symbols, options)
    }
}

fn sequence_error_issue(error_type: SequenceErrorType) -> String {
    match error_type {
        SequenceErrorType::Gap => "Sequence gap detected".to_string(),
        SequenceErrorType::OutOfOrder => "Out-of-order sequence".to_string(),
        SequenceErrorType::Duplicate => "Duplicate sequence".to_string(),
        SequenceErrorType::Reset => "Sequence reset".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn ts(secs: i64) -> Instant {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn trade(symbol: &str, t: Instant, price: rust_decimal::Decimal) -> TradeEvent {
        TradeEvent {
            symbol: Symbol::from(symbol),
            timestamp: t,
            price,
            volume: 100,
            sequence: None,
            provider: None,
            latency_ms: None,
            venue: None,
            aggressor: crate::types::Aggressor::Unknown,
        }
    }

    #[test]
    fn test_process_trade_marks_symbol_healthy() {
        let orchestrator = QualityOrchestrator::new(QualityOrchestratorConfig::default());
        orchestrator.process_trade(trade("AAPL", ts(0), dec!(100)));
        let health = orchestrator.get_symbol_health(&Symbol::from("AAPL")).unwrap();
        assert_eq!(health.state, SymbolHealthState::Healthy);
    }

    #[test]
    fn test_sequence_gap_degrades_health() {
        let orchestrator = QualityOrchestrator::new(QualityOrchestratorConfig::default());
        let mut first = trade("AAPL", ts(0), dec!(100));
        first.sequence = Some(1);
        orchestrator.process_trade(first);

        let mut jump = trade("AAPL", ts(1), dec!(100));
        jump.sequence = Some(1000);
        orchestrator.process_trade(jump);

        let health = orchestrator.get_symbol_health(&Symbol::from("AAPL")).unwrap();
        assert_eq!(health.state, SymbolHealthState::Degraded);
    }

    #[test]
    fn test_get_real_time_metrics_counts_active_symbols() {
        let orchestrator = QualityOrchestrator::new(QualityOrchestratorConfig::default());
        orchestrator.process_trade(trade("AAPL", ts(0), dec!(100)));
        orchestrator.process_trade(trade("MSFT", ts(0), dec!(200)));
        let metrics = orchestrator.get_real_time_metrics(ts(1));
        assert_eq!(metrics.active_symbols, 2);
        assert_eq!(metrics.overall_health_score, 1.0);
    }

    struct FixedMetricsSink(f64);

    impl qm_integration::MetricsSink for FixedMetricsSink {
        fn events_per_second(&self) -> f64 {
            self.0
        }
    }

    #[test]
    fn test_events_per_second_reads_through_metrics_sink() {
        let orchestrator = QualityOrchestrator::new(QualityOrchestratorConfig::default());
        assert_eq!(orchestrator.get_real_time_metrics(ts(0)).events_per_second, 0.0);

        orchestrator.set_metrics_sink(Arc::new(FixedMetricsSink(42.5)));
        orchestrator.process_trade(trade("AAPL", ts(0), dec!(100)));
        assert_eq!(orchestrator.get_real_time_metrics(ts(1)).events_per_second, 42.5);
    }

    #[test]
    fn test_tick_promotes_stale_symbol() {
        let orchestrator = QualityOrchestrator::new(QualityOrchestratorConfig::default());
        orchestrator.process_trade(trade("AAPL", ts(0), dec!(100)));
        // High-liquidity stale threshold is 60s.
        orchestrator.tick(ts(3600));
        let health = orchestrator.get_symbol_health(&Symbol::from("AAPL")).unwrap();
        assert_eq!(health.state, SymbolHealthState::Stale);
    }
}
