use crate::anomaly::{AnomalyDetector, AnomalyType};
use crate::completeness::CompletenessCalculator;
use crate::gap::GapAnalyzer;
use crate::latency::LatencyHistogram;
use crate::sequence::SequenceErrorTracker;
use crate::types::EventKind;
use qm_instrument::{SessionDate, Symbol};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolReportEntry {
    pub symbol: Symbol,
    pub completeness_score: Option<f64>,
    pub gap_count: usize,
    pub sequence_error_count: u64,
    pub anomaly_count: usize,
    pub anomaly_breakdown: HashMap<String, usize>,
    pub average_latency_ms: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyQualityReport {
    pub date: SessionDate,
    pub generated_at: qm_instrument::Instant,
    pub symbols: Vec<SymbolReportEntry>,
    pub total_gaps: usize,
    pub total_sequence_errors: u64,
    pub total_anomalies: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeeklyQualityReport {
    pub week_start: SessionDate,
    pub generated_at: qm_instrument::Instant,
    pub days: Vec<DailyQualityReport>,
    pub total_gaps: usize,
    pub total_sequence_errors: u64,
    pub total_anomalies: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReportOptions {
    pub symbols: Option<()>,
}

/// Rolls up C/D/E/F/G detector state into an exportable report (component
/// I). JSON is the authoritative persisted form (spec.md §6); CSV/HTML/
/// Markdown are derived presentation views with no re-import requirement.
pub struct ReportGenerator<'a> {
    pub completeness: &'a CompletenessCalculator,
    pub gaps: &'a GapAnalyzer,
    pub sequence: &'a SequenceErrorTracker,
    pub anomalies: &'a AnomalyDetector,
    pub latency: &'a LatencyHistogram,
}

impl<'a> ReportGenerator<'a> {
    pub fn generate_daily_report(
        &self,
        date: SessionDate,
        now: qm_instrument::Instant,
        symbols: &[Symbol],
        _options: ReportOptions,
    ) -> DailyQualityReport {
        let mut entries = Vec::with_capacity(symbols.len());
        let mut total_gaps = 0usize;
        let mut total_sequence_errors = 0u64;
        let mut total_anomalies = 0u64;

        for symbol in symbols {
            let completeness_score = self
                .completeness
                .calculate_score(symbol, EventKind::Trades, date)
                .map(|s| s.score);

            let gap_count = self.gaps.gaps_for_symbol_date(symbol, date).len();
            total_gaps += gap_count;

            let sequence_error_count = self
                .sequence
                .symbol_summary(symbol)
                .map(|s| s.gap + s.out_of_order + s.duplicate + s.reset)
                .unwrap_or(0);
            total_sequence_errors += sequence_error_count;

            let symbol_anomalies = self.anomalies.anomalies_for(symbol);
            let anomaly_count = symbol_anomalies.len();
            total_anomalies += anomaly_count as u64;
            let mut breakdown: HashMap<String, usize> = HashMap::new();
            for anomaly in &symbol_anomalies {
                *breakdown.entry(anomaly_type_label(anomaly.anomaly_type)).or_insert(0) += 1;
            }

            let average_latency_ms = self
                .latency
                .statistics_for(symbol, None)
                .filter(|stats| stats.count > 0)
                .map(|stats| stats.mean_ms);

            entries.push(SymbolReportEntry {
                symbol: symbol.clone(),
                completeness_score,
                gap_count,
                sequence_error_count,
                anomaly_count,
                anomaly_breakdown: breakdown,
                average_latency_ms,
            });
        }

        DailyQualityReport {
            date,
            generated_at: now,
            symbols: entries,
            total_gaps,
            total_sequence_errors,
            total_anomalies,
        }
    }

    pub fn generate_weekly_report(
        &self,
        week_start: SessionDate,
        now: qm_instrument::Instant,
        symbols: &[Symbol],
        options: ReportOptions,
    ) -> WeeklyQualityReport {
        let mut days = Vec::with_capacity(7);
        let mut total_gaps = 0usize;
        let mut total_sequence_errors = 0u64;
        let mut total_anomalies = 0u64;

        for offset in 0..7 {
            let date = week_start + chrono::Duration::days(offset);
            let day = self.generate_daily_report(date, now, symbols, options);
            total_gaps += day.total_gaps;
            total_sequence_errors += day.total_sequence_errors;
            total_anomalies += day.total_anomalies;
            days.push(day);
        }

        WeeklyQualityReport {
            week_start,
            generated_at: now,
            days,
            total_gaps,
            total_sequence_errors,
            total_anomalies,
        }
    }
}

fn anomaly_type_label(anomaly_type: AnomalyType) -> String {
    match anomaly_type {
        AnomalyType::PriceSpike => "price_spike",
        AnomalyType::PriceDrop => "price_drop",
        AnomalyType::RapidPriceChange => "rapid_price_change",
        AnomalyType::VolumeSpike => "volume_spike",
        AnomalyType::VolumeDrop => "volume_drop",
        AnomalyType::CrossedMarket => "crossed_market",
        AnomalyType::SpreadWide => "spread_wide",
        AnomalyType::StaleData => "stale_data",
    }
    .to_string()
}

/// File naming convention from spec.md §6: `quality_report_<YYYY-MM-DD>.<ext>`
/// and `weekly_quality_report_<YYYY-MM-DD>.<ext>`.
pub fn daily_report_filename(date: SessionDate, ext: &str) -> String {
    format!("quality_report_{}.{ext}", date.format("%Y-%m-%d"))
}

pub fn weekly_report_filename(week_start: SessionDate, ext: &str) -> String {
    format!("weekly_quality_report_{}.{ext}", week_start.format("%Y-%m-%d"))
}

/// Derived CSV view over a daily report's per-symbol rows. No re-import
/// requirement - export only.
pub fn daily_report_to_csv(report: &DailyQualityReport) -> String {
    let mut out = String::from("symbol,completeness_score,gap_count,sequence_error_count,anomaly_count,average_latency_ms\n");
    for entry in &report.symbols {
        out.push_str(&format!(
            "{},{},{},{},{},{}\n",
            entry.symbol,
            entry
                .completeness_score
                .map(|s| s.to_string())
                .unwrap_or_default(),
            entry.gap_count,
            entry.sequence_error_count,
            entry.anomaly_count,
            entry
                .average_latency_ms
                .map(|s| s.to_string())
                .unwrap_or_default(),
        ));
    }
    out
}
