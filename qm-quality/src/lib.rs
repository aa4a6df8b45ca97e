pub mod anomaly;
pub mod completeness;
pub mod gap;
pub mod health;
pub mod latency;
pub mod orchestrator;
pub mod report;
pub mod sequence;
pub mod sla;
pub mod types;

pub use anomaly::{AnomalyConfig, AnomalyDetector, AnomalySeverity, AnomalyType, DataAnomaly};
pub use completeness::{CompletenessCalculator, CompletenessConfig, CompletenessGrade, CompletenessScore};
pub use gap::{DataGap, GapAnalyzer, GapConfig, GapStatistics};
pub use health::{HealthMap, SymbolHealth, SymbolHealthState};
pub use latency::{LatencyHistogram, LatencyStatistics};
pub use orchestrator::{QualityOrchestrator, QualityOrchestratorConfig, RealTimeQualityMetrics};
pub use report::{DailyQualityReport, ReportGenerator, ReportOptions, WeeklyQualityReport};
pub use sequence::{SequenceConfig, SequenceError, SequenceErrorTracker, SequenceErrorType};
pub use sla::{SlaConfig, SlaMonitor, SlaState};
pub use types::{AggregateBar, Aggressor, EventKind, QuoteEvent, Timeframe, TradeEvent};
