//! Aggregated, validated configuration for the quality supervisor
//! (SPEC_FULL.md "Configuration").
//!
//! A single immutable [`QmConfig`] is produced once, by [`QmConfigBuilder`],
//! rather than exposing mutable config records that components could
//! observe mid-change (spec.md §9 "Mutable configuration records with
//! defaulted optional fields"). Validation failures surface as
//! [`QualityError::Configuration`] before any component starts.

use qm_backfill::BackfillWorkerConfig;
use qm_instrument::{Feed, Provider};
use qm_integration::QualityError;
use qm_quality::{AnomalyConfig, CompletenessConfig, GapConfig, QualityOrchestratorConfig, SequenceConfig, SlaConfig};
use qm_streaming::StreamingConfig;
use std::time::Duration;

/// Connection settings for a single streaming provider session
/// (spec.md §6 wire protocol endpoint resolution).
#[derive(Debug, Clone)]
pub struct StreamingConnectionConfig {
    pub endpoint: url::Url,
    pub api_key: String,
    pub feed: Feed,
    pub provider: Provider,
}

impl StreamingConnectionConfig {
    /// Resolves the `wss://socket.polygon.io/<feed>` /
    /// `wss://delayed.polygon.io/<feed>` endpoint from feed + delayed flag
    /// (spec.md §6).
    pub fn resolve(api_key: impl Into<String>, feed: Feed, provider: Provider, delayed: bool) -> Result<Self, QualityError> {
        let host = if delayed { "delayed.polygon.io" } else { "socket.polygon.io" };
        let endpoint = url::Url::parse(&format!("wss://{host}/{}", feed.as_str()))
            .map_err(|e| QualityError::Configuration(format!("invalid streaming endpoint: {e}")))?;
        Ok(Self { endpoint, api_key: api_key.into(), feed, provider })
    }

    pub(crate) fn into_streaming_config(self) -> StreamingConfig {
        StreamingConfig::new(self.endpoint, self.api_key, self.feed, self.provider)
    }
}

/// Complete, validated configuration for the supervisor: the quality engine
/// sub-configs (§6 "completeness"/"gap"/"sequence"/"anomaly"/"sla"), the
/// backfill worker's bounds, and the streaming connection.
#[derive(Debug, Clone)]
pub struct QmConfig {
    pub completeness: CompletenessConfig,
    pub gap: GapConfig,
    pub sequence: SequenceConfig,
    pub anomaly: AnomalyConfig,
    pub sla: SlaConfig,
    pub backfill: BackfillWorkerConfig,
    pub streaming: StreamingConnectionConfig,
}

impl QmConfig {
    pub fn builder(streaming: StreamingConnectionConfig) -> QmConfigBuilder {
        QmConfigBuilder {
            completeness: CompletenessConfig::default(),
            gap: GapConfig::default(),
            sequence: SequenceConfig::default(),
            anomaly: AnomalyConfig::default(),
            sla: SlaConfig::default(),
            backfill: BackfillWorkerConfig::default(),
            streaming,
        }
    }

    pub fn quality_config(&self) -> QualityOrchestratorConfig {
        QualityOrchestratorConfig {
            gap: self.gap,
            sequence: self.sequence,
            completeness: self.completeness,
            anomaly: self.anomaly,
            sla: self.sla,
        }
    }

    pub(crate) fn streaming_config(&self) -> StreamingConfig {
        self.streaming.clone().into_streaming_config()
    }
}

#[derive(Debug, Clone)]
pub struct QmConfigBuilder {
    completeness: CompletenessConfig,
    gap: GapConfig,
    sequence: SequenceConfig,
    anomaly: AnomalyConfig,
    sla: SlaConfig,
    backfill: BackfillWorkerConfig,
    streaming: StreamingConnectionConfig,
}

impl QmConfigBuilder {
    pub fn completeness(mut self, completeness: CompletenessConfig) -> Self {
        self.completeness = completeness;
        self
    }

    pub fn gap(mut self, gap: GapConfig) -> Self {
        self.gap = gap;
        self
    }

    pub fn sequence(mut self, sequence: SequenceConfig) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn anomaly(mut self, anomaly: AnomalyConfig) -> Self {
        self.anomaly = anomaly;
        self
    }

    pub fn sla(mut self, sla: SlaConfig) -> Self {
        self.sla = sla;
        self
    }

    pub fn backfill(mut self, backfill: BackfillWorkerConfig) -> Self {
        self.backfill = backfill;
        self
    }

    /// Validates every numeric bound this crate is responsible for owning
    /// and produces the immutable [`QmConfig`]. Invalid bounds are fatal at
    /// startup (spec.md §7 `ConfigurationError`).
    pub fn build(self) -> Result<QmConfig, QualityError> {
        if self.streaming.api_key.trim().is_empty() {
            return Err(QualityError::Configuration("streaming api_key must not be empty".to_string()));
        }
        if self.gap.max_gaps_per_symbol == 0 {
            return Err(QualityError::Configuration("gap.max_gaps_per_symbol must be > 0".to_string()));
        }
        if self.sequence.max_recent_tracked == 0 {
            return Err(QualityError::Configuration("sequence.max_recent_tracked must be > 0".to_string()));
        }
        if self.anomaly.min_samples_for_statistics == 0 {
            return Err(QualityError::Configuration("anomaly.min_samples_for_statistics must be > 0".to_string()));
        }
        if self.sla.check_interval_seconds == 0 {
            return Err(QualityError::Configuration("sla.check_interval_seconds must be > 0".to_string()));
        }
        let backfill = self.backfill.validate()?;

        Ok(QmConfig {
            completeness: self.completeness,
            gap: self.gap,
            sequence: self.sequence,
            anomaly: self.anomaly,
            sla: self.sla,
            backfill,
            streaming: self.streaming,
        })
    }
}

/// Default supervisor tick cadence (spec.md §4.J "A 5-second ticker").
pub const ORCHESTRATOR_TICK_INTERVAL: Duration = Duration::from_secs(5);
/// Hourly cleanup cadence shared by gap/anomaly retention sweeps.
pub const HOURLY_CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);
/// Daily cleanup cadence for the completeness calculator.
pub const DAILY_CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[cfg(test)]
mod tests {
    use super::*;

    fn streaming() -> StreamingConnectionConfig {
        StreamingConnectionConfig::resolve("test-key", Feed::Stocks, Provider::Polygon, false).unwrap()
    }

    #[test]
    fn test_resolve_endpoint_live_vs_delayed() {
        let live = StreamingConnectionConfig::resolve("k", Feed::Stocks, Provider::Polygon, false).unwrap();
        assert_eq!(live.endpoint.as_str(), "wss://socket.polygon.io/stocks");

        let delayed = StreamingConnectionConfig::resolve("k", Feed::Crypto, Provider::PolygonDelayed, true).unwrap();
        assert_eq!(delayed.endpoint.as_str(), "wss://delayed.polygon.io/crypto");
    }

    #[test]
    fn test_build_rejects_empty_api_key() {
        let bad = StreamingConnectionConfig { api_key: String::new(), ..streaming() };
        assert!(QmConfig::builder(bad).build().is_err());
    }

    #[test]
    fn test_build_rejects_invalid_backfill_concurrency() {
        let result = QmConfig::builder(streaming())
            .backfill(BackfillWorkerConfig { max_concurrent_requests: 0, ..Default::default() })
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_build_succeeds_with_defaults() {
        assert!(QmConfig::builder(streaming()).build().is_ok());
    }
}
