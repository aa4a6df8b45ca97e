//! Minimal process wiring that demonstrates the supervisor end-to-end: a
//! `QmConfig`, the `QualitySupervisor` (Orchestrator + Subscription Manager
//! + Streaming Client + Backfill Worker), run until Ctrl-C, then a bounded
//! shutdown. This is NOT the "embedded HTTP dashboard/CLI surface" spec.md
//! places out of scope - it is just enough process wiring for the crate to
//! be runnable, analogous to the teacher's `examples/*.rs` binaries.

use async_trait::async_trait;
use qm::{
    Feed, Granularity, HistoricalProvider, LiquidityProfile, MetricsSink, Provider, QmConfig,
    QualityError, StorageSink, StreamingConnectionConfig, Symbol,
};
use qm_backfill::HistoricalBar;
use qm_instrument::SessionDate;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Placeholder historical provider; a real deployment supplies one backed
/// by an HTTP client for Tiingo/AlphaVantage/etc (spec.md §6
/// `HistoricalProvider.getDailyBars`, explicitly an external collaborator).
struct NullHistoricalProvider;

#[async_trait]
impl HistoricalProvider for NullHistoricalProvider {
    async fn get_daily_bars(
        &self,
        _symbol: &Symbol,
        _from: SessionDate,
        _to: SessionDate,
        _granularity: Granularity,
    ) -> Result<Vec<HistoricalBar>, QualityError> {
        Ok(Vec::new())
    }
}

/// Placeholder storage sink; a real deployment writes bars to the on-disk
/// layout spec.md places out of scope.
struct NullStorageSink;

#[async_trait]
impl StorageSink for NullStorageSink {
    async fn write_bars(&self, _symbol: &Symbol, _bars: &[HistoricalBar]) -> Result<(), QualityError> {
        Ok(())
    }
}

/// Placeholder events/sec counter; a real deployment wires this to whatever
/// ingestion-rate meter the host already tracks (spec.md §6
/// `MetricsSink.eventsPerSecond()`).
struct NullMetricsSink;

impl MetricsSink for NullMetricsSink {
    fn events_per_second(&self) -> f64 {
        0.0
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    qm::logging::init_logging();

    let api_key = std::env::var("QM_STREAMING_API_KEY").unwrap_or_else(|_| "demo-key".to_string());
    let streaming = StreamingConnectionConfig::resolve(api_key, Feed::Stocks, Provider::Polygon, false)?;
    let config = QmConfig::builder(streaming).build()?;

    let supervisor = qm::QualitySupervisor::new(
        &config,
        Arc::new(NullHistoricalProvider),
        Arc::new(NullStorageSink),
        HashMap::new(),
    )?;
    supervisor.orchestrator.set_metrics_sink(Arc::new(NullMetricsSink));

    supervisor.subscribe_symbol(Symbol::from("AAPL"), LiquidityProfile::High).await?;
    supervisor.subscribe_symbol(Symbol::from("MSFT"), LiquidityProfile::High).await?;

    supervisor.run();
    tracing::info!("quality supervisor running; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    supervisor.shutdown(Duration::from_secs(5)).await;

    Ok(())
}
