//! Top-level facade wiring K-M and the Orchestrator together behind the
//! "interfaces exposed to the host" of spec.md §6 (SPEC_FULL.md "Workspace
//! layout"). Modeled on the teacher's `System` task-handle facade: holds
//! `JoinHandle`s for every background task and exposes a single bounded
//! `shutdown`.

use crate::config::QmConfig;
use crate::shutdown::{with_deadline, ShutdownOutcome};
use qm_backfill::{BackfillWorker, HistoricalProvider, StorageSink};
use qm_instrument::{LiquidityProfile, Provider, Symbol};
use qm_integration::rate_limit::RateLimiter;
use qm_integration::QualityError;
use qm_quality::orchestrator::{QualityOrchestrator, RealTimeQualityMetrics};
use qm_quality::{DailyQualityReport, ReportOptions, SymbolHealth, WeeklyQualityReport};
use qm_streaming::{StreamingClient, SubscriptionId, SubscriptionKind, SubscriptionManager};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::{DAILY_CLEANUP_INTERVAL, HOURLY_CLEANUP_INTERVAL, ORCHESTRATOR_TICK_INTERVAL};

/// A running instance of the quality monitor: the orchestrator (component J
/// plus C-H), the subscription manager (K) and streaming client (L) for a
/// single provider session, and the backfill worker (M). Task handles for
/// every background loop are retained so [`QualitySupervisor::shutdown`] can
/// wait on them.
pub struct QualitySupervisor {
    pub orchestrator: Arc<QualityOrchestrator>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub streaming: Arc<StreamingClient>,
    pub backfill: Arc<BackfillWorker>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl QualitySupervisor {
    pub fn new(
        config: &QmConfig,
        historical: Arc<dyn HistoricalProvider>,
        storage: Arc<dyn StorageSink>,
        backfill_providers: HashMap<Provider, RateLimiter>,
    ) -> Result<Arc<Self>, QualityError> {
        let orchestrator = QualityOrchestrator::new(config.quality_config());
        let subscriptions = Arc::new(SubscriptionManager::new(provider_id_base(config.streaming.provider)));
        let streaming = StreamingClient::new(config.streaming_config(), Arc::clone(&subscriptions), Arc::clone(&orchestrator));
        let backfill = BackfillWorker::new(config.backfill.clone(), backfill_providers, historical, storage)?;

        Ok(Arc::new(Self {
            orchestrator,
            subscriptions,
            streaming,
            backfill,
            tasks: parking_lot::Mutex::new(Vec::new()),
        }))
    }

    /// Subscribes to `symbol`'s trade, quote, and aggregate streams,
    /// registering its liquidity tier first so detector thresholds are
    /// correct from the first ingested event (spec.md §4.A/§4.J).
    pub async fn subscribe_symbol(
        &self,
        symbol: Symbol,
        profile: LiquidityProfile,
    ) -> Result<[SubscriptionId; 3], QualityError> {
        self.orchestrator.register_symbol_liquidity(symbol.clone(), profile);
        Ok([
            self.streaming.subscribe(symbol.clone(), SubscriptionKind::Trades).await?,
            self.streaming.subscribe(symbol.clone(), SubscriptionKind::Quotes).await?,
            self.streaming.subscribe(symbol, SubscriptionKind::Aggregates).await?,
        ])
    }

    /// Spawns the streaming client's run loop, the backfill worker's run
    /// loop, and the periodic sweep tasks (5s orchestrator tick, hourly gap
    /// and anomaly cleanup, daily completeness cleanup - spec.md §9 "Timer-
    /// driven periodic sweeps"). Returns immediately; tasks run until
    /// [`Self::shutdown`] is called.
    pub fn run(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();

        {
            let streaming = Arc::clone(&self.streaming);
            tasks.push(tokio::spawn(async move {
                if let Err(err) = streaming.run().await {
                    tracing::error!(error = %err, "streaming client terminated");
                }
            }));
        }

        {
            let backfill = Arc::clone(&self.backfill);
            tasks.push(tokio::spawn(backfill.run()));
        }

        {
            let orchestrator = Arc::clone(&self.orchestrator);
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(ORCHESTRATOR_TICK_INTERVAL);
                loop {
                    ticker.tick().await;
                    orchestrator.tick(qm_instrument::now());
                }
            }));
        }

        {
            let orchestrator = Arc::clone(&self.orchestrator);
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(HOURLY_CLEANUP_INTERVAL);
                loop {
                    ticker.tick().await;
                    let now = qm_instrument::now();
                    orchestrator.gaps.cleanup(now);
                    orchestrator.anomalies.cleanup(now);
                }
            }));
        }

        {
            let orchestrator = Arc::clone(&self.orchestrator);
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(DAILY_CLEANUP_INTERVAL);
                loop {
                    ticker.tick().await;
                    orchestrator.completeness.cleanup(qm_instrument::now().date_naive());
                }
            }));
        }
    }

    pub fn get_dashboard(&self) -> Vec<SymbolHealth> {
        self.orchestrator.get_dashboard()
    }

    pub fn get_real_time_metrics(&self) -> RealTimeQualityMetrics {
        self.orchestrator.get_real_time_metrics(qm_instrument::now())
    }

    pub fn get_symbol_health(&self, symbol: &Symbol) -> Option<SymbolHealth> {
        self.orchestrator.get_symbol_health(symbol)
    }

    pub fn get_unhealthy_symbols(&self) -> Vec<SymbolHealth> {
        self.orchestrator.get_unhealthy_symbols()
    }

    pub fn generate_daily_report(&self, date: qm_instrument::SessionDate, symbols: &[Symbol], options: ReportOptions) -> DailyQualityReport {
        self.orchestrator.generate_daily_report(date, qm_instrument::now(), symbols, options)
    }

    pub fn generate_weekly_report(&self, week_start: qm_instrument::SessionDate, symbols: &[Symbol], options: ReportOptions) -> WeeklyQualityReport {
        self.orchestrator.generate_weekly_report(week_start, qm_instrument::now(), symbols, options)
    }

    /// Disposes the streaming client, stops the backfill worker, and waits
    /// up to `deadline` for every background task to return (spec.md §5
    /// "Dispose ... waits up to 5 seconds for orderly shutdown, then
    /// forcibly closes the socket").
    pub async fn shutdown(&self, deadline: Duration) -> ShutdownOutcome {
        self.streaming.dispose();
        self.backfill.stop();

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        let outcome = with_deadline(deadline, async {
            self.backfill.drain().await;
            for task in tasks {
                let _ = task.await;
            }
        })
        .await;

        if outcome == ShutdownOutcome::TimedOut {
            tracing::warn!("supervisor shutdown deadline exceeded; some tasks were left running");
        }
        outcome
    }
}

/// Disjoint subscription-id ranges per provider (spec.md §4.K "`id_base`
/// lets distinct providers allocate from disjoint ranges").
fn provider_id_base(provider: Provider) -> u64 {
    match provider {
        Provider::Other => 0,
        Provider::Mock => 1_000_000,
        Provider::Polygon => 2_000_000,
        Provider::PolygonDelayed => 3_000_000,
        Provider::PolygonHistorical => 4_000_000,
        Provider::Tiingo => 5_000_000,
        Provider::AlphaVantage => 6_000_000,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_id_bases_are_disjoint() {
        let providers = [
            Provider::Other,
            Provider::Mock,
            Provider::Polygon,
            Provider::PolygonDelayed,
            Provider::PolygonHistorical,
            Provider::Tiingo,
            Provider::AlphaVantage,
        ];
        let bases: Vec<u64> = providers.iter().map(|p| provider_id_base(*p)).collect();
        let mut sorted = bases.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), bases.len());
    }
}
