//! Top-level facade crate for the market data quality monitor and
//! ingestion supervisor: wires the quality engine (`qm-quality`), the
//! streaming ingestion supervisor (`qm-streaming`), and the backfill worker
//! (`qm-backfill`) behind a single validated configuration
//! ([`config::QmConfig`]) and logging setup ([`logging`]).
//!
//! This crate is deliberately thin (SPEC_FULL.md "CLI / binary entrypoint")
//! - the actual detection and ingestion logic lives in the component
//! crates this one re-exports and assembles.

pub mod config;
pub mod logging;
pub mod shutdown;
pub mod supervisor;

pub use config::{QmConfig, QmConfigBuilder, StreamingConnectionConfig};
pub use supervisor::QualitySupervisor;

pub use qm_backfill::{BackfillRequest, BackfillStatus, BackfillWorker, BackfillWorkerConfig, Granularity, HistoricalProvider, StorageSink};
pub use qm_instrument::{thresholds, Feed, LiquidityProfile, Provider, Symbol};
pub use qm_integration::{MetricsSink, QualityError};
pub use qm_quality::orchestrator::{QualityOrchestrator, RealTimeQualityMetrics};
pub use qm_streaming::{StreamingClient, SubscriptionKind, SubscriptionManager};
