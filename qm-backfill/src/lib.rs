//! Backfill request queue and concurrency-limited worker pool (component M):
//! the queued unit of work and its lifecycle ([`request`]), the priority
//! queue ([`queue`]), per-symbol progress tracking ([`progress`]), the
//! `Retry-After` parser ([`retry`]), and the worker loop itself
//! ([`worker`]).

pub mod progress;
pub mod queue;
pub mod request;
pub mod retry;
pub mod worker;

pub use progress::{ProgressTracker, SymbolProgress};
pub use queue::BackfillQueue;
pub use request::{BackfillRequest, BackfillStatus, Granularity, HistoricalBar, RequestId};
pub use worker::{BackfillWorker, BackfillWorkerConfig, HistoricalProvider, StorageSink};
