//! Per-symbol backfill progress tracker (spec.md §4.M "Per-symbol progress
//! tracker: running counts of bars retrieved, completion, failure reasons").

use parking_lot::Mutex;
use qm_instrument::Symbol;
use std::collections::HashMap;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SymbolProgress {
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    pub bars_retrieved: u64,
    pub last_failure_reason: Option<String>,
}

#[derive(Default)]
pub struct ProgressTracker {
    by_symbol: Mutex<HashMap<Symbol, SymbolProgress>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, symbol: &Symbol, bars_retrieved: usize) {
        let mut map = self.by_symbol.lock();
        let entry = map.entry(symbol.clone()).or_default();
        entry.requests_succeeded += 1;
        entry.bars_retrieved += bars_retrieved as u64;
    }

    pub fn record_failure(&self, symbol: &Symbol, reason: impl Into<String>) {
        let mut map = self.by_symbol.lock();
        let entry = map.entry(symbol.clone()).or_default();
        entry.requests_failed += 1;
        entry.last_failure_reason = Some(reason.into());
    }

    pub fn get(&self, symbol: &Symbol) -> Option<SymbolProgress> {
        self.by_symbol.lock().get(symbol).cloned()
    }

    pub fn snapshot(&self) -> HashMap<Symbol, SymbolProgress> {
        self.by_symbol.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_success_accumulates_bars() {
        let tracker = ProgressTracker::new();
        let symbol = Symbol::from("AAPL");
        tracker.record_success(&symbol, 5);
        tracker.record_success(&symbol, 3);

        let progress = tracker.get(&symbol).unwrap();
        assert_eq!(progress.requests_succeeded, 2);
        assert_eq!(progress.bars_retrieved, 8);
    }

    #[test]
    fn test_record_failure_tracks_last_reason() {
        let tracker = ProgressTracker::new();
        let symbol = Symbol::from("MSFT");
        tracker.record_failure(&symbol, "rate limited");
        tracker.record_failure(&symbol, "timeout");

        let progress = tracker.get(&symbol).unwrap();
        assert_eq!(progress.requests_failed, 2);
        assert_eq!(progress.last_failure_reason.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_unknown_symbol_returns_none() {
        let tracker = ProgressTracker::new();
        assert!(tracker.get(&Symbol::from("GOOG")).is_none());
    }
}
