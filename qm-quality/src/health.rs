use parking_lot::Mutex;
use qm_instrument::{Instant, Symbol};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Declaration order doubles as the "ascending" sort order the dashboard
/// uses (worst-first) for `getRealTimeMetrics` (spec.md §4.J).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolHealthState {
    Unhealthy,
    Degraded,
    Stale,
    Unknown,
    Healthy,
}

impl SymbolHealthState {
    fn base_score(self) -> f64 {
        match self {
            SymbolHealthState::Healthy => 1.0,
            SymbolHealthState::Degraded | SymbolHealthState::Stale => 0.5,
            SymbolHealthState::Unhealthy => 0.0,
            SymbolHealthState::Unknown => 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolHealth {
    pub symbol: Symbol,
    pub state: SymbolHealthState,
    pub score: f64,
    pub last_event: Instant,
    pub time_since_last_event_seconds: u64,
    pub active_issues: Vec<String>,
}

const MAX_ACTIVE_ISSUES: usize = 5;

/// Per-symbol health repository guarded by a single lock, so the 5-issue
/// cap and upsert semantics live in one place (spec.md §9 re-architecture
/// note on "concurrent dictionaries exposing raw mutation").
#[derive(Default)]
pub struct HealthMap {
    entries: Mutex<HashMap<Symbol, SymbolHealth>>,
}

impl HealthMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert semantics from spec.md §4.J `updateHealth`:
    /// - new entry: state as provided, score 1.0 if Healthy else 0.5.
    /// - existing entry: active issues are the deduped last-5 of
    ///   (existing ∪ {issue}) when an issue is present; a Healthy event on
    ///   a non-Unknown entry clears issues; Healthy is promoted over
    ///   Unknown.
    pub fn update_health(
        &self,
        symbol: Symbol,
        state: SymbolHealthState,
        issue: Option<String>,
        now: Instant,
    ) {
        let mut entries = self.entries.lock();
        match entries.get_mut(&symbol) {
            None => {
                let score = if state == SymbolHealthState::Healthy {
                    1.0
                } else {
                    0.5
                };
                entries.insert(
                    symbol.clone(),
                    SymbolHealth {
                        symbol,
                        state,
                        score,
                        last_event: now,
                        time_since_last_event_seconds: 0,
                        active_issues: issue.into_iter().collect(),
                    },
                );
            }
            Some(existing) => {
                // Transitions follow the caller's value, except an incoming
                // `Unknown` must not downgrade an existing `Healthy`
                // (spec.md §4.J "Healthy is promoted over Unknown").
                let resolved_state = if state == SymbolHealthState::Unknown
                    && existing.state == SymbolHealthState::Healthy
                {
                    SymbolHealthState::Healthy
                } else {
                    state
                };

                if resolved_state == SymbolHealthState::Healthy && existing.state != SymbolHealthState::Unknown {
                    existing.active_issues.clear();
                } else if let Some(issue) = issue {
                    if !existing.active_issues.contains(&issue) {
                        existing.active_issues.push(issue);
                    }
                    while existing.active_issues.len() > MAX_ACTIVE_ISSUES {
                        existing.active_issues.remove(0);
                    }
                }

                existing.state = resolved_state;
                existing.score = resolved_state.base_score();
                existing.last_event = now;
                existing.time_since_last_event_seconds = 0;
            }
        }
    }

    /// Promotes `symbol` to `Stale` with an appended issue, used by the
    /// 5-second staleness sweep. A no-op if the symbol is already `Stale`
    /// or has no recorded entry.
    pub fn mark_stale(&self, symbol: &Symbol, now: Instant) -> bool {
        let mut entries = self.entries.lock();
        let Some(existing) = entries.get_mut(symbol) else {
            return false;
        };
        if existing.state == SymbolHealthState::Stale {
            return false;
        }
        existing.state = SymbolHealthState::Stale;
        existing.score = SymbolHealthState::Stale.base_score();
        if !existing.active_issues.iter().any(|i| i == "No recent data") {
            existing.active_issues.push("No recent data".to_string());
            while existing.active_issues.len() > MAX_ACTIVE_ISSUES {
                existing.active_issues.remove(0);
            }
        }
        let _ = now;
        true
    }

    pub fn refresh_time_since_last_event(&self, now: Instant) {
        let mut entries = self.entries.lock();
        for entry in entries.values_mut() {
            entry.time_since_last_event_seconds =
                (now - entry.last_event).num_seconds().max(0) as u64;
        }
    }

    pub fn get(&self, symbol: &Symbol) -> Option<SymbolHealth> {
        self.entries.lock().get(symbol).cloned()
    }

    pub fn snapshot(&self) -> Vec<SymbolHealth> {
        self.entries.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn unhealthy(&self) -> Vec<SymbolHealth> {
        self.entries
            .lock()
            .values()
            .filter(|h| h.state == SymbolHealthState::Unhealthy || h.state == SymbolHealthState::Degraded)
            .cloned()
            .collect()
    }

    /// Top-N entries ordered by (state ascending, timeSinceLastEvent
    /// descending) per spec.md §4.J `getRealTimeMetrics`.
    pub fn top_n(&self, n: usize) -> Vec<SymbolHealth> {
        let mut all = self.snapshot();
        all.sort_by(|a, b| {
            a.state
                .cmp(&b.state)
                .then(b.time_since_last_event_seconds.cmp(&a.time_since_last_event_seconds))
        });
        all.truncate(n);
        all
    }

    /// `(h + 0.5d) / N` over Healthy (`h`) and Degraded (`d`) counts,
    /// rounded to 4dp (spec.md §8 "Health score formula").
    pub fn overall_health_score(&self) -> f64 {
        let entries = self.entries.lock();
        let n = entries.len();
        if n == 0 {
            return 1.0;
        }
        let healthy = entries
            .values()
            .filter(|h| h.state == SymbolHealthState::Healthy)
            .count();
        let degraded = entries
            .values()
            .filter(|h| h.state == SymbolHealthState::Degraded)
            .count();
        let score = (healthy as f64 + 0.5 * degraded as f64) / n as f64;
        (score * 10_000.0).round() / 10_000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn ts(secs: i64) -> Instant {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_new_entry_defaults() {
        let map = HealthMap::new();
        map.update_health(Symbol::from("AAPL"), SymbolHealthState::Healthy, None, ts(0));
        let entry = map.get(&Symbol::from("AAPL")).unwrap();
        assert_eq!(entry.score, 1.0);
        assert!(entry.active_issues.is_empty());
    }

    #[test]
    fn test_issue_cap_at_five() {
        let map = HealthMap::new();
        let symbol = Symbol::from("AAPL");
        for i in 0..8 {
            map.update_health(
                symbol.clone(),
                SymbolHealthState::Degraded,
                Some(format!("issue-{i}")),
                ts(i),
            );
        }
        let entry = map.get(&symbol).unwrap();
        assert_eq!(entry.active_issues.len(), 5);
        assert_eq!(entry.active_issues.last().unwrap(), "issue-7");
    }

    #[test]
    fn test_healthy_clears_issues() {
        let map = HealthMap::new();
        let symbol = Symbol::from("AAPL");
        map.update_health(
            symbol.clone(),
            SymbolHealthState::Degraded,
            Some("stale".to_string()),
            ts(0),
        );
        map.update_health(symbol.clone(), SymbolHealthState::Healthy, None, ts(1));
        let entry = map.get(&symbol).unwrap();
        assert!(entry.active_issues.is_empty());
        assert_eq!(entry.state, SymbolHealthState::Healthy);
    }

    #[test]
    fn test_healthy_promoted_over_unknown() {
        let map = HealthMap::new();
        let symbol = Symbol::from("AAPL");
        map.update_health(symbol.clone(), SymbolHealthState::Unknown, None, ts(0));
        map.update_health(symbol.clone(), SymbolHealthState::Healthy, None, ts(1));
        assert_eq!(
            map.get(&symbol).unwrap().state,
            SymbolHealthState::Healthy
        );
    }

    #[test]
    fn test_unknown_does_not_downgrade_healthy() {
        let map = HealthMap::new();
        let symbol = Symbol::from("AAPL");
        map.update_health(symbol.clone(), SymbolHealthState::Healthy, None, ts(0));
        map.update_health(symbol.clone(), SymbolHealthState::Unknown, None, ts(1));
        assert_eq!(
            map.get(&symbol).unwrap().state,
            SymbolHealthState::Healthy
        );
    }

    #[test]
    fn test_overall_health_score_formula() {
        let map = HealthMap::new();
        map.update_health(Symbol::from("A"), SymbolHealthState::Healthy, None, ts(0));
        map.update_health(Symbol::from("B"), SymbolHealthState::Healthy, None, ts(0));
        map.update_health(Symbol::from("C"), SymbolHealthState::Degraded, None, ts(0));
        map.update_health(Symbol::from("D"), SymbolHealthState::Unhealthy, None, ts(0));
        // (2 + 0.5*1) / 4 = 0.625
        assert_eq!(map.overall_health_score(), 0.625);
    }

    #[test]
    fn test_stale_contributes_zero_not_half() {
        let map = HealthMap::new();
        map.update_health(Symbol::from("A"), SymbolHealthState::Healthy, None, ts(0));
        map.update_health(Symbol::from("B"), SymbolHealthState::Healthy, None, ts(0));
        map.mark_stale(&Symbol::from("B"), ts(1));
        // h=1, d=0, u(=Stale, uncounted)=1 -> (1 + 0) / 2 = 0.5
        assert_eq!(map.overall_health_score(), 0.5);
    }

    #[test]
    fn test_top_n_orders_by_state_then_staleness() {
        let map = HealthMap::new();
        map.update_health(Symbol::from("A"), SymbolHealthState::Healthy, None, ts(0));
        map.update_health(Symbol::from("B"), SymbolHealthState::Unhealthy, None, ts(0));
        map.refresh_time_since_last_event(ts(100));
        let top = map.top_n(2);
        assert_eq!(top[0].symbol, Symbol::from("B"));
    }
}
