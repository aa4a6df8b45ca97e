use parking_lot::Mutex;
use qm_instrument::{Provider, Symbol};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Upper bound (ms) of each finite bucket; the final bucket is an overflow
/// catch-all for anything above the last bound (spec.md §4.G).
const BUCKET_BOUNDS_MS: [f64; 11] = [1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0];
const BUCKET_COUNT: usize = BUCKET_BOUNDS_MS.len() + 1;

/// A fixed-bucket latency histogram with running moments, kept per
/// (symbol, provider) key so per-provider latency can be distinguished.
#[derive(Clone)]
struct Histogram {
    buckets: [u64; BUCKET_COUNT],
    count: u64,
    sum: f64,
    sum_sq: f64,
    min: f64,
    max: f64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: [0; BUCKET_COUNT],
            count: 0,
            sum: 0.0,
            sum_sq: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    fn record(&mut self, ms: f64) {
        let idx = bucket_index(ms);
        self.buckets[idx] += 1;
        self.count += 1;
        self.sum += ms;
        self.sum_sq += ms * ms;
        self.min = self.min.min(ms);
        self.max = self.max.max(ms);
    }

    fn merge(&mut self, other: &Histogram) {
        for (a, b) in self.buckets.iter_mut().zip(other.buckets.iter()) {
            *a += *b;
        }
        self.count += other.count;
        self.sum += other.sum;
        self.sum_sq += other.sum_sq;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    fn stdev(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        let n = self.count as f64;
        let mean = self.mean();
        ((self.sum_sq / n) - mean * mean).max(0.0).sqrt()
    }

    fn quantile(&self, q: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let target_rank = (q * self.count as f64).ceil().max(1.0);
        let mut cumulative = 0u64;
        for (i, &bucket_count) in self.buckets.iter().enumerate() {
            if bucket_count == 0 {
                continue;
            }
            let prev_cumulative = cumulative;
            cumulative += bucket_count;
            if (cumulative as f64) >= target_rank {
                let (lower, upper) = bucket_range(i, self.max);
                if bucket_count == 1 || upper <= lower {
                    return upper;
                }
                let within = target_rank - prev_cumulative as f64;
                let fraction = within / bucket_count as f64;
                return lower + fraction * (upper - lower);
            }
        }
        self.max
    }
}

fn bucket_index(ms: f64) -> usize {
    for (i, bound) in BUCKET_BOUNDS_MS.iter().enumerate() {
        if ms <= *bound {
            return i;
        }
    }
    BUCKET_COUNT - 1
}

/// Returns the (lower, upper) bound in ms used for interpolation inside
/// bucket `i`. The overflow bucket has no upper bound, so the observed
/// series maximum stands in for it.
fn bucket_range(i: usize, observed_max: f64) -> (f64, f64) {
    let lower = if i == 0 { 0.0 } else { BUCKET_BOUNDS_MS[i - 1] };
    let upper = if i < BUCKET_BOUNDS_MS.len() {
        BUCKET_BOUNDS_MS[i]
    } else {
        observed_max.max(lower)
    };
    (lower, upper)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencyStatistics {
    pub count: u64,
    pub mean_ms: f64,
    pub stdev_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

impl Histogram {
    fn statistics(&self) -> LatencyStatistics {
        LatencyStatistics {
            count: self.count,
            mean_ms: self.mean(),
            stdev_ms: self.stdev(),
            min_ms: if self.count == 0 { 0.0 } else { self.min },
            max_ms: if self.count == 0 { 0.0 } else { self.max },
            p50_ms: self.quantile(0.50),
            p90_ms: self.quantile(0.90),
            p95_ms: self.quantile(0.95),
            p99_ms: self.quantile(0.99),
        }
    }
}

type SeriesKey = (Symbol, Option<Provider>);

/// Tracks end-to-end event latency per (symbol, provider) series and
/// recombines them into a global view on demand (component G).
pub struct LatencyHistogram {
    series: Mutex<HashMap<SeriesKey, Histogram>>,
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self {
            series: Mutex::new(HashMap::new()),
        }
    }

    pub fn record_latency(&self, symbol: Symbol, ms: u64, provider: Option<Provider>) {
        let mut series = self.series.lock();
        let histogram = series
            .entry((symbol, provider))
            .or_insert_with(Histogram::new);
        histogram.record(ms as f64);
    }

    pub fn statistics_for(&self, symbol: &Symbol, provider: Option<Provider>) -> Option<LatencyStatistics> {
        self.series
            .lock()
            .get(&(symbol.clone(), provider))
            .map(Histogram::statistics)
    }

    /// Global mean/p50/p90/p95/p99 recombined by weighted bucket merge
    /// across every (symbol, provider) series (spec.md §4.G).
    pub fn global_statistics(&self) -> LatencyStatistics {
        let series = self.series.lock();
        let mut combined = Histogram::new();
        for histogram in series.values() {
            combined.merge(histogram);
        }
        combined.statistics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_assignment_boundaries() {
        assert_eq!(bucket_index(1.0), 0);
        assert_eq!(bucket_index(1.1), 1);
        assert_eq!(bucket_index(5.0), 1);
        assert_eq!(bucket_index(5000.0), 10);
        assert_eq!(bucket_index(5000.1), 11);
    }

    #[test]
    fn test_quantiles_on_uniform_distribution() {
        let histogram = LatencyHistogram::new();
        let symbol = Symbol::from("AAPL");
        for ms in 1..=100u64 {
            histogram.record_latency(symbol.clone(), ms, None);
        }
        let stats = histogram.statistics_for(&symbol, None).unwrap();
        assert_eq!(stats.count, 100);
        assert!(stats.p50_ms > 30.0 && stats.p50_ms < 70.0);
        assert!(stats.p99_ms > stats.p90_ms);
        assert!(stats.max_ms >= 99.0);
    }

    #[test]
    fn test_global_statistics_recombines_series() {
        let histogram = LatencyHistogram::new();
        histogram.record_latency(Symbol::from("AAPL"), 10, Some(Provider::Polygon));
        histogram.record_latency(Symbol::from("MSFT"), 20, Some(Provider::Tiingo));
        let global = histogram.global_statistics();
        assert_eq!(global.count, 2);
        assert!((global.mean_ms - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_overflow_bucket_uses_observed_max() {
        let histogram = LatencyHistogram::new();
        let symbol = Symbol::from("AAPL");
        histogram.record_latency(symbol.clone(), 10_000, None);
        let stats = histogram.statistics_for(&symbol, None).unwrap();
        assert_eq!(stats.p99_ms, 10_000.0);
    }
}
