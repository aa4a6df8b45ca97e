use serde::{Deserialize, Serialize};

/// Discrete liquidity tier used to parameterise every detector threshold so
/// illiquid symbols are not spuriously flagged (spec.md §3/§4.A).
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum LiquidityProfile {
    #[default]
    High,
    Normal,
    Low,
    VeryLow,
    Minimal,
}

/// Threshold parameters derived from a [`LiquidityProfile`], consumed by
/// components C-H.
#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
pub struct LiquidityThresholds {
    pub gap_threshold_seconds: u64,
    pub expected_events_per_hour: u64,
    pub freshness_threshold_seconds: u64,
    pub stale_data_threshold_seconds: u64,
    pub spread_threshold_bps: u64,
    pub min_samples_for_statistics: usize,
}

const HIGH: LiquidityThresholds = LiquidityThresholds {
    gap_threshold_seconds: 60,
    expected_events_per_hour: 1000,
    freshness_threshold_seconds: 60,
    stale_data_threshold_seconds: 60,
    spread_threshold_bps: 10,
    min_samples_for_statistics: 100,
};

const NORMAL: LiquidityThresholds = LiquidityThresholds {
    gap_threshold_seconds: 120,
    expected_events_per_hour: 200,
    freshness_threshold_seconds: 120,
    stale_data_threshold_seconds: 120,
    spread_threshold_bps: 50,
    min_samples_for_statistics: 50,
};

const LOW: LiquidityThresholds = LiquidityThresholds {
    gap_threshold_seconds: 600,
    expected_events_per_hour: 20,
    freshness_threshold_seconds: 600,
    stale_data_threshold_seconds: 600,
    spread_threshold_bps: 500,
    min_samples_for_statistics: 20,
};

const VERY_LOW: LiquidityThresholds = LiquidityThresholds {
    gap_threshold_seconds: 1800,
    expected_events_per_hour: 5,
    freshness_threshold_seconds: 1800,
    stale_data_threshold_seconds: 1800,
    spread_threshold_bps: 1000,
    min_samples_for_statistics: 10,
};

const MINIMAL: LiquidityThresholds = LiquidityThresholds {
    gap_threshold_seconds: 3600,
    expected_events_per_hour: 1,
    freshness_threshold_seconds: 3600,
    stale_data_threshold_seconds: 3600,
    spread_threshold_bps: 2000,
    min_samples_for_statistics: 5,
};

/// Pure total function `thresholds(profile) -> LiquidityThresholds`
/// (spec.md §4.A). An unrecognised profile is not representable since
/// [`LiquidityProfile`] is a closed enum, but the fallback-to-`High`
/// behaviour is preserved for any future variant by matching exhaustively
/// here rather than via a catch-all `_ => HIGH`.
pub fn thresholds(profile: LiquidityProfile) -> LiquidityThresholds {
    match profile {
        LiquidityProfile::High => HIGH,
        LiquidityProfile::Normal => NORMAL,
        LiquidityProfile::Low => LOW,
        LiquidityProfile::VeryLow => VERY_LOW,
        LiquidityProfile::Minimal => MINIMAL,
    }
}

/// Severity of a detected [`DataGap`](crate gap module in `qm-quality`).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GapSeverity {
    Minor,
    Moderate,
    Significant,
    Major,
    Critical,
}

/// Classify a gap `duration_seconds` at the given `profile` by comparing it
/// to `base_threshold x {1, 5, 30, 60, >60}` breakpoints (spec.md §4.A).
///
/// A duration strictly below the base threshold is not a gap at all; callers
/// only invoke this once they have already decided a gap exists.
pub fn classify_gap_severity(duration_seconds: f64, profile: LiquidityProfile) -> GapSeverity {
    let base = thresholds(profile).gap_threshold_seconds as f64;
    if duration_seconds < base * 5.0 {
        GapSeverity::Minor
    } else if duration_seconds < base * 30.0 {
        GapSeverity::Moderate
    } else if duration_seconds < base * 60.0 {
        GapSeverity::Significant
    } else if duration_seconds <= base * 60.0 * 2.0 {
        GapSeverity::Major
    } else {
        GapSeverity::Critical
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thresholds_table() {
        assert_eq!(thresholds(LiquidityProfile::High).gap_threshold_seconds, 60);
        assert_eq!(
            thresholds(LiquidityProfile::Minimal).expected_events_per_hour,
            1
        );
    }

    #[test]
    fn test_classify_gap_severity_monotonic() {
        let profile = LiquidityProfile::High;
        let base = thresholds(profile).gap_threshold_seconds as f64;
        assert_eq!(classify_gap_severity(base, profile), GapSeverity::Minor);
        assert_eq!(
            classify_gap_severity(base * 5.0, profile),
            GapSeverity::Moderate
        );
        assert_eq!(
            classify_gap_severity(base * 30.0, profile),
            GapSeverity::Significant
        );
        assert_eq!(classify_gap_severity(base * 61.0, profile), GapSeverity::Major);
        assert_eq!(
            classify_gap_severity(base * 200.0, profile),
            GapSeverity::Critical
        );

        // Longer durations never produce a lower severity at a fixed profile.
        let samples = [base, base * 4.0, base * 10.0, base * 40.0, base * 90.0, base * 500.0];
        let severities: Vec<_> = samples
            .iter()
            .map(|d| classify_gap_severity(*d, profile))
            .collect();
        for window in severities.windows(2) {
            assert!(window[1] >= window[0]);
        }
    }

    #[test]
    fn test_high_falls_back_as_default() {
        assert_eq!(LiquidityProfile::default(), LiquidityProfile::High);
    }
}
