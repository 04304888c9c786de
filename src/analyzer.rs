//! Connection quality assessment over a window of recent outcomes.

use crate::quality::{bps_to_mbps, Tier};
use crate::session::TestOutcome;
use crate::stats::{mean, std_dev};
use log::debug;
use serde::Serialize;

/// Default number of outcomes considered.
pub const DEFAULT_WINDOW_SIZE: usize = 20;

/// Default maximum outcome age, 24 hours.
pub const DEFAULT_MAX_AGE_MS: i64 = 24 * 60 * 60 * 1000;

/// Speeds below this are treated as this when used as a divisor.
const MIN_SPEED_MBPS: f64 = 0.1;

/// Snapshot of how the connection has been behaving recently.
///
/// `quality` is `None` when there was nothing to analyze, which callers
/// treat as "use defaults" rather than as a bad connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionAssessment {
    pub quality: Option<Tier>,
    pub download_quality: Option<Tier>,
    pub upload_quality: Option<Tier>,
    pub avg_download_mbps: f64,
    pub avg_upload_mbps: f64,
    pub avg_latency_ms: f64,
    pub sample_size: usize,
    pub successful_tests: usize,
    pub failed_tests: usize,
    pub failure_rate: f64,
    /// Mean of the two per-direction scores, in `[0, 1]`.
    pub consistency: Option<f64>,
    pub download_consistency: Option<f64>,
    pub upload_consistency: Option<f64>,
}

impl ConnectionAssessment {
    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn is_unknown(&self) -> bool {
        self.quality.is_none()
    }
}

/// Select the analysis window: outcomes started within `max_age_ms` of
/// `now`, newest first, at most `max_samples` of them.
pub fn recent_window<'a>(
    outcomes: impl IntoIterator<Item = &'a TestOutcome>,
    now: i64,
    max_age_ms: i64,
    max_samples: usize,
) -> Vec<&'a TestOutcome> {
    let cutoff = now - max_age_ms;
    let mut window: Vec<&TestOutcome> = outcomes
        .into_iter()
        .filter(|outcome| outcome.started_at() > cutoff)
        .collect();

    window.sort_by_key(|outcome| std::cmp::Reverse(outcome.started_at()));
    window.truncate(max_samples);
    window
}

/// `1 - min(1, stddev / max(mean, 0.1))`.
fn consistency_of(speeds: &[f64]) -> Option<f64> {
    let avg = mean(speeds)?;
    let sd = std_dev(speeds)?;
    Some(1.0 - (sd / avg.max(MIN_SPEED_MBPS)).min(1.0))
}

/// Assess a window of outcomes (successes and failures alike).
pub fn analyze(window: &[&TestOutcome]) -> ConnectionAssessment {
    if window.is_empty() {
        return ConnectionAssessment::unknown();
    }

    let successes: Vec<_> =
        window.iter().filter_map(|outcome| outcome.result()).collect();
    let total = window.len();
    let failed = total - successes.len();
    let failure_rate = failed as f64 / total as f64;

    if successes.is_empty() {
        return ConnectionAssessment {
            quality: Some(Tier::Poor),
            download_quality: Some(Tier::Poor),
            upload_quality: Some(Tier::Poor),
            sample_size: total,
            failed_tests: failed,
            failure_rate,
            ..ConnectionAssessment::default()
        };
    }

    let downloads: Vec<f64> =
        successes.iter().map(|r| bps_to_mbps(r.download_bandwidth)).collect();
    let uploads: Vec<f64> =
        successes.iter().map(|r| bps_to_mbps(r.upload_bandwidth)).collect();
    let latencies: Vec<f64> =
        successes.iter().map(|r| r.unloaded_latency).collect();

    let avg_download = mean(&downloads).unwrap_or(0.0);
    let avg_upload = mean(&uploads).unwrap_or(0.0);
    let avg_latency = mean(&latencies).unwrap_or(0.0);

    let download_quality = Tier::of(avg_download);
    let upload_quality = Tier::of(avg_upload);

    let download_consistency = consistency_of(&downloads);
    let upload_consistency = consistency_of(&uploads);
    let consistency = match (download_consistency, upload_consistency) {
        (Some(down), Some(up)) => Some((down + up) / 2.0),
        _ => None,
    };

    let mut quality = download_quality.min(upload_quality);

    if consistency.is_some_and(|c| c < 0.5) {
        quality = quality.downgrade(1);
    }

    if avg_latency > 200.0 && quality == Tier::Excellent {
        quality = Tier::Good;
    } else if avg_latency > 500.0 && quality == Tier::Good {
        quality = Tier::Moderate;
    }

    if failure_rate > 0.3 {
        quality = quality.downgrade(2);
    } else if failure_rate > 0.15 {
        quality = quality.downgrade(1);
    }

    if failure_rate > 0.05 && quality.is_extreme() {
        quality = quality.downgrade(1);
    }

    debug!(
        "Assessed {} tests: {} (down {:.2} Mbps, up {:.2} Mbps, {:.0}% failed)",
        total,
        quality,
        avg_download,
        avg_upload,
        failure_rate * 100.0
    );

    ConnectionAssessment {
        quality: Some(quality),
        download_quality: Some(download_quality),
        upload_quality: Some(upload_quality),
        avg_download_mbps: avg_download,
        avg_upload_mbps: avg_upload,
        avg_latency_ms: avg_latency,
        sample_size: total,
        successful_tests: successes.len(),
        failed_tests: failed,
        failure_rate,
        consistency,
        download_consistency,
        upload_consistency,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::fixtures::{failure_at, success_at};

    fn refs(outcomes: &[TestOutcome]) -> Vec<&TestOutcome> {
        outcomes.iter().collect()
    }

    #[test]
    fn test_empty_window_is_unknown() {
        let assessment = analyze(&[]);
        assert!(assessment.is_unknown());
        assert_eq!(assessment.sample_size, 0);
    }

    #[test]
    fn test_all_failed_is_poor_not_unknown() {
        let outcomes: Vec<_> = (0..4).map(|i| failure_at(i * 1_000)).collect();
        let assessment = analyze(&refs(&outcomes));

        assert_eq!(assessment.quality, Some(Tier::Poor));
        assert_eq!(assessment.sample_size, 4);
        assert_eq!(assessment.failed_tests, 4);
        assert_eq!(assessment.failure_rate, 1.0);
    }

    #[test]
    fn test_overall_is_worse_direction() {
        let outcomes: Vec<_> =
            (0..3).map(|i| success_at(i * 1_000, 100.0, 1.0, 20.0)).collect();
        let assessment = analyze(&refs(&outcomes));

        assert_eq!(assessment.download_quality, Some(Tier::Excellent));
        assert_eq!(assessment.upload_quality, Some(Tier::Poor));
        assert_eq!(assessment.quality, Some(Tier::Poor));
        assert_eq!(assessment.consistency, Some(1.0));
    }

    #[test]
    fn test_high_failure_rate_drops_two_tiers() {
        // 13 steady excellent successes and 7 failures: failure rate 0.35.
        let mut outcomes: Vec<_> = (0..13)
            .map(|i| success_at(i * 1_000, 100.0, 100.0, 20.0))
            .collect();
        outcomes.extend((13..20).map(|i| failure_at(i * 1_000)));

        let assessment = analyze(&refs(&outcomes));
        assert!((assessment.failure_rate - 0.35).abs() < 0.001);
        assert_eq!(assessment.download_quality, Some(Tier::Excellent));
        assert_eq!(assessment.quality, Some(Tier::Moderate));
    }

    #[test]
    fn test_inconsistent_speeds_drop_one_tier() {
        let outcomes = vec![
            success_at(0, 20.0, 20.0, 20.0),
            success_at(1_000, 130.0, 130.0, 20.0),
        ];
        let assessment = analyze(&refs(&outcomes));

        // Mean 75 Mbps is excellent, std-dev 55 gives consistency ~0.27.
        assert_eq!(assessment.download_quality, Some(Tier::Excellent));
        assert!(assessment.consistency.unwrap() < 0.5);
        assert_eq!(assessment.quality, Some(Tier::Good));
    }

    #[test]
    fn test_latency_downgrade_does_not_cascade() {
        let outcomes: Vec<_> =
            (0..3).map(|i| success_at(i * 1_000, 100.0, 100.0, 600.0)).collect();
        let assessment = analyze(&refs(&outcomes));

        // Excellent drops to good, and the good rule is not applied again.
        assert_eq!(assessment.quality, Some(Tier::Good));
    }

    #[test]
    fn test_slow_good_link_with_huge_latency() {
        let outcomes: Vec<_> =
            (0..3).map(|i| success_at(i * 1_000, 50.0, 50.0, 600.0)).collect();
        assert_eq!(analyze(&refs(&outcomes)).quality, Some(Tier::Moderate));
    }

    #[test]
    fn test_any_failure_rate_above_five_percent_caps_extreme_tiers() {
        let mut outcomes: Vec<_> = (0..18)
            .map(|i| success_at(i * 1_000, 800.0, 800.0, 5.0))
            .collect();
        outcomes.extend((18..20).map(|i| failure_at(i * 1_000)));

        // Failure rate 0.1: no general drop, but gigabit falls to ultra.
        assert_eq!(analyze(&refs(&outcomes)).quality, Some(Tier::Ultra));
    }

    #[test]
    fn test_recent_window_filters_and_caps() {
        let now = DEFAULT_MAX_AGE_MS + 100_000;
        let mut outcomes = vec![failure_at(0)];
        outcomes.extend((1..=25).map(|i| failure_at(now - i * 1_000)));

        let window = recent_window(&outcomes, now, DEFAULT_MAX_AGE_MS, 20);
        assert_eq!(window.len(), 20);
        assert_eq!(window[0].started_at(), now - 1_000);
        assert!(window.iter().all(|o| o.started_at() > 0));
    }
}
