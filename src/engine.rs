//! The speed-test engine seam.
//!
//! The monitor only needs something that can execute a
//! [`MeasurementPlan`] and hand back the six summary figures. Engines emit
//! [`ProgressEvent`]s while they work; callbacks must not block.

use crate::errors::MonitorError;
use crate::plan::{Direction, MeasurementPlan};
use crate::resilience::Reachability;
use crate::scoring::{calculate_aim_scores, AimScores, ScoringInput};
use crate::session::RawResults;
use crate::stats::{jitter, median, percentile};
use log::debug;

/// Transfers shorter than this are too noisy to count towards bandwidth.
pub const MIN_SAMPLE_DURATION_MS: f64 = 10.0;

/// Percentile of per-request bandwidth reported as the link speed.
pub const BANDWIDTH_PERCENTILE: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestPhase {
    Latency,
    Download,
    Upload,
    Complete,
}

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    PhaseChange(TestPhase),
    LatencyMeasurement {
        value_ms: f64,
        /// 1-indexed
        current: usize,
        total: usize,
    },
    BandwidthMeasurement {
        direction: Direction,
        speed_mbps: f64,
        bytes: u64,
        current: usize,
        total: usize,
    },
    Error(String),
}

pub trait ProgressCallback: Send + Sync {
    fn on_progress(&self, event: ProgressEvent);
}

/// Forwards progress to the log at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressCallback for LogProgress {
    fn on_progress(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::PhaseChange(phase) => debug!("Phase: {:?}", phase),
            ProgressEvent::LatencyMeasurement { value_ms, current, total } => {
                debug!("Latency {}/{}: {:.2} ms", current, total, value_ms)
            }
            ProgressEvent::BandwidthMeasurement {
                direction,
                speed_mbps,
                bytes,
                current,
                total,
            } => debug!(
                "{:?} {}B {}/{}: {:.2} Mbps",
                direction, bytes, current, total, speed_mbps
            ),
            ProgressEvent::Error(message) => debug!("Engine error: {}", message),
        }
    }
}

/// One timed transfer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandwidthSample {
    pub direction: Direction,
    pub bytes: u64,
    pub duration_ms: f64,
    /// Warm-up transfers are reported but never counted.
    pub bypass_min_duration: bool,
}

impl BandwidthSample {
    pub fn bits_per_second(&self) -> f64 {
        if self.duration_ms <= 0.0 {
            return 0.0;
        }
        (self.bytes as f64 * 8.0) / (self.duration_ms / 1000.0)
    }

    pub fn speed_mbps(&self) -> f64 {
        self.bits_per_second() / 1_000_000.0
    }
}

/// Everything an engine measured during one plan execution.
#[derive(Debug, Clone, Default)]
pub struct EngineReport {
    pub summary: RawResults,
    pub bandwidth: Vec<BandwidthSample>,
    /// Idle round trips in milliseconds.
    pub latency: Vec<f64>,
    pub loaded_latency_down: Vec<f64>,
    pub loaded_latency_up: Vec<f64>,
    pub scores: Option<AimScores>,
}

impl EngineReport {
    /// Builds the summary and scores from raw samples.
    ///
    /// Bandwidth is the 90th percentile of the counted transfers in each
    /// direction, latency the median idle round trip and jitter the mean
    /// absolute difference between consecutive idle round trips.
    pub fn from_samples(
        bandwidth: Vec<BandwidthSample>,
        latency: Vec<f64>,
        loaded_latency_down: Vec<f64>,
        loaded_latency_up: Vec<f64>,
    ) -> Self {
        let speed = |direction: Direction| {
            let values: Vec<f64> = bandwidth
                .iter()
                .filter(|s| s.direction == direction)
                .filter(|s| {
                    !s.bypass_min_duration
                        && s.duration_ms >= MIN_SAMPLE_DURATION_MS
                })
                .map(BandwidthSample::bits_per_second)
                .collect();
            percentile(&values, BANDWIDTH_PERCENTILE)
        };

        let summary = RawResults {
            download_bandwidth: speed(Direction::Download),
            upload_bandwidth: speed(Direction::Upload),
            unloaded_latency: median(&latency),
            unloaded_jitter: jitter(&latency),
            download_loaded_latency: median(&loaded_latency_down),
            upload_loaded_latency: median(&loaded_latency_up),
        };

        let scores = scores_for(&summary);

        Self {
            summary,
            bandwidth,
            latency,
            loaded_latency_down,
            loaded_latency_up,
            scores,
        }
    }
}

fn scores_for(summary: &RawResults) -> Option<AimScores> {
    let input = ScoringInput {
        download_mbps: summary.download_bandwidth? / 1_000_000.0,
        upload_mbps: summary.upload_bandwidth? / 1_000_000.0,
        latency_ms: summary.unloaded_latency?,
        jitter_ms: summary.unloaded_jitter.unwrap_or(0.0),
        loaded_latency_down_ms: summary.download_loaded_latency,
        loaded_latency_up_ms: summary.upload_loaded_latency,
    };
    Some(calculate_aim_scores(&input))
}

/// A black-box speed test.
///
/// `abort` is best effort: it asks an in-flight `run` to give up early, and
/// callers must still drop the future themselves.
#[allow(async_fn_in_trait)]
pub trait SpeedTestEngine {
    async fn run(
        &self,
        plan: &MeasurementPlan,
        progress: &dyn ProgressCallback,
    ) -> Result<EngineReport, MonitorError>;

    fn abort(&self);

    async fn reachability(&self) -> Reachability {
        Reachability::default()
    }
}

impl<E: SpeedTestEngine> SpeedTestEngine for &E {
    async fn run(
        &self,
        plan: &MeasurementPlan,
        progress: &dyn ProgressCallback,
    ) -> Result<EngineReport, MonitorError> {
        (**self).run(plan, progress).await
    }

    fn abort(&self) {
        (**self).abort()
    }

    async fn reachability(&self) -> Reachability {
        (**self).reachability().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::Grade;

    fn sample(direction: Direction, bytes: u64, duration_ms: f64) -> BandwidthSample {
        BandwidthSample { direction, bytes, duration_ms, bypass_min_duration: false }
    }

    #[test]
    fn test_sample_speed() {
        let s = sample(Direction::Download, 1_000_000, 1000.0);
        assert_eq!(s.bits_per_second(), 8_000_000.0);
        assert_eq!(s.speed_mbps(), 8.0);
        assert_eq!(sample(Direction::Upload, 10, 0.0).bits_per_second(), 0.0);
    }

    #[test]
    fn test_report_from_samples() {
        let mut warm_up = sample(Direction::Download, 100_000, 50.0);
        warm_up.bypass_min_duration = true;

        let report = EngineReport::from_samples(
            vec![
                warm_up,
                sample(Direction::Download, 1_000_000, 100.0),
                sample(Direction::Download, 1_000_000, 100.0),
                sample(Direction::Download, 1_000, 1.0),
                sample(Direction::Upload, 1_000_000, 400.0),
            ],
            vec![10.0, 12.0, 14.0],
            vec![30.0],
            vec![],
        );

        assert_eq!(report.summary.download_bandwidth, Some(80_000_000.0));
        assert_eq!(report.summary.upload_bandwidth, Some(20_000_000.0));
        assert_eq!(report.summary.unloaded_latency, Some(12.0));
        assert_eq!(report.summary.unloaded_jitter, Some(2.0));
        assert_eq!(report.summary.download_loaded_latency, Some(30.0));
        assert_eq!(report.summary.upload_loaded_latency, None);

        let scores = report.scores.unwrap();
        assert_eq!(scores.streaming, Grade::Great);
    }

    #[test]
    fn test_report_without_uploads_has_no_scores() {
        let report = EngineReport::from_samples(
            vec![sample(Direction::Download, 1_000_000, 100.0)],
            vec![10.0],
            vec![],
            vec![],
        );
        assert!(report.summary.upload_bandwidth.is_none());
        assert!(report.scores.is_none());
    }
}
