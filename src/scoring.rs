//! AIM (Aggregated Internet Measurement) use-case scores.
//!
//! Each engine report carries a grade for streaming, gaming and video
//! conferencing, derived from the test's summary metrics with the
//! thresholds used by speed.cloudflare.com.

use serde::Serialize;

/// Variants are ordered from worst to best for correct derived Ord behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Grade {
    Poor,
    Average,
    Good,
    Great,
}

impl Grade {
    pub fn description(&self) -> &'static str {
        match self {
            Grade::Great => "Excellent",
            Grade::Good => "Good",
            Grade::Average => "Average",
            Grade::Poor => "Poor",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AimScores {
    pub streaming: Grade,
    pub gaming: Grade,
    pub video_conferencing: Grade,
}

impl AimScores {
    /// The weakest of the three grades.
    pub fn overall(&self) -> Grade {
        self.streaming.min(self.gaming).min(self.video_conferencing)
    }
}

/// Inputs for scoring. Speeds in Mbps, times in milliseconds.
#[derive(Debug, Clone, Copy)]
pub struct ScoringInput {
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub latency_ms: f64,
    pub jitter_ms: f64,
    pub loaded_latency_down_ms: Option<f64>,
    pub loaded_latency_up_ms: Option<f64>,
}

/// `[great, good, average]` thresholds for one metric.
type Thresholds = [f64; 3];

/// Grade a metric where larger is better.
fn at_least(value: f64, [great, good, average]: Thresholds) -> Grade {
    if value >= great {
        Grade::Great
    } else if value >= good {
        Grade::Good
    } else if value >= average {
        Grade::Average
    } else {
        Grade::Poor
    }
}

/// Grade a metric where smaller is better.
fn at_most(value: f64, [great, good, average]: Thresholds) -> Grade {
    if value <= great {
        Grade::Great
    } else if value <= good {
        Grade::Good
    } else if value <= average {
        Grade::Average
    } else {
        Grade::Poor
    }
}

mod streaming {
    pub const DOWNLOAD: super::Thresholds = [25.0, 10.0, 5.0];
    pub const LATENCY: super::Thresholds = [100.0, 200.0, 400.0];
}

mod gaming {
    pub const LATENCY: super::Thresholds = [30.0, 50.0, 100.0];
    pub const JITTER: super::Thresholds = [10.0, 20.0, 30.0];
    pub const DOWNLOAD: super::Thresholds = [15.0, 5.0, 3.0];
}

mod video_conferencing {
    pub const DOWNLOAD: super::Thresholds = [10.0, 5.0, 2.0];
    pub const UPLOAD: super::Thresholds = [10.0, 5.0, 2.0];
    pub const LATENCY: super::Thresholds = [50.0, 100.0, 200.0];
    pub const JITTER: super::Thresholds = [15.0, 30.0, 50.0];
}

pub fn calculate_aim_scores(input: &ScoringInput) -> AimScores {
    let streaming_latency = input.loaded_latency_down_ms.unwrap_or(input.latency_ms);
    let streaming = at_least(input.download_mbps, streaming::DOWNLOAD)
        .min(at_most(streaming_latency, streaming::LATENCY));

    let gaming_latency = input
        .loaded_latency_down_ms
        .or(input.loaded_latency_up_ms)
        .unwrap_or(input.latency_ms);
    let gaming = at_most(gaming_latency, gaming::LATENCY)
        .min(at_most(input.jitter_ms, gaming::JITTER))
        .min(at_least(input.download_mbps, gaming::DOWNLOAD));

    let call_latency = input
        .loaded_latency_up_ms
        .or(input.loaded_latency_down_ms)
        .unwrap_or(input.latency_ms);
    let video_conferencing =
        at_least(input.download_mbps, video_conferencing::DOWNLOAD)
            .min(at_least(input.upload_mbps, video_conferencing::UPLOAD))
            .min(at_most(call_latency, video_conferencing::LATENCY))
            .min(at_most(input.jitter_ms, video_conferencing::JITTER));

    AimScores { streaming, gaming, video_conferencing }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(down: f64, up: f64, latency: f64, jitter: f64) -> ScoringInput {
        ScoringInput {
            download_mbps: down,
            upload_mbps: up,
            latency_ms: latency,
            jitter_ms: jitter,
            loaded_latency_down_ms: None,
            loaded_latency_up_ms: None,
        }
    }

    #[test]
    fn test_fast_link_is_great_everywhere() {
        let scores = calculate_aim_scores(&input(100.0, 50.0, 15.0, 2.0));
        assert_eq!(scores.streaming, Grade::Great);
        assert_eq!(scores.gaming, Grade::Great);
        assert_eq!(scores.video_conferencing, Grade::Great);
        assert_eq!(scores.overall(), Grade::Great);
    }

    #[test]
    fn test_weak_upload_only_hurts_calls() {
        let scores = calculate_aim_scores(&input(100.0, 1.0, 15.0, 2.0));
        assert_eq!(scores.streaming, Grade::Great);
        assert_eq!(scores.video_conferencing, Grade::Poor);
        assert_eq!(scores.overall(), Grade::Poor);
    }

    #[test]
    fn test_loaded_latency_is_preferred() {
        let mut metrics = input(100.0, 50.0, 15.0, 2.0);
        metrics.loaded_latency_down_ms = Some(250.0);
        let scores = calculate_aim_scores(&metrics);
        assert_eq!(scores.streaming, Grade::Average);
        assert_eq!(scores.gaming, Grade::Poor);
    }

    #[test]
    fn test_threshold_edges() {
        assert_eq!(at_least(25.0, streaming::DOWNLOAD), Grade::Great);
        assert_eq!(at_least(4.99, streaming::DOWNLOAD), Grade::Poor);
        assert_eq!(at_most(30.0, gaming::LATENCY), Grade::Great);
        assert_eq!(at_most(100.1, gaming::LATENCY), Grade::Poor);
    }
}
