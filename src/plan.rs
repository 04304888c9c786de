//! Measurement plans: what a single speed test does, and how big.
//!
//! A plan is generated from a [`ConnectionAssessment`] by picking per-tier
//! download and upload batches, fine-tuning them against the observed
//! consistency, and shrinking the result until its estimated duration fits
//! the time budget.

use crate::analyzer::ConnectionAssessment;
use crate::quality::Tier;
use log::{debug, info};
use serde::{Deserialize, Serialize};

/// Wall-clock budget for one test, in seconds.
pub const DEFAULT_TIME_BUDGET_SECS: f64 = 45.0;

/// Multiplier applied to the raw duration estimate.
pub const OVERHEAD_FACTOR: f64 = 1.2;

/// Seconds charged per latency packet.
pub const SECONDS_PER_PACKET: f64 = 0.1;

/// Smallest transfer a scaled plan may contain.
pub const MIN_TRANSFER_BYTES: u64 = 10_000;

/// Additional scaling passes allowed when probes keep a plan over budget.
const MAX_REFINEMENT_PASSES: usize = 8;

const MIN_SPEED_MBPS: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferSpec {
    pub bytes: u64,
    pub count: u32,
    /// Only set on the warm-up transfer.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub bypass_min_duration: bool,
}

impl TransferSpec {
    pub const fn new(bytes: u64, count: u32) -> Self {
        Self { bytes, count, bypass_min_duration: false }
    }

    pub const fn warm_up(bytes: u64) -> Self {
        Self { bytes, count: 1, bypass_min_duration: true }
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes.saturating_mul(u64::from(self.count))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Download,
    Upload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Operation {
    Latency {
        #[serde(rename = "numPackets")]
        num_packets: u32,
    },
    Download(TransferSpec),
    Upload(TransferSpec),
}

impl Operation {
    pub const fn latency(num_packets: u32) -> Self {
        Operation::Latency { num_packets }
    }

    pub const fn download(bytes: u64, count: u32) -> Self {
        Operation::Download(TransferSpec::new(bytes, count))
    }

    pub const fn upload(bytes: u64, count: u32) -> Self {
        Operation::Upload(TransferSpec::new(bytes, count))
    }

    pub fn transfer(&self) -> Option<(Direction, &TransferSpec)> {
        match self {
            Operation::Latency { .. } => None,
            Operation::Download(spec) => Some((Direction::Download, spec)),
            Operation::Upload(spec) => Some((Direction::Upload, spec)),
        }
    }

    fn transfer_mut(&mut self) -> Option<(Direction, &mut TransferSpec)> {
        match self {
            Operation::Latency { .. } => None,
            Operation::Download(spec) => Some((Direction::Download, spec)),
            Operation::Upload(spec) => Some((Direction::Upload, spec)),
        }
    }
}

/// An ordered list of operations making up one speed test.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MeasurementPlan {
    operations: Vec<Operation>,
}

impl From<Vec<Operation>> for MeasurementPlan {
    fn from(operations: Vec<Operation>) -> Self {
        Self { operations }
    }
}

impl MeasurementPlan {
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn transfers(&self) -> impl Iterator<Item = (Direction, &TransferSpec)> {
        self.operations.iter().filter_map(Operation::transfer)
    }

    pub fn latency_packets(&self) -> u32 {
        self.operations
            .iter()
            .map(|op| match op {
                Operation::Latency { num_packets } => *num_packets,
                _ => 0,
            })
            .sum()
    }

    fn map_transfers(
        mut self,
        mut f: impl FnMut(Direction, &mut TransferSpec),
    ) -> Self {
        for op in self.operations.iter_mut() {
            if let Some((direction, spec)) = op.transfer_mut() {
                f(direction, spec);
            }
        }
        self
    }

    /// The plan used whenever nothing is known about the connection.
    pub fn default_good() -> Self {
        vec![
            Operation::latency(1),
            Operation::Download(TransferSpec::warm_up(100_000)),
            Operation::latency(20),
            Operation::download(100_000, 6),
            Operation::download(1_000_000, 5),
            Operation::upload(100_000, 5),
            Operation::upload(1_000_000, 4),
            Operation::download(5_000_000, 4),
            Operation::upload(5_000_000, 2),
            Operation::download(10_000_000, 2),
        ]
        .into()
    }
}

type Batches = &'static [(u64, u32)];

const POOR_DOWNLOADS: Batches = &[(100_000, 3), (200_000, 2)];
const MODERATE_DOWNLOADS: Batches =
    &[(200_000, 4), (1_000_000, 4), (3_000_000, 3)];
const GOOD_DOWNLOADS: Batches =
    &[(500_000, 4), (2_000_000, 4), (8_000_000, 3), (15_000_000, 2)];
const EXCELLENT_DOWNLOADS: Batches =
    &[(1_000_000, 4), (5_000_000, 4), (15_000_000, 3), (30_000_000, 2)];
const ULTRA_DOWNLOADS: Batches =
    &[(2_000_000, 3), (10_000_000, 4), (25_000_000, 3), (50_000_000, 2)];
const GIGABIT_DOWNLOADS: Batches =
    &[(5_000_000, 3), (20_000_000, 4), (50_000_000, 3), (100_000_000, 2)];

const POOR_UPLOADS: Batches = &[(100_000, 2), (200_000, 1)];
const MODERATE_UPLOADS: Batches =
    &[(200_000, 3), (1_000_000, 2), (2_000_000, 1)];
const GOOD_UPLOADS: Batches =
    &[(500_000, 3), (2_000_000, 3), (5_000_000, 2), (10_000_000, 1)];
const EXCELLENT_UPLOADS: Batches =
    &[(1_000_000, 3), (5_000_000, 3), (10_000_000, 2), (20_000_000, 1)];
const ULTRA_UPLOADS: Batches =
    &[(2_000_000, 3), (10_000_000, 3), (20_000_000, 2), (50_000_000, 1)];
const GIGABIT_UPLOADS: Batches =
    &[(5_000_000, 3), (20_000_000, 3), (50_000_000, 2), (100_000_000, 1)];

/// Download batches for a tier, warm-up first.
pub fn download_batches(tier: Tier) -> Vec<Operation> {
    let (warm_up, batches) = match tier {
        Tier::Poor => (50_000, POOR_DOWNLOADS),
        Tier::Moderate => (100_000, MODERATE_DOWNLOADS),
        Tier::Good => (100_000, GOOD_DOWNLOADS),
        Tier::Excellent => (100_000, EXCELLENT_DOWNLOADS),
        Tier::Ultra => (100_000, ULTRA_DOWNLOADS),
        Tier::Gigabit => (100_000, GIGABIT_DOWNLOADS),
    };

    std::iter::once(Operation::Download(TransferSpec::warm_up(warm_up)))
        .chain(
            batches
                .iter()
                .map(|&(bytes, count)| Operation::download(bytes, count)),
        )
        .collect()
}

pub fn upload_batches(tier: Tier) -> Vec<Operation> {
    let batches = match tier {
        Tier::Poor => POOR_UPLOADS,
        Tier::Moderate => MODERATE_UPLOADS,
        Tier::Good => GOOD_UPLOADS,
        Tier::Excellent => EXCELLENT_UPLOADS,
        Tier::Ultra => ULTRA_UPLOADS,
        Tier::Gigabit => GIGABIT_UPLOADS,
    };

    batches
        .iter()
        .map(|&(bytes, count)| Operation::upload(bytes, count))
        .collect()
}

fn scale_bytes(bytes: u64, factor: f64) -> u64 {
    (bytes as f64 * factor).floor() as u64
}

/// Adjust batch sizes to the consistency seen in `assessment`.
pub fn fine_tune(
    plan: MeasurementPlan,
    assessment: &ConnectionAssessment,
) -> MeasurementPlan {
    let mut plan = plan;

    match assessment.consistency {
        Some(c) if c < 0.7 => {
            plan = plan.map_transfers(|_, spec| {
                spec.bytes = scale_bytes(spec.bytes, 0.7);
                spec.count = (spec.count + 2).min(12);
            });
        }
        Some(c) if c > 0.9 => {
            plan = plan.map_transfers(|_, spec| {
                spec.bytes = scale_bytes(spec.bytes, 1.2);
                spec.count = spec.count.saturating_sub(1).max(1);
            });
        }
        _ => {}
    }

    match (assessment.download_consistency, assessment.upload_consistency) {
        (Some(down), Some(up)) => {
            plan = tune_direction(plan, Direction::Download, down, 8);
            plan = tune_direction(plan, Direction::Upload, up, 6);
        }
        _ => {
            let (down, up) =
                (assessment.avg_download_mbps, assessment.avg_upload_mbps);
            if down > 0.0 && up > 0.0 {
                let ratio = up / down;
                let factor = if ratio > 0.8 {
                    1.3
                } else if ratio < 0.3 {
                    0.8
                } else {
                    1.0
                };
                if factor != 1.0 {
                    plan = plan.map_transfers(|direction, spec| {
                        if direction == Direction::Upload {
                            spec.bytes = scale_bytes(spec.bytes, factor);
                        }
                    });
                }
            }
        }
    }

    plan
}

fn tune_direction(
    plan: MeasurementPlan,
    target: Direction,
    consistency: f64,
    max_count: u32,
) -> MeasurementPlan {
    if consistency < 0.7 {
        plan.map_transfers(|direction, spec| {
            if direction == target {
                spec.bytes = scale_bytes(spec.bytes, 0.8);
                spec.count = (spec.count + 1).min(max_count);
            }
        })
    } else if consistency > 0.9 {
        plan.map_transfers(|direction, spec| {
            if direction == target {
                spec.bytes = scale_bytes(spec.bytes, 1.2);
                spec.count = spec.count.saturating_sub(1).max(1);
            }
        })
    } else {
        plan
    }
}

fn probe_seconds(plan: &MeasurementPlan) -> f64 {
    f64::from(plan.latency_packets()) * SECONDS_PER_PACKET
}

fn transfer_seconds(plan: &MeasurementPlan, down_mbps: f64, up_mbps: f64) -> f64 {
    let down_bps = down_mbps.max(MIN_SPEED_MBPS) * 1e6 / 8.0;
    let up_bps = up_mbps.max(MIN_SPEED_MBPS) * 1e6 / 8.0;

    plan.transfers()
        .map(|(direction, spec)| {
            let rate = match direction {
                Direction::Download => down_bps,
                Direction::Upload => up_bps,
            };
            spec.total_bytes() as f64 / rate
        })
        .sum()
}

/// Estimated run time of `plan` in seconds at the given speeds.
///
/// Speeds below 0.1 Mbps are treated as 0.1 Mbps.
pub fn estimate_duration(
    plan: &MeasurementPlan,
    down_mbps: f64,
    up_mbps: f64,
) -> f64 {
    (transfer_seconds(plan, down_mbps, up_mbps) + probe_seconds(plan))
        * OVERHEAD_FACTOR
}

/// Shrink every transfer by `factor`.
///
/// Above a factor of 2 both size and count shrink by `sqrt(factor)`,
/// otherwise only the size shrinks. Sizes never fall below
/// [`MIN_TRANSFER_BYTES`] and counts never below 1.
pub fn scale_down(plan: MeasurementPlan, factor: f64) -> MeasurementPlan {
    if !(factor > 1.0) {
        return plan;
    }

    plan.map_transfers(|_, spec| {
        if factor > 2.0 {
            let root = factor.sqrt();
            spec.bytes = (spec.bytes as f64 / root).floor() as u64;
            spec.count = ((f64::from(spec.count) / root).floor() as u32).max(1);
        } else {
            spec.bytes = (spec.bytes as f64 / factor).floor() as u64;
        }
        spec.bytes = spec.bytes.max(MIN_TRANSFER_BYTES);
        spec.count = spec.count.max(1);
    })
}

/// Shrink the transfer volume by `factor`, moving the reduction onto the
/// count once a transfer's size hits the floor.
fn shrink_volume(plan: MeasurementPlan, factor: f64) -> MeasurementPlan {
    plan.map_transfers(|_, spec| {
        let bytes =
            ((spec.bytes as f64 / factor).floor() as u64).max(MIN_TRANSFER_BYTES);
        let achieved = spec.bytes as f64 / bytes as f64;
        if achieved < factor {
            let remaining = factor / achieved.max(1.0);
            spec.count =
                ((f64::from(spec.count) / remaining).floor() as u32).max(1);
        }
        spec.bytes = bytes.min(spec.bytes).max(MIN_TRANSFER_BYTES);
    })
}

/// Produces plans sized to a time budget.
#[derive(Debug, Clone)]
pub struct PlanGenerator {
    pub budget_secs: f64,
    /// Used instead of the built-in default when the connection is unknown.
    pub fallback: Option<MeasurementPlan>,
}

impl Default for PlanGenerator {
    fn default() -> Self {
        Self { budget_secs: DEFAULT_TIME_BUDGET_SECS, fallback: None }
    }
}

impl PlanGenerator {
    pub fn new(budget_secs: f64, fallback: Option<MeasurementPlan>) -> Self {
        Self { budget_secs, fallback }
    }

    pub fn generate(&self, assessment: &ConnectionAssessment) -> MeasurementPlan {
        let Some(quality) = assessment.quality else {
            return self.fallback.clone().unwrap_or_else(MeasurementPlan::default_good);
        };

        let download_tier = assessment.download_quality.unwrap_or(quality);
        let upload_tier = assessment.upload_quality.unwrap_or(quality);

        let mut operations = vec![Operation::latency(1)];
        operations.extend(download_batches(download_tier));
        operations.push(Operation::latency(20));
        operations.extend(upload_batches(upload_tier));
        let mut plan = MeasurementPlan::from(operations);

        if assessment.sample_size >= 3 {
            plan = fine_tune(plan, assessment);
        }

        self.fit_to_budget(plan, assessment.avg_download_mbps, assessment.avg_upload_mbps)
    }

    /// Scale `plan` down until its estimate fits the budget.
    pub fn fit_to_budget(
        &self,
        plan: MeasurementPlan,
        down_mbps: f64,
        up_mbps: f64,
    ) -> MeasurementPlan {
        let estimate = estimate_duration(&plan, down_mbps, up_mbps);
        if estimate <= self.budget_secs {
            return plan;
        }

        info!(
            "Test duration estimated at {:.1}s, scaling down to fit {:.0}s",
            estimate, self.budget_secs
        );
        let mut plan = scale_down(plan, estimate / self.budget_secs);

        // Latency probes do not scale, so budget the transfers on their own.
        let probe_budget = probe_seconds(&plan) * OVERHEAD_FACTOR;
        let transfer_budget = self.budget_secs - probe_budget;

        for pass in 0..MAX_REFINEMENT_PASSES {
            let estimate = estimate_duration(&plan, down_mbps, up_mbps);
            if estimate <= self.budget_secs || transfer_budget <= 0.0 {
                return plan;
            }

            let transfer_estimate =
                transfer_seconds(&plan, down_mbps, up_mbps) * OVERHEAD_FACTOR;
            let factor = transfer_estimate / transfer_budget;
            debug!("Refinement pass {}: shrinking transfers by {:.2}", pass + 1, factor);
            plan = shrink_volume(plan, factor);
        }

        if estimate_duration(&plan, down_mbps, up_mbps) > self.budget_secs {
            plan = plan.map_transfers(|_, spec| {
                spec.bytes = MIN_TRANSFER_BYTES;
                spec.count = 1;
            });
        }

        plan
    }
}

/// Decide whether a new assessment should replace the current plan.
pub fn should_update(
    new: &ConnectionAssessment,
    previous: Option<&ConnectionAssessment>,
) -> bool {
    let Some(previous) = previous else {
        return true;
    };

    if new.sample_size == 0 {
        return false;
    }

    if new.failure_rate > previous.failure_rate + 0.1 {
        return true;
    }

    if new.failed_tests > 0 && new.quality.is_some_and(|q| q.is_extreme()) {
        return true;
    }

    if new.quality != previous.quality
        || new.download_quality != previous.download_quality
        || new.upload_quality != previous.upload_quality
    {
        return true;
    }

    let relative_change = |now: f64, before: f64| {
        (now - before).abs() / before.max(MIN_SPEED_MBPS)
    };
    if relative_change(new.avg_download_mbps, previous.avg_download_mbps) > 0.25
        || relative_change(new.avg_upload_mbps, previous.avg_upload_mbps) > 0.25
    {
        return true;
    }

    if let (Some(now), Some(before)) = (new.consistency, previous.consistency) {
        if (now - before).abs() > 0.15 {
            return true;
        }
    }

    (new.failure_rate - previous.failure_rate).abs() > 0.1
}

/// Totals and a one-line description of a plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSummary {
    pub summary: String,
    pub details: Vec<String>,
    pub quality: Option<Tier>,
    pub download_quality: Option<Tier>,
    pub upload_quality: Option<Tier>,
    pub total_download_bytes: u64,
    pub total_upload_bytes: u64,
    pub latency_packets: u32,
    pub download_tests: usize,
    pub upload_tests: usize,
    pub latency_tests: usize,
    pub estimated_duration_secs: Option<f64>,
}

pub fn format_bytes(bytes: u64) -> String {
    let b = bytes as f64;
    if b >= 1e9 {
        format!("{:.1}GB", b / 1e9)
    } else if b >= 1e6 {
        format!("{:.1}MB", b / 1e6)
    } else if b >= 1e3 {
        format!("{:.0}KB", b / 1e3)
    } else {
        format!("{}B", bytes)
    }
}

/// Describe `plan` in the context of the assessment it was built from.
pub fn describe(
    plan: &MeasurementPlan,
    assessment: Option<&ConnectionAssessment>,
) -> PlanSummary {
    let mut download_tests = 0;
    let mut upload_tests = 0;
    let mut total_download_bytes = 0u64;
    let mut total_upload_bytes = 0u64;

    for (direction, spec) in plan.transfers() {
        match direction {
            Direction::Download => {
                download_tests += 1;
                total_download_bytes += spec.total_bytes();
            }
            Direction::Upload => {
                upload_tests += 1;
                total_upload_bytes += spec.total_bytes();
            }
        }
    }
    let latency_tests = plan.len() - download_tests - upload_tests;

    let quality = assessment.and_then(|a| a.quality);
    let download_quality = assessment.and_then(|a| a.download_quality);
    let upload_quality = assessment.and_then(|a| a.upload_quality);

    let estimated_duration_secs = assessment
        .filter(|a| a.avg_download_mbps > 0.0)
        .map(|a| estimate_duration(plan, a.avg_download_mbps, a.avg_upload_mbps));

    let counts = format!(
        "{} download, {} upload, {} latency tests",
        download_tests, upload_tests, latency_tests
    );
    let summary = if plan.is_empty() {
        "No test configuration".to_string()
    } else {
        match (download_quality, upload_quality) {
            (Some(down), Some(up)) if down != up => {
                format!("{} Down / {} Up - {}", down.label(), up.label(), counts)
            }
            _ => {
                let label = quality.map(|q| q.label()).unwrap_or("Unknown");
                format!("{} Connection - {}", label, counts)
            }
        }
    };

    let mut details = vec![
        format!("Total download data: {}", format_bytes(total_download_bytes)),
        format!("Total upload data: {}", format_bytes(total_upload_bytes)),
        format!("Latency packets: {}", plan.latency_packets()),
    ];
    if let Some(secs) = estimated_duration_secs {
        details.push(format!("Estimated duration: {:.0} seconds", secs));
    }
    match assessment {
        Some(a) if !a.is_unknown() => {
            details.push(format!("Based on {} recent tests", a.sample_size))
        }
        _ => details.push("Using default configuration".to_string()),
    }

    PlanSummary {
        summary,
        details,
        quality,
        download_quality,
        upload_quality,
        total_download_bytes,
        total_upload_bytes,
        latency_packets: plan.latency_packets(),
        download_tests,
        upload_tests,
        latency_tests,
        estimated_duration_secs,
    }
}
