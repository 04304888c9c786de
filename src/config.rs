//! Monitor tunables and their command-line mapping.

use crate::analyzer::{DEFAULT_MAX_AGE_MS, DEFAULT_WINDOW_SIZE};
use crate::errors::MonitorError;
use crate::location::Position;
use crate::plan::{MeasurementPlan, DEFAULT_TIME_BUDGET_SECS};
use crate::resilience::DEFAULT_BASE_TIMEOUT;
use crate::retry::{RetryConfig, DEFAULT_MAX_RETRIES};
use crate::storage::DEFAULT_RETENTION_MS;
use clap::Args;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_TEST_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Gap between test starts; zero runs tests back to back.
    pub test_interval: Duration,
    /// Minimum gap between test starts in continuous mode.
    pub continuous_gap: Duration,
    pub tick: Duration,
    pub window_size: usize,
    pub window_max_age_ms: i64,
    pub time_budget_secs: f64,
    pub retry: RetryConfig,
    pub base_timeout: Duration,
    /// Low-memory or battery-constrained device.
    pub constrained: bool,
    /// Ticks between session integrity checks.
    pub integrity_check_every: u64,
    /// Ticks between reachability probes.
    pub reachability_every: u64,
    /// How many recent errors are kept for display.
    pub error_capacity: usize,
    pub retention_ms: i64,
    pub fallback_plan: Option<MeasurementPlan>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            test_interval: DEFAULT_TEST_INTERVAL,
            continuous_gap: Duration::from_secs(2),
            tick: Duration::from_secs(1),
            window_size: DEFAULT_WINDOW_SIZE,
            window_max_age_ms: DEFAULT_MAX_AGE_MS,
            time_budget_secs: DEFAULT_TIME_BUDGET_SECS,
            retry: RetryConfig::default(),
            base_timeout: DEFAULT_BASE_TIMEOUT,
            constrained: false,
            integrity_check_every: 30,
            reachability_every: 30,
            error_capacity: 5,
            retention_ms: DEFAULT_RETENTION_MS,
            fallback_plan: None,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct MonitorArgs {
    /// Seconds between test starts (0 = continuous)
    #[arg(short, long, default_value_t = DEFAULT_TEST_INTERVAL.as_secs())]
    pub interval: u64,

    /// Session name (defaults to the start time)
    #[arg(short, long)]
    pub name: Option<String>,

    /// Free-form session description
    #[arg(short, long)]
    pub description: Option<String>,

    /// Use shorter timeouts suited to constrained devices
    #[arg(long)]
    pub constrained: bool,

    /// Fixed position attached to every test, as LAT,LON
    #[arg(long, value_name = "LAT,LON", value_parser = parse_position)]
    pub position: Option<(f64, f64)>,

    /// JSON measurement plan used while the connection is unknown
    #[arg(long, value_name = "FILE")]
    pub plan_file: Option<PathBuf>,

    /// Number of recent tests the connection analysis looks at
    #[arg(long, default_value_t = DEFAULT_WINDOW_SIZE)]
    pub window: usize,

    /// Per-attempt timeout in seconds before network scaling
    #[arg(long, default_value_t = DEFAULT_BASE_TIMEOUT.as_secs())]
    pub timeout: u64,

    /// Retries after a failed attempt
    #[arg(long, default_value_t = DEFAULT_MAX_RETRIES)]
    pub retries: u32,
}

impl MonitorArgs {
    pub fn fixed_position(&self, now: i64) -> Option<Position> {
        self.position
            .map(|(latitude, longitude)| Position::new(latitude, longitude, 0.0, now))
    }
}

impl TryFrom<&MonitorArgs> for MonitorConfig {
    type Error = MonitorError;

    fn try_from(args: &MonitorArgs) -> Result<Self, Self::Error> {
        if args.window == 0 {
            return Err(MonitorError::config("--window must be at least 1"));
        }
        if args.timeout == 0 {
            return Err(MonitorError::config("--timeout must be at least 1 second"));
        }

        let fallback_plan = args.plan_file.as_deref().map(load_plan).transpose()?;

        Ok(Self {
            test_interval: Duration::from_secs(args.interval),
            window_size: args.window,
            base_timeout: Duration::from_secs(args.timeout),
            constrained: args.constrained,
            retry: RetryConfig { max_retries: args.retries, ..RetryConfig::default() },
            fallback_plan,
            ..Self::default()
        })
    }
}

/// Reads a measurement plan from a JSON file.
pub fn load_plan(path: &Path) -> Result<MeasurementPlan, MonitorError> {
    let text = fs::read_to_string(path).map_err(|e| {
        MonitorError::config(format!("Cannot read plan file {}", path.display()))
            .with_source(e)
    })?;

    let plan: MeasurementPlan = serde_json::from_str(&text).map_err(|e| {
        MonitorError::config(format!("Invalid plan file {}: {}", path.display(), e))
            .with_source(e)
    })?;

    if plan.is_empty() {
        return Err(MonitorError::config(format!(
            "Plan file {} contains no operations",
            path.display()
        )));
    }
    Ok(plan)
}

fn parse_position(value: &str) -> Result<(f64, f64), String> {
    let (lat, lon) = value
        .split_once(',')
        .ok_or_else(|| format!("expected LAT,LON but got '{}'", value))?;
    let lat: f64 = lat.trim().parse().map_err(|_| format!("invalid latitude '{}'", lat))?;
    let lon: f64 = lon.trim().parse().map_err(|_| format!("invalid longitude '{}'", lon))?;

    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return Err(format!("position '{}' is out of range", value));
    }
    Ok((lat, lon))
}
