//! Test outcomes and the sessions that group them.
//!
//! A [`TestOutcome`] is immutable once built and always carries exactly one
//! of a result or an error. A [`Session`] only accepts new outcomes while it
//! is active and never drops one.

use crate::clock;
use crate::errors::MonitorError;
use crate::location::Position;
use crate::plan::MeasurementPlan;
use crate::stats::mean;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// The six measurements every successful test must produce.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResults {
    /// Bits per second.
    pub download_bandwidth: f64,
    /// Bits per second.
    pub upload_bandwidth: f64,
    pub unloaded_latency: f64,
    pub unloaded_jitter: f64,
    pub download_loaded_latency: f64,
    pub upload_loaded_latency: f64,
}

/// A results record as reported by an engine or read back from storage,
/// before the mandatory fields have been checked.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawResults {
    #[serde(default)]
    pub download_bandwidth: Option<f64>,
    #[serde(default)]
    pub upload_bandwidth: Option<f64>,
    #[serde(default)]
    pub unloaded_latency: Option<f64>,
    #[serde(default)]
    pub unloaded_jitter: Option<f64>,
    #[serde(default)]
    pub download_loaded_latency: Option<f64>,
    #[serde(default)]
    pub upload_loaded_latency: Option<f64>,
}

impl TryFrom<RawResults> for TestResults {
    type Error = MonitorError;

    fn try_from(raw: RawResults) -> Result<Self, Self::Error> {
        let fields = [
            ("downloadBandwidth", raw.download_bandwidth),
            ("downloadLoadedLatency", raw.download_loaded_latency),
            ("unloadedLatency", raw.unloaded_latency),
            ("unloadedJitter", raw.unloaded_jitter),
            ("uploadBandwidth", raw.upload_bandwidth),
            ("uploadLoadedLatency", raw.upload_loaded_latency),
        ];

        let missing: Vec<&str> = fields
            .iter()
            .filter(|(_, value)| value.is_none())
            .map(|(name, _)| *name)
            .collect();

        if !missing.is_empty() {
            return Err(MonitorError::invalid_result(format!(
                "Missing required properties: {}",
                missing.join(", ")
            )));
        }

        Ok(TestResults {
            download_bandwidth: raw.download_bandwidth.unwrap_or_default(),
            upload_bandwidth: raw.upload_bandwidth.unwrap_or_default(),
            unloaded_latency: raw.unloaded_latency.unwrap_or_default(),
            unloaded_jitter: raw.unloaded_jitter.unwrap_or_default(),
            download_loaded_latency: raw
                .download_loaded_latency
                .unwrap_or_default(),
            upload_loaded_latency: raw.upload_loaded_latency.unwrap_or_default(),
        })
    }
}

impl From<TestResults> for RawResults {
    fn from(results: TestResults) -> Self {
        RawResults {
            download_bandwidth: Some(results.download_bandwidth),
            upload_bandwidth: Some(results.upload_bandwidth),
            unloaded_latency: Some(results.unloaded_latency),
            unloaded_jitter: Some(results.unloaded_jitter),
            download_loaded_latency: Some(results.download_loaded_latency),
            upload_loaded_latency: Some(results.upload_loaded_latency),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Outcome {
    Succeeded(TestResults),
    Failed(String),
}

/// One completed (or terminally failed) speed test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TestOutcomeRecord", into = "TestOutcomeRecord")]
pub struct TestOutcome {
    id: String,
    started_at: i64,
    ended_at: i64,
    location: Option<Position>,
    outcome: Outcome,
}

impl TestOutcome {
    /// Build a successful outcome, validating the result record.
    pub fn success(
        started_at: i64,
        ended_at: i64,
        location: Option<Position>,
        results: RawResults,
    ) -> Result<Self, MonitorError> {
        let results = TestResults::try_from(results)?;
        Self::build(
            new_id(),
            started_at,
            ended_at,
            location,
            Outcome::Succeeded(results),
        )
    }

    pub fn failure(
        started_at: i64,
        ended_at: i64,
        location: Option<Position>,
        error: impl Into<String>,
    ) -> Result<Self, MonitorError> {
        let error = error.into();
        let error =
            if error.is_empty() { "Unknown error".to_string() } else { error };
        Self::build(
            new_id(),
            started_at,
            ended_at,
            location,
            Outcome::Failed(error),
        )
    }

    fn build(
        id: String,
        started_at: i64,
        ended_at: i64,
        location: Option<Position>,
        outcome: Outcome,
    ) -> Result<Self, MonitorError> {
        if ended_at < started_at {
            return Err(MonitorError::invalid_result(format!(
                "test {} ends ({}) before it starts ({})",
                id, ended_at, started_at
            )));
        }

        Ok(Self { id, started_at, ended_at, location, outcome })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn started_at(&self) -> i64 {
        self.started_at
    }

    pub fn ended_at(&self) -> i64 {
        self.ended_at
    }

    pub fn duration_ms(&self) -> i64 {
        self.ended_at - self.started_at
    }

    pub fn location(&self) -> Option<&Position> {
        self.location.as_ref()
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, Outcome::Succeeded(_))
    }

    pub fn result(&self) -> Option<&TestResults> {
        match &self.outcome {
            Outcome::Succeeded(results) => Some(results),
            Outcome::Failed(_) => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            Outcome::Succeeded(_) => None,
            Outcome::Failed(error) => Some(error),
        }
    }
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Wire form of a [`TestOutcome`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestOutcomeRecord {
    #[serde(default)]
    pub id: Option<String>,
    pub start_timestamp: i64,
    pub end_timestamp: i64,
    #[serde(default)]
    pub location: Option<Position>,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub results: Option<RawResults>,
}

impl TryFrom<TestOutcomeRecord> for TestOutcome {
    type Error = MonitorError;

    fn try_from(record: TestOutcomeRecord) -> Result<Self, Self::Error> {
        let id = record.id.filter(|id| !id.is_empty()).unwrap_or_else(new_id);

        // A record is a success only if it has results and no error.
        let outcome = match (record.results, record.error) {
            (Some(results), None) if record.success => {
                Outcome::Succeeded(TestResults::try_from(results)?)
            }
            (_, Some(error)) => Outcome::Failed(error),
            (_, None) => Outcome::Failed("Unknown error".to_string()),
        };

        TestOutcome::build(
            id,
            record.start_timestamp,
            record.end_timestamp,
            record.location,
            outcome,
        )
    }
}

impl From<TestOutcome> for TestOutcomeRecord {
    fn from(outcome: TestOutcome) -> Self {
        let (success, error, results) = match outcome.outcome {
            Outcome::Succeeded(results) => (true, None, Some(results.into())),
            Outcome::Failed(error) => (false, Some(error), None),
        };

        TestOutcomeRecord {
            id: Some(outcome.id),
            start_timestamp: outcome.started_at,
            end_timestamp: outcome.ended_at,
            location: outcome.location,
            success,
            error,
            results,
        }
    }
}

/// Aggregates over a session's outcomes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub total_tests: usize,
    pub successful_tests: usize,
    pub failed_tests: usize,
    /// Bits per second, successes only.
    pub avg_download: f64,
    /// Bits per second, successes only.
    pub avg_upload: f64,
    /// Milliseconds, successes only.
    pub avg_latency: f64,
    /// Milliseconds.
    pub duration: i64,
}

/// A named, time-bounded grouping of test outcomes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SessionRecord", into = "SessionRecord")]
pub struct Session {
    id: String,
    name: String,
    description: String,
    start_time: i64,
    end_time: Option<i64>,
    is_active: bool,
    test_interval_ms: u64,
    measurements: MeasurementPlan,
    test_runs: HashMap<String, TestOutcome>,
}

impl Session {
    /// A new, inactive session. Call [`Session::start`] to open it.
    pub fn new(
        name: Option<String>,
        description: Option<String>,
        test_interval_ms: u64,
        measurements: MeasurementPlan,
        now: i64,
    ) -> Self {
        let name = name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| {
                format!("Session {}", clock::to_local_display(now))
            });

        Self {
            id: new_id(),
            name,
            description: description.unwrap_or_default(),
            start_time: now,
            end_time: None,
            is_active: false,
            test_interval_ms,
            measurements,
            test_runs: HashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn start_time(&self) -> i64 {
        self.start_time
    }

    pub fn end_time(&self) -> Option<i64> {
        self.end_time
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn test_interval_ms(&self) -> u64 {
        self.test_interval_ms
    }

    pub fn measurements(&self) -> &MeasurementPlan {
        &self.measurements
    }

    pub fn start(&mut self, now: i64) {
        self.is_active = true;
        self.start_time = now;
        self.end_time = None;
    }

    pub fn stop(&mut self, now: i64) {
        self.is_active = false;
        self.end_time = Some(now);
    }

    pub fn add_test_run(
        &mut self,
        outcome: TestOutcome,
    ) -> Result<(), MonitorError> {
        if !self.is_active {
            return Err(MonitorError::session(format!(
                "session {} is not active",
                self.id
            )));
        }

        if self.test_runs.contains_key(outcome.id()) {
            return Err(MonitorError::session(format!(
                "test {} is already recorded in session {}",
                outcome.id(),
                self.id
            )));
        }

        self.test_runs.insert(outcome.id().to_string(), outcome);
        Ok(())
    }

    /// All outcomes, oldest start first.
    pub fn all_test_runs(&self) -> Vec<&TestOutcome> {
        let mut runs: Vec<&TestOutcome> = self.test_runs.values().collect();
        runs.sort_by_key(|run| run.started_at());
        runs
    }

    /// The `n` most recent outcomes, newest start first.
    pub fn last_n(&self, n: usize) -> Vec<&TestOutcome> {
        let mut runs: Vec<&TestOutcome> = self.test_runs.values().collect();
        runs.sort_by_key(|run| std::cmp::Reverse(run.started_at()));
        runs.truncate(n);
        runs
    }

    pub fn count(&self) -> usize {
        self.test_runs.len()
    }

    pub fn stats(&self, now: i64) -> SessionStats {
        let successes: Vec<&TestResults> =
            self.test_runs.values().filter_map(|run| run.result()).collect();

        let average = |f: fn(&TestResults) -> f64| {
            let values: Vec<f64> = successes.iter().map(|r| f(r)).collect();
            mean(&values).unwrap_or(0.0)
        };

        SessionStats {
            total_tests: self.test_runs.len(),
            successful_tests: successes.len(),
            failed_tests: self.test_runs.len() - successes.len(),
            avg_download: average(|r| r.download_bandwidth),
            avg_upload: average(|r| r.upload_bandwidth),
            avg_latency: average(|r| r.unloaded_latency),
            duration: self.end_time.unwrap_or(now) - self.start_time,
        }
    }
}

/// Wire form of a [`Session`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub start_time: i64,
    #[serde(default)]
    pub end_time: Option<i64>,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub test_interval: u64,
    #[serde(default)]
    pub measurements: MeasurementPlan,
    #[serde(default)]
    pub test_runs: Vec<TestOutcome>,
}

impl TryFrom<SessionRecord> for Session {
    type Error = MonitorError;

    fn try_from(record: SessionRecord) -> Result<Self, Self::Error> {
        if record.id.is_empty() {
            return Err(MonitorError::invalid_result("session without an id"));
        }

        let test_runs = record
            .test_runs
            .into_iter()
            .map(|run| (run.id().to_string(), run))
            .collect();

        Ok(Session {
            id: record.id,
            name: record.name,
            description: record.description,
            start_time: record.start_time,
            end_time: record.end_time,
            is_active: record.is_active,
            test_interval_ms: record.test_interval,
            measurements: record.measurements,
            test_runs,
        })
    }
}

impl From<Session> for SessionRecord {
    fn from(session: Session) -> Self {
        let mut test_runs: Vec<TestOutcome> =
            session.test_runs.into_values().collect();
        test_runs.sort_by_key(|run| run.started_at());

        SessionRecord {
            id: session.id,
            name: session.name,
            description: session.description,
            start_time: session.start_time,
            end_time: session.end_time,
            is_active: session.is_active,
            test_interval: session.test_interval_ms,
            measurements: session.measurements,
            test_runs,
        }
    }
}
