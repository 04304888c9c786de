//! Tabular and JSON exports of recorded outcomes.

use crate::clock::to_iso;
use crate::errors::MonitorError;
use crate::session::{Session, TestOutcome};
use chrono::{Days, NaiveDate, NaiveTime};
use log::debug;
use serde::Serialize;
use std::collections::HashSet;
use std::io::Write;

/// An inclusive range of UTC calendar days.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, MonitorError> {
        if end < start {
            return Err(MonitorError::config(format!(
                "Export range ends ({}) before it starts ({})",
                end, start
            )));
        }
        Ok(Self { start, end })
    }

    /// The week ending on `today`.
    pub fn last_week(today: NaiveDate) -> Self {
        let start = today.checked_sub_days(Days::new(7)).unwrap_or(today);
        Self { start, end: today }
    }

    /// Whether a timestamp (ms since epoch) falls on one of the days.
    pub fn contains(&self, ms: i64) -> bool {
        let from = self.start.and_time(NaiveTime::MIN).and_utc().timestamp_millis();
        let until = self
            .end
            .checked_add_days(Days::new(1))
            .map(|next| next.and_time(NaiveTime::MIN).and_utc().timestamp_millis())
            .unwrap_or(i64::MAX);
        ms >= from && ms < until
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExportFilter {
    pub range: Option<DateRange>,
    pub include_failed: bool,
}

/// Outcomes across `sessions` that pass the filter, oldest first.
///
/// An outcome present in more than one session (a re-imported copy, say)
/// is listed once.
pub fn select_outcomes<'a>(
    sessions: &'a [Session],
    filter: &ExportFilter,
) -> Vec<&'a TestOutcome> {
    let mut seen = HashSet::new();
    let mut outcomes: Vec<&TestOutcome> = sessions
        .iter()
        .flat_map(Session::all_test_runs)
        .filter(|o| filter.include_failed || o.succeeded())
        .filter(|o| filter.range.map_or(true, |r| r.contains(o.started_at())))
        .filter(|o| seen.insert(o.id().to_string()))
        .collect();
    outcomes.sort_by_key(|o| o.started_at());
    outcomes
}

/// One spreadsheet row per outcome.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CsvRow {
    #[serde(rename = "Test ID")]
    pub test_id: String,
    #[serde(rename = "Start Time")]
    pub start_time: String,
    #[serde(rename = "End Time")]
    pub end_time: String,
    #[serde(rename = "Duration (seconds)")]
    pub duration_secs: i64,
    #[serde(rename = "Success")]
    pub success: &'static str,
    #[serde(rename = "Error")]
    pub error: String,
    #[serde(rename = "Download Speed (Mbps)")]
    pub download_mbps: String,
    #[serde(rename = "Upload Speed (Mbps)")]
    pub upload_mbps: String,
    #[serde(rename = "Latency (ms)")]
    pub latency_ms: String,
    #[serde(rename = "Jitter (ms)")]
    pub jitter_ms: String,
    #[serde(rename = "Download Loaded Latency (ms)")]
    pub download_loaded_latency_ms: String,
    #[serde(rename = "Upload Loaded Latency (ms)")]
    pub upload_loaded_latency_ms: String,
    #[serde(rename = "Latitude")]
    pub latitude: Option<f64>,
    #[serde(rename = "Longitude")]
    pub longitude: Option<f64>,
    #[serde(rename = "Altitude (m)")]
    pub altitude: Option<f64>,
    #[serde(rename = "Accuracy (m)")]
    pub accuracy: Option<f64>,
    #[serde(rename = "Speed (m/s)")]
    pub speed: Option<f64>,
    #[serde(rename = "Heading (degrees)")]
    pub heading: Option<f64>,
    #[serde(rename = "Location Timestamp")]
    pub location_timestamp: String,
}

fn two_places(value: f64) -> String {
    format!("{:.2}", value)
}

impl From<&TestOutcome> for CsvRow {
    fn from(outcome: &TestOutcome) -> Self {
        let result = outcome.result();
        let metric = |f: fn(&crate::session::TestResults) -> f64| {
            result.map(|r| two_places(f(r))).unwrap_or_default()
        };
        let location = outcome.location();

        CsvRow {
            test_id: outcome.id().to_string(),
            start_time: to_iso(outcome.started_at()),
            end_time: to_iso(outcome.ended_at()),
            duration_secs: (outcome.duration_ms() as f64 / 1000.0).round() as i64,
            success: if outcome.succeeded() { "Yes" } else { "No" },
            error: outcome.error().unwrap_or_default().to_string(),
            download_mbps: metric(|r| r.download_bandwidth / 1_000_000.0),
            upload_mbps: metric(|r| r.upload_bandwidth / 1_000_000.0),
            latency_ms: metric(|r| r.unloaded_latency),
            jitter_ms: metric(|r| r.unloaded_jitter),
            download_loaded_latency_ms: metric(|r| r.download_loaded_latency),
            upload_loaded_latency_ms: metric(|r| r.upload_loaded_latency),
            latitude: location.map(|p| p.latitude),
            longitude: location.map(|p| p.longitude),
            altitude: location.and_then(|p| p.altitude),
            accuracy: location.map(|p| p.accuracy),
            speed: location.and_then(|p| p.speed),
            heading: location.and_then(|p| p.heading),
            location_timestamp: location.map(|p| to_iso(p.timestamp)).unwrap_or_default(),
        }
    }
}

/// Writes one row per outcome, preceded by the header row when there is at
/// least one outcome. Returns the row count.
pub fn write_csv<W: Write>(
    writer: W,
    outcomes: &[&TestOutcome],
) -> Result<usize, MonitorError> {
    let csv_error = |e: csv::Error| {
        MonitorError::storage(format!("Failed to write CSV: {}", e)).with_source(e)
    };

    let mut csv = csv::Writer::from_writer(writer);
    for outcome in outcomes {
        csv.serialize(CsvRow::from(*outcome)).map_err(csv_error)?;
    }
    csv.flush()?;

    debug!("Wrote {} CSV rows", outcomes.len());
    Ok(outcomes.len())
}

pub fn csv_file_name(range: &DateRange) -> String {
    format!("network-speed-tests-{}-to-{}.csv", range.start, range.end)
}

/// Pretty JSON of a whole session, including its plan.
pub fn session_json(session: &Session) -> Result<String, MonitorError> {
    Ok(serde_json::to_string_pretty(session)?)
}

/// `session-<slug>-<date>.json`, with every non-alphanumeric character of
/// the name replaced by `_`.
pub fn session_file_name(session: &Session, today: NaiveDate) -> String {
    let slug: String = session
        .name()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    format!("session-{}-{}.json", slug, today)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::Position;
    use crate::plan::MeasurementPlan;
    use crate::session::fixtures::{failure_at, results, success_at};

    /// 2024-03-10T12:00:00Z
    const NOON: i64 = 1_710_072_000_000;
    const DAY: i64 = 86_400_000;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn session_with(outcomes: Vec<TestOutcome>) -> Session {
        let mut session =
            Session::new(Some("Train ride #4".into()), None, 0, MeasurementPlan::default(), NOON);
        session.start(NOON - 10 * DAY);
        for outcome in outcomes {
            session.add_test_run(outcome).unwrap();
        }
        session
    }

    #[test]
    fn test_date_range_is_inclusive() {
        let range = DateRange::new(date("2024-03-10"), date("2024-03-10")).unwrap();
        assert!(range.contains(NOON));
        assert!(range.contains(NOON - 12 * 3_600_000));
        assert!(!range.contains(NOON + 12 * 3_600_000));
        assert!(!range.contains(NOON - 12 * 3_600_000 - 1));

        assert!(DateRange::new(date("2024-03-10"), date("2024-03-09")).is_err());
        assert_eq!(DateRange::last_week(date("2024-03-10")).start, date("2024-03-03"));
    }

    #[test]
    fn test_select_outcomes_filters() {
        let session = session_with(vec![
            success_at(NOON, 50.0, 10.0, 20.0),
            failure_at(NOON - DAY),
            success_at(NOON - 5 * DAY, 50.0, 10.0, 20.0),
        ]);
        let sessions = vec![session.clone(), session];

        let all = select_outcomes(
            &sessions,
            &ExportFilter { range: None, include_failed: true },
        );
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].started_at() <= w[1].started_at()));

        let recent_successes = select_outcomes(
            &sessions,
            &ExportFilter {
                range: Some(DateRange::new(date("2024-03-08"), date("2024-03-10")).unwrap()),
                include_failed: false,
            },
        );
        assert_eq!(recent_successes.len(), 1);
        assert_eq!(recent_successes[0].started_at(), NOON);
    }

    #[test]
    fn test_csv_row_for_success_with_location() {
        let mut position = Position::new(52.37, 4.89, 12.0, NOON);
        position.speed = Some(27.5);
        let outcome =
            TestOutcome::success(NOON, NOON + 12_600, Some(position), results(48.5, 9.25, 21.0))
                .unwrap();

        let row = CsvRow::from(&outcome);
        assert_eq!(row.start_time, "2024-03-10T12:00:00.000Z");
        assert_eq!(row.duration_secs, 13);
        assert_eq!(row.success, "Yes");
        assert_eq!(row.download_mbps, "48.50");
        assert_eq!(row.upload_mbps, "9.25");
        assert_eq!(row.latency_ms, "21.00");
        assert_eq!(row.latitude, Some(52.37));
        assert_eq!(row.speed, Some(27.5));
        assert_eq!(row.heading, None);
        assert_eq!(row.location_timestamp, "2024-03-10T12:00:00.000Z");
    }

    #[test]
    fn test_write_csv() {
        let failed = failure_at(NOON);
        let mut buffer = Vec::new();
        let rows = write_csv(&mut buffer, &[&failed]).unwrap();
        assert_eq!(rows, 1);

        let text = String::from_utf8(buffer).unwrap();
        let mut lines = text.lines();
        let header = lines.next().unwrap();
        assert!(header.starts_with("Test ID,Start Time,End Time,Duration (seconds),Success,Error,"));
        assert!(header.ends_with("Heading (degrees),Location Timestamp"));

        let row = lines.next().unwrap();
        assert!(row.contains(",5,No,timed out,,,,,,,,,,,,,"));
    }

    #[test]
    fn test_write_csv_without_outcomes_is_empty() {
        let mut buffer = Vec::new();
        assert_eq!(write_csv(&mut buffer, &[]).unwrap(), 0);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_session_exports() {
        let session = session_with(vec![success_at(NOON, 50.0, 10.0, 20.0)]);
        assert_eq!(
            session_file_name(&session, date("2024-03-10")),
            "session-train_ride__4-2024-03-10.json"
        );

        let json = session_json(&session).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["name"], "Train ride #4");
        assert!(value["measurements"].is_array());
        assert_eq!(value["testRuns"].as_array().map(Vec::len), Some(1));

        let range = DateRange::last_week(date("2024-03-10"));
        assert_eq!(csv_file_name(&range), "network-speed-tests-2024-03-03-to-2024-03-10.csv");
    }
}
