extern crate clap;

mod analyzer;
mod clock;
mod cloudflare;
mod config;
mod engine;
mod errors;
mod export;
mod location;
mod monitor;
mod plan;
mod quality;
mod resilience;
mod retry;
mod scoring;
mod session;
mod stats;
mod storage;

use crate::analyzer::{analyze, recent_window, ConnectionAssessment};
use crate::clock::{to_local_display, Clock, SystemClock};
use crate::cloudflare::{Client, CloudflareEngine};
use crate::config::{MonitorArgs, MonitorConfig};
use crate::errors::{exit_codes, format_error_for_display, MonitorError};
use crate::export::{DateRange, ExportFilter};
use crate::monitor::{Monitor, MonitorEvent, MonitorObserver};
use crate::plan::{describe, PlanGenerator, PlanSummary};
use crate::scoring::Grade;
use crate::session::{Session, TestOutcome};
use crate::storage::{FileStore, SessionStorage};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use colored::{ColoredString, Colorize};
use log::info;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (rev ",
    env!("ROVING_SPEED_BUILD_GIT_HASH"),
    ")"
);

#[derive(Parser)]
#[command(author, version, long_version = LONG_VERSION, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory holding saved sessions
    #[arg(long, global = true, default_value = ".roving-speed")]
    data_dir: PathBuf,

    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

#[derive(Subcommand)]
enum Command {
    /// Run speed tests repeatedly until interrupted
    Monitor(MonitorArgs),
    /// List saved sessions
    Sessions,
    /// Show one session and its tests
    Show { id: String },
    /// Assess recent tests and print the plan the next test would use
    Plan {
        /// Number of recent tests to analyze
        #[arg(long, default_value_t = analyzer::DEFAULT_WINDOW_SIZE)]
        window: usize,
        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },
    /// Export saved tests
    Export {
        #[command(subcommand)]
        format: ExportFormat,
    },
    /// Import sessions from a JSON export
    Import { file: PathBuf },
    /// Delete every saved session
    Clear {
        /// Confirm deletion
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum ExportFormat {
    /// One CSV row per test
    Csv {
        /// First day to include (YYYY-MM-DD, UTC); defaults to a week ago
        #[arg(long)]
        from: Option<NaiveDate>,
        /// Last day to include (YYYY-MM-DD, UTC); defaults to today
        #[arg(long)]
        to: Option<NaiveDate>,
        /// Include tests from every day
        #[arg(long, conflicts_with_all = ["from", "to"])]
        all: bool,
        /// Include failed tests
        #[arg(long)]
        include_failed: bool,
        /// Output file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Sessions as JSON, including their plans
    Json {
        /// Sessions to export; all when omitted
        #[arg(long = "session", value_name = "ID")]
        sessions: Vec<String>,
        /// Output file; stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(cli.verbose.log_level_filter())
        .parse_default_env()
        .init();

    let code = match run(cli).await {
        Ok(()) => exit_codes::SUCCESS,
        Err(e) => {
            eprintln!("{}", format_error_for_display(&e).red());
            e.exit_code()
        }
    };

    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), MonitorError> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let storage = SessionStorage::new(FileStore::open(&cli.data_dir)?, clock.clone());

    match cli.command {
        Command::Monitor(args) => run_monitor(args, storage, clock).await,
        Command::Sessions => list_sessions(&storage),
        Command::Show { id } => show_session(&storage, &id, clock.now_ms()),
        Command::Plan { window, json } => show_plan(&storage, window, json, clock.now_ms()),
        Command::Export { format } => match format {
            ExportFormat::Csv { from, to, all, include_failed, output } => {
                let today = Utc::now().date_naive();
                let range = if all {
                    None
                } else {
                    let default = DateRange::last_week(today);
                    Some(DateRange::new(
                        from.unwrap_or(default.start),
                        to.unwrap_or(default.end),
                    )?)
                };
                export_csv(&storage, ExportFilter { range, include_failed }, output)
            }
            ExportFormat::Json { sessions, output } => {
                export_json(&storage, &sessions, output)
            }
        },
        Command::Import { file } => {
            let text = fs::read_to_string(&file).map_err(|e| {
                MonitorError::config(format!("Cannot read {}", file.display())).with_source(e)
            })?;
            let count = storage.import_json(&text)?;
            println!("{} {} sessions", "Imported".bold().green(), count);
            Ok(())
        }
        Command::Clear { yes } => {
            if !yes {
                return Err(MonitorError::config("Refusing to delete sessions")
                    .with_suggestion("Pass --yes to confirm."));
            }
            let removed = storage.clear_all()?;
            println!("{} {} sessions", "Removed".bold().yellow(), removed);
            Ok(())
        }
    }
}

async fn run_monitor(
    args: MonitorArgs,
    storage: SessionStorage<FileStore>,
    clock: Arc<dyn Clock>,
) -> Result<(), MonitorError> {
    let config = MonitorConfig::try_from(&args)?;
    let storage = storage.with_retention(config.retention_ms);
    let engine = CloudflareEngine::new(Client::new()?);

    let (publisher, positions) = location::channel();
    if let Some(position) = args.fixed_position(clock.now_ms()) {
        publisher.publish(position);
    }

    let mut monitor = Monitor::new(engine, storage, clock.clone(), config)
        .with_location(positions)
        .with_observer(Arc::new(ConsoleObserver));

    monitor.start(args.name, args.description)?;

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Stop requested, finishing up");
            let _ = stop_tx.send(true);
        }
    });

    let result = monitor.run(stop_rx).await;

    if let Some(session) = monitor.session() {
        print_stats(session, clock.now_ms());
    }
    drop(publisher);
    result
}

/// Prints monitor events as they happen.
struct ConsoleObserver;

impl MonitorObserver for ConsoleObserver {
    fn on_event(&self, event: MonitorEvent) {
        match event {
            MonitorEvent::Started { session_id, name } => println!(
                "{} {} {}",
                "Session:".bold().white(),
                name.bright_blue(),
                format!("({})", session_id).dimmed()
            ),
            MonitorEvent::PlanUpdated(summary) => {
                println!("{} {}", "Plan:".bold().white(), summary.summary.yellow())
            }
            MonitorEvent::TestStarted { plan_operations } => println!(
                "{} {} operations",
                "Testing...".bold().white(),
                plan_operations
            ),
            MonitorEvent::OutcomeRecorded(outcome) => print_outcome(&outcome),
            MonitorEvent::Scored(scores) => println!(
                "  {} {}  {} {}  {} {}",
                "Streaming".bold(),
                grade(scores.streaming),
                "Gaming".bold(),
                grade(scores.gaming),
                "Video calls".bold(),
                grade(scores.video_conferencing)
            ),
            MonitorEvent::Error(entry) => println!(
                "{} {}",
                "Error:".bold().red(),
                entry.message.red()
            ),
            MonitorEvent::Offline => {
                println!("{}", "Network offline, tests paused".bold().red())
            }
            MonitorEvent::Online => println!("{}", "Network back online".bold().green()),
            MonitorEvent::SessionRecreated { session_id } => println!(
                "{} {}",
                "Session recreated:".bold().yellow(),
                session_id
            ),
            MonitorEvent::Stopped => println!("{}", "Stopped".bold().white()),
        }
    }
}

fn grade(grade: Grade) -> ColoredString {
    let text = grade.description();
    match grade {
        Grade::Great => text.bright_green(),
        Grade::Good => text.green(),
        Grade::Average => text.yellow(),
        Grade::Poor => text.red(),
    }
}

fn mbps(bps: f64) -> String {
    format!("{:.2} Mbps", bps / 1_000_000.0)
}

fn print_outcome(outcome: &TestOutcome) {
    let when = to_local_display(outcome.started_at());
    match (outcome.result(), outcome.error()) {
        (Some(result), _) => println!(
            "{} {}  {} {}  {} {}  {} {:.0} ms",
            "✓".green(),
            when,
            "Down".bold(),
            mbps(result.download_bandwidth).bright_blue(),
            "Up".bold(),
            mbps(result.upload_bandwidth).bright_blue(),
            "Latency".bold(),
            result.unloaded_latency
        ),
        (None, error) => println!(
            "{} {}  {}",
            "✗".red(),
            when,
            error.unwrap_or_default().red()
        ),
    }
}

fn print_stats(session: &Session, now: i64) {
    let stats = session.stats(now);
    println!(
        "{} {} tests ({} ok, {} failed) over {}s",
        "Summary:".bold().white(),
        stats.total_tests,
        stats.successful_tests.to_string().green(),
        stats.failed_tests.to_string().red(),
        stats.duration / 1000
    );
    if stats.successful_tests > 0 {
        println!(
            "  {} {}  {} {}  {} {:.0} ms",
            "Avg down".bold(),
            mbps(stats.avg_download),
            "Avg up".bold(),
            mbps(stats.avg_upload),
            "Avg latency".bold(),
            stats.avg_latency
        );
    }
}

fn print_plan(summary: &PlanSummary) {
    println!("{} {}", "Plan:".bold().white(), summary.summary.yellow());
    for line in &summary.details {
        println!("  {}", line);
    }
}

fn list_sessions(storage: &SessionStorage<FileStore>) -> Result<(), MonitorError> {
    let sessions = storage.list_sessions()?;
    if sessions.is_empty() {
        println!("No saved sessions");
        return Ok(());
    }

    for session in sessions {
        let status = if session.is_active() { "active".green() } else { "closed".dimmed() };
        println!(
            "{}  {}  {}  {} tests  {}",
            session.id().dimmed(),
            session.name().bold(),
            to_local_display(session.start_time()),
            session.count(),
            status
        );
    }
    Ok(())
}

fn show_session(
    storage: &SessionStorage<FileStore>,
    id: &str,
    now: i64,
) -> Result<(), MonitorError> {
    let session = storage
        .get_session(id)?
        .ok_or_else(|| MonitorError::session(format!("No session with id {}", id)))?;

    println!("{} {}", "Session:".bold().white(), session.name().bright_blue());
    if !session.description().is_empty() {
        println!("  {}", session.description());
    }
    println!(
        "  Started {}, interval {}s",
        to_local_display(session.start_time()),
        session.test_interval_ms() / 1000
    );
    print_stats(&session, now);
    print_plan(&describe(session.measurements(), None));

    for outcome in session.all_test_runs() {
        print_outcome(outcome);
    }
    Ok(())
}

fn assess_history(
    storage: &SessionStorage<FileStore>,
    window: usize,
    now: i64,
) -> Result<ConnectionAssessment, MonitorError> {
    let sessions = storage.list_sessions()?;
    let outcomes = sessions.iter().flat_map(Session::all_test_runs);
    let recent = recent_window(outcomes, now, analyzer::DEFAULT_MAX_AGE_MS, window);
    Ok(analyze(&recent))
}

fn show_plan(
    storage: &SessionStorage<FileStore>,
    window: usize,
    json: bool,
    now: i64,
) -> Result<(), MonitorError> {
    let assessment = assess_history(storage, window, now)?;
    let plan = PlanGenerator::default().generate(&assessment);

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    match assessment.quality {
        Some(quality) => println!(
            "{} {} ({} tests, {:.0}% failed)",
            "Connection:".bold().white(),
            quality.label().bright_blue(),
            assessment.sample_size,
            assessment.failure_rate * 100.0
        ),
        None => println!("{} {}", "Connection:".bold().white(), "unknown".dimmed()),
    }
    print_plan(&describe(&plan, Some(&assessment)));
    Ok(())
}

fn write_output(path: &Path, contents: &[u8]) -> Result<(), MonitorError> {
    fs::write(path, contents).map_err(|e| {
        MonitorError::storage(format!("Cannot write {}", path.display())).with_source(e)
    })
}

fn export_csv(
    storage: &SessionStorage<FileStore>,
    filter: ExportFilter,
    output: Option<PathBuf>,
) -> Result<(), MonitorError> {
    let sessions = storage.list_sessions()?;
    let outcomes = export::select_outcomes(&sessions, &filter);
    if outcomes.is_empty() {
        println!("No tests found in the selected date range.");
        return Ok(());
    }

    let path = output.unwrap_or_else(|| match &filter.range {
        Some(range) => PathBuf::from(export::csv_file_name(range)),
        None => PathBuf::from("network-speed-tests-all.csv"),
    });

    let mut buffer = Vec::new();
    let rows = export::write_csv(&mut buffer, &outcomes)?;
    write_output(&path, &buffer)?;

    println!(
        "{} {} tests to {}",
        "Exported".bold().green(),
        rows,
        path.display()
    );
    Ok(())
}

fn export_json(
    storage: &SessionStorage<FileStore>,
    ids: &[String],
    output: Option<PathBuf>,
) -> Result<(), MonitorError> {
    let json = match ids {
        [id] => {
            let session = storage
                .get_session(id)?
                .ok_or_else(|| MonitorError::session(format!("No session with id {}", id)))?;
            let json = export::session_json(&session)?;
            let path = output.unwrap_or_else(|| {
                PathBuf::from(export::session_file_name(&session, Utc::now().date_naive()))
            });
            write_output(&path, json.as_bytes())?;
            println!("{} session to {}", "Exported".bold().green(), path.display());
            return Ok(());
        }
        [] => storage.export_json(None)?,
        ids => storage.export_json(Some(ids))?,
    };

    match output {
        Some(path) => {
            write_output(&path, json.as_bytes())?;
            println!("{} sessions to {}", "Exported".bold().green(), path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}
