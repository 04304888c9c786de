//! The long-running test loop.
//!
//! A [`Monitor`] owns one session at a time. Once started it wakes every
//! tick, decides whether a test is due, runs the current plan through the
//! engine with per-attempt timeouts and retries, records the outcome and
//! re-plans from the updated history. All waiting is raced against the stop
//! signal so a stop request is honoured within one suspension point.

use crate::analyzer::{analyze, recent_window, ConnectionAssessment};
use crate::clock::Clock;
use crate::config::MonitorConfig;
use crate::engine::{LogProgress, SpeedTestEngine};
use crate::errors::{ErrorKind, MonitorError};
use crate::location::LocationWatch;
use crate::plan::{describe, should_update, MeasurementPlan, PlanGenerator, PlanSummary};
use crate::resilience::{attempt_timeout, Reachability};
use crate::retry::{retry_async, wait_for_stop, RetryResult};
use crate::scoring::AimScores;
use crate::session::{Session, TestOutcome};
use crate::storage::{KeyValueStore, SessionStorage};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::error::Error;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, timeout, MissedTickBehavior};

/// Consecutive failed session recreations that end the loop.
const MAX_RECREATION_FAILURES: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Waiting,
    Running,
    Stopping,
    Stopped,
}

/// A user-visible error with the time it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEntry {
    pub at: i64,
    pub kind: ErrorKind,
    pub message: String,
}

/// Keeps only the most recent errors.
#[derive(Debug, Clone)]
pub struct ErrorLog {
    capacity: usize,
    entries: VecDeque<ErrorEntry>,
}

impl ErrorLog {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, entries: VecDeque::with_capacity(capacity) }
    }

    pub fn push(&mut self, entry: ErrorEntry) {
        if self.capacity == 0 {
            return;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Oldest first.
    pub fn entries(&self) -> impl Iterator<Item = &ErrorEntry> {
        self.entries.iter()
    }

    pub fn latest(&self) -> Option<&ErrorEntry> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone)]
pub enum MonitorEvent {
    Started { session_id: String, name: String },
    PlanUpdated(PlanSummary),
    TestStarted { plan_operations: usize },
    OutcomeRecorded(TestOutcome),
    /// Use-case grades for the test that was just recorded.
    Scored(AimScores),
    Error(ErrorEntry),
    Offline,
    Online,
    SessionRecreated { session_id: String },
    Stopped,
}

/// Receives monitor events. Implementations must not block.
pub trait MonitorObserver: Send + Sync {
    fn on_event(&self, event: MonitorEvent);
}

impl MonitorObserver for () {
    fn on_event(&self, _event: MonitorEvent) {}
}

/// Whether a test should start at `now`.
///
/// With a zero interval tests run back to back, separated by at least
/// `continuous_gap_ms` between starts.
pub fn is_due(
    now: i64,
    last_start: Option<i64>,
    interval_ms: u64,
    continuous_gap_ms: u64,
) -> bool {
    let Some(last_start) = last_start else {
        return true;
    };

    let elapsed = now.saturating_sub(last_start);
    if interval_ms == 0 {
        elapsed >= continuous_gap_ms as i64
    } else {
        elapsed >= interval_ms as i64
    }
}

/// Text for an error without the suggestion line.
fn error_text(error: &(dyn Error + 'static)) -> String {
    match error.downcast_ref::<MonitorError>() {
        Some(e) => e.message.clone(),
        None => error.to_string(),
    }
}

pub struct Monitor<E, K> {
    engine: E,
    storage: SessionStorage<K>,
    clock: Arc<dyn Clock>,
    config: MonitorConfig,
    generator: PlanGenerator,
    location: Option<LocationWatch>,
    observer: Arc<dyn MonitorObserver>,
    state: MonitorState,
    session: Option<Session>,
    plan: MeasurementPlan,
    assessment: Option<ConnectionAssessment>,
    reachability: Reachability,
    errors: ErrorLog,
    ticks: u64,
    last_test_start: Option<i64>,
    recreation_failures: u32,
}

impl<E: SpeedTestEngine, K: KeyValueStore> Monitor<E, K> {
    pub fn new(
        engine: E,
        storage: SessionStorage<K>,
        clock: Arc<dyn Clock>,
        config: MonitorConfig,
    ) -> Self {
        let generator =
            PlanGenerator::new(config.time_budget_secs, config.fallback_plan.clone());
        let plan = generator.generate(&ConnectionAssessment::unknown());

        Self {
            engine,
            storage,
            clock,
            errors: ErrorLog::new(config.error_capacity),
            config,
            generator,
            location: None,
            observer: Arc::new(()),
            state: MonitorState::Idle,
            session: None,
            plan,
            assessment: None,
            reachability: Reachability::default(),
            ticks: 0,
            last_test_start: None,
            recreation_failures: 0,
        }
    }

    pub fn with_location(mut self, location: LocationWatch) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn MonitorObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn plan(&self) -> &MeasurementPlan {
        &self.plan
    }

    pub fn assessment(&self) -> Option<&ConnectionAssessment> {
        self.assessment.as_ref()
    }

    pub fn reachability(&self) -> Reachability {
        self.reachability
    }

    pub fn errors(&self) -> &ErrorLog {
        &self.errors
    }

    pub fn storage(&self) -> &SessionStorage<K> {
        &self.storage
    }

    fn push_error(&mut self, error: &MonitorError) {
        warn!("{}", error);
        let entry = ErrorEntry {
            at: self.clock.now_ms(),
            kind: error.kind,
            message: error.message.clone(),
        };
        self.errors.push(entry.clone());
        self.observer.on_event(MonitorEvent::Error(entry));
    }

    /// Re-analyze recent history and adopt a new plan when warranted.
    pub fn refresh_plan(&mut self) {
        let now = self.clock.now_ms();

        let stored = match self.storage.list_sessions() {
            Ok(sessions) => sessions,
            Err(e) => {
                self.push_error(&e);
                Vec::new()
            }
        };

        let current_id = self.session.as_ref().map(Session::id);
        let history = stored
            .iter()
            .filter(|s| Some(s.id()) != current_id)
            .chain(self.session.iter())
            .flat_map(Session::all_test_runs);

        let window = recent_window(
            history,
            now,
            self.config.window_max_age_ms,
            self.config.window_size,
        );
        let assessment = analyze(&window);

        if should_update(&assessment, self.assessment.as_ref()) {
            self.plan = self.generator.generate(&assessment);
            let summary = describe(&self.plan, Some(&assessment));
            info!("Plan updated: {}", summary.summary);
            self.observer.on_event(MonitorEvent::PlanUpdated(summary));
        } else {
            debug!("Keeping current plan");
        }
        self.assessment = Some(assessment);
    }

    /// Open a new session and wait for the first tick.
    pub fn start(
        &mut self,
        name: Option<String>,
        description: Option<String>,
    ) -> Result<(), MonitorError> {
        if !matches!(self.state, MonitorState::Idle | MonitorState::Stopped) {
            return Err(MonitorError::session("Monitor is already running"));
        }

        self.refresh_plan();

        let now = self.clock.now_ms();
        let mut session = Session::new(
            name,
            description,
            self.config.test_interval.as_millis() as u64,
            self.plan.clone(),
            now,
        );
        session.start(now);

        if let Err(e) = self.storage.save_session(&session) {
            self.push_error(&e);
        }

        info!("Started session {} ({})", session.name(), session.id());
        self.observer.on_event(MonitorEvent::Started {
            session_id: session.id().to_string(),
            name: session.name().to_string(),
        });

        self.session = Some(session);
        self.state = MonitorState::Waiting;
        self.ticks = 0;
        self.last_test_start = None;
        self.recreation_failures = 0;
        Ok(())
    }

    /// Close the session. Does nothing unless a session is open.
    pub fn stop(&mut self) {
        if matches!(self.state, MonitorState::Idle | MonitorState::Stopped) {
            return;
        }
        self.state = MonitorState::Stopping;

        let now = self.clock.now_ms();
        let saved = match self.session.as_mut() {
            Some(session) => {
                session.stop(now);
                self.storage.save_session(session)
            }
            None => Ok(()),
        };
        if let Err(e) = saved {
            self.push_error(&e);
        }

        self.state = MonitorState::Stopped;
        info!("Monitoring stopped");
        self.observer.on_event(MonitorEvent::Stopped);
    }

    /// Drive the loop until `stop` flips to true or the session is lost.
    ///
    /// The session is closed on every exit path.
    pub async fn run(
        &mut self,
        mut stop: watch::Receiver<bool>,
    ) -> Result<(), MonitorError> {
        if self.state != MonitorState::Waiting {
            return Err(MonitorError::session("Monitor has not been started"));
        }

        let mut ticker = interval(self.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = wait_for_stop(&mut stop) => break Ok(()),
            }

            if let Err(e) = self.on_tick(&mut stop).await {
                break Err(e);
            }

            if *stop.borrow() {
                break Ok(());
            }
        };

        self.stop();
        result
    }

    async fn on_tick(
        &mut self,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<(), MonitorError> {
        self.ticks += 1;

        if self.ticks % self.config.integrity_check_every == 0 {
            self.check_integrity()?;
        }

        if self.ticks == 1 || self.ticks % self.config.reachability_every == 0 {
            let reachability = tokio::select! {
                reachability = self.engine.reachability() => reachability,
                _ = wait_for_stop(stop) => return Ok(()),
            };
            self.update_reachability(reachability);
        }

        if !self.reachability.online {
            return Ok(());
        }

        let now = self.clock.now_ms();
        if is_due(
            now,
            self.last_test_start,
            self.config.test_interval.as_millis() as u64,
            self.config.continuous_gap.as_millis() as u64,
        ) {
            self.run_test(stop).await;
        }
        Ok(())
    }

    fn update_reachability(&mut self, reachability: Reachability) {
        let was_online = self.reachability.online;
        self.reachability = reachability;

        if was_online && !reachability.online {
            self.push_error(&MonitorError::network(
                "Network appears offline; scheduled tests are paused",
            ));
            self.observer.on_event(MonitorEvent::Offline);
        } else if !was_online && reachability.online {
            info!("Network is back ({})", reachability.quality);
            self.observer.on_event(MonitorEvent::Online);
        }
    }

    /// Make sure the open session is still in storage, re-saving it if not.
    fn check_integrity(&mut self) -> Result<(), MonitorError> {
        let Some(session) = self.session.as_ref() else {
            return Err(MonitorError::session_lost("No session is open"));
        };

        if matches!(self.storage.contains(session.id()), Ok(true)) {
            self.recreation_failures = 0;
            return Ok(());
        }

        warn!("Session {} is missing from storage, recreating", session.id());
        let session_id = session.id().to_string();
        match self.storage.save_session(session) {
            Ok(()) => {
                self.recreation_failures = 0;
                self.observer.on_event(MonitorEvent::SessionRecreated { session_id });
                Ok(())
            }
            Err(e) => {
                self.push_error(&e);
                self.recreation_failures += 1;
                if self.recreation_failures >= MAX_RECREATION_FAILURES {
                    Err(MonitorError::session_lost(format!(
                        "Session {} could not be recreated after {} attempts",
                        session_id, self.recreation_failures
                    ))
                    .with_source(e))
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Run the current plan once, with retries, and record the outcome.
    ///
    /// A stop request aborts the engine and records nothing.
    async fn run_test(&mut self, stop: &mut watch::Receiver<bool>) {
        let started_at = self.clock.now_ms();
        self.last_test_start = Some(started_at);
        self.state = MonitorState::Running;
        self.observer.on_event(MonitorEvent::TestStarted {
            plan_operations: self.plan.len(),
        });

        let location = self.location.as_ref().and_then(LocationWatch::current);
        let quality = self.reachability.quality;
        let limit =
            attempt_timeout(self.config.base_timeout, self.config.constrained, quality);

        let engine = &self.engine;
        let plan = &self.plan;
        let result = retry_async(&self.config.retry, quality, "speed test", stop, move |attempt| {
            debug!("Speed test attempt {} (timeout {:?})", attempt, limit);
            async move {
                match timeout(limit, engine.run(plan, &LogProgress)).await {
                    Ok(result) => result,
                    Err(_) => {
                        engine.abort();
                        Err(MonitorError::timeout(format!(
                            "Test timed out after {} seconds",
                            limit.as_secs()
                        )))
                    }
                }
            }
        })
        .await;

        let ended_at = self.clock.now_ms().max(started_at);
        let mut scores = None;
        let outcome = match result {
            RetryResult::Success(report) => {
                scores = report.scores;
                TestOutcome::success(started_at, ended_at, location.clone(), report.summary)
                    .or_else(|e| {
                        TestOutcome::failure(started_at, ended_at, location, e.message)
                    })
            }
            RetryResult::Failed { last_error, attempts } => {
                debug!("Speed test failed after {} attempts", attempts);
                TestOutcome::failure(
                    started_at,
                    ended_at,
                    location,
                    error_text(&*last_error),
                )
            }
            RetryResult::Aborted { attempts } => {
                debug!("Speed test aborted after {} attempts", attempts);
                self.engine.abort();
                self.state = MonitorState::Stopping;
                return;
            }
        };

        match outcome {
            Ok(outcome) => {
                let succeeded = outcome.succeeded();
                self.record(outcome);
                if let Some(scores) = scores.filter(|_| succeeded) {
                    info!("AIM scores: overall {}", scores.overall().description());
                    self.observer.on_event(MonitorEvent::Scored(scores));
                }
            }
            Err(e) => self.push_error(&e),
        }

        self.refresh_plan();
        self.state = MonitorState::Waiting;
    }

    fn record(&mut self, outcome: TestOutcome) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        if let Err(e) = session.add_test_run(outcome.clone()) {
            self.push_error(&e);
            return;
        }

        if outcome.succeeded() {
            info!("Test {} recorded", outcome.id());
        } else {
            warn!("Test {} failed: {}", outcome.id(), outcome.error().unwrap_or_default());
        }

        let saved = self.storage.save_session(session);
        self.observer.on_event(MonitorEvent::OutcomeRecorded(outcome));
        if let Err(e) = saved {
            self.push_error(&e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::TokioClock;
    use crate::engine::{EngineReport, ProgressCallback};
    use crate::quality::Tier;
    use crate::scoring::Grade;
    use crate::session::fixtures::{results, success_at};
    use crate::session::RawResults;
    use crate::storage::testing::FlakyStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::sleep;

    /// 2024-03-10T12:00:00Z
    const ORIGIN: i64 = 1_710_072_000_000;

    enum Step {
        Succeed(RawResults),
        Scored(RawResults, AimScores),
        Fail(&'static str),
        Hang,
    }

    #[derive(Default)]
    struct ScriptedEngine {
        script: Mutex<VecDeque<Step>>,
        reachability: Mutex<VecDeque<Reachability>>,
        runs: AtomicUsize,
        aborts: AtomicUsize,
        probes: AtomicUsize,
    }

    impl ScriptedEngine {
        fn with_steps(steps: impl IntoIterator<Item = Step>) -> Self {
            Self { script: Mutex::new(steps.into_iter().collect()), ..Self::default() }
        }

        fn always_failing() -> Self {
            Self::with_steps((0..50).map(|_| Step::Fail("connection reset")))
        }

        fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }
    }

    impl SpeedTestEngine for ScriptedEngine {
        async fn run(
            &self,
            _plan: &MeasurementPlan,
            _progress: &dyn ProgressCallback,
        ) -> Result<EngineReport, MonitorError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let step = self.script.lock().unwrap().pop_front();
            match step {
                Some(Step::Succeed(summary)) => Ok(EngineReport { summary, ..Default::default() }),
                Some(Step::Scored(summary, scores)) => {
                    Ok(EngineReport { summary, scores: Some(scores), ..Default::default() })
                }
                Some(Step::Fail(message)) => Err(MonitorError::engine(message)),
                Some(Step::Hang) => std::future::pending().await,
                None => Ok(EngineReport { summary: results(50.0, 10.0, 20.0), ..Default::default() }),
            }
        }

        fn abort(&self) {
            self.aborts.fetch_add(1, Ordering::SeqCst);
        }

        async fn reachability(&self) -> Reachability {
            self.probes.fetch_add(1, Ordering::SeqCst);
            self.reachability.lock().unwrap().pop_front().unwrap_or_default()
        }
    }

    fn quick_config() -> MonitorConfig {
        let mut config = MonitorConfig::default();
        config.retry.jitter_ms = 0;
        config
    }

    type TestMonitor<'a> = Monitor<&'a ScriptedEngine, Arc<FlakyStore>>;

    fn monitor<'a>(
        engine: &'a ScriptedEngine,
        store: &Arc<FlakyStore>,
        config: MonitorConfig,
    ) -> TestMonitor<'a> {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::starting_at(ORIGIN));
        let storage = SessionStorage::new(store.clone(), clock.clone());
        Monitor::new(engine, storage, clock, config)
    }

    #[derive(Default)]
    struct EventLog(Mutex<Vec<MonitorEvent>>);

    impl MonitorObserver for EventLog {
        fn on_event(&self, event: MonitorEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    /// Runs the loop and flips the stop signal after `after`.
    async fn run_for(
        monitor: &mut TestMonitor<'_>,
        after: Duration,
    ) -> Result<(), MonitorError> {
        let (tx, rx) = watch::channel(false);
        let (result, _) = tokio::join!(monitor.run(rx), async move {
            sleep(after).await;
            let _ = tx.send(true);
            // keep the sender alive until the loop has seen the flag
            sleep(Duration::from_secs(3600)).await;
        });
        result
    }

    #[test]
    fn test_is_due() {
        assert!(is_due(0, None, 30_000, 2_000));
        assert!(!is_due(29_999, Some(0), 30_000, 2_000));
        assert!(is_due(30_000, Some(0), 30_000, 2_000));
        assert!(!is_due(1_999, Some(0), 0, 2_000));
        assert!(is_due(2_000, Some(0), 0, 2_000));
    }

    #[test]
    fn test_error_log_keeps_latest() {
        let mut log = ErrorLog::new(5);
        for i in 0..7 {
            log.push(ErrorEntry { at: i, kind: ErrorKind::Storage, message: i.to_string() });
        }
        assert_eq!(log.len(), 5);
        assert_eq!(log.entries().next().map(|e| e.at), Some(2));
        assert_eq!(log.latest().map(|e| e.at), Some(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_creates_and_persists_session() {
        let engine = ScriptedEngine::default();
        let store = Arc::new(FlakyStore::default());
        let mut monitor = monitor(&engine, &store, quick_config());

        monitor.start(Some("Bus 42".into()), None).unwrap();

        assert_eq!(monitor.state(), MonitorState::Waiting);
        let session = monitor.session().unwrap();
        assert!(session.is_active());
        assert_eq!(session.test_interval_ms(), 30_000);
        assert!(monitor.storage().contains(session.id()).unwrap());
        assert_eq!(monitor.plan(), &MeasurementPlan::default_good());
        assert!(monitor.assessment().unwrap().is_unknown());

        assert!(monitor.start(None, None).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_plans_from_stored_history() {
        let engine = ScriptedEngine::default();
        let store = Arc::new(FlakyStore::default());
        let mut monitor = monitor(&engine, &store, quick_config());

        let mut previous = Session::new(None, None, 0, MeasurementPlan::default(), ORIGIN - 60_000);
        previous.start(ORIGIN - 60_000);
        for i in 0..3 {
            previous.add_test_run(success_at(ORIGIN - 50_000 + i * 10_000, 300.0, 300.0, 10.0)).unwrap();
        }
        monitor.storage().save_session(&previous).unwrap();

        monitor.start(None, None).unwrap();

        let assessment = monitor.assessment().unwrap();
        assert_eq!(assessment.sample_size, 3);
        assert_eq!(assessment.quality, Some(Tier::Ultra));
        assert_ne!(monitor.plan(), &MeasurementPlan::default_good());
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_on_interval_and_closes_session() {
        let engine = ScriptedEngine::default();
        let store = Arc::new(FlakyStore::default());
        let mut monitor = monitor(&engine, &store, quick_config());
        monitor.start(None, None).unwrap();

        run_for(&mut monitor, Duration::from_secs(65)).await.unwrap();

        assert_eq!(engine.runs(), 3);
        assert_eq!(monitor.state(), MonitorState::Stopped);

        let session = monitor.session().unwrap();
        assert!(!session.is_active());
        assert_eq!(session.end_time(), Some(ORIGIN + 65_000));
        assert_eq!(session.count(), 3);

        let stored = monitor.storage().get_session(session.id()).unwrap().unwrap();
        assert_eq!(stored.count(), 3);
        assert!(!stored.is_active());

        let assessment = monitor.assessment().unwrap();
        assert_eq!(assessment.sample_size, 3);
        assert_eq!(assessment.quality, Some(Tier::Moderate));
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_mode_respects_gap() {
        let engine = ScriptedEngine::default();
        let store = Arc::new(FlakyStore::default());
        let mut config = quick_config();
        config.test_interval = Duration::ZERO;
        let mut monitor = monitor(&engine, &store, config);
        monitor.start(None, None).unwrap();

        run_for(&mut monitor, Duration::from_millis(9_500)).await.unwrap();

        // starts at 0, 2, 4, 6, 8 seconds
        assert_eq!(engine.runs(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_record_failure() {
        let engine = ScriptedEngine::always_failing();
        let store = Arc::new(FlakyStore::default());
        let mut monitor = monitor(&engine, &store, quick_config());
        monitor.start(None, None).unwrap();

        // backoff 5 + 7.5 + 11.25 seconds, next test due at 30
        run_for(&mut monitor, Duration::from_secs(29)).await.unwrap();

        assert_eq!(engine.runs(), 4);
        let session = monitor.session().unwrap();
        let runs = session.all_test_runs();
        assert_eq!(runs.len(), 1);
        assert!(!runs[0].succeeded());
        assert_eq!(runs[0].error(), Some("connection reset"));
        assert_eq!(runs[0].started_at(), ORIGIN);
        assert_eq!(runs[0].ended_at(), ORIGIN + 23_750);

        let assessment = monitor.assessment().unwrap();
        assert_eq!(assessment.quality, Some(Tier::Poor));
        assert_eq!(assessment.failure_rate, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_stop_mid_retry() {
        let engine = ScriptedEngine::always_failing();
        let store = Arc::new(FlakyStore::default());
        let mut monitor = monitor(&engine, &store, quick_config());
        monitor.start(None, None).unwrap();

        // first retry at 5s, second backoff runs from 5s to 12.5s
        run_for(&mut monitor, Duration::from_secs(8)).await.unwrap();

        assert_eq!(engine.runs(), 2);
        assert_eq!(monitor.state(), MonitorState::Stopped);

        let session = monitor.session().unwrap();
        assert_eq!(session.count(), 0);
        assert_eq!(session.end_time(), Some(ORIGIN + 8_000));

        sleep(Duration::from_secs(60)).await;
        assert_eq!(engine.runs(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_running_aborts_engine() {
        let engine = ScriptedEngine::with_steps([Step::Hang]);
        let store = Arc::new(FlakyStore::default());
        let mut monitor = monitor(&engine, &store, quick_config());
        monitor.start(None, None).unwrap();

        run_for(&mut monitor, Duration::from_secs(10)).await.unwrap();

        assert_eq!(engine.runs(), 1);
        assert_eq!(engine.aborts.load(Ordering::SeqCst), 1);
        let session = monitor.session().unwrap();
        assert_eq!(session.count(), 0);
        assert_eq!(session.end_time(), Some(ORIGIN + 10_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_counts_as_failure() {
        let engine = ScriptedEngine::with_steps([Step::Hang]);
        let store = Arc::new(FlakyStore::default());
        let mut config = quick_config();
        config.base_timeout = Duration::from_secs(2);
        config.retry.max_retries = 0;
        let mut monitor = monitor(&engine, &store, config);
        monitor.start(None, None).unwrap();

        run_for(&mut monitor, Duration::from_secs(5)).await.unwrap();

        assert_eq!(engine.aborts.load(Ordering::SeqCst), 1);
        let session = monitor.session().unwrap();
        let runs = session.all_test_runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].error(), Some("Test timed out after 2 seconds"));
        assert_eq!(runs[0].duration_ms(), 2_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_result_is_recorded_as_failure() {
        let mut summary = results(50.0, 10.0, 20.0);
        summary.upload_bandwidth = None;
        let engine = ScriptedEngine::with_steps([Step::Succeed(summary)]);
        let store = Arc::new(FlakyStore::default());
        let mut monitor = monitor(&engine, &store, quick_config());
        monitor.start(None, None).unwrap();

        run_for(&mut monitor, Duration::from_secs(5)).await.unwrap();

        let session = monitor.session().unwrap();
        let runs = session.all_test_runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].error(), Some("Missing required properties: uploadBandwidth"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scores_follow_recorded_outcome() {
        let scores = AimScores {
            streaming: Grade::Great,
            gaming: Grade::Average,
            video_conferencing: Grade::Good,
        };
        let mut malformed = results(50.0, 10.0, 20.0);
        malformed.unloaded_jitter = None;
        let engine = ScriptedEngine::with_steps([
            Step::Scored(results(50.0, 10.0, 20.0), scores),
            Step::Scored(malformed, scores),
        ]);
        let store = Arc::new(FlakyStore::default());
        let events = Arc::new(EventLog::default());
        let mut monitor =
            monitor(&engine, &store, quick_config()).with_observer(events.clone());
        monitor.start(None, None).unwrap();

        run_for(&mut monitor, Duration::from_secs(35)).await.unwrap();

        let events = events.0.lock().unwrap();
        let kinds: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                MonitorEvent::OutcomeRecorded(o) if o.succeeded() => Some("success"),
                MonitorEvent::OutcomeRecorded(_) => Some("failure"),
                MonitorEvent::Scored(s) => {
                    assert_eq!(s.overall(), Grade::Average);
                    Some("scored")
                }
                _ => None,
            })
            .collect();
        assert_eq!(kinds, ["success", "scored", "failure"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_storage_failures_do_not_stop_the_loop() {
        let engine = ScriptedEngine::default();
        let store = Arc::new(FlakyStore::default());
        let mut monitor = monitor(&engine, &store, quick_config());
        monitor.start(None, None).unwrap();
        store.set_failing(true);

        run_for(&mut monitor, Duration::from_secs(25)).await.unwrap();

        assert_eq!(engine.runs(), 1);
        assert_eq!(monitor.session().unwrap().count(), 1);
        let errors: Vec<_> = monitor.errors().entries().collect();
        assert!(!errors.is_empty());
        assert!(errors.iter().all(|e| e.kind == ErrorKind::Storage));
        assert!(errors.len() <= 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_skips_tests_and_warns_once() {
        let engine = ScriptedEngine::default();
        engine.reachability.lock().unwrap().extend([
            Reachability::offline(),
            Reachability::offline(),
            Reachability::offline(),
        ]);
        let store = Arc::new(FlakyStore::default());
        let mut monitor = monitor(&engine, &store, quick_config());
        monitor.start(None, None).unwrap();

        run_for(&mut monitor, Duration::from_secs(70)).await.unwrap();

        assert_eq!(engine.probes.load(Ordering::SeqCst), 3);
        assert_eq!(engine.runs(), 0);
        assert_eq!(monitor.session().unwrap().count(), 0);
        assert_eq!(monitor.errors().len(), 1);
        assert_eq!(monitor.errors().latest().map(|e| e.kind), Some(ErrorKind::Network));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_session_is_resaved() {
        let engine = ScriptedEngine::default();
        let store = Arc::new(FlakyStore::default());
        let mut config = quick_config();
        config.test_interval = Duration::from_secs(3600);
        let mut monitor = monitor(&engine, &store, config);
        monitor.start(None, None).unwrap();
        let id = monitor.session().unwrap().id().to_string();

        let (tx, rx) = watch::channel(false);
        let (result, _) = tokio::join!(monitor.run(rx), async {
            sleep(Duration::from_secs(5)).await;
            let removal = SessionStorage::new(store.clone(), Arc::new(TokioClock::starting_at(ORIGIN)));
            removal.remove_session(&id).unwrap();
            sleep(Duration::from_secs(40)).await;
            assert!(removal.contains(&id).unwrap());
            let _ = tx.send(true);
            sleep(Duration::from_secs(3600)).await;
        });

        result.unwrap();
        assert!(monitor.storage().contains(&id).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_failed_recreations_are_fatal() {
        let engine = ScriptedEngine::default();
        let store = Arc::new(FlakyStore::default());
        let mut config = quick_config();
        config.test_interval = Duration::from_secs(3600);
        let mut monitor = monitor(&engine, &store, config);
        monitor.start(None, None).unwrap();

        let id = monitor.session().unwrap().id().to_string();
        monitor.storage().remove_session(&id).unwrap();
        store.set_failing(true);

        let error = run_for(&mut monitor, Duration::from_secs(600)).await.unwrap_err();

        assert_eq!(error.kind, ErrorKind::SessionLost);
        assert_eq!(monitor.state(), MonitorState::Stopped);
        assert!(!monitor.session().unwrap().is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_requires_start() {
        let engine = ScriptedEngine::default();
        let store = Arc::new(FlakyStore::default());
        let mut monitor = monitor(&engine, &store, quick_config());
        let (_tx, rx) = watch::channel(false);

        let error = monitor.run(rx).await.unwrap_err();
        assert_eq!(error.kind, ErrorKind::Session);
    }
}
