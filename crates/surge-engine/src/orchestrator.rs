//! Run orchestrator: drives one run through its phases.
//!
//! `Setup -> Ramping/Steady/RampingDown -> Teardown -> Terminal`. Teardown
//! always runs, whether the schedule completed, the run was cancelled or an
//! `abort_on_fail` threshold fired, so a report is produced in every case.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use surge_core::{Config, RunId, RunPhase, Schedule, SlotId, VuId};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::action::{ActionExecutor, PreparedStep, RequestTarget};
use crate::aggregator::MetricsAggregator;
use crate::controller::{publish_phase, ScheduleController, VuSpawner};
use crate::error::EngineResult;
use crate::evaluator::{ThresholdEvaluator, ThresholdVerdict};
use crate::executor::{run_setup, Scenario, VirtualUser};
use crate::http::{HttpClient, ReqwestClient};
use crate::reporter::{RunEnd, RunReport, SetupReport, VuReport};

struct ScenarioSpawner {
    scenario: Arc<Scenario>,
    aggregator: Arc<MetricsAggregator>,
}

impl VuSpawner for ScenarioSpawner {
    fn spawn(&self, vu: VuId, slot: SlotId, cancel: CancellationToken) -> JoinHandle<u64> {
        let user = VirtualUser::new(vu, slot);
        tokio::spawn(user.run(
            Arc::clone(&self.scenario),
            Arc::clone(&self.aggregator),
            cancel,
        ))
    }
}

/// A validated, ready-to-start load run.
pub struct LoadRun {
    config: Config,
    schedule: Schedule,
    evaluator: Arc<ThresholdEvaluator>,
    setup_steps: Vec<PreparedStep>,
    steps: Vec<PreparedStep>,
    actions: ActionExecutor,
    cancel: CancellationToken,
    phases: watch::Sender<RunPhase>,
}

impl LoadRun {
    /// Validates `config` and builds the HTTP client.
    ///
    /// Every configuration error surfaces here, before anything is sent.
    pub fn new(config: Config) -> EngineResult<Self> {
        let client = ReqwestClient::new(config.run.request_timeout)?;
        Self::with_client(config, Arc::new(client))
    }

    /// Like [`LoadRun::new`] with a caller-provided transport.
    pub fn with_client(config: Config, client: Arc<dyn HttpClient>) -> EngineResult<Self> {
        config.validate()?;

        let schedule = config.schedule()?;
        let evaluator = ThresholdEvaluator::new(config.thresholds()?);
        let setup_steps = prepare(&config.setup)?;
        let steps = prepare(&config.steps)?;
        let target = RequestTarget {
            base_url: config.run.base_url.clone(),
            origin: config.origin()?,
            auth: config.auth.clone(),
        };
        let (phases, _) = watch::channel(RunPhase::Setup);

        Ok(Self {
            config,
            schedule,
            evaluator: Arc::new(evaluator),
            setup_steps,
            steps,
            actions: ActionExecutor::new(client, target),
            cancel: CancellationToken::new(),
            phases,
        })
    }

    /// Cancelling this token stops the run cooperatively; teardown still runs.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Receiver for phase transitions.
    #[must_use]
    pub fn phases(&self) -> watch::Receiver<RunPhase> {
        self.phases.subscribe()
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Runs setup, the scheduled load and teardown, then builds the report.
    pub async fn run(self) -> EngineResult<RunReport> {
        let run_id = RunId::new();
        let started_at = Utc::now();
        let aggregator = Arc::new(MetricsAggregator::new());
        let settings = &self.config.run;

        tracing::info!(
            run_id = %run_id,
            name = %settings.name,
            base_url = %settings.base_url,
            duration = ?self.schedule.total_duration(),
            max_vus = self.schedule.max_target(),
            thresholds = self.evaluator.thresholds().len(),
            "Starting load run"
        );

        publish_phase(&self.phases, RunPhase::Setup);
        let setup = run_setup(&self.setup_steps, &self.actions, &aggregator, &self.cancel).await;
        let setup_report = setup_report(&self.setup_steps, setup.vars().keys());
        if setup_report.degraded() {
            tracing::warn!(
                missing = ?setup_report.missing,
                "Setup incomplete, dependent steps will be skipped"
            );
        }

        let scenario = Arc::new(Scenario {
            steps: self.steps.clone(),
            actions: self.actions.clone(),
            setup: Arc::new(setup),
        });
        let spawner = ScenarioSpawner {
            scenario,
            aggregator: Arc::clone(&aggregator),
        };
        let mut controller = ScheduleController::new(
            self.schedule.clone(),
            settings.controller_tick,
            spawner,
            self.cancel.clone(),
        );

        let load_started = Instant::now();
        let abort = Arc::new(Mutex::new(None));
        let monitor_stop = CancellationToken::new();
        let monitor = tokio::spawn(monitor(
            Arc::clone(&aggregator),
            Arc::clone(&self.evaluator),
            settings.monitor_interval,
            load_started,
            Arc::clone(&abort),
            self.cancel.clone(),
            monitor_stop.clone(),
        ));

        controller.run(load_started, &self.phases).await;

        publish_phase(&self.phases, RunPhase::Teardown);
        let summary = controller.shutdown(settings.graceful_stop).await;
        monitor_stop.cancel();
        monitor.await?;

        let snapshot = aggregator.snapshot();
        let verdict = self.evaluator.evaluate(&snapshot);
        for failed in verdict.failures() {
            tracing::warn!(
                threshold = %failed.key,
                expression = %failed.expression,
                observed = failed.observed,
                "Threshold failed"
            );
        }

        let breach = abort.lock().take();
        let end = match breach {
            Some(breach) => RunEnd::AbortedByThreshold {
                threshold: format!("{}: {}", breach.key, breach.expression),
            },
            None if self.cancel.is_cancelled() => RunEnd::Cancelled,
            None => RunEnd::Completed,
        };

        publish_phase(&self.phases, RunPhase::Terminal);
        tracing::info!(
            run_id = %run_id,
            requests = snapshot.global.total,
            iterations = snapshot.iterations,
            passed = verdict.passed,
            "Load run finished"
        );

        Ok(RunReport::new(
            run_id,
            settings.name.clone(),
            settings.base_url.clone(),
            started_at,
            end,
            setup_report,
            VuReport {
                spawned: summary.vus_spawned,
                peak: summary.peak_vus as u64,
                aborted: summary.vus_aborted as u64,
            },
            &snapshot,
            verdict,
        ))
    }
}

fn prepare(steps: &[surge_core::StepConfig]) -> EngineResult<Vec<PreparedStep>> {
    Ok(steps
        .iter()
        .map(PreparedStep::from_config)
        .collect::<Result<_, _>>()?)
}

fn setup_report<'a>(
    steps: &[PreparedStep],
    collected: impl Iterator<Item = &'a String>,
) -> SetupReport {
    let variables: Vec<String> = collected.cloned().collect();
    let expected: BTreeSet<&String> = steps.iter().flat_map(|s| s.extracts()).collect();
    let missing = expected
        .into_iter()
        .filter(|var| !variables.contains(var))
        .cloned()
        .collect();
    SetupReport { variables, missing }
}

/// Logs live progress and enforces `abort_on_fail` thresholds.
async fn monitor(
    aggregator: Arc<MetricsAggregator>,
    evaluator: Arc<ThresholdEvaluator>,
    every: Duration,
    load_started: Instant,
    abort: Arc<Mutex<Option<ThresholdVerdict>>>,
    run_cancel: CancellationToken,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(load_started + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let snapshot = aggregator.snapshot();
        let global = &snapshot.global;
        tracing::info!(
            elapsed_secs = load_started.elapsed().as_secs(),
            vus = snapshot.active_vus,
            requests = global.total,
            iterations = snapshot.iterations,
            rps = snapshot.request_rate(),
            p95_ms = global.percentile_ms(95.0),
            error_rate = global.failure_rate(),
            "Progress"
        );

        for failing in evaluator.evaluate(&snapshot).failures() {
            tracing::debug!(
                threshold = %failing.key,
                expression = %failing.expression,
                observed = failing.observed,
                "Threshold currently failing"
            );
        }

        if let Some(breach) = evaluator.abort_breach(&snapshot, load_started.elapsed()) {
            tracing::warn!(
                threshold = %breach.key,
                expression = %breach.expression,
                observed = breach.observed,
                "Threshold breached, aborting run"
            );
            *abort.lock() = Some(breach);
            run_cancel.cancel();
            return;
        }
    }
}
