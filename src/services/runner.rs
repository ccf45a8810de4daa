//! Per-scan worker logic.
//!
//! A runner owns one job from Pending to a terminal status: it opens an
//! engine session, starts every phase of the kind's plan, then samples all
//! running phases once per poll tick until each is done or timed out. The
//! whole phase loop is raced against the job's cancellation token and a
//! ledger watch for cancels recorded by other processes, so a cancel is
//! observed within one tick regardless of what the engine is doing.
//!
//! The terminal status is written before engine cleanup; stopping phases
//! and closing the session share one call timeout afterwards.

use std::future::Future;
use std::sync::Arc;

use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::OrchestratorSettings;
use crate::engine::{DiscoveryMode, EngineClient, EngineError, EngineSession, PhaseHandle, RawFinding};
use crate::ledger::{Completion, ScanLedger};
use crate::models::scan::{ScanJob, ScanStatus};
use crate::models::scan_finding::RiskCounts;
use crate::services::ingestion;
use crate::services::lifecycle::{Phase, PhasePlan, CANCELLED_BY_CALLER};
use crate::services::metrics::ScanMetrics;
use crate::services::progress::{passive_percent, ProgressReporter};

const COLLECTING_RESULTS: &str = "Collecting results";

/// Attempts for the terminal status write before giving up to recovery.
const TERMINAL_WRITE_ATTEMPTS: u32 = 3;

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { total: i32, counts: RiskCounts },
    Failed(String),
    Cancelled,
    /// The job was gone or no longer Pending when the worker picked it up,
    /// or someone else finished it while it ran.
    Skipped,
}

enum Interrupt {
    Cancelled,
    Failed(String),
    /// The row left InProgress under us; there is nothing left to write.
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PhaseState {
    Running,
    Done,
    TimedOut,
}

struct PhaseTrack {
    phase: Phase,
    handle: Option<PhaseHandle>,
    state: PhaseState,
    percent: u8,
    deadline: Instant,
}

impl PhaseTrack {
    fn is_finished(&self) -> bool {
        self.state != PhaseState::Running
    }

    /// Finished phases count as complete toward overall progress.
    fn progress(&self) -> u8 {
        if self.is_finished() {
            100
        } else {
            self.percent
        }
    }

    fn observe(&mut self, percent: u8) {
        self.percent = self.percent.max(percent.min(100));
        if percent >= 100 {
            self.state = PhaseState::Done;
        }
    }
}

/// Engine-side state of a run, kept outside the phase loop so it can be
/// cleaned up after the loop is abandoned.
#[derive(Default)]
struct RunState {
    session: Option<EngineSession>,
    phases: Vec<PhaseTrack>,
    backlog_peak: u64,
    backlog: Option<u64>,
}

fn discovery_mode(phase: Phase) -> DiscoveryMode {
    match phase {
        Phase::SecondaryDiscovery => DiscoveryMode::Secondary,
        _ => DiscoveryMode::Standard,
    }
}

/// Step text for the earliest unfinished phase.
fn describe_step(run: &RunState) -> String {
    match run.phases.iter().find(|t| !t.is_finished()) {
        Some(track) if track.phase == Phase::PassiveAnalysis => match run.backlog {
            Some(remaining) => format!("Passive analysis: {remaining} records remaining"),
            None => "Passive analysis: waiting for records".to_string(),
        },
        Some(track) => format!("{}: {}%", track.phase.label(), track.percent),
        None => COLLECTING_RESULTS.to_string(),
    }
}

#[derive(Clone)]
pub struct ScanRunner {
    ledger: Arc<dyn ScanLedger>,
    engine: Arc<dyn EngineClient>,
    metrics: Arc<ScanMetrics>,
    settings: OrchestratorSettings,
}

impl ScanRunner {
    pub fn new(
        ledger: Arc<dyn ScanLedger>,
        engine: Arc<dyn EngineClient>,
        metrics: Arc<ScanMetrics>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            ledger,
            engine,
            metrics,
            settings,
        }
    }

    /// Execute one job to a terminal status. Never panics on engine or
    /// storage errors; those become a Failed transition.
    pub async fn run(&self, scan_id: Uuid, cancel: CancellationToken) -> RunOutcome {
        let job = match self.ledger.get(scan_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::warn!(scan_id = %scan_id, "Queued scan no longer exists");
                return RunOutcome::Skipped;
            }
            Err(e) => {
                // The row stays Pending and is picked up by the next sweep.
                tracing::error!(scan_id = %scan_id, error = %e, "Failed to load queued scan");
                return RunOutcome::Skipped;
            }
        };

        if job.status != ScanStatus::Pending {
            tracing::debug!(scan_id = %scan_id, status = %job.status, "Skipping scan that is not pending");
            return RunOutcome::Skipped;
        }

        if cancel.is_cancelled() {
            self.finish(scan_id, ScanStatus::Pending, ScanStatus::Cancelled, Some(CANCELLED_BY_CALLER))
                .await;
            return RunOutcome::Cancelled;
        }

        match self
            .ledger
            .transition(scan_id, ScanStatus::Pending, ScanStatus::InProgress, None)
            .await
        {
            Ok(true) => {}
            Ok(false) => return RunOutcome::Skipped,
            Err(e) => {
                tracing::error!(scan_id = %scan_id, error = %e, "Failed to start scan");
                return RunOutcome::Skipped;
            }
        }

        tracing::info!(scan_id = %scan_id, kind = ?job.kind, target = %job.target_url, "Scan started");
        self.metrics.on_started();
        let started = Instant::now();
        let mut reporter = ProgressReporter::new(self.ledger.clone(), scan_id, self.settings.heartbeat_interval);
        let mut run = RunState::default();

        let result = self.drive(&job, &cancel, &mut reporter, &mut run).await;
        let outcome = match result {
            // A cancel that lands between the last poll and ingestion still wins.
            Ok(_) if cancel.is_cancelled() => self.cancelled(scan_id).await,
            Ok(raw) => match ingestion::ingest(self.ledger.as_ref(), scan_id, raw).await {
                Ok(summary) => match summary.completion {
                    Completion::Completed => RunOutcome::Completed {
                        total: summary.total,
                        counts: summary.counts,
                    },
                    Completion::Cancelled => RunOutcome::Cancelled,
                    Completion::Skipped => RunOutcome::Skipped,
                },
                Err(e) => self.fail(scan_id, format!("result ingestion failed: {e}")).await,
            },
            Err(Interrupt::Cancelled) => self.cancelled(scan_id).await,
            Err(Interrupt::Failed(_)) if cancel.is_cancelled() => self.cancelled(scan_id).await,
            Err(Interrupt::Failed(message)) => self.fail(scan_id, message).await,
            Err(Interrupt::Abandoned) => RunOutcome::Skipped,
        };

        self.release(&run).await;

        let elapsed = started.elapsed();
        let elapsed_secs = elapsed.as_secs_f64();
        match &outcome {
            RunOutcome::Completed { total, counts } => {
                self.metrics.on_completed(elapsed, *counts);
                tracing::info!(scan_id = %scan_id, elapsed_secs, findings = total, "Scan completed");
            }
            RunOutcome::Cancelled => {
                self.metrics.on_cancelled(elapsed);
                tracing::info!(scan_id = %scan_id, elapsed_secs, progress = reporter.percent(), "Scan cancelled");
            }
            RunOutcome::Failed(_) => {
                self.metrics.on_failed(elapsed);
                tracing::info!(scan_id = %scan_id, elapsed_secs, progress = reporter.percent(), "Scan failed");
            }
            RunOutcome::Skipped => {
                self.metrics.on_abandoned();
                tracing::warn!(scan_id = %scan_id, elapsed_secs, "Scan finished elsewhere; run abandoned");
            }
        }
        outcome
    }

    /// Race the phase loop against both cancellation paths.
    async fn drive(
        &self,
        job: &ScanJob,
        cancel: &CancellationToken,
        reporter: &mut ProgressReporter,
        run: &mut RunState,
    ) -> Result<Vec<RawFinding>, Interrupt> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Interrupt::Cancelled),
            interrupt = self.watch_ledger(job.id) => Err(interrupt),
            result = self.execute(job, run, reporter) => result,
        }
    }

    /// Re-read the row once per tick. Resolves when another process recorded
    /// a cancel or the row left InProgress.
    async fn watch_ledger(&self, scan_id: Uuid) -> Interrupt {
        loop {
            tokio::time::sleep(self.settings.poll_interval).await;
            match self.ledger.get(scan_id).await {
                Ok(Some(job)) if job.status != ScanStatus::InProgress => {
                    tracing::warn!(scan_id = %scan_id, status = %job.status, "Scan left in_progress while running");
                    return Interrupt::Abandoned;
                }
                Ok(Some(job)) if job.cancel_requested_at.is_some() => {
                    tracing::info!(scan_id = %scan_id, "Cancel request found in ledger");
                    return Interrupt::Cancelled;
                }
                Ok(Some(_)) => {}
                Ok(None) => return Interrupt::Abandoned,
                Err(e) => {
                    tracing::warn!(scan_id = %scan_id, error = %e, "Failed to re-read running scan");
                }
            }
        }
    }

    /// Stop whatever is still running and close the session. The whole
    /// cleanup shares one call timeout so a hung engine cannot hold the
    /// worker.
    async fn release(&self, run: &RunState) {
        let Some(session) = &run.session else {
            return;
        };
        let cleanup = async {
            self.stop_running(session, &run.phases).await;
            if let Err(e) = self.engine.close_session(session).await {
                tracing::warn!(scan_id = %session.scan_id, error = %e, "Failed to close engine session");
            }
        };
        if tokio::time::timeout(self.settings.engine_call_timeout, cleanup)
            .await
            .is_err()
        {
            tracing::warn!(scan_id = %session.scan_id, "Engine cleanup timed out; session abandoned");
        }
    }

    async fn execute(
        &self,
        job: &ScanJob,
        run: &mut RunState,
        reporter: &mut ProgressReporter,
    ) -> Result<Vec<RawFinding>, Interrupt> {
        let plan = PhasePlan::for_kind(job.kind, self.settings.secondary_discovery);
        let budget = self.ceiling(&plan);

        // Opening may queue behind another scan of the same target, so it
        // gets the scan's whole budget rather than a single call timeout.
        let opened = self
            .retrying_within("open engine session", budget, || {
                self.engine.open_session(job.id, &job.target_url, &job.config)
            })
            .await?;
        run.session = Some(opened.clone());
        let session = &opened;
        let ceiling = Instant::now() + budget;

        if let Err(e) = self.ledger.set_engine_handle(job.id, &session.context).await {
            tracing::warn!(scan_id = %job.id, error = %e, "Failed to record engine handle");
        }

        for phase in plan.phases() {
            let handle = match phase {
                Phase::Discovery | Phase::SecondaryDiscovery => {
                    let mode = discovery_mode(phase);
                    let handle = self
                        .retrying(phase.label(), || self.engine.start_discovery(session, mode))
                        .await?;
                    Some(handle)
                }
                Phase::PassiveAnalysis => {
                    self.retrying(phase.label(), || self.engine.trigger_passive(session))
                        .await?;
                    None
                }
                Phase::ActiveTesting => Some(
                    self.retrying(phase.label(), || self.engine.start_active(session))
                        .await?,
                ),
            };
            tracing::debug!(scan_id = %job.id, phase = phase.label(), handle = ?handle, "Phase started");
            run.phases.push(PhaseTrack {
                phase,
                handle,
                state: PhaseState::Running,
                percent: 0,
                deadline: Instant::now() + self.phase_timeout(phase),
            });
        }

        loop {
            self.poll_phases(job.id, session, run).await?;
            self.enforce_deadlines(job.id, session, run, ceiling).await;

            let samples: Vec<(Phase, u8)> =
                run.phases.iter().map(|t| (t.phase, t.progress())).collect();
            // 100 is reserved for the Completed transition.
            let percent = plan.combined_progress(&samples).min(99);
            reporter.report(percent, &describe_step(run)).await;

            if run.phases.iter().all(PhaseTrack::is_finished) {
                break;
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }

        reporter.report(99, COLLECTING_RESULTS).await;
        self.retrying("fetch findings", || self.engine.fetch_findings(session))
            .await
    }

    /// Sample every running phase once. Passive analysis is sampled last so
    /// it sees discovery results from the same tick.
    async fn poll_phases(
        &self,
        scan_id: Uuid,
        session: &EngineSession,
        run: &mut RunState,
    ) -> Result<(), Interrupt> {
        for track in run
            .phases
            .iter_mut()
            .filter(|t| !t.is_finished() && t.phase != Phase::PassiveAnalysis)
        {
            let Some(handle) = track.handle.clone() else {
                continue;
            };
            let sample = match track.phase {
                Phase::ActiveTesting => self.call(self.engine.poll_active(session, &handle)).await,
                phase => {
                    self.call(self.engine.poll_discovery(session, discovery_mode(phase), &handle))
                        .await
                }
            };
            match sample {
                Ok(percent) => track.observe(percent),
                Err(e) => tolerate(scan_id, track.phase, e)?,
            }
        }

        let discovery_finished = run
            .phases
            .iter()
            .filter(|t| t.phase.is_discovery())
            .all(PhaseTrack::is_finished);

        let Some(track) = run
            .phases
            .iter_mut()
            .find(|t| t.phase == Phase::PassiveAnalysis && !t.is_finished())
        else {
            return Ok(());
        };

        match self.call(self.engine.passive_backlog(session)).await {
            Ok(backlog) => {
                run.backlog_peak = run.backlog_peak.max(backlog);
                run.backlog = Some(backlog);
                if discovery_finished && backlog == 0 {
                    track.observe(100);
                } else {
                    track.observe(passive_percent(run.backlog_peak, backlog));
                }
            }
            Err(e) => tolerate(scan_id, track.phase, e)?,
        }
        Ok(())
    }

    /// Stop phases past their own deadline or the overall ceiling. A timed
    /// out phase counts as finished; the scan still collects results.
    async fn enforce_deadlines(
        &self,
        scan_id: Uuid,
        session: &EngineSession,
        run: &mut RunState,
        ceiling: Instant,
    ) {
        let now = Instant::now();
        for track in run.phases.iter_mut().filter(|t| !t.is_finished()) {
            if now < track.deadline && now < ceiling {
                continue;
            }
            tracing::warn!(
                scan_id = %scan_id,
                phase = track.phase.label(),
                percent = track.percent,
                "Phase timed out; requesting stop"
            );
            self.stop_phase(session, track).await;
            track.state = PhaseState::TimedOut;
        }
    }

    async fn stop_running(&self, session: &EngineSession, phases: &[PhaseTrack]) {
        for track in phases.iter().filter(|t| !t.is_finished()) {
            self.stop_phase(session, track).await;
        }
    }

    async fn stop_phase(&self, session: &EngineSession, track: &PhaseTrack) {
        let result = match (track.phase, &track.handle) {
            (Phase::ActiveTesting, Some(handle)) => {
                self.call(self.engine.stop_active(session, handle)).await
            }
            (phase, Some(handle)) if phase.is_discovery() => {
                self.call(self.engine.stop_discovery(session, discovery_mode(phase), handle))
                    .await
            }
            // Passive analysis drains on its own.
            _ => Ok(()),
        };
        if let Err(e) = result {
            tracing::warn!(
                scan_id = %session.scan_id,
                phase = track.phase.label(),
                error = %e,
                "Failed to stop phase"
            );
        }
    }

    /// Bound a single engine call by the configured call timeout.
    async fn call<T>(
        &self,
        request: impl Future<Output = Result<T, EngineError>>,
    ) -> Result<T, EngineError> {
        self.call_within(self.settings.engine_call_timeout, request).await
    }

    async fn call_within<T>(
        &self,
        limit: Duration,
        request: impl Future<Output = Result<T, EngineError>>,
    ) -> Result<T, EngineError> {
        tokio::time::timeout(limit, request)
            .await
            .unwrap_or_else(|_| {
                Err(EngineError::Transient(format!(
                    "engine call exceeded {}s",
                    limit.as_secs()
                )))
            })
    }

    /// Run a start or fetch call, retrying transient failures.
    async fn retrying<T, F, Fut>(&self, what: &str, request: F) -> Result<T, Interrupt>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        self.retrying_within(what, self.settings.engine_call_timeout, request)
            .await
    }

    async fn retrying_within<T, F, Fut>(
        &self,
        what: &str,
        limit: Duration,
        mut request: F,
    ) -> Result<T, Interrupt>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let attempts = self.settings.engine_start_retries.max(1);
        let mut attempt = 1;
        loop {
            match self.call_within(limit, request()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < attempts => {
                    tracing::warn!(attempt, error = %e, "{what} failed; retrying");
                    tokio::time::sleep(self.settings.poll_interval).await;
                    attempt += 1;
                }
                Err(e) => return Err(Interrupt::Failed(format!("{what} failed: {e}"))),
            }
        }
    }

    async fn cancelled(&self, scan_id: Uuid) -> RunOutcome {
        self.finish(
            scan_id,
            ScanStatus::InProgress,
            ScanStatus::Cancelled,
            Some(CANCELLED_BY_CALLER),
        )
        .await;
        RunOutcome::Cancelled
    }

    async fn fail(&self, scan_id: Uuid, message: String) -> RunOutcome {
        tracing::error!(scan_id = %scan_id, error = %message, "Scan failed");
        self.finish(scan_id, ScanStatus::InProgress, ScanStatus::Failed, Some(&message))
            .await;
        RunOutcome::Failed(message)
    }

    /// Terminal status write, retried because it is the one write that must
    /// not be lost. Anything still unwritten is reconciled at next start.
    async fn finish(
        &self,
        scan_id: Uuid,
        from: ScanStatus,
        to: ScanStatus,
        message: Option<&str>,
    ) -> bool {
        for attempt in 1..=TERMINAL_WRITE_ATTEMPTS {
            match self.ledger.transition(scan_id, from, to, message).await {
                Ok(applied) => return applied,
                Err(e) if attempt < TERMINAL_WRITE_ATTEMPTS => {
                    tracing::warn!(scan_id = %scan_id, attempt, error = %e, "Terminal write failed; retrying");
                    tokio::time::sleep(Duration::from_millis(500 * u64::from(attempt))).await;
                }
                Err(e) => {
                    tracing::error!(scan_id = %scan_id, to = %to, error = %e, "Terminal write failed");
                }
            }
        }
        false
    }

    fn phase_timeout(&self, phase: Phase) -> Duration {
        match phase {
            Phase::Discovery | Phase::SecondaryDiscovery => self.settings.discovery_timeout,
            Phase::PassiveAnalysis => self.settings.passive_timeout,
            Phase::ActiveTesting => self.settings.active_timeout,
        }
    }

    /// Overall ceiling: the sum of the plan's phase timeouts.
    fn ceiling(&self, plan: &PhasePlan) -> Duration {
        plan.phases().map(|p| self.phase_timeout(p)).sum()
    }
}

/// Transient poll errors are skipped for this tick; fatal ones fail the scan.
fn tolerate(scan_id: Uuid, phase: Phase, error: EngineError) -> Result<(), Interrupt> {
    if error.is_transient() {
        tracing::warn!(scan_id = %scan_id, phase = phase.label(), error = %error, "Transient engine error");
        Ok(())
    } else {
        Err(Interrupt::Failed(format!("{} failed: {error}", phase.label())))
    }
}
