//! Shared fixtures: a scripted engine and helpers for driving the
//! orchestrator against the in-memory ledger.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use scanorch::config::OrchestratorSettings;
use scanorch::engine::{
    DiscoveryMode, EngineClient, EngineError, EngineSession, PhaseHandle, RawFinding,
};
use scanorch::ledger::{MemoryLedger, ScanLedger};
use scanorch::models::scan::{CreateScanRequest, ScanJob, ScanKind};
use scanorch::Orchestrator;
use uuid::Uuid;

#[derive(Default)]
struct Script {
    open_failures: VecDeque<EngineError>,
    discovery: VecDeque<Result<u8, EngineError>>,
    secondary: VecDeque<Result<u8, EngineError>>,
    backlog: VecDeque<Result<u64, EngineError>>,
    active: VecDeque<Result<u8, EngineError>>,
    findings: Vec<RawFinding>,
    panic_on_fetch: bool,
    hang_on_cleanup: bool,
    calls: Vec<String>,
}

/// Pop the next scripted response; the last one repeats forever.
fn next<T: Clone>(queue: &mut VecDeque<Result<T, EngineError>>, default: T) -> Result<T, EngineError> {
    if queue.len() > 1 {
        queue.pop_front().unwrap_or(Ok(default))
    } else {
        queue.front().cloned().unwrap_or(Ok(default))
    }
}

/// Engine whose poll responses are scripted per phase. Unscripted phases
/// finish on the first poll.
#[derive(Default)]
pub struct ScriptedEngine {
    script: Mutex<Script>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn discovery(self, samples: impl IntoIterator<Item = u8>) -> Self {
        self.script().discovery = samples.into_iter().map(Ok).collect();
        self
    }

    pub fn discovery_results(self, results: Vec<Result<u8, EngineError>>) -> Self {
        self.script().discovery = results.into();
        self
    }

    pub fn secondary(self, samples: impl IntoIterator<Item = u8>) -> Self {
        self.script().secondary = samples.into_iter().map(Ok).collect();
        self
    }

    pub fn backlog(self, samples: impl IntoIterator<Item = u64>) -> Self {
        self.script().backlog = samples.into_iter().map(Ok).collect();
        self
    }

    pub fn active(self, samples: impl IntoIterator<Item = u8>) -> Self {
        self.script().active = samples.into_iter().map(Ok).collect();
        self
    }

    pub fn active_results(self, results: Vec<Result<u8, EngineError>>) -> Self {
        self.script().active = results.into();
        self
    }

    pub fn open_failures(self, failures: Vec<EngineError>) -> Self {
        self.script().open_failures = failures.into();
        self
    }

    pub fn findings(self, findings: Vec<RawFinding>) -> Self {
        self.script().findings = findings;
        self
    }

    pub fn panic_on_fetch(self) -> Self {
        self.script().panic_on_fetch = true;
        self
    }

    /// Stop and close calls are recorded, then never answer.
    pub fn hang_on_cleanup(self) -> Self {
        self.script().hang_on_cleanup = true;
        self
    }

    async fn cleanup(&self, call: impl Into<String>) -> Result<(), EngineError> {
        self.record(call);
        let hang = self.script().hang_on_cleanup;
        if hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(())
    }

    /// Every engine call so far, as `name` or `name:detail`.
    pub fn calls(&self) -> Vec<String> {
        self.script().calls.clone()
    }

    pub fn called(&self, name: &str) -> bool {
        self.script().calls.iter().any(|c| c == name)
    }

    fn record(&self, call: impl Into<String>) {
        self.script().calls.push(call.into());
    }
}

fn mode_name(mode: DiscoveryMode) -> &'static str {
    match mode {
        DiscoveryMode::Standard => "standard",
        DiscoveryMode::Secondary => "secondary",
    }
}

#[async_trait]
impl EngineClient for ScriptedEngine {
    async fn open_session(
        &self,
        scan_id: Uuid,
        target: &str,
        config: &serde_json::Value,
    ) -> Result<EngineSession, EngineError> {
        self.record("open_session");
        if let Some(err) = self.script().open_failures.pop_front() {
            return Err(err);
        }
        Ok(EngineSession::new(scan_id, target).with_config(config.clone()))
    }

    async fn start_discovery(
        &self,
        _session: &EngineSession,
        mode: DiscoveryMode,
    ) -> Result<PhaseHandle, EngineError> {
        self.record(format!("start_discovery:{}", mode_name(mode)));
        Ok(PhaseHandle(mode_name(mode).to_string()))
    }

    async fn poll_discovery(
        &self,
        _session: &EngineSession,
        mode: DiscoveryMode,
        _handle: &PhaseHandle,
    ) -> Result<u8, EngineError> {
        let mut script = self.script();
        match mode {
            DiscoveryMode::Standard => next(&mut script.discovery, 100),
            DiscoveryMode::Secondary => next(&mut script.secondary, 100),
        }
    }

    async fn stop_discovery(
        &self,
        _session: &EngineSession,
        mode: DiscoveryMode,
        _handle: &PhaseHandle,
    ) -> Result<(), EngineError> {
        self.cleanup(format!("stop_discovery:{}", mode_name(mode))).await
    }

    async fn trigger_passive(&self, _session: &EngineSession) -> Result<(), EngineError> {
        self.record("trigger_passive");
        Ok(())
    }

    async fn passive_backlog(&self, _session: &EngineSession) -> Result<u64, EngineError> {
        next(&mut self.script().backlog, 0)
    }

    async fn start_active(&self, _session: &EngineSession) -> Result<PhaseHandle, EngineError> {
        self.record("start_active");
        Ok(PhaseHandle("active".to_string()))
    }

    async fn poll_active(
        &self,
        _session: &EngineSession,
        _handle: &PhaseHandle,
    ) -> Result<u8, EngineError> {
        next(&mut self.script().active, 100)
    }

    async fn stop_active(
        &self,
        _session: &EngineSession,
        _handle: &PhaseHandle,
    ) -> Result<(), EngineError> {
        self.cleanup("stop_active").await
    }

    async fn fetch_findings(&self, _session: &EngineSession) -> Result<Vec<RawFinding>, EngineError> {
        self.record("fetch_findings");
        let (panic, findings) = {
            let script = self.script();
            (script.panic_on_fetch, script.findings.clone())
        };
        if panic {
            panic!("engine adapter bug");
        }
        Ok(findings)
    }

    async fn close_session(&self, _session: &EngineSession) -> Result<(), EngineError> {
        self.cleanup("close_session").await
    }
}

pub fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        worker_count: 4,
        queue_capacity: 64,
        max_active_per_owner: 5,
        poll_interval: Duration::from_secs(1),
        discovery_timeout: Duration::from_secs(60),
        passive_timeout: Duration::from_secs(60),
        active_timeout: Duration::from_secs(120),
        secondary_discovery: false,
        engine_call_timeout: Duration::from_secs(5),
        engine_start_retries: 3,
        heartbeat_interval: Duration::from_secs(60),
    }
}

pub struct Harness {
    pub ledger: Arc<MemoryLedger>,
    pub engine: Arc<ScriptedEngine>,
    pub orchestrator: Orchestrator,
}

pub fn harness(engine: ScriptedEngine, settings: OrchestratorSettings) -> Harness {
    harness_with_ledger(Arc::new(MemoryLedger::new()), engine, settings)
}

pub fn harness_with_ledger(
    ledger: Arc<MemoryLedger>,
    engine: ScriptedEngine,
    settings: OrchestratorSettings,
) -> Harness {
    let engine = Arc::new(engine);
    let orchestrator = Orchestrator::start(ledger.clone(), engine.clone(), settings);
    Harness {
        ledger,
        engine,
        orchestrator,
    }
}

pub fn request(kind: ScanKind) -> CreateScanRequest {
    CreateScanRequest {
        target_url: "https://example.com".to_string(),
        kind,
        config: None,
    }
}

pub fn alert(name: &str, risk: &str) -> RawFinding {
    serde_json::from_value(serde_json::json!({
        "alert": name,
        "risk": risk,
        "confidence": "Medium",
        "url": "https://example.com/",
    }))
    .unwrap()
}

/// Poll the ledger until `done` holds for the scan.
pub async fn wait_until(
    ledger: &dyn ScanLedger,
    id: Uuid,
    done: impl Fn(&ScanJob) -> bool,
) -> ScanJob {
    for _ in 0..4000 {
        if let Some(job) = ledger.get(id).await.unwrap() {
            if done(&job) {
                return job;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("scan {id} never reached the expected state");
}

pub async fn wait_terminal(ledger: &dyn ScanLedger, id: Uuid) -> ScanJob {
    wait_until(ledger, id, |job| job.status.is_terminal()).await
}

/// Engine cleanup runs after the terminal write; wait for it to show up.
pub async fn wait_for_call(engine: &ScriptedEngine, name: &str) {
    for _ in 0..4000 {
        if engine.called(name) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("engine never received {name}");
}

/// Pending plus InProgress scans of an owner.
pub async fn active_scans(ledger: &dyn ScanLedger, owner: Uuid) -> i64 {
    let stats = ledger.stats(owner).await.unwrap();
    stats.pending_scans + stats.in_progress_scans
}

pub fn assert_non_decreasing(samples: &[i32]) {
    for pair in samples.windows(2) {
        assert!(pair[0] <= pair[1], "progress regressed: {samples:?}");
    }
}
