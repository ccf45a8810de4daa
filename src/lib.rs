pub mod config;
pub mod db;
pub mod engine;
pub mod errors;
pub mod ledger;
pub mod models;
pub mod services;

use std::sync::Arc;

use config::OrchestratorSettings;
use engine::EngineClient;
use ledger::ScanLedger;
use services::admission::AdmissionController;
use services::dispatcher::Dispatcher;
use services::metrics::ScanMetrics;
use services::runner::ScanRunner;
use services::scan::ScanService;

/// Running orchestration core shared by the worker binary and embedders.
#[derive(Clone)]
pub struct Orchestrator {
    pub ledger: Arc<dyn ScanLedger>,
    pub dispatcher: Dispatcher,
    pub scans: ScanService,
    /// Counters for runs executed by this process's workers.
    pub metrics: Arc<ScanMetrics>,
}

impl Orchestrator {
    /// Wire the services together and start the worker pool.
    pub fn start(
        ledger: Arc<dyn ScanLedger>,
        engine: Arc<dyn EngineClient>,
        settings: OrchestratorSettings,
    ) -> Self {
        let metrics = Arc::new(ScanMetrics::new());
        let runner = ScanRunner::new(ledger.clone(), engine, metrics.clone(), settings.clone());
        let dispatcher = Dispatcher::spawn(
            ledger.clone(),
            runner,
            settings.worker_count,
            settings.queue_capacity,
        );
        let admission = AdmissionController::new(ledger.clone(), settings.max_active_per_owner);
        let scans = ScanService::new(ledger.clone(), admission, dispatcher.clone());

        Self {
            ledger,
            dispatcher,
            scans,
            metrics,
        }
    }
}
