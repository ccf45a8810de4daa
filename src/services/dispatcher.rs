//! Job dispatcher: bounded queue, fixed worker pool, per-job cancellation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::errors::AppError;
use crate::ledger::ScanLedger;
use crate::models::scan::ScanStatus;
use crate::services::lifecycle::{self, CANCELLED_BY_CALLER};
use crate::services::runner::ScanRunner;

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Accepted,
    NotFound,
    NotCancellable(ScanStatus),
}

struct Shared {
    ledger: Arc<dyn ScanLedger>,
    runner: ScanRunner,
    inflight: Mutex<HashMap<Uuid, CancellationToken>>,
    sender: Mutex<Option<mpsc::Sender<Uuid>>>,
    stopping: CancellationToken,
}

impl Shared {
    fn token(&self, id: Uuid) -> Option<CancellationToken> {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    fn forget(&self, id: Uuid) {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }
}

/// Handle to the worker pool. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Dispatcher {
    /// Start `worker_count` workers consuming a queue of `queue_capacity`.
    pub fn spawn(
        ledger: Arc<dyn ScanLedger>,
        runner: ScanRunner,
        worker_count: usize,
        queue_capacity: usize,
    ) -> Self {
        let (sender, receiver) = mpsc::channel::<Uuid>(queue_capacity.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let shared = Arc::new(Shared {
            ledger,
            runner,
            inflight: Mutex::new(HashMap::new()),
            sender: Mutex::new(Some(sender)),
            stopping: CancellationToken::new(),
        });

        let workers = (0..worker_count.max(1))
            .map(|worker| {
                let shared = shared.clone();
                let receiver = receiver.clone();
                tokio::spawn(worker_loop(worker, shared, receiver))
            })
            .collect();

        tracing::info!(workers = worker_count.max(1), queue_capacity, "Scan worker pool started");

        Self {
            shared,
            workers: Arc::new(Mutex::new(workers)),
        }
    }

    /// Hand a Pending job to the pool. Submitting a job that is already
    /// queued or running is a no-op.
    pub async fn submit(&self, scan_id: Uuid) -> Result<(), AppError> {
        let sender = self
            .shared
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| AppError::Internal("Dispatcher is shut down".to_string()))?;

        {
            let mut inflight = self
                .shared
                .inflight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if inflight.contains_key(&scan_id) {
                return Ok(());
            }
            inflight.insert(scan_id, CancellationToken::new());
        }

        if sender.send(scan_id).await.is_err() {
            self.shared.forget(scan_id);
            return Err(AppError::Internal("Dispatcher is shut down".to_string()));
        }
        tracing::debug!(scan_id = %scan_id, "Scan queued");
        Ok(())
    }

    /// Request cancellation of a Pending or InProgress job.
    ///
    /// A Pending job is moved straight to Cancelled. For a running job the
    /// request is recorded in the ledger, where whichever process runs it
    /// picks it up within one tick; a local worker is also signalled
    /// directly. A job that finished first is reported as not cancellable.
    pub async fn cancel(&self, scan_id: Uuid) -> Result<CancelOutcome, AppError> {
        let Some(job) = self.shared.ledger.get(scan_id).await? else {
            return Ok(CancelOutcome::NotFound);
        };
        if !lifecycle::is_cancellable(job.status) {
            return Ok(CancelOutcome::NotCancellable(job.status));
        }

        if let Some(token) = self.shared.token(scan_id) {
            token.cancel();
        }

        let accepted = if job.status == ScanStatus::Pending
            && self
                .shared
                .ledger
                .transition(
                    scan_id,
                    ScanStatus::Pending,
                    ScanStatus::Cancelled,
                    Some(CANCELLED_BY_CALLER),
                )
                .await?
        {
            true
        } else {
            // Running here or elsewhere, or a worker took it between our
            // read and the write.
            self.shared.ledger.request_cancel(scan_id).await?
        };

        if !accepted {
            return match self.shared.ledger.get(scan_id).await? {
                Some(job) => Ok(CancelOutcome::NotCancellable(job.status)),
                None => Ok(CancelOutcome::NotFound),
            };
        }

        tracing::info!(scan_id = %scan_id, status = %job.status, "Cancellation accepted");
        Ok(CancelOutcome::Accepted)
    }

    /// Whether a job is queued or running in this process.
    pub fn is_tracked(&self, scan_id: Uuid) -> bool {
        self.shared.token(scan_id).is_some()
    }

    /// Stop accepting jobs and wait for workers to finish their current job.
    ///
    /// Queued jobs stay Pending for the next start to pick up. Callers bound
    /// the wait with a timeout; jobs left running are reconciled on restart.
    pub async fn shutdown(&self) {
        self.shared
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.shared.stopping.cancel();

        let workers: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "Scan worker exited abnormally");
            }
        }
        tracing::info!("Scan worker pool stopped");
    }
}

async fn worker_loop(
    worker: usize,
    shared: Arc<Shared>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Uuid>>>,
) {
    tracing::debug!(worker, "Scan worker started");
    loop {
        let next = tokio::select! {
            biased;
            _ = shared.stopping.cancelled() => None,
            id = async { receiver.lock().await.recv().await } => id,
        };
        let Some(scan_id) = next else {
            break;
        };
        let Some(cancel) = shared.token(scan_id) else {
            continue;
        };

        // Each job runs in its own task so a panic is contained to the job.
        let runner = shared.runner.clone();
        let task = tokio::spawn(async move { runner.run(scan_id, cancel).await });

        match task.await {
            Ok(outcome) => {
                tracing::debug!(worker, scan_id = %scan_id, outcome = ?outcome, "Scan finished");
            }
            Err(e) => {
                tracing::error!(worker, scan_id = %scan_id, error = %e, "Scan task panicked");
                fail_after_panic(shared.ledger.as_ref(), scan_id, &e.to_string()).await;
            }
        }
        shared.forget(scan_id);
    }
    tracing::debug!(worker, "Scan worker stopped");
}

async fn fail_after_panic(ledger: &dyn ScanLedger, scan_id: Uuid, detail: &str) {
    let message = format!("worker panicked: {detail}");
    let from = match ledger.get(scan_id).await {
        Ok(Some(job)) if job.status.is_active() => job.status,
        Ok(_) => return,
        Err(e) => {
            tracing::error!(scan_id = %scan_id, error = %e, "Failed to load scan after panic");
            return;
        }
    };
    if let Err(e) = ledger
        .transition(scan_id, from, ScanStatus::Failed, Some(&message))
        .await
    {
        tracing::error!(scan_id = %scan_id, error = %e, "Failed to mark panicked scan as failed");
    }
}
