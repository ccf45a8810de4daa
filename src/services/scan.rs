//! Caller-facing scan operations, scoped to the requesting owner.

use std::sync::Arc;

use reqwest::Url;
use serde::Serialize;
use uuid::Uuid;
use validator::Validate;

use crate::errors::AppError;
use crate::ledger::ScanLedger;
use crate::models::pagination::{PagedResult, Pagination};
use crate::models::scan::{
    CreateScanRequest, NewScanJob, ScanFilters, ScanJob, ScanStats, ScanStatus,
};
use crate::models::scan_finding::ScanFinding;
use crate::services::admission::AdmissionController;
use crate::services::dispatcher::{CancelOutcome, Dispatcher};

/// A scan together with its findings.
#[derive(Debug, Serialize)]
pub struct ScanWithFindings {
    #[serde(flatten)]
    pub scan: ScanJob,
    pub findings: Vec<ScanFinding>,
}

#[derive(Clone)]
pub struct ScanService {
    ledger: Arc<dyn ScanLedger>,
    admission: AdmissionController,
    dispatcher: Dispatcher,
}

impl ScanService {
    pub fn new(
        ledger: Arc<dyn ScanLedger>,
        admission: AdmissionController,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            ledger,
            admission,
            dispatcher,
        }
    }

    /// Validate, admit and queue a new scan. Returns the Pending job.
    pub async fn create_scan(
        &self,
        owner_id: Uuid,
        req: CreateScanRequest,
    ) -> Result<ScanJob, AppError> {
        req.validate()
            .map_err(|e| AppError::Validation(e.to_string()))?;
        let target_url = validate_target(&req.target_url)?;

        let config = req.config.unwrap_or_else(|| serde_json::json!({}));
        if !config.is_object() {
            return Err(AppError::Validation(
                "config must be a JSON object".to_string(),
            ));
        }

        let new = NewScanJob {
            owner_id,
            target_url,
            kind: req.kind,
            config,
        };
        let job = self.admission.admit(&new).await?;

        if let Err(e) = self.dispatcher.submit(job.id).await {
            tracing::error!(scan_id = %job.id, error = %e, "Failed to queue admitted scan");
            let message = format!("could not be queued: {e}");
            if let Err(write_err) = self
                .ledger
                .transition(job.id, ScanStatus::Pending, ScanStatus::Failed, Some(&message))
                .await
            {
                tracing::error!(scan_id = %job.id, error = %write_err, "Failed to mark unqueued scan as failed");
            }
            return Err(AppError::Internal(format!("Failed to queue scan: {e}")));
        }

        Ok(job)
    }

    pub async fn get_scan(&self, owner_id: Uuid, id: Uuid) -> Result<ScanJob, AppError> {
        self.ledger
            .get(id)
            .await?
            .filter(|job| job.owner_id == owner_id)
            .ok_or_else(|| AppError::NotFound("Scan not found".to_string()))
    }

    pub async fn get_scan_with_findings(
        &self,
        owner_id: Uuid,
        id: Uuid,
    ) -> Result<ScanWithFindings, AppError> {
        let scan = self.get_scan(owner_id, id).await?;
        let findings = self.ledger.findings(id).await?;
        Ok(ScanWithFindings { scan, findings })
    }

    pub async fn list_scans(
        &self,
        owner_id: Uuid,
        filters: &ScanFilters,
        pagination: &Pagination,
    ) -> Result<PagedResult<ScanJob>, AppError> {
        let (items, total) = self.ledger.list(owner_id, filters, pagination).await?;
        Ok(PagedResult::new(items, total, pagination))
    }

    pub async fn cancel_scan(&self, owner_id: Uuid, id: Uuid) -> Result<CancelOutcome, AppError> {
        match self.get_scan(owner_id, id).await {
            Ok(_) => self.dispatcher.cancel(id).await,
            Err(e) if e.is_not_found() => Ok(CancelOutcome::NotFound),
            Err(e) => Err(e),
        }
    }

    /// Delete a scan and its findings. Refused while the scan is running.
    pub async fn delete_scan(&self, owner_id: Uuid, id: Uuid) -> Result<(), AppError> {
        self.get_scan(owner_id, id).await?;
        self.ledger.delete(id).await?;
        tracing::info!(scan_id = %id, owner = %owner_id, "Scan deleted");
        Ok(())
    }

    pub async fn scan_stats(&self, owner_id: Uuid) -> Result<ScanStats, AppError> {
        self.ledger.stats(owner_id).await
    }
}

/// Scan targets must be absolute http(s) URLs with a host.
fn validate_target(raw: &str) -> Result<String, AppError> {
    let trimmed = raw.trim();
    let url = Url::parse(trimmed)
        .map_err(|e| AppError::Validation(format!("Invalid target URL: {e}")))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(AppError::Validation(format!(
            "Unsupported target URL scheme: {}",
            url.scheme()
        )));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(AppError::Validation(
            "Target URL must include a host".to_string(),
        ));
    }
    Ok(trimmed.to_string())
}
