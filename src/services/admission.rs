//! Per-owner concurrency quota enforced at scan creation.

use std::sync::Arc;

use crate::errors::AppError;
use crate::ledger::{Admission, ScanLedger};
use crate::models::scan::{NewScanJob, ScanJob};

/// Result of an admission check.
#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionDecision {
    /// The Pending row was created.
    Allow(ScanJob),
    Reject { active: i64, limit: i64 },
}

/// Admits scans while an owner has fewer than `limit` Pending or
/// InProgress scans.
///
/// The count and the insert happen in one ledger call that serializes
/// concurrent admissions for the same owner.
#[derive(Clone)]
pub struct AdmissionController {
    ledger: Arc<dyn ScanLedger>,
    limit: i64,
}

impl AdmissionController {
    pub fn new(ledger: Arc<dyn ScanLedger>, limit: i64) -> Self {
        Self {
            ledger,
            limit: limit.max(1),
        }
    }

    pub async fn decide(&self, new: &NewScanJob) -> Result<AdmissionDecision, AppError> {
        match self.ledger.insert_within_quota(new, self.limit).await? {
            Admission::Admitted(job) => {
                tracing::info!(
                    scan_id = %job.id,
                    owner = %job.owner_id,
                    kind = ?job.kind,
                    target = %job.target_url,
                    "Scan admitted"
                );
                Ok(AdmissionDecision::Allow(job))
            }
            Admission::Rejected { active } => {
                tracing::info!(owner = %new.owner_id, active, limit = self.limit, "Scan rejected by quota");
                Ok(AdmissionDecision::Reject {
                    active,
                    limit: self.limit,
                })
            }
        }
    }

    /// Admit or fail with `QuotaExceeded`.
    pub async fn admit(&self, new: &NewScanJob) -> Result<ScanJob, AppError> {
        match self.decide(new).await? {
            AdmissionDecision::Allow(job) => Ok(job),
            AdmissionDecision::Reject { active, limit } => {
                Err(AppError::QuotaExceeded { active, limit })
            }
        }
    }
}
