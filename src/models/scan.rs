//! Scan job model: identity, lifecycle status, progress and aggregate counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

use crate::models::scan_finding::RiskCounts;

// -- Enums matching PostgreSQL --

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "scan_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ScanKind {
    /// Discovery with opportunistic passive analysis.
    Basic,
    /// Discovery, passive analysis and active testing.
    Full,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "scan_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl ScanStatus {
    pub const ALL: [ScanStatus; 5] = [
        ScanStatus::Pending,
        ScanStatus::InProgress,
        ScanStatus::Completed,
        ScanStatus::Failed,
        ScanStatus::Cancelled,
    ];

    /// Completed, Failed and Cancelled are never exited.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Pending and InProgress scans count against the owner's quota.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// -- Scan job --

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct ScanJob {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub target_url: String,
    pub kind: ScanKind,
    pub status: ScanStatus,
    pub config: serde_json::Value,
    pub progress: i32,
    pub current_step: Option<String>,
    pub total_findings: i32,
    pub high_count: i32,
    pub medium_count: i32,
    pub low_count: i32,
    pub info_count: i32,
    pub error_message: Option<String>,
    pub engine_handle: Option<String>,
    /// Set when an owner asked to cancel the scan while it was running.
    /// The worker that owns the row honors it on its next tick.
    pub cancel_requested_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ScanJob {
    /// Build a fresh Pending row for an admitted request.
    pub fn pending(new: &NewScanJob, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            owner_id: new.owner_id,
            target_url: new.target_url.clone(),
            kind: new.kind,
            status: ScanStatus::Pending,
            config: new.config.clone(),
            progress: 0,
            current_step: None,
            total_findings: 0,
            high_count: 0,
            medium_count: 0,
            low_count: 0,
            info_count: 0,
            error_message: None,
            engine_handle: None,
            cancel_requested_at: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    pub fn risk_counts(&self) -> RiskCounts {
        RiskCounts {
            high: self.high_count,
            medium: self.medium_count,
            low: self.low_count,
            informational: self.info_count,
        }
    }
}

/// Validated, immutable part of a scan job supplied at admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewScanJob {
    pub owner_id: Uuid,
    pub target_url: String,
    pub kind: ScanKind,
    pub config: serde_json::Value,
}

/// Caller request to create a scan.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateScanRequest {
    #[validate(url(message = "target_url must be an absolute URL"))]
    pub target_url: String,
    #[serde(default = "default_kind")]
    pub kind: ScanKind,
    #[serde(default)]
    pub config: Option<serde_json::Value>,
}

fn default_kind() -> ScanKind {
    ScanKind::Basic
}

/// Filters for listing an owner's scans.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScanFilters {
    pub status: Option<ScanStatus>,
    pub kind: Option<ScanKind>,
}

/// Per-owner scan statistics.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ScanStats {
    pub total_scans: i64,
    pub pending_scans: i64,
    pub in_progress_scans: i64,
    pub completed_scans: i64,
    pub failed_scans: i64,
    pub cancelled_scans: i64,
    /// Finding counters summed over Completed scans only.
    pub total_findings: i64,
    pub high_risk_findings: i64,
    pub medium_risk_findings: i64,
    pub low_risk_findings: i64,
    pub info_findings: i64,
}
