//! Unified error types for the ledger, service and engine boundaries.

/// Application error type returned by ledger and service operations.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("Quota exceeded: {active} of {limit} active scans")]
    QuotaExceeded { active: i64, limit: i64 },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Check if this error represents a not-found condition.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if this error is the per-owner quota rejection.
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }
}

/// Error reported by a scan engine call, classified so the orchestrator can
/// decide between retrying and failing the scan.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    /// Momentary condition (call timeout, connection refused, 5xx).
    #[error("transient engine error: {0}")]
    Transient(String),

    /// The engine refused the request or is in an unusable state.
    #[error("fatal engine error: {0}")]
    Fatal(String),
}

impl EngineError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}
