//! Scan engine boundary.
//!
//! The engine is an opaque collaborator that scans a target and reports
//! raw alerts. Every call returns an [`EngineError`] that
//! is either transient (keep polling) or fatal (fail the scan).

pub mod zap;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use crate::errors::EngineError;
pub use zap::ZapClient;

/// Reservation an engine holds on behalf of a session, released when the
/// last clone of the session is dropped.
#[derive(Clone)]
pub struct SessionLease(Arc<dyn Any + Send + Sync>);

impl SessionLease {
    pub fn new<T: Send + Sync + 'static>(guard: T) -> Self {
        Self(Arc::new(guard))
    }
}

impl fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionLease")
    }
}

impl PartialEq for SessionLease {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for SessionLease {}

/// Engine-side isolation scope for one scan.
///
/// Implementations that share an engine between concurrent scans must key
/// discovered URLs and alerts by `context` so sessions never see each
/// other's data. Where the engine cannot separate them (alerts for the same
/// target), the implementation holds a `lease` that keeps other sessions
/// for that target waiting until this one is dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSession {
    pub scan_id: Uuid,
    pub target: String,
    pub context: String,
    pub context_id: Option<String>,
    pub config: serde_json::Value,
    pub lease: Option<SessionLease>,
}

impl EngineSession {
    pub fn new(scan_id: Uuid, target: impl Into<String>) -> Self {
        Self {
            scan_id,
            target: target.into(),
            context: format!("scanorch-{scan_id}"),
            context_id: None,
            config: serde_json::Value::Null,
            lease: None,
        }
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    /// Read a positive integer option from the scan's config.
    pub fn config_u64(&self, key: &str) -> Option<u64> {
        self.config.get(key).and_then(|v| {
            v.as_u64()
                .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
        })
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }
}

/// Which discovery mechanism a discovery phase uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryMode {
    /// Link-following spider.
    Standard,
    /// Browser-driven spider for script-heavy targets.
    Secondary,
}

/// Engine-assigned identifier of a started phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseHandle(pub String);

/// One alert as reported by the engine, before normalization.
///
/// Risk is kept as raw JSON because engines report it as numeric strings,
/// numbers or labels.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RawFinding {
    #[serde(default)]
    pub alert: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub risk: Option<serde_json::Value>,
    #[serde(default)]
    pub confidence: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub solution: Option<String>,
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub cweid: Option<serde_json::Value>,
    #[serde(default)]
    pub wascid: Option<serde_json::Value>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub param: Option<String>,
    #[serde(default)]
    pub attack: Option<String>,
    #[serde(default)]
    pub evidence: Option<String>,
    #[serde(default)]
    pub other: Option<String>,
    #[serde(default)]
    pub tags: Option<serde_json::Value>,
}

impl RawFinding {
    /// Alert title, preferring `alert` over `name`.
    pub fn title(&self) -> Option<&str> {
        self.alert
            .as_deref()
            .or(self.name.as_deref())
            .filter(|t| !t.is_empty())
    }
}

/// Lifecycle API of a scan engine.
#[async_trait]
pub trait EngineClient: Send + Sync {
    /// Prepare an isolated session for a scan. `config` is the scan's
    /// opaque configuration, passed through untouched.
    ///
    /// May wait for another session on the same target to be dropped.
    async fn open_session(
        &self,
        scan_id: Uuid,
        target: &str,
        config: &serde_json::Value,
    ) -> Result<EngineSession, EngineError>;

    async fn start_discovery(
        &self,
        session: &EngineSession,
        mode: DiscoveryMode,
    ) -> Result<PhaseHandle, EngineError>;

    /// Discovery completion percentage, 0..=100.
    async fn poll_discovery(
        &self,
        session: &EngineSession,
        mode: DiscoveryMode,
        handle: &PhaseHandle,
    ) -> Result<u8, EngineError>;

    async fn stop_discovery(
        &self,
        session: &EngineSession,
        mode: DiscoveryMode,
        handle: &PhaseHandle,
    ) -> Result<(), EngineError>;

    /// Ask the engine to analyze responses passively as they are observed.
    async fn trigger_passive(&self, session: &EngineSession) -> Result<(), EngineError>;

    /// Records still waiting for passive analysis.
    async fn passive_backlog(&self, session: &EngineSession) -> Result<u64, EngineError>;

    async fn start_active(&self, session: &EngineSession) -> Result<PhaseHandle, EngineError>;

    async fn poll_active(
        &self,
        session: &EngineSession,
        handle: &PhaseHandle,
    ) -> Result<u8, EngineError>;

    async fn stop_active(
        &self,
        session: &EngineSession,
        handle: &PhaseHandle,
    ) -> Result<(), EngineError>;

    /// All alerts raised within the session's scope.
    async fn fetch_findings(&self, session: &EngineSession) -> Result<Vec<RawFinding>, EngineError>;

    /// Release engine-side resources held by the session.
    async fn close_session(&self, session: &EngineSession) -> Result<(), EngineError>;
}
