//! OWASP ZAP client over the JSON API.
//!
//! Each scan gets its own ZAP context (`scanorch-<scan id>`) that includes
//! the target URL prefix, so spider and active scans stay scoped to it.
//!
//! ZAP's alert store is global and outlives contexts, and two contexts on the
//! same target match the same URLs. One daemon therefore runs at most one
//! session per target origin at a time: the next session for that origin
//! waits for the previous one to be dropped, then clears the origin's old
//! alerts before it starts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;
use uuid::Uuid;

use super::{
    DiscoveryMode, EngineClient, EngineError, EngineSession, PhaseHandle, RawFinding, SessionLease,
};

/// Alerts fetched per `alert/view/alerts` page.
const ALERT_PAGE_SIZE: usize = 500;

/// Handle used for the AJAX spider, which ZAP does not number.
const AJAX_SPIDER_HANDLE: &str = "ajax";

type TargetLocks = HashMap<String, Arc<tokio::sync::Mutex<()>>>;

#[derive(Debug, Clone)]
pub struct ZapClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    targets: Arc<Mutex<TargetLocks>>,
}

impl ZapClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        call_timeout: Duration,
    ) -> Result<Self, EngineError> {
        let client = Client::builder()
            .timeout(call_timeout)
            .build()
            .map_err(|e| EngineError::Fatal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
            targets: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Wait until no other session holds `target`'s origin.
    async fn reserve_target(&self, target: &str) -> SessionLease {
        let key = target_key(target);
        let lock = {
            let mut targets = self.targets.lock().unwrap_or_else(PoisonError::into_inner);
            // Entries only the map refers to are idle.
            targets.retain(|k, lock| *k == key || Arc::strong_count(lock) > 1);
            targets.entry(key.clone()).or_default().clone()
        };
        if lock.try_lock().is_err() {
            tracing::info!(target_origin = %key, "Waiting for another scan of the same target");
        }
        SessionLease::new(lock.lock_owned().await)
    }

    /// ZAP version string, used as a liveness check at startup.
    pub async fn version(&self) -> Result<String, EngineError> {
        let body = self.call("core", "view", "version", &[]).await?;
        string_field(&body, "version")
    }

    /// Issue one `/JSON/<component>/<kind>/<name>/` request.
    async fn call(
        &self,
        component: &str,
        kind: &str,
        name: &str,
        params: &[(&str, String)],
    ) -> Result<Value, EngineError> {
        let path = format!("{component}/{kind}/{name}");
        let url = format!("{}/JSON/{path}/", self.base_url);

        let mut request = self.client.get(&url).query(params);
        if let Some(key) = &self.api_key {
            request = request.header("X-ZAP-API-Key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| classify_transport(&path, e))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(EngineError::Transient(format!("{path} returned {status}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Fatal(describe_rejection(&path, status, &body)));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| EngineError::Fatal(format!("{path} returned an unreadable body: {e}")))
    }
}

fn classify_transport(path: &str, err: reqwest::Error) -> EngineError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        EngineError::Transient(format!("{path}: {err}"))
    } else {
        EngineError::Fatal(format!("{path}: {err}"))
    }
}

/// ZAP rejects bad requests with `{"code": "...", "message": "..."}`.
fn describe_rejection(path: &str, status: StatusCode, body: &str) -> String {
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            let code = v.get("code").and_then(Value::as_str).unwrap_or_default().to_string();
            let message = v.get("message").and_then(Value::as_str).unwrap_or_default().to_string();
            match (code.is_empty(), message.is_empty()) {
                (true, true) => None,
                (false, true) => Some(code),
                (true, false) => Some(message),
                (false, false) => Some(format!("{code}: {message}")),
            }
        })
        .unwrap_or_else(|| status.to_string());
    format!("{path} rejected: {detail}")
}

/// ZAP reports numbers as JSON strings; accept either.
fn string_field(body: &Value, key: &str) -> Result<String, EngineError> {
    match body.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(EngineError::Fatal(format!("response is missing `{key}`"))),
    }
}

fn percent_field(body: &Value, key: &str) -> Result<u8, EngineError> {
    let raw = string_field(body, key)?;
    let value: u64 = raw
        .trim()
        .parse()
        .map_err(|_| EngineError::Fatal(format!("`{key}` is not a percentage: {raw}")))?;
    Ok(value.min(100) as u8)
}

/// The AJAX spider reports a state rather than a percentage.
fn ajax_status_percent(body: &Value) -> Result<u8, EngineError> {
    match string_field(body, "status")?.as_str() {
        "stopped" => Ok(100),
        "running" => Ok(0),
        other => Err(EngineError::Fatal(format!("unknown AJAX spider status: {other}"))),
    }
}

fn include_pattern(target: &str) -> String {
    format!("^{}.*", regex::escape(target))
}

/// Sessions are serialized per origin; unparseable targets fall back to the
/// raw string.
fn target_key(target: &str) -> String {
    Url::parse(target)
        .map(|url| url.origin().ascii_serialization())
        .unwrap_or_else(|_| target.to_string())
}

#[async_trait]
impl EngineClient for ZapClient {
    async fn open_session(
        &self,
        scan_id: Uuid,
        target: &str,
        config: &Value,
    ) -> Result<EngineSession, EngineError> {
        let mut session = EngineSession::new(scan_id, target).with_config(config.clone());
        session.lease = Some(self.reserve_target(target).await);

        // Alerts left by an earlier scan of this target would otherwise be
        // reported again.
        self.call(
            "alert",
            "action",
            "deleteAlerts",
            &[("baseurl", session.target.clone())],
        )
        .await?;

        let created = self
            .call(
                "context",
                "action",
                "newContext",
                &[("contextName", session.context.clone())],
            )
            .await?;
        session.context_id = Some(string_field(&created, "contextId")?);

        self.call(
            "context",
            "action",
            "includeInContext",
            &[
                ("contextName", session.context.clone()),
                ("regex", include_pattern(target)),
            ],
        )
        .await?;

        Ok(session)
    }

    async fn start_discovery(
        &self,
        session: &EngineSession,
        mode: DiscoveryMode,
    ) -> Result<PhaseHandle, EngineError> {
        match mode {
            DiscoveryMode::Standard => {
                let mut params = vec![
                    ("url", session.target.clone()),
                    ("contextName", session.context.clone()),
                    ("recurse", "true".to_string()),
                ];
                if let Some(max_children) = session.config_u64("max_children") {
                    params.push(("maxChildren", max_children.to_string()));
                }
                if let Some(max_depth) = session.config_u64("max_depth") {
                    // Spider depth is a global option in ZAP.
                    self.call(
                        "spider",
                        "action",
                        "setOptionMaxDepth",
                        &[("Integer", max_depth.to_string())],
                    )
                    .await?;
                }
                let body = self.call("spider", "action", "scan", &params).await?;
                Ok(PhaseHandle(string_field(&body, "scan")?))
            }
            DiscoveryMode::Secondary => {
                self.call(
                    "ajaxSpider",
                    "action",
                    "scan",
                    &[
                        ("url", session.target.clone()),
                        ("contextName", session.context.clone()),
                        ("inScope", "true".to_string()),
                    ],
                )
                .await?;
                Ok(PhaseHandle(AJAX_SPIDER_HANDLE.to_string()))
            }
        }
    }

    async fn poll_discovery(
        &self,
        _session: &EngineSession,
        mode: DiscoveryMode,
        handle: &PhaseHandle,
    ) -> Result<u8, EngineError> {
        match mode {
            DiscoveryMode::Standard => {
                let body = self
                    .call("spider", "view", "status", &[("scanId", handle.0.clone())])
                    .await?;
                percent_field(&body, "status")
            }
            DiscoveryMode::Secondary => {
                let body = self.call("ajaxSpider", "view", "status", &[]).await?;
                ajax_status_percent(&body)
            }
        }
    }

    async fn stop_discovery(
        &self,
        _session: &EngineSession,
        mode: DiscoveryMode,
        handle: &PhaseHandle,
    ) -> Result<(), EngineError> {
        match mode {
            DiscoveryMode::Standard => {
                self.call("spider", "action", "stop", &[("scanId", handle.0.clone())])
                    .await?;
            }
            DiscoveryMode::Secondary => {
                self.call("ajaxSpider", "action", "stop", &[]).await?;
            }
        }
        Ok(())
    }

    async fn trigger_passive(&self, session: &EngineSession) -> Result<(), EngineError> {
        // Passive rules run on every proxied response; fetching the target
        // through ZAP guarantees at least one record for small sites.
        self.call(
            "core",
            "action",
            "accessUrl",
            &[
                ("url", session.target.clone()),
                ("followRedirects", "true".to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    /// ZAP keeps one passive queue for the whole daemon, so the backlog also
    /// counts records produced by other scans' traffic.
    async fn passive_backlog(&self, _session: &EngineSession) -> Result<u64, EngineError> {
        let body = self.call("pscan", "view", "recordsToScan", &[]).await?;
        let raw = string_field(&body, "recordsToScan")?;
        raw.trim()
            .parse()
            .map_err(|_| EngineError::Fatal(format!("`recordsToScan` is not a count: {raw}")))
    }

    async fn start_active(&self, session: &EngineSession) -> Result<PhaseHandle, EngineError> {
        let mut params = vec![
            ("url", session.target.clone()),
            ("recurse", "true".to_string()),
        ];
        if let Some(context_id) = &session.context_id {
            params.push(("contextId", context_id.clone()));
        }
        if let Some(policy) = session.config_str("scan_policy") {
            params.push(("scanPolicyName", policy.to_string()));
        }
        let body = self.call("ascan", "action", "scan", &params).await?;
        Ok(PhaseHandle(string_field(&body, "scan")?))
    }

    async fn poll_active(
        &self,
        _session: &EngineSession,
        handle: &PhaseHandle,
    ) -> Result<u8, EngineError> {
        let body = self
            .call("ascan", "view", "status", &[("scanId", handle.0.clone())])
            .await?;
        percent_field(&body, "status")
    }

    async fn stop_active(
        &self,
        _session: &EngineSession,
        handle: &PhaseHandle,
    ) -> Result<(), EngineError> {
        self.call("ascan", "action", "stop", &[("scanId", handle.0.clone())])
            .await?;
        Ok(())
    }

    async fn fetch_findings(&self, session: &EngineSession) -> Result<Vec<RawFinding>, EngineError> {
        let mut findings = Vec::new();
        let mut start = 0usize;

        loop {
            let body = self
                .call(
                    "alert",
                    "view",
                    "alerts",
                    &[
                        ("baseurl", session.target.clone()),
                        ("contextName", session.context.clone()),
                        ("start", start.to_string()),
                        ("count", ALERT_PAGE_SIZE.to_string()),
                    ],
                )
                .await?;

            let page: Vec<RawFinding> = match body.get("alerts") {
                Some(alerts) => serde_json::from_value(alerts.clone())
                    .map_err(|e| EngineError::Fatal(format!("malformed alerts page: {e}")))?,
                None => return Err(EngineError::Fatal("response is missing `alerts`".into())),
            };

            let fetched = page.len();
            findings.extend(page);
            if fetched < ALERT_PAGE_SIZE {
                break;
            }
            start += fetched;
        }

        tracing::debug!(
            scan_id = %session.scan_id,
            alerts = findings.len(),
            "Fetched engine alerts"
        );
        Ok(findings)
    }

    async fn close_session(&self, session: &EngineSession) -> Result<(), EngineError> {
        self.call(
            "context",
            "action",
            "removeContext",
            &[("contextName", session.context.clone())],
        )
        .await?;
        Ok(())
    }
}
