use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    pub zap_base_url: String,
    pub zap_api_key: String,
    pub pending_sweep_interval: Duration,
    /// InProgress rows untouched for this long are treated as orphaned.
    /// Must comfortably exceed `orchestrator.heartbeat_interval`.
    pub stale_after: Duration,
    pub shutdown_grace: Duration,
    pub orchestrator: OrchestratorSettings,
}

/// Tuning knobs for admission, the worker pool and the per-scan poll loop.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub max_active_per_owner: i64,
    pub poll_interval: Duration,
    pub discovery_timeout: Duration,
    pub passive_timeout: Duration,
    pub active_timeout: Duration,
    /// Enables the AJAX spider alongside the traditional one.
    pub secondary_discovery: bool,
    /// Upper bound on any single engine request.
    pub engine_call_timeout: Duration,
    /// Attempts for start and fetch calls that fail transiently.
    pub engine_start_retries: u32,
    /// Longest gap between progress writes of a running scan.
    pub heartbeat_interval: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_capacity: 256,
            max_active_per_owner: 5,
            poll_interval: Duration::from_secs(2),
            discovery_timeout: Duration::from_secs(900),
            passive_timeout: Duration::from_secs(600),
            active_timeout: Duration::from_secs(3600),
            secondary_discovery: false,
            engine_call_timeout: Duration::from_secs(30),
            engine_start_retries: 3,
            heartbeat_interval: Duration::from_secs(60),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, env::VarError> {
        let defaults = OrchestratorSettings::default();
        Ok(Self {
            database_url: env::var("DATABASE_URL")?,
            database_max_connections: parse_or("DATABASE_MAX_CONNECTIONS", 10),
            zap_base_url: env::var("ZAP_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8080".to_string()),
            zap_api_key: env::var("ZAP_API_KEY").unwrap_or_default(),
            pending_sweep_interval: Duration::from_secs(parse_or("SCAN_PENDING_SWEEP_SECS", 30)),
            stale_after: Duration::from_secs(parse_or("SCAN_STALE_AFTER_SECS", 300)),
            shutdown_grace: Duration::from_secs(parse_or("SHUTDOWN_GRACE_SECS", 30)),
            orchestrator: OrchestratorSettings {
                worker_count: parse_or("SCAN_WORKER_COUNT", defaults.worker_count).max(1),
                queue_capacity: parse_or("SCAN_QUEUE_CAPACITY", defaults.queue_capacity).max(1),
                max_active_per_owner: parse_or(
                    "SCAN_MAX_ACTIVE_PER_OWNER",
                    defaults.max_active_per_owner,
                ),
                poll_interval: secs_or("SCAN_POLL_INTERVAL_SECS", defaults.poll_interval),
                discovery_timeout: secs_or("SCAN_DISCOVERY_TIMEOUT_SECS", defaults.discovery_timeout),
                passive_timeout: secs_or("SCAN_PASSIVE_TIMEOUT_SECS", defaults.passive_timeout),
                active_timeout: secs_or("SCAN_ACTIVE_TIMEOUT_SECS", defaults.active_timeout),
                secondary_discovery: parse_or("SCAN_SECONDARY_DISCOVERY", false),
                engine_call_timeout: secs_or(
                    "ENGINE_CALL_TIMEOUT_SECS",
                    defaults.engine_call_timeout,
                ),
                engine_start_retries: parse_or(
                    "ENGINE_START_RETRIES",
                    defaults.engine_start_retries,
                )
                .max(1),
                heartbeat_interval: secs_or("SCAN_HEARTBEAT_SECS", defaults.heartbeat_interval),
            },
        })
    }
}

fn parse_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn secs_or(key: &str, default: Duration) -> Duration {
    Duration::from_secs(parse_or(key, default.as_secs()))
}
