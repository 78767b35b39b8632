//! Default values and protocol constants for the monitoring system.
//!
//! Centralized here, the way the prior incarnation of this workspace kept
//! its `default_*` functions in one module, so `clap`'s `#[arg(default_value_t
//! = ...)]` and the aggregator's internal constants stay in one place.

/// Default coordinator listen port (`SERVER_PORT`).
pub fn default_server_port() -> u16 {
    3000
}

/// Threshold (ms) of agent silence before the liveness sweep marks it offline.
pub const OFFLINE_THRESHOLD_MS: u64 = 120_000;

/// Interval between liveness sweeps.
pub const LIVENESS_SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

/// Agent heartbeat interval (fixed, not configurable per the protocol).
pub const HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

/// Agent target-list poll interval (fixed, not configurable per the protocol).
pub const TARGET_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(120);

/// Threshold of agents reporting down required to flip consensus when two or
/// more agents observe a target.
pub const MIN_AGENTS_FOR_DOWNTIME: usize = 2;

/// Width of a response-time aggregation bucket, in milliseconds.
pub const RESPONSE_BUCKET_WIDTH_MS: u64 = 30 * 60 * 1000;

/// TTL of the read cache over the three expensive aggregated queries.
pub const QUERY_CACHE_TTL: std::time::Duration = std::time::Duration::from_secs(10);

/// Config-file watcher debounce stability window.
pub const CONFIG_WATCH_DEBOUNCE: std::time::Duration = std::time::Duration::from_millis(300);

/// Per-request timeout for agent -> coordinator RPCs.
pub const RPC_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Maximum retry attempts for register / fetch-targets / submit-results.
pub const RPC_MAX_RETRIES: u32 = 3;

/// Base delay for the agent's RPC retry backoff.
pub const RPC_BACKOFF_BASE_MS: u64 = 1000;

/// Cap for the agent's RPC retry backoff.
pub const RPC_BACKOFF_MAX_MS: u64 = 10_000;

/// Look-back window, in days, used by the uptime-percentage window queries.
pub const UPTIME_LOOKBACK_DAYS: i64 = 45;

/// Default graceful shutdown timeout for either binary.
pub fn default_graceful_shutdown_timeout() -> u64 {
    30
}

/// Default location label for an agent that doesn't set `AGENT_LOCATION`.
pub fn default_agent_location() -> String {
    "Unknown".to_string()
}
