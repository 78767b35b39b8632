//! Wire protocol types for the coordinator's HTTP API.
//!
//! Every response is `{ "success": bool, … }` or `{ "success": false, "error":
//! "…" }`; rather than a single generic envelope, each endpoint gets its own
//! response struct with `success` as its first field, since the "notable
//! fields" differ per endpoint and a one-size envelope would force an inner
//! `data` wrapper the protocol doesn't have.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::model::{Agent, CheckResult, DailyDowntimeRecord, Target};

/// HTTP headers used for authentication and agent identification.
pub mod headers {
    pub const API_KEY: &str = "x-api-key";
    pub const AGENT_ID: &str = "x-agent-id";
}

/// API endpoint paths.
pub mod endpoints {
    pub const REGISTER: &str = "/api/register";
    pub const HEARTBEAT: &str = "/api/heartbeat";
    pub const TARGETS: &str = "/api/targets";
    pub const TARGETS_CHECK_UPDATES: &str = "/api/targets/check-updates";
    pub const RESULTS: &str = "/api/results";
    pub const UPTIME: &str = "/api/uptime";
    pub const LATENCY: &str = "/api/latency";
    pub const TARGET_STATUS: &str = "/api/target-status";
    pub const AGENTS: &str = "/api/agents";
    pub const UPTIME_RESET: &str = "/api/uptime/reset";
    pub const UPTIME_CHECK: &str = "/api/uptime/check";
    pub const METRICS: &str = "/metrics";
}

/// Every failed request responds with this shape regardless of endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
        }
    }
}

/// `POST /api/register` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub location: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub success: bool,
    pub agent_id: String,
    pub server_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub success: bool,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetsResponse {
    pub success: bool,
    pub targets: Vec<Target>,
    pub last_updated: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckUpdatesQuery {
    pub last_checked: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckUpdatesResponse {
    pub success: bool,
    pub has_updates: bool,
    pub last_updated: u64,
}

/// `POST /api/results` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsSubmission {
    pub results: Vec<CheckResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResultsResponse {
    pub success: bool,
    pub accepted: usize,
}

/// One target's aggregated state for a single day, as returned by `/api/uptime`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetUptimeEntry {
    pub is_down: bool,
    pub downtime_ms: u64,
    pub uptime_percentage: f64,
    pub avg_response_time: Option<f64>,
    pub agent_reports: HashMap<String, bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UptimeResponse {
    pub success: bool,
    pub results: HashMap<String, TargetUptimeEntry>,
    pub date: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyPoint {
    pub timestamp: u64,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyResponse {
    pub success: bool,
    pub latency_data: HashMap<String, Vec<LatencyPoint>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetStatusEntry {
    pub target_id: u64,
    pub is_down: bool,
    pub last_updated: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetStatusSummary {
    pub total: usize,
    pub up: usize,
    pub down: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetStatusResponse {
    pub success: bool,
    pub current_status: Vec<TargetStatusEntry>,
    pub summary: TargetStatusSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsResponse {
    pub success: bool,
    pub agents: Vec<Agent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowUptime {
    pub day: f64,
    pub week: f64,
    pub month: f64,
    pub year: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetWindowUptimeResponse {
    pub success: bool,
    pub uptime: WindowUptime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimpleSuccessResponse {
    pub success: bool,
}

impl SimpleSuccessResponse {
    pub fn ok() -> Self {
        Self { success: true }
    }
}

/// `GET /api/results` response: the raw per-(agent,target,date) records,
/// filtered to whichever of `agentId`/`targetId`/`date` the caller supplied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawResultsResponse {
    pub success: bool,
    pub results: HashMap<String, HashMap<u64, HashMap<String, DailyDowntimeRecord>>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawResultsQuery {
    pub agent_id: Option<String>,
    pub target_id: Option<u64>,
    pub date: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UptimeLatencyQuery {
    pub target_id: Option<u64>,
    pub date: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UptimeCheckQuery {
    pub target_id: Option<u64>,
}

/// `GET /metrics` response: process-level liveness, not the aggregated
/// monitoring data (that's `/api/uptime` et al.).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessMetricsResponse {
    pub success: bool,
    pub target_count: usize,
    pub agent_count: usize,
    pub online_agent_count: usize,
    pub process_uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_response_has_success_false() {
        let err = ErrorResponse::new("boom");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "boom");
    }

    #[test]
    fn register_response_uses_camel_case_fields() {
        let resp = RegisterResponse {
            success: true,
            agent_id: "agent-1".into(),
            server_id: "coordinator-1".into(),
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["agentId"], "agent-1");
        assert_eq!(json["serverId"], "coordinator-1");
    }

    #[test]
    fn check_updates_query_parses_camel_case() {
        let query: CheckUpdatesQuery = serde_json::from_str(r#"{"lastChecked": 42}"#).unwrap();
        assert_eq!(query.last_checked, 42);
    }
}
