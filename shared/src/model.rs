//! The persisted and derived data model shared by coordinator and agents.
//!
//! Everything in this module is plain data: validation lives here (on `Target`)
//! because both the config manager and the HTTP API's programmatic-edit
//! endpoints need the same rules, but the state machines that mutate
//! `DailyDowntimeRecord` and `TargetStatus` live in `server::store`.

use serde::{Deserialize, Serialize};

use crate::{MonitoringError, Result};

/// A network endpoint to be probed, identified by a stable integer id unique
/// across the whole target set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Target {
    pub id: u64,
    pub name: String,
    pub kind: TargetKind,
    /// URL for `kind = Http`, bare host (or host:port) for `kind = Icmp`.
    pub endpoint: String,
    pub interval_ms: u64,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Http,
    Icmp,
}

impl Target {
    /// Rejects a target missing required fields for its kind, or with
    /// nonsensical timing. Mirrors the coordinator's config-manager contract:
    /// `timeout_ms` must be positive and no greater than `interval_ms`.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(MonitoringError::ValidationFailure(format!(
                "target {}: name must not be empty",
                self.id
            ))
            .into());
        }
        if self.interval_ms == 0 {
            return Err(MonitoringError::ValidationFailure(format!(
                "target {}: interval_ms must be > 0",
                self.id
            ))
            .into());
        }
        if self.timeout_ms == 0 {
            return Err(MonitoringError::ValidationFailure(format!(
                "target {}: timeout_ms must be > 0",
                self.id
            ))
            .into());
        }
        if self.timeout_ms > self.interval_ms {
            return Err(MonitoringError::ValidationFailure(format!(
                "target {}: timeout_ms ({}) must not exceed interval_ms ({})",
                self.id, self.timeout_ms, self.interval_ms
            ))
            .into());
        }
        match self.kind {
            TargetKind::Http => {
                crate::utils::validate_url(&self.endpoint, false).map_err(|e| {
                    MonitoringError::ValidationFailure(format!(
                        "target {} ({}): {}",
                        self.id, self.name, e
                    ))
                })?;
            }
            TargetKind::Icmp => {
                if self.endpoint.trim().is_empty() {
                    return Err(MonitoringError::ValidationFailure(format!(
                        "target {} ({}): icmp endpoint (host) must not be empty",
                        self.id, self.name
                    ))
                    .into());
                }
            }
        }
        Ok(())
    }
}

/// Validates an entire target set: per-target validation plus the
/// no-shared-id invariant.
pub fn validate_target_set(targets: &[Target]) -> Result<()> {
    let mut seen = std::collections::HashSet::with_capacity(targets.len());
    for target in targets {
        target.validate()?;
        if !seen.insert(target.id) {
            return Err(MonitoringError::ValidationFailure(format!(
                "duplicate target id {}",
                target.id
            ))
            .into());
        }
    }
    Ok(())
}

/// A remote probing worker, identified by a coordinator-minted opaque id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub location: String,
    pub status: AgentStatus,
    /// Unix millis of the last register/heartbeat from this agent.
    pub last_seen: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Offline,
}

/// An immutable report of one probe attempt. Never mutated once submitted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub target_id: u64,
    pub agent_id: String,
    /// Unix millis, assigned by the agent at the moment the check completed.
    pub timestamp: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub response_time_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error_text: Option<String>,
}

/// A maximal interval during which consensus says a target is down, from one
/// (agent, target, day) perspective. `end_time = None` means still open.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DowntimeIncident {
    pub start_time: u64,
    pub end_time: Option<u64>,
}

impl DowntimeIncident {
    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }

    /// Duration of this incident clipped to `now` if still open.
    pub fn duration_ms(&self, now: u64) -> u64 {
        self.end_time.unwrap_or(now).saturating_sub(self.start_time)
    }
}

/// A 30-minute half-open aggregation window for successful response times,
/// aligned to local-day midnight.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResponseTimeBucket {
    pub start_time: u64,
    pub end_time: u64,
    pub count: u64,
    pub avg_response_time: f64,
}

impl ResponseTimeBucket {
    /// Folds one more successful sample into the running mean.
    pub fn fold(&mut self, response_time_ms: f64) {
        let count = self.count as f64;
        self.avg_response_time = (self.avg_response_time * count + response_time_ms) / (count + 1.0);
        self.count += 1;
    }
}

/// The per-(agent, target, day) aggregate: cumulative closed downtime, the
/// incident timeline, response-time buckets, and a redundant `is_down` cache
/// rebuildable from the incident list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DailyDowntimeRecord {
    /// Local date string, `YYYY-MM-DD`.
    pub date: String,
    pub downtime_ms: u64,
    pub incidents: Vec<DowntimeIncident>,
    pub response_time_intervals: Vec<ResponseTimeBucket>,
    pub is_down: bool,
}

impl DailyDowntimeRecord {
    pub fn new(date: String) -> Self {
        Self {
            date,
            downtime_ms: 0,
            incidents: Vec::new(),
            response_time_intervals: Vec::new(),
            is_down: false,
        }
    }

    /// Total downtime contribution for this record as of `now`: closed
    /// incidents plus the still-open one's elapsed duration, if any.
    pub fn downtime_as_of(&self, now: u64) -> u64 {
        let open_contribution = self
            .incidents
            .last()
            .filter(|i| i.is_open())
            .map(|i| i.duration_ms(now))
            .unwrap_or(0);
        self.downtime_ms + open_contribution
    }

    /// Returns the response-time bucket whose half-open interval contains
    /// `start_time`, creating it lazily if absent.
    pub fn bucket_mut(&mut self, start_time: u64, bucket_width_ms: u64) -> &mut ResponseTimeBucket {
        if let Some(idx) = self
            .response_time_intervals
            .iter()
            .position(|b| b.start_time == start_time)
        {
            return &mut self.response_time_intervals[idx];
        }
        self.response_time_intervals.push(ResponseTimeBucket {
            start_time,
            end_time: start_time + bucket_width_ms,
            count: 0,
            avg_response_time: 0.0,
        });
        self.response_time_intervals.last_mut().expect("just pushed")
    }
}

/// Derived, in-memory, per-target consensus snapshot. Rebuilt from the
/// results store on coordinator startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TargetStatus {
    pub is_down: bool,
    pub agents_reporting: std::collections::HashMap<String, bool>,
    pub last_updated: u64,
}

impl TargetStatus {
    /// Re-evaluates consensus per the coordinator's aggregation rule:
    /// a lone reporter is authoritative; two or more reporters require
    /// `min_agents_for_downtime` of them to agree the target is down.
    pub fn recompute_consensus(&mut self, min_agents_for_downtime: usize) {
        let total = self.agents_reporting.len();
        let down = self.agents_reporting.values().filter(|v| **v).count();
        self.is_down = if total == 1 {
            down == 1
        } else {
            down >= min_agents_for_downtime
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http_target(id: u64) -> Target {
        Target {
            id,
            name: "example".into(),
            kind: TargetKind::Http,
            endpoint: "https://example.com".into(),
            interval_ms: 1000,
            timeout_ms: 1000,
        }
    }

    #[test]
    fn timeout_equal_to_interval_is_valid() {
        let t = http_target(1);
        assert!(t.validate().is_ok());
    }

    #[test]
    fn timeout_exceeding_interval_is_rejected() {
        let mut t = http_target(1);
        t.timeout_ms = t.interval_ms + 1;
        assert!(t.validate().is_err());
    }

    #[test]
    fn icmp_requires_nonempty_host() {
        let mut t = http_target(1);
        t.kind = TargetKind::Icmp;
        t.endpoint = String::new();
        assert!(t.validate().is_err());
        t.endpoint = "10.0.0.1".into();
        assert!(t.validate().is_ok());
    }

    #[test]
    fn duplicate_ids_rejected() {
        let targets = vec![http_target(1), http_target(1)];
        assert!(validate_target_set(&targets).is_err());
    }

    #[test]
    fn bucket_fold_computes_running_mean() {
        let mut record = DailyDowntimeRecord::new("2026-01-01".into());
        {
            let bucket = record.bucket_mut(0, 1_800_000);
            bucket.fold(100.0);
            bucket.fold(200.0);
        }
        let bucket = &record.response_time_intervals[0];
        assert_eq!(bucket.count, 2);
        assert!((bucket.avg_response_time - 150.0).abs() < f64::EPSILON);
    }

    #[test]
    fn consensus_single_reporter_is_authoritative() {
        let mut status = TargetStatus::default();
        status.agents_reporting.insert("agent-1".into(), true);
        status.recompute_consensus(2);
        assert!(status.is_down);
    }

    #[test]
    fn consensus_requires_threshold_with_multiple_reporters() {
        let mut status = TargetStatus::default();
        status.agents_reporting.insert("agent-1".into(), true);
        status.agents_reporting.insert("agent-2".into(), false);
        status.recompute_consensus(2);
        assert!(!status.is_down, "only one of two reporters is down");

        status.agents_reporting.insert("agent-2".into(), true);
        status.recompute_consensus(2);
        assert!(status.is_down, "both reporters down meets threshold");
    }
}
