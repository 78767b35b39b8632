//! Shared data structures and utilities for the uptime/latency monitoring system
//!
//! This crate contains the wire protocol, persisted data model, configuration
//! structures, and utilities used by both the coordinator (`server`) and the
//! probing workers (`agent`).

pub mod api;
pub mod config;
pub mod defaults;
pub mod model;
pub mod persist;
pub mod utils;

pub use model::{
    Agent, AgentStatus, CheckResult, DailyDowntimeRecord, DowntimeIncident, ResponseTimeBucket,
    Target, TargetKind, TargetStatus,
};
pub use utils::validate_url;

/// Result type alias used throughout the shared crate and re-exported for convenience.
pub type Result<T> = anyhow::Result<T>;

/// The error kinds named by the coordinator-agent protocol.
///
/// Each variant maps to a distinct JSON error response on the coordinator's
/// HTTP API; none of them represent a process-fatal condition.
#[derive(Debug, thiserror::Error)]
pub enum MonitoringError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failure: {0}")]
    ValidationFailure(String),

    #[error("I/O failure: {0}")]
    IoFailure(String),

    #[error("upstream failure: {0}")]
    UpstreamFailure(String),

    #[error("timeout: {0}")]
    Timeout(String),
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_basic_imports() {
        // Smoke test to ensure all modules can be imported together.
    }
}
