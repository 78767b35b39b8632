//! Coordinator and agent configuration.
//!
//! Both binaries are configured from environment variables per the protocol's
//! external-interfaces contract; `clap::Parser`'s `env` attribute gives every
//! variable an equivalent CLI flag for free, the same override posture the
//! prior incarnation of this workspace gave its TOML files, adapted to an
//! env-var-first configuration surface.

use std::path::PathBuf;

use clap::Parser;

use crate::defaults::{default_agent_location, default_graceful_shutdown_timeout, default_server_port};
use crate::{MonitoringError, Result};

/// Coordinator configuration.
#[derive(Debug, Clone, Parser)]
#[command(name = "server", about = "Uptime/latency monitoring coordinator")]
pub struct ServerConfig {
    /// Port the HTTP API listens on.
    #[arg(long, env = "SERVER_PORT", default_value_t = default_server_port())]
    pub port: u16,

    /// Shared-secret header value required on authenticated endpoints.
    #[arg(long, env = "API_KEY")]
    pub api_key: String,

    /// Outbound webhook URL for the alert sink. Unset disables alerting silently.
    #[arg(long, env = "DISCORD_WEBHOOK")]
    pub discord_webhook: Option<String>,

    /// Root directory for the three persisted JSON files
    /// (`config/targets.json`, `db/agents.json`, `db/results.json`).
    #[arg(long, env = "DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,

    /// When set, results older than this many days are pruned once at startup.
    /// Unset (the default) disables pruning, matching the system's historical
    /// behavior of unbounded growth.
    #[arg(long, env = "RETENTION_DAYS")]
    pub retention_days: Option<u32>,

    #[arg(long, env = "GRACEFUL_SHUTDOWN_TIMEOUT_SECONDS", default_value_t = default_graceful_shutdown_timeout())]
    pub graceful_shutdown_timeout_seconds: u64,
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            return Err(MonitoringError::ValidationFailure(
                "API_KEY must not be empty".to_string(),
            )
            .into());
        }
        if let Some(webhook) = &self.discord_webhook {
            if !webhook.trim().is_empty() {
                crate::utils::validate_url(webhook, true)
                    .map_err(|e| MonitoringError::ValidationFailure(format!("DISCORD_WEBHOOK: {e}")))?;
            }
        }
        Ok(())
    }

    pub fn targets_path(&self) -> PathBuf {
        self.data_dir.join("config").join("targets.json")
    }

    pub fn agents_path(&self) -> PathBuf {
        self.data_dir.join("db").join("agents.json")
    }

    pub fn results_path(&self) -> PathBuf {
        self.data_dir.join("db").join("results.json")
    }
}

/// Agent configuration.
#[derive(Debug, Clone, Parser)]
#[command(name = "agent", about = "Uptime/latency monitoring probing worker")]
pub struct AgentConfig {
    /// Base URL of the coordinator's HTTP API.
    #[arg(long, env = "SERVER_URL")]
    pub server_url: String,

    /// Shared-secret header value sent with every authenticated request.
    #[arg(long, env = "API_KEY")]
    pub api_key: String,

    /// Display name used to register with the coordinator; reconnecting with
    /// the same name reclaims the same agent id.
    #[arg(long, env = "AGENT_NAME")]
    pub agent_name: Option<String>,

    #[arg(long, env = "AGENT_LOCATION", default_value_t = default_agent_location())]
    pub agent_location: String,

    /// Informational only: per-target intervals in the target list govern
    /// actual scheduling.
    #[arg(long, env = "CHECK_INTERVAL")]
    pub check_interval: Option<u64>,

    #[arg(long, env = "GRACEFUL_SHUTDOWN_TIMEOUT_SECONDS", default_value_t = default_graceful_shutdown_timeout())]
    pub graceful_shutdown_timeout_seconds: u64,
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            return Err(
                MonitoringError::ValidationFailure("API_KEY must not be empty".to_string()).into(),
            );
        }
        crate::utils::validate_url(&self.server_url, false)
            .map_err(|e| MonitoringError::ValidationFailure(format!("SERVER_URL: {e}")))?;
        Ok(())
    }

    /// Resolves `AGENT_NAME`, falling back to the host's name when unset.
    pub fn resolved_agent_name(&self) -> String {
        self.agent_name.clone().unwrap_or_else(default_hostname)
    }
}

/// Best-effort hostname lookup for the `AGENT_NAME` default. Avoids pulling
/// in a platform-hostname crate for one fallback value: tries the
/// environment, then the Linux hostname pseudo-file, then gives up.
fn default_hostname() -> String {
    if let Ok(h) = std::env::var("HOSTNAME") {
        if !h.trim().is_empty() {
            return h;
        }
    }
    if let Ok(h) = std::fs::read_to_string("/proc/sys/kernel/hostname") {
        let h = h.trim();
        if !h.is_empty() {
            return h.to_string();
        }
    }
    "unknown-agent".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_server_config() -> ServerConfig {
        ServerConfig {
            port: 3000,
            api_key: "secret".into(),
            discord_webhook: None,
            data_dir: PathBuf::from("data"),
            retention_days: None,
            graceful_shutdown_timeout_seconds: 30,
        }
    }

    #[test]
    fn server_config_rejects_empty_api_key() {
        let mut config = base_server_config();
        config.api_key = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn server_config_rejects_non_https_webhook() {
        let mut config = base_server_config();
        config.discord_webhook = Some("http://example.com/webhook".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn server_config_paths_are_rooted_at_data_dir() {
        let config = base_server_config();
        assert_eq!(config.targets_path(), PathBuf::from("data/config/targets.json"));
        assert_eq!(config.agents_path(), PathBuf::from("data/db/agents.json"));
        assert_eq!(config.results_path(), PathBuf::from("data/db/results.json"));
    }

    fn base_agent_config() -> AgentConfig {
        AgentConfig {
            server_url: "https://coordinator.example.com".into(),
            api_key: "secret".into(),
            agent_name: Some("eu-1".into()),
            agent_location: "EU".into(),
            check_interval: None,
            graceful_shutdown_timeout_seconds: 30,
        }
    }

    #[test]
    fn agent_config_rejects_invalid_server_url() {
        let mut config = base_agent_config();
        config.server_url = "not a url".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn agent_name_falls_back_when_unset() {
        let mut config = base_agent_config();
        config.agent_name = None;
        assert!(!config.resolved_agent_name().is_empty());
    }
}
