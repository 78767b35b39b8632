//! Agent registry.
//!
//! In-memory map of agents indexed by id, with a secondary index by name so
//! a reconnecting agent reclaims its previous id. The liveness sweep is the
//! only path that ever flips an agent online → offline; register and
//! heartbeat only ever flip it the other way.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use shared::defaults::OFFLINE_THRESHOLD_MS;
use shared::model::{Agent, AgentStatus};
use shared::persist;
use shared::utils::current_timestamp_millis;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Serialize, Deserialize)]
struct AgentsDocument {
    agents: Vec<Agent>,
}

struct Inner {
    by_id: HashMap<String, Agent>,
    by_name: HashMap<String, String>,
    next_id: u64,
}

pub struct AgentRegistry {
    path: PathBuf,
    inner: RwLock<Inner>,
}

impl AgentRegistry {
    /// Loads `path`, resetting every persisted agent to offline per the
    /// coordinator's startup contract: liveness is only ever established by
    /// a fresh heartbeat, never assumed to have survived a restart.
    pub fn load(path: PathBuf) -> Result<Self> {
        let doc: Option<AgentsDocument> = persist::read_json(&path)?;
        let mut by_id = HashMap::new();
        let mut by_name = HashMap::new();
        let mut max_n = 0u64;

        for mut agent in doc.map(|d| d.agents).unwrap_or_default() {
            agent.status = AgentStatus::Offline;
            if let Some(n) = agent.id.strip_prefix("agent-").and_then(|s| s.parse::<u64>().ok()) {
                max_n = max_n.max(n);
            }
            by_name.insert(agent.name.clone(), agent.id.clone());
            by_id.insert(agent.id.clone(), agent);
        }

        Ok(Self {
            path,
            inner: RwLock::new(Inner {
                by_id,
                by_name,
                next_id: max_n + 1,
            }),
        })
    }

    /// Registers or reclaims an agent id for `(name, location)`.
    pub async fn register(&self, name: &str, location: &str) -> Result<Arc<Agent>> {
        let mut inner = self.inner.write().await;
        let now = current_timestamp_millis();

        let id = if let Some(existing_id) = inner.by_name.get(name).cloned() {
            existing_id
        } else {
            let id = format!("agent-{}", inner.next_id);
            inner.next_id += 1;
            inner.by_name.insert(name.to_string(), id.clone());
            id
        };

        let agent = Agent {
            id: id.clone(),
            name: name.to_string(),
            location: location.to_string(),
            status: AgentStatus::Online,
            last_seen: now,
        };
        inner.by_id.insert(id, agent.clone());
        self.persist_locked(&inner)?;
        info!(agent_id = %agent.id, name, location, "agent registered");
        Ok(Arc::new(agent))
    }

    /// Refreshes liveness for an already-registered agent. Returns `false`
    /// if `agent_id` is unknown so the caller can surface `UnknownAgent`.
    pub async fn heartbeat(&self, agent_id: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let now = current_timestamp_millis();
        let found = if let Some(agent) = inner.by_id.get_mut(agent_id) {
            agent.status = AgentStatus::Online;
            agent.last_seen = now;
            true
        } else {
            false
        };
        if found {
            self.persist_locked(&inner)?;
        }
        Ok(found)
    }

    pub async fn get(&self, agent_id: &str) -> Option<Agent> {
        self.inner.read().await.by_id.get(agent_id).cloned()
    }

    pub async fn contains(&self, agent_id: &str) -> bool {
        self.inner.read().await.by_id.contains_key(agent_id)
    }

    pub async fn list(&self) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self.inner.read().await.by_id.values().cloned().collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    /// The liveness sweep: the only transition from online to offline.
    pub async fn sweep_offline(&self) -> Result<usize> {
        let mut inner = self.inner.write().await;
        let now = current_timestamp_millis();
        let mut flipped = 0;
        for agent in inner.by_id.values_mut() {
            if agent.status == AgentStatus::Online
                && now.saturating_sub(agent.last_seen) > OFFLINE_THRESHOLD_MS
            {
                agent.status = AgentStatus::Offline;
                flipped += 1;
            }
        }
        if flipped > 0 {
            warn!(count = flipped, "liveness sweep marked agents offline");
            self.persist_locked(&inner)?;
        }
        Ok(flipped)
    }

    fn persist_locked(&self, inner: &Inner) -> Result<()> {
        let mut agents: Vec<Agent> = inner.by_id.values().cloned().collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        persist::write_json_atomic(&self.path, &AgentsDocument { agents })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reconnecting_with_same_name_reclaims_id() {
        let dir = tempfile::tempdir().unwrap();
        let registry = AgentRegistry::load(dir.path().join("agents.json")).unwrap();
        let first = registry.register("eu-1", "EU").await.unwrap();
        let second = registry.register("eu-1", "EU").await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn restart_resets_everyone_to_offline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agents.json");
        let registry = AgentRegistry::load(path.clone()).unwrap();
        let agent = registry.register("eu-1", "EU").await.unwrap();
        assert_eq!(agent.status, AgentStatus::Online);

        let restarted = AgentRegistry::load(path).unwrap();
        let reloaded = restarted.get(&agent.id).await.unwrap();
        assert_eq!(reloaded.status, AgentStatus::Offline);
    }

    #[tokio::test]
    async fn heartbeat_on_unknown_agent_reports_false() {
        let dir = tempfile::tempdir().unwrap();
        let registry = AgentRegistry::load(dir.path().join("agents.json")).unwrap();
        assert!(!registry.heartbeat("agent-999").await.unwrap());
    }

    #[tokio::test]
    async fn sweep_marks_stale_agents_offline() {
        let dir = tempfile::tempdir().unwrap();
        let registry = AgentRegistry::load(dir.path().join("agents.json")).unwrap();
        let agent = registry.register("eu-1", "EU").await.unwrap();
        {
            let mut inner = registry.inner.write().await;
            inner.by_id.get_mut(&agent.id).unwrap().last_seen = 0;
        }
        let flipped = registry.sweep_offline().await.unwrap();
        assert_eq!(flipped, 1);
        assert_eq!(registry.get(&agent.id).await.unwrap().status, AgentStatus::Offline);
    }
}
