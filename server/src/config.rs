//! Target configuration manager.
//!
//! Owns the authoritative in-memory target set, loaded from `targets.json`
//! and hot-reloaded on file change. The watcher debounces bursts of
//! modification events (a single editor save can fire several) into a
//! single reload, the way the prior incarnation of this workspace debounced
//! agent-config uploads before persisting them.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use shared::model::{validate_target_set, Target};
use shared::persist;
use shared::utils::current_timestamp_millis;
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info, warn};

const WATCH_DEBOUNCE: Duration = std::time::Duration::from_millis(300);

#[derive(Debug, Serialize, Deserialize)]
struct TargetsDocument {
    targets: Vec<Target>,
}

struct Inner {
    targets: Vec<Target>,
    last_updated: u64,
}

/// Hot-reloadable target configuration, shared behind an `Arc` so the HTTP
/// layer and the watcher task can both hold a reference.
pub struct TargetConfigManager {
    path: PathBuf,
    inner: Arc<RwLock<Inner>>,
}

impl TargetConfigManager {
    /// Loads `path` (creating an empty document if absent) and returns the
    /// manager. Does not start the file watcher; call [`Self::spawn_watcher`]
    /// for that once the manager is wrapped in an `Arc`.
    pub fn load(path: PathBuf) -> Result<Self> {
        let targets = Self::load_from_disk(&path).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "failed to load targets.json, starting empty");
            Vec::new()
        });

        Ok(Self {
            path,
            inner: Arc::new(RwLock::new(Inner {
                targets,
                last_updated: current_timestamp_millis(),
            })),
        })
    }

    fn load_from_disk(path: &PathBuf) -> Result<Vec<Target>> {
        let doc: Option<TargetsDocument> = persist::read_json(path).context("reading targets.json")?;
        let targets = doc.map(|d| d.targets).unwrap_or_default();
        validate_target_set(&targets).context("validating targets.json")?;
        Ok(targets)
    }

    /// Starts the debounced file watcher on a background task. The watcher
    /// itself is dropped when the returned guard is dropped; callers keep it
    /// alive for the process lifetime by holding it in `main`.
    pub fn spawn_watcher(self: &Arc<Self>) -> Result<notify::RecommendedWatcher> {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                if event.kind.is_modify() || event.kind.is_create() {
                    let _ = tx.send(());
                }
            }
        })
        .context("creating file watcher")?;

        let watch_dir = self
            .path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&watch_dir).ok();
        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .context("watching targets.json directory")?;

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if rx.recv().await.is_none() {
                    break;
                }
                // Collapse a burst of events into one reload: drain anything
                // else that arrives within the debounce window.
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(WATCH_DEBOUNCE) => break,
                        more = rx.recv() => if more.is_none() { return; },
                    }
                }
                if let Err(e) = manager.reload().await {
                    error!(error = %e, "target config reload failed, keeping previous set");
                }
            }
        });

        Ok(watcher)
    }

    async fn reload(&self) -> Result<()> {
        let targets = Self::load_from_disk(&self.path)?;
        let mut inner = self.inner.write().await;
        inner.targets = targets;
        inner.last_updated = current_timestamp_millis();
        info!(count = inner.targets.len(), "targets.json reloaded");
        Ok(())
    }

    /// `list()` — current targets and the TargetSetVersion.
    pub async fn list(&self) -> (Vec<Target>, u64) {
        let inner = self.inner.read().await;
        (inner.targets.clone(), inner.last_updated)
    }

    pub async fn last_updated(&self) -> u64 {
        self.inner.read().await.last_updated
    }

    /// `hasChangesSince(clientVersion)`.
    pub async fn has_changes_since(&self, client_version: u64) -> bool {
        self.inner.read().await.last_updated > client_version
    }

    pub async fn get(&self, id: u64) -> Option<Target> {
        self.inner
            .read()
            .await
            .targets
            .iter()
            .find(|t| t.id == id)
            .cloned()
    }

    /// Inserts or replaces a target by id, validates the resulting set, and
    /// persists it back to `targets.json` atomically.
    pub async fn upsert(&self, target: Target) -> Result<()> {
        target.validate()?;
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.targets.iter_mut().find(|t| t.id == target.id) {
            *existing = target;
        } else {
            inner.targets.push(target);
        }
        self.persist_locked(&mut inner)
    }

    pub async fn delete(&self, id: u64) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let before = inner.targets.len();
        inner.targets.retain(|t| t.id != id);
        let removed = inner.targets.len() != before;
        if removed {
            self.persist_locked(&mut inner)?;
        }
        Ok(removed)
    }

    fn persist_locked(&self, inner: &mut Inner) -> Result<()> {
        let ids: HashSet<u64> = inner.targets.iter().map(|t| t.id).collect();
        if ids.len() != inner.targets.len() {
            anyhow::bail!("duplicate target id after edit");
        }
        persist::write_json_atomic(
            &self.path,
            &TargetsDocument {
                targets: inner.targets.clone(),
            },
        )?;
        inner.last_updated = current_timestamp_millis();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::model::TargetKind;

    fn sample_target(id: u64) -> Target {
        Target {
            id,
            name: format!("target-{id}"),
            kind: TargetKind::Http,
            endpoint: "https://example.com".into(),
            interval_ms: 1000,
            timeout_ms: 1000,
        }
    }

    #[tokio::test]
    async fn loads_empty_when_file_absent() {
        let dir = tempfile::tempdir().unwrap();
        let manager = TargetConfigManager::load(dir.path().join("targets.json")).unwrap();
        let (targets, _) = manager.list().await;
        assert!(targets.is_empty());
    }

    #[tokio::test]
    async fn upsert_persists_and_is_reloadable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("targets.json");
        let manager = TargetConfigManager::load(path.clone()).unwrap();
        manager.upsert(sample_target(1)).await.unwrap();

        let reloaded = TargetConfigManager::load(path).unwrap();
        let (targets, _) = reloaded.list().await;
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].id, 1);
    }

    #[tokio::test]
    async fn delete_removes_and_reports_absence() {
        let dir = tempfile::tempdir().unwrap();
        let manager = TargetConfigManager::load(dir.path().join("targets.json")).unwrap();
        manager.upsert(sample_target(1)).await.unwrap();
        assert!(manager.delete(1).await.unwrap());
        assert!(!manager.delete(1).await.unwrap());
    }

    #[tokio::test]
    async fn has_changes_since_reflects_version_bump() {
        let dir = tempfile::tempdir().unwrap();
        let manager = TargetConfigManager::load(dir.path().join("targets.json")).unwrap();
        let version = manager.last_updated().await;
        assert!(!manager.has_changes_since(version).await);
        manager.upsert(sample_target(1)).await.unwrap();
        assert!(manager.has_changes_since(version).await);
    }
}
