//! Per-target scheduling: one ticker per target firing at that target's
//! configured interval, each tick checked-then-submitted independently of
//! the others. A tick is skipped (never queued) if the previous check for
//! the same target is still in flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use shared::model::Target;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::client::{self, RpcClient};
use crate::probe;

struct TargetHandle {
    is_running: Arc<AtomicBool>,
    join_handle: JoinHandle<()>,
}

/// Owns one ticker task per target. Hot-reloading the target list is a
/// stop-then-restart: there is no incremental diffing of intervals.
pub struct TargetScheduler {
    client: Arc<RpcClient>,
    agent_id: String,
    agent_name: String,
    running: HashMap<u64, TargetHandle>,
}

impl TargetScheduler {
    pub fn new(client: Arc<RpcClient>, agent_id: String, agent_name: String) -> Self {
        Self {
            client,
            agent_id,
            agent_name,
            running: HashMap::new(),
        }
    }

    /// Spawns a ticker for every target. The first check fires immediately
    /// (tokio's default `interval` burst behavior), not after one full
    /// interval.
    pub fn start_all(&mut self, targets: &[Target]) {
        for target in targets {
            self.spawn_ticker(target.clone());
        }
    }

    /// Aborts every running ticker and in-flight check. Buffered results are
    /// not drained; nothing is queued for retry after a stop.
    pub fn stop_all(&mut self) {
        for (_, handle) in self.running.drain() {
            handle.join_handle.abort();
        }
    }

    /// Stops every ticker and starts fresh from `targets`. Used when the
    /// target-update poller detects a change.
    pub fn restart_all(&mut self, targets: &[Target]) {
        self.stop_all();
        self.start_all(targets);
    }

    pub fn running_target_count(&self) -> usize {
        self.running.len()
    }

    fn spawn_ticker(&mut self, target: Target) {
        let is_running = Arc::new(AtomicBool::new(false));
        let is_running_task = Arc::clone(&is_running);
        let client = Arc::clone(&self.client);
        let agent_id = self.agent_id.clone();
        let agent_name = self.agent_name.clone();
        let interval_duration = std::time::Duration::from_millis(target.interval_ms);

        let join_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval_duration);
            loop {
                interval.tick().await;

                if is_running_task.swap(true, Ordering::AcqRel) {
                    debug!(target_id = target.id, "skipping tick, previous check still running");
                    continue;
                }

                let result = probe::run_check(&target, &agent_id, &agent_name).await;
                match client.submit_results(&agent_id, vec![result]).await {
                    Ok(resp) => {
                        debug!(target_id = target.id, accepted = resp.accepted, "submitted check result");
                    }
                    Err(e) => {
                        client::log_dropped_submission(1, &e);
                        warn!(target_id = target.id, "check result not accepted by coordinator");
                    }
                }

                is_running_task.store(false, Ordering::Release);
            }
        });

        self.running.insert(
            target.id,
            TargetHandle {
                is_running,
                join_handle,
            },
        );
    }
}

impl Drop for TargetScheduler {
    fn drop(&mut self) {
        for (_, handle) in self.running.drain() {
            handle.join_handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::model::TargetKind;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn sample_target(id: u64, endpoint: &str, interval_ms: u64, timeout_ms: u64) -> Target {
        Target {
            id,
            name: format!("target-{id}"),
            kind: TargetKind::Http,
            endpoint: endpoint.to_string(),
            interval_ms,
            timeout_ms,
        }
    }

    fn test_client() -> Arc<RpcClient> {
        Arc::new(RpcClient::new("http://127.0.0.1:1".to_string(), "test".to_string()).unwrap())
    }

    #[tokio::test]
    async fn restart_all_replaces_running_targets() {
        let mut scheduler = TargetScheduler::new(test_client(), "agent-1".into(), "test-agent".into());
        let first = vec![
            sample_target(1, "http://127.0.0.1:1", 60_000, 5_000),
            sample_target(2, "http://127.0.0.1:1", 60_000, 5_000),
        ];
        scheduler.start_all(&first);
        assert_eq!(scheduler.running_target_count(), 2);

        let second = vec![sample_target(3, "http://127.0.0.1:1", 60_000, 5_000)];
        scheduler.restart_all(&second);
        assert_eq!(scheduler.running_target_count(), 1);
        assert!(scheduler.running.contains_key(&3));
        assert!(!scheduler.running.contains_key(&1));
    }

    #[tokio::test]
    async fn stop_all_clears_every_ticker() {
        let mut scheduler = TargetScheduler::new(test_client(), "agent-1".into(), "test-agent".into());
        scheduler.start_all(&[sample_target(1, "http://127.0.0.1:1", 60_000, 5_000)]);
        assert_eq!(scheduler.running_target_count(), 1);
        scheduler.stop_all();
        assert_eq!(scheduler.running_target_count(), 0);
    }

    /// A check that never returns must keep the overlap guard engaged, so a
    /// fast ticker firing underneath it never starts a second check.
    #[tokio::test]
    async fn overlap_guard_skips_ticks_while_a_check_is_still_in_flight() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let accepted_task = Arc::clone(&accepted);
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                accepted_task.fetch_add(1, Ordering::SeqCst);
                held.push(socket);
            }
        });

        let mut scheduler = TargetScheduler::new(test_client(), "agent-1".into(), "test-agent".into());
        let target = sample_target(1, &format!("http://{addr}"), 40, 10_000);
        scheduler.start_all(&[target]);

        tokio::time::sleep(Duration::from_millis(220)).await;
        scheduler.stop_all();

        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }
}
