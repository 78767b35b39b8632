//! Uptime/latency monitoring coordinator.
//!
//! Aggregates check results from probing agents, serves the hot-reloadable
//! target list, and exposes the HTTP API consumed by agents and the
//! (out-of-scope) dashboard.

#[cfg(not(target_os = "windows"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

mod alert;
mod api;
mod cache;
mod config;
mod registry;
mod store;

use alert::AlertSink;
use config::TargetConfigManager;
use registry::AgentRegistry;
use shared::config::ServerConfig;
use shared::defaults::LIVENESS_SWEEP_INTERVAL;
use store::ResultsStore;

struct Coordinator {
    state: api::AppState,
    listen_port: u16,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
    liveness_task: Option<JoinHandle<()>>,
    _watcher: notify::RecommendedWatcher,
}

impl Coordinator {
    fn new(config: ServerConfig) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        let targets = Arc::new(
            TargetConfigManager::load(config.targets_path()).context("loading targets.json")?,
        );
        let watcher = targets.spawn_watcher().context("starting target config watcher")?;

        let registry =
            Arc::new(AgentRegistry::load(config.agents_path()).context("loading agents.json")?);

        let alert = Arc::new(AlertSink::new(config.discord_webhook.clone()));
        let store = Arc::new(
            ResultsStore::load(config.results_path(), Arc::clone(&alert))
                .context("loading results.json")?,
        );

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

        Ok(Self {
            listen_port: config.port,
            state: api::AppState {
                config: Arc::new(config),
                targets,
                registry,
                store,
                alert,
                start_time: Instant::now(),
            },
            shutdown_tx,
            liveness_task: None,
            _watcher: watcher,
        })
    }

    async fn run(&mut self) -> Result<()> {
        if let Some(days) = self.state.config.retention_days {
            match self.state.store.prune_older_than(days).await {
                Ok(removed) => info!(removed, "startup retention pruning complete"),
                Err(e) => warn!(error = %e, "startup retention pruning failed"),
            }
        }

        let registry = Arc::clone(&self.state.registry);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        self.liveness_task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(LIVENESS_SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = registry.sweep_offline().await {
                            error!(error = %e, "liveness sweep failed");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("liveness sweep task received shutdown signal");
                        break;
                    }
                }
            }
        }));

        let app = api::create_router(self.state.clone());
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], self.listen_port));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding to {addr}"))?;
        info!(%addr, "coordinator listening");

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("HTTP server received shutdown signal");
            })
            .await
            .context("HTTP server error")?;

        Ok(())
    }

    async fn shutdown(&mut self) {
        info!("shutting down coordinator");
        let timeout = Duration::from_secs(self.state.config.graceful_shutdown_timeout_seconds);
        let _ = self.shutdown_tx.send(());

        if let Some(handle) = self.liveness_task.take() {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => info!("liveness sweep task stopped cleanly"),
                Ok(Err(e)) => warn!(error = %e, "liveness sweep task panicked"),
                Err(_) => warn!("liveness sweep task shutdown timeout reached"),
            }
        }
        info!("coordinator shutdown complete");
    }
}

async fn setup_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to register SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to register SIGINT handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received Ctrl+C");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let file_appender = tracing_appender::rolling::daily("./logs", "server.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("server=info,shared=info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(non_blocking)
        .init();

    let config = ServerConfig::parse();

    info!("coordinator starting up");

    let mut coordinator = match Coordinator::new(config) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to initialize coordinator");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = coordinator.run() => {
            if let Err(e) = result {
                error!(error = %e, "coordinator error");
                std::process::exit(1);
            }
        }
        _ = setup_shutdown_signal() => {
            info!("shutdown signal received, initiating graceful shutdown");
        }
    }

    coordinator.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config(dir: &std::path::Path) -> ServerConfig {
        ServerConfig {
            port: 0,
            api_key: "secret".into(),
            discord_webhook: None,
            data_dir: dir.to_path_buf(),
            retention_days: None,
            graceful_shutdown_timeout_seconds: 1,
        }
    }

    #[test]
    fn coordinator_initializes_from_empty_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = Coordinator::new(base_config(dir.path()));
        assert!(coordinator.is_ok());
    }
}
