//! Probing agent: registers with the coordinator, runs per-target checks on
//! their own schedule, and reports heartbeats and target-list changes.

#[cfg(not(target_os = "windows"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use shared::config::AgentConfig;
use shared::defaults::{HEARTBEAT_INTERVAL, TARGET_POLL_INTERVAL};
use tracing::{error, info, warn};

mod client;
mod probe;
mod scheduler;

use client::RpcClient;
use scheduler::TargetScheduler;

/// Connects to the coordinator and keeps the per-target ticker fleet,
/// heartbeat timer, and target-list poller alive until shutdown.
async fn run(config: AgentConfig) -> Result<()> {
    let client = Arc::new(RpcClient::new(config.server_url.clone(), config.api_key.clone())?);
    let agent_name = config.resolved_agent_name();

    let register_response = client
        .register(&agent_name, &config.agent_location)
        .await
        .context("failed to register with coordinator")?;
    client::log_registered(&register_response.agent_id, &register_response.server_id);
    let agent_id = register_response.agent_id;

    let targets_response = client
        .fetch_targets()
        .await
        .context("failed to fetch initial target list")?;
    info!(count = targets_response.targets.len(), "fetched target list");

    let mut scheduler = TargetScheduler::new(Arc::clone(&client), agent_id.clone(), agent_name);
    scheduler.start_all(&targets_response.targets);

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    let heartbeat_task = {
        let client = Arc::clone(&client);
        let agent_id = agent_id.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = client.heartbeat(&agent_id).await {
                            warn!(error = %e, "heartbeat failed");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("heartbeat task received shutdown signal");
                        break;
                    }
                }
            }
        })
    };

    // The poller owns the scheduler's restart path: it's the only task that
    // mutates `scheduler`, so no locking is needed between it and the main loop.
    let poll_task = {
        let client = Arc::clone(&client);
        let mut shutdown_rx = shutdown_tx.subscribe();
        let mut last_updated = targets_response.last_updated;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TARGET_POLL_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match client.check_updates(last_updated).await {
                            Ok(resp) if resp.has_updates => {
                                match client.fetch_targets().await {
                                    Ok(targets) => {
                                        info!(count = targets.targets.len(), "target list changed, restarting schedulers");
                                        last_updated = targets.last_updated;
                                        scheduler.restart_all(&targets.targets);
                                    }
                                    Err(e) => warn!(error = %e, "failed to fetch updated target list"),
                                }
                            }
                            Ok(_) => {}
                            Err(e) => warn!(error = %e, "check-updates poll failed"),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("target poller received shutdown signal");
                        scheduler.stop_all();
                        break;
                    }
                }
            }
        })
    };

    setup_shutdown_signal().await;
    info!("shutdown signal received, stopping agent");
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(
        Duration::from_secs(config.graceful_shutdown_timeout_seconds),
        heartbeat_task,
    )
    .await
    {
        Ok(Ok(())) => info!(task = "heartbeat", "stopped cleanly"),
        Ok(Err(e)) => warn!(task = "heartbeat", error = %e, "task panicked"),
        Err(_) => warn!(task = "heartbeat", "shutdown timeout reached"),
    }

    match tokio::time::timeout(
        Duration::from_secs(config.graceful_shutdown_timeout_seconds),
        poll_task,
    )
    .await
    {
        Ok(Ok(())) => info!(task = "target poller", "stopped cleanly"),
        Ok(Err(e)) => warn!(task = "target poller", error = %e, "task panicked"),
        Err(_) => warn!(task = "target poller", "shutdown timeout reached"),
    }

    Ok(())
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
    let file_appender = tracing_appender::rolling::daily("./logs", "agent.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("agent=info,shared=info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(non_blocking)
        .init();

    let config = AgentConfig::parse();
    if let Err(e) = config.validate() {
        error!(error = %e, "invalid configuration");
        std::process::exit(1);
    }

    info!("agent starting up");

    if let Err(e) = run(config).await {
        error!(error = %e, "agent error");
        std::process::exit(1);
    }

    Ok(())
}
