use std::future::{self, Future};
use std::io;
use std::process::ExitCode;
use std::thread::JoinHandle;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal;
use tracing::{error, info, warn};
use tracklist_core::{spawn_loop_thread, ExitStatus, LoopState, MemoryBackend};

mod config;
mod fixture;
mod routes;
mod telemetry;

use config::{Cli, ServerConfig};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let telemetry = telemetry::Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        fixture = ?config.fixture,
        timeout = ?config.bridge.continuation_timeout,
        "starting tracklist server"
    );

    let status = run(config, telemetry.metrics_handle()).await?;
    Ok(ExitCode::from(status.code()))
}

async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<ExitStatus> {
    let seeds = match &config.fixture {
        Some(path) => fixture::load(path)?,
        None => fixture::demo().context("built-in demo playlists are invalid")?,
    };
    info!(playlists = seeds.len(), "seeding playlist service");

    let memory = config.memory.clone();
    let (loop_handle, join) = spawn_loop_thread(
        move |wake| MemoryBackend::new(wake, memory).with_playlists(seeds),
        config.bridge.clone(),
        shutdown_signal(),
    )
    .context("failed to start event loop")?;

    let state = loop_handle.wait_running().await;
    if state != LoopState::Running {
        warn!(?state, "session never came up; not serving");
        return join_loop(join).await;
    }

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("tracklist listening on {}", config.listen_addr);

    let router = routes::router(routes::AppState::new(loop_handle.clone(), Some(metrics)));
    let until_terminated = loop_handle.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { until_terminated.wait_terminated().await })
        .await
        .context("server shutdown with error")?;

    let status = join_loop(join).await?;
    info!(?status, "shutdown complete");
    Ok(status)
}

async fn join_loop(join: JoinHandle<ExitStatus>) -> Result<ExitStatus> {
    tokio::task::spawn_blocking(move || join.join())
        .await
        .context("failed to wait for event loop")?
        .map_err(|_| anyhow!("event loop thread panicked"))
}

/// Polled on the loop thread; the loop logs out when it resolves.
async fn shutdown_signal() {
    until_interrupted(signal::ctrl_c()).await
}

/// Without a handler the process only stops when the session ends on its own.
async fn until_interrupted(signal: impl Future<Output = io::Result<()>>) {
    if let Err(err) = signal.await {
        error!(error = %err, "failed to install ctrl-c handler");
        future::pending::<()>().await;
    }
}
