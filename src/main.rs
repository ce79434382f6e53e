//! timetabled - task scheduling daemon with PostgreSQL as the state of record.
//!
//! Entry point: merges the configuration, installs logging, connects the
//! database gateway and drives the scheduling engine until shutdown. Exit
//! codes: 0 on a clean run, 2 for configuration errors, 3 when the database
//! schema needs an upgrade that was not requested.

#![forbid(unsafe_code)]

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use timetable_core::{logsink, yaml, Config, Engine, Gateway, RunOutcome, SchemaState};

mod cli;
mod server;

use crate::server::{RestHandler, SchedulerHandle};

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    let cli = cli::Cli::parse();
    let config = match Config::resolve(cli.options) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            let mut cmd = <cli::Cli as clap::CommandFactory>::command();
            let _ = cmd.print_help();
            return ExitCode::from(2);
        }
    };

    let logging = match logsink::init(&config) {
        Ok(logging) => logging,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(2);
        }
    };

    match run(config, logging).await {
        Ok(code) => code,
        Err(e) => {
            error!("Fatal: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config, logging: logsink::Logging) -> anyhow::Result<ExitCode> {
    info!(
        "Starting timetabled v{} as client {}",
        env!("CARGO_PKG_VERSION"),
        config.client_name
    );
    let _file_guard = logging.file_guard;

    let token = CancellationToken::new();
    spawn_shutdown_watcher(token.clone());

    let config = Arc::new(config);
    let gateway = match Gateway::connect_with_retry(&config, &token).await? {
        Some(gateway) => Arc::new(gateway),
        None => return Ok(ExitCode::SUCCESS),
    };

    match gateway.schema_state().await? {
        SchemaState::UpToDate => {}
        SchemaState::Fresh => {
            info!("Installing the timetable schema");
            gateway.migrate().await?;
        }
        SchemaState::Pending(n) if config.upgrade || config.init => {
            info!("Applying {} pending schema migrations", n);
            gateway.migrate().await?;
        }
        SchemaState::Pending(n) => {
            error!("Database schema is {} migrations behind, restart with --upgrade", n);
            gateway.close().await;
            return Ok(ExitCode::from(3));
        }
    }
    if config.init {
        info!("Schema is up to date, exiting");
        gateway.close().await;
        return Ok(ExitCode::SUCCESS);
    }

    if !gateway.lock_client_name(&token).await? {
        gateway.close().await;
        return Ok(ExitCode::SUCCESS);
    }

    let swept = gateway.fix_leftovers(Utc::now()).await?;
    if swept > 0 {
        info!("Marked {} abandoned chain runs as dead", swept);
    }

    let mut sink_health = None;
    let mut flusher = None;
    if let Some(sink) = logging.db_sink {
        sink_health = Some(Arc::clone(&sink.health));
        flusher = Some(logsink::spawn_db_flusher(
            Arc::clone(&gateway),
            sink,
            token.child_token(),
        ));
    }

    if let Some(path) = &config.file {
        info!("Executing startup script {}", path.display());
        gateway
            .exec_script_file(path)
            .await
            .with_context(|| format!("startup script {} failed", path.display()))?;
    }

    if let Some(path) = &config.import {
        yaml::import_file(&gateway, path, config.replace)
            .await
            .with_context(|| format!("chain import from {} failed", path.display()))?;
    }

    let handle = SchedulerHandle::new(Arc::clone(&gateway));
    let mut rest = None;
    if config.rest_port > 0 {
        let handler: Arc<dyn RestHandler> = handle.clone();
        let rest_token = token.child_token();
        let port = config.rest_port;
        rest = Some(tokio::spawn(async move {
            if let Err(e) = server::serve(port, handler, rest_token).await {
                error!("REST API server failed: {:#}", e);
            }
        }));
    }

    let mut engine = Engine::new(Arc::clone(&gateway), Arc::clone(&config));
    if let Some(health) = sink_health {
        engine = engine.with_sink_health(health);
    }

    let outcome = drive_engine(&engine, &gateway, &handle, &token).await;

    handle.set_ready(false);
    token.cancel();
    if let Some(task) = rest {
        let _ = task.await;
    }
    if let Some(task) = flusher {
        let _ = task.await;
    }
    gateway.close().await;

    outcome?;
    info!("Shutdown complete");
    Ok(ExitCode::SUCCESS)
}

/// Run the engine, re-entering it after every recovered connection loss.
///
/// A lost connection disarms readiness, waits for the database to answer
/// pings again, re-acquires the session lock and sweeps the runs orphaned by
/// the outage before the engine starts over.
async fn drive_engine(
    engine: &Engine,
    gateway: &Gateway,
    handle: &SchedulerHandle,
    token: &CancellationToken,
) -> timetable_core::Result<()> {
    loop {
        handle.set_ready(true);
        let outcome = engine.run(token.clone()).await?;
        handle.set_ready(false);
        match outcome {
            RunOutcome::Terminated => return Ok(()),
            RunOutcome::ConnectionLost => {
                warn!("Connection to the configuration database lost, reconnecting");
                if !gateway.wait_until_reachable(token).await {
                    return Ok(());
                }
                if !gateway.lock_client_name(token).await? {
                    return Ok(());
                }
                match gateway.fix_leftovers(Utc::now()).await {
                    Ok(swept) if swept > 0 => {
                        info!("Marked {} chain runs orphaned by the outage as dead", swept)
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Leftover sweep failed after reconnect: {}", e),
                }
            }
        }
    }
}

fn spawn_shutdown_watcher(token: CancellationToken) {
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        token.cancel();
    });
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C signal"),
        _ = terminate => info!("Received SIGTERM signal"),
    }
}
