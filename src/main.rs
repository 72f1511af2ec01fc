#![forbid(unsafe_code)]

//! `flint-gateway` — gateway server binary.
//!
//! Bootstraps configuration, starts the HTTP surface, and shuts the agent
//! runtime pool down gracefully on SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use flint_gateway::config::{CliOverrides, GatewayOptions};
use flint_gateway::gateway::GatewayEngine;
use flint_gateway::{http, AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "flint-gateway", about = "Messaging-to-agent gateway", version, long_about = None)]
struct Cli {
    /// Path to the JSON settings file.
    ///
    /// Defaults to `~/.flint/settings.json`; `FLINT_GATEWAY_USER_SETTINGS_PATH`
    /// overrides the default, this flag overrides both.
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Override the HTTP port (default 8788, or `PORT`).
    #[arg(long)]
    port: Option<u16>,

    /// Override the thread store path.
    #[arg(long)]
    store_path: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> std::process::ExitCode {
    let args = Cli::parse();
    if let Err(err) = init_tracing(args.log_format) {
        eprintln!("failed to initialise logging: {err}");
        return std::process::ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(%err, "failed to build tokio runtime");
            return std::process::ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(args)) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "gateway startup failed");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run(args: Cli) -> Result<()> {
    info!("flint-gateway bootstrap");

    let options = GatewayOptions::load(&CliOverrides {
        settings_path: args.settings,
        port: args.port,
        store_path: args.store_path,
    })?;

    info!(
        provider = options.provider.hint(),
        routing_mode = options.routing_mode.as_str(),
        port = options.port,
        store = %options.store_path.display(),
        "configuration loaded"
    );

    // Channel adapters are registered here when the deployment provides
    // them; the core ships with none.
    let engine = GatewayEngine::start(options, Vec::new()).await?;

    let ct = CancellationToken::new();
    let http_handle = {
        let engine = Arc::clone(&engine);
        let ct = ct.clone();
        tokio::spawn(async move { http::serve(engine, ct).await })
    };

    shutdown_signal().await;
    info!("shutdown signal received — starting graceful shutdown");
    ct.cancel();

    // Second signal forces exit.
    tokio::spawn(async {
        shutdown_signal().await;
        error!("second shutdown signal received — forcing exit");
        std::process::exit(1);
    });

    // ── Graceful shutdown with timeout ───────────────────
    let shutdown_fut = async {
        engine.shutdown().await;
        match http_handle.await {
            Ok(result) => result,
            Err(err) => Err(AppError::Io(format!("http task join error: {err}"))),
        }
    };

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, shutdown_fut).await {
        Ok(result) => result?,
        Err(_elapsed) => {
            error!(
                timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
                "graceful shutdown timed out — exiting"
            );
        }
    }

    info!("flint-gateway shut down");
    Ok(())
}

/// Maximum time to wait for graceful shutdown before giving up.
const SHUTDOWN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
