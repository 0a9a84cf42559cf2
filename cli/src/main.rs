//! CLI entrypoint for engine-relay
//!
//! This is the main binary that wires together all layers using
//! dependency injection.

mod args;
mod relay;

use anyhow::{Context, Result, bail};
use args::Cli;
use clap::Parser;
use relay::{Relay, StopReason};
use relay_application::{AuditLogger, NoAuditLogger};
use relay_infrastructure::{ConfigLoader, EngineProcess, FileConfig, JsonlAuditLogger, MessageChannel};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Grace period for the engine to exit after the channel closes.
const ENGINE_EXIT_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    if cli.show_config {
        ConfigLoader::print_config_sources(cli.config.as_ref());
        return Ok(ExitCode::SUCCESS);
    }

    let mut config = if cli.no_config {
        ConfigLoader::load_defaults()
    } else {
        ConfigLoader::load(cli.config.as_ref()).context("Failed to load configuration")?
    };
    cli.apply_overrides(&mut config);

    // Keep the guard alive so buffered file logs are flushed on exit.
    let _log_guard = init_logging(cli.log_level(), config.logging.directory.as_deref());

    let issues = config.validate();
    if !issues.is_empty() {
        for issue in &issues {
            error!("{}", issue);
        }
        bail!("Invalid configuration ({} issue(s))", issues.len());
    }

    info!("Starting engine-relay");
    run(config).await
}

fn init_logging(level: &str, directory: Option<&Path>) -> Option<WorkerGuard> {
    let filter = if std::env::var_os("RUST_LOG").is_some() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(level)
    };

    let (file_layer, guard) = match directory {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "engine-relay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .init();
    guard
}

async fn run(config: FileConfig) -> Result<ExitCode> {
    // === Dependency Injection ===
    let audit: Arc<dyn AuditLogger> = match &config.logging.audit_file {
        Some(path) => Arc::new(JsonlAuditLogger::open(path).with_context(|| {
            format!("Failed to open audit log {}", path.display())
        })?),
        None => Arc::new(NoAuditLogger),
    };
    let channel = Arc::new(MessageChannel::new(config.channel.to_options()));
    let mut engine = EngineProcess::spawn(&config.engine.to_settings())?;

    let relay = Relay::new(config, Arc::clone(&channel), audit)?;
    engine.connect(&channel).await?;

    let reason = relay
        .run(async {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        warn!("Ctrl-C handler failed: {}", e);
                    }
                    StopReason::Interrupted
                }
                status = engine.wait() => match status {
                    Ok(code) => StopReason::EngineExited(code),
                    Err(e) => {
                        warn!("Waiting for engine failed: {}", e);
                        StopReason::EngineExited(None)
                    }
                },
            }
        })
        .await;

    let code = match reason {
        StopReason::EngineExited(code) => code,
        StopReason::Interrupted | StopReason::Disconnected(_) => {
            match tokio::time::timeout(ENGINE_EXIT_GRACE, engine.wait()).await {
                Ok(Ok(code)) => code,
                Ok(Err(e)) => {
                    warn!("Waiting for engine failed: {}", e);
                    None
                }
                Err(_) => {
                    warn!("Engine did not exit, killing it");
                    engine.kill().await?;
                    None
                }
            }
        }
    };

    match (reason, code) {
        (StopReason::Interrupted, _) => Ok(ExitCode::SUCCESS),
        (_, Some(0)) => Ok(ExitCode::SUCCESS),
        (_, Some(code)) => {
            warn!("Engine exited with code {}", code);
            Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
        }
        (_, None) => Ok(ExitCode::FAILURE),
    }
}
