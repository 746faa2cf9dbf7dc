use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use clap::Parser;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use quotaguard::clock::{Clock, SystemClock};
use quotaguard::config::QuotaGuardConfig;
use quotaguard::ratelimit::{Limiter, LimiterRegistry, TokenQuotaLimiter};

/// Check identities against configured rate limiters.
///
/// Reads one command per line from stdin and prints one JSON result per line:
///
///   check <identity> [cost]
///   record <identity> <cost>
///   usage <identity>
///   reset <identity>
#[derive(Parser, Debug)]
#[command(name = "quotaguard", version, about)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "quotaguard.yaml")]
    config: String,

    /// Name of the limiter or composite to drive
    #[arg(short, long)]
    limiter: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Log filter directive, overridden by RUST_LOG
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = QuotaGuardConfig::from_file(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config))?;

    init_tracing(
        cli.log_level.as_deref().unwrap_or(&config.logging.level),
        cli.log_json || config.logging.json,
    );

    info!("Starting QuotaGuard");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let stores = config.build_stores().await?;
    let sweeper = stores
        .local
        .spawn_sweeper(clock.clone(), config.store.sweep_interval());

    let registry = config.build_registry(&stores, clock)?;
    if registry.get(&cli.limiter).is_none() {
        bail!(
            "unknown limiter '{}', configured: {}",
            cli.limiter,
            registry.names().join(", ")
        );
    }
    info!(limiter = %cli.limiter, backend = ?config.store.backend, "Ready for commands");

    tokio::select! {
        result = run(&registry, &cli.limiter) => result?,
        _ = shutdown_signal() => {}
    }

    sweeper.shutdown();
    info!("QuotaGuard stopped");
    Ok(())
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Process stdin commands until EOF.
async fn run(registry: &LimiterRegistry, name: &str) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let output = match execute(registry, name, line).await {
            Ok(value) => value,
            Err(e) => {
                warn!(command = %line, error = %e, "Command failed");
                json!({ "error": e.to_string() })
            }
        };
        println!("{}", serde_json::to_string(&output)?);
    }

    Ok(())
}

async fn execute(
    registry: &LimiterRegistry,
    name: &str,
    line: &str,
) -> anyhow::Result<serde_json::Value> {
    let mut parts = line.split_whitespace();
    let command = parts.next().unwrap_or_default();
    let identity = parts.next().ok_or_else(|| anyhow!("missing identity"))?;
    let cost = parts
        .next()
        .map(str::parse::<u64>)
        .transpose()
        .context("cost must be a non-negative integer")?;

    let value = match command {
        "check" => {
            let decision = match (cost, registry.quota(name), registry.token_bucket(name)) {
                (Some(cost), Some(quota), _) => quota.check_pre_request(identity, cost).await,
                (Some(cost), None, Some(bucket)) => bucket.check_cost(identity, cost).await,
                (Some(_), None, None) => bail!("limiter '{}' does not take a cost", name),
                (None, _, _) => limiter(registry, name)?.check(identity).await,
            };
            serde_json::to_value(decision)?
        }
        "record" => {
            let cost = cost.ok_or_else(|| anyhow!("record needs a cost"))?;
            let usage = quota(registry, name)?.record_usage(identity, cost).await?;
            serde_json::to_value(usage)?
        }
        "usage" => {
            let usage = quota(registry, name)?.get_usage(identity).await?;
            serde_json::to_value(usage)?
        }
        "reset" => {
            limiter(registry, name)?.reset(identity).await?;
            json!({ "reset": identity })
        }
        other => bail!("unknown command '{}'", other),
    };

    Ok(value)
}

fn limiter(registry: &LimiterRegistry, name: &str) -> anyhow::Result<Arc<dyn Limiter>> {
    registry
        .get(name)
        .ok_or_else(|| anyhow!("unknown limiter '{}'", name))
}

fn quota(registry: &LimiterRegistry, name: &str) -> anyhow::Result<Arc<TokenQuotaLimiter>> {
    registry
        .quota(name)
        .ok_or_else(|| anyhow!("limiter '{}' is not a token quota", name))
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
