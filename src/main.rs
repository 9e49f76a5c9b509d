use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cmdgate::builtin::register_builtins;
use cmdgate::clock::{Clock, SystemClock};
use cmdgate::command::CommandRegistry;
use cmdgate::config::{GateConfig, LogFormat};
use cmdgate::gate::AdmissionGate;
use cmdgate::ingress::{Ingress, JsonLinesResponder};
use cmdgate::ratelimit::{CooldownGate, RateLimiter};
use cmdgate::store::{RedisStore, SharedStore, UnavailableStore};

/// Admission control for bot commands, reading events from stdin.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Redis URL for shared limiter state (overrides the configuration)
    #[arg(long)]
    redis_url: Option<String>,

    /// Log output format (overrides the configuration)
    #[arg(long, value_enum)]
    log_format: Option<CliLogFormat>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliLogFormat {
    Text,
    Json,
}

impl From<CliLogFormat> for LogFormat {
    fn from(format: CliLogFormat) -> Self {
        match format {
            CliLogFormat::Text => LogFormat::Text,
            CliLogFormat::Json => LogFormat::Json,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = GateConfig::load(args.config.as_deref())?;
    if let Some(url) = args.redis_url {
        config.store.redis_url = Some(url);
    }
    if let Some(format) = args.log_format {
        config.log.format = format.into();
    }

    init_tracing(&config);

    info!("Starting cmdgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store: Arc<dyn SharedStore> = match &config.store.redis_url {
        Some(url) => Arc::new(RedisStore::open(url)?),
        None => {
            warn!("No shared store configured, rate limits apply per instance only");
            Arc::new(UnavailableStore)
        }
    };

    let rules = Arc::new(config.rate_limiting.table()?);
    let limiter = Arc::new(
        RateLimiter::new(store.clone(), clock.clone())
            .with_operation_timeout(config.store.operation_timeout()),
    );
    let sweeper = limiter.spawn_sweeper(config.rate_limiting.sweep_interval());
    let cooldowns = Arc::new(
        CooldownGate::new(store, clock).with_operation_timeout(config.store.operation_timeout()),
    );
    info!(
        categories = rules.categories().count(),
        sweep_interval_secs = config.rate_limiting.sweep_interval_secs,
        "Rate limiter initialized"
    );

    let mut registry = CommandRegistry::new();
    register_builtins(&mut registry, limiter.clone(), rules.clone())?;
    info!(commands = registry.len(), "Command registry populated");

    let gate = Arc::new(
        AdmissionGate::new(Arc::new(registry), limiter, cooldowns, rules)
            .with_owners(config.owners.iter().cloned()),
    );

    let responder = Arc::new(JsonLinesResponder::new(tokio::io::stdout()));
    let ingress = Ingress::new(gate, responder);
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());

    let stats = ingress.serve_with_shutdown(stdin, shutdown_signal()).await?;
    sweeper.abort();

    info!(?stats, "cmdgate stopped");
    Ok(())
}

/// Install the global subscriber. Logs go to stderr; stdout carries replies.
fn init_tracing(config: &GateConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    match config.log.format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
