use std::path::PathBuf;

use clap::Parser;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::ratelimit::{Decision, Limiter};
use turnstile::TurnstileConfig;

#[derive(Parser, Debug)]
#[command(author, version, about = "Turnstile request rate limiter")]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    /// Identifier to check; may be repeated. Reads stdin lines when omitted.
    #[arg(short, long = "identifier", value_name = "ID")]
    identifiers: Vec<String>,
}

/// One decision, printed as a JSON line on stdout.
#[derive(Serialize, Debug)]
struct DecisionLine<'a> {
    identifier: &'a str,
    allowed: bool,
    limit: Option<u64>,
    remaining: Option<i64>,
    reset: Option<i64>,
    retry_after_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<'a> DecisionLine<'a> {
    fn new(identifier: &'a str, decision: &Decision) -> Self {
        let status = decision.status();
        Self {
            identifier,
            allowed: decision.is_allowed(),
            limit: status.map(|s| s.total),
            remaining: status.map(|s| s.remaining.max(0)),
            reset: status.map(|s| s.reset_time.timestamp()),
            retry_after_ms: status.map(|s| s.retry_after.as_millis() as u64),
            error: match decision {
                Decision::Degraded { error, .. } => Some(error.to_string()),
                _ => None,
            },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    info!("Starting Turnstile");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = TurnstileConfig::load(cli.config.as_deref())?;
    info!(backend = ?config.limiter.backend, "Configuration loaded");

    let limiter = Limiter::from_config(&config)?;
    let sweeper = config
        .sweep_interval()
        .and_then(|every| limiter.spawn_sweeper(every));

    if cli.identifiers.is_empty() {
        check_stdin(&limiter).await?;
    } else {
        for identifier in &cli.identifiers {
            emit(&limiter, identifier).await?;
        }
    }

    if let Some(sweeper) = sweeper {
        sweeper.shutdown().await;
    }

    info!("Turnstile stopped");
    Ok(())
}

/// Check one identifier per stdin line until EOF or a shutdown signal.
async fn check_stdin(limiter: &Limiter) -> anyhow::Result<()> {
    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            line = lines.next() => match line {
                Some(line) => {
                    let line = line?;
                    let identifier = line.trim();
                    if identifier.is_empty() {
                        continue;
                    }
                    emit(limiter, identifier).await?;
                }
                None => break,
            },
        }
    }

    Ok(())
}

async fn emit(limiter: &Limiter, identifier: &str) -> anyhow::Result<()> {
    let decision = limiter.check(identifier).await;
    let line = serde_json::to_string(&DecisionLine::new(identifier, &decision))?;
    println!("{}", line);
    Ok(())
}

/// Logs go to stderr so stdout carries only decisions.
fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(%err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(%err, "Failed to install SIGTERM handler");
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
