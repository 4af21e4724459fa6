use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::future::join_all;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ratewarden::config::{Driver, LogFormat, LoggingConfig, WardenConfig};
use ratewarden::Limiter;

#[derive(Debug, Parser)]
#[command(name = "ratewarden", version, about = "Fixed-window rate limiter")]
struct Cli {
    /// YAML configuration file; RATEWARDEN__* variables override it
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Override the configured counter store
    #[arg(long)]
    driver: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Count hits against a key and report each decision
    Hit {
        key: String,

        /// Hits allowed per window
        #[arg(long)]
        limit: u64,

        /// Window length in seconds
        #[arg(long)]
        ttl: u64,

        /// Number of hits to send
        #[arg(long, default_value_t = 1)]
        times: u64,

        /// Send all hits at once instead of one after another
        #[arg(long)]
        concurrent: bool,

        /// Print one JSON object per hit
        #[arg(long)]
        json: bool,
    },
    /// Report whether an IP address is whitelisted
    Whitelist { ip: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let mut config = WardenConfig::load(cli.config.as_deref())?;
    if let Some(driver) = cli.driver {
        config.driver = Driver::from(driver);
    }
    init_tracing(&config.logging);

    info!(version = env!("CARGO_PKG_VERSION"), driver = %config.driver, "Starting Ratewarden");

    let limiter = Arc::new(Limiter::from_config(&config).await?);

    match cli.command {
        Command::Hit {
            key,
            limit,
            ttl,
            times,
            concurrent,
            json,
        } => {
            let results = send_hits(&limiter, &key, limit, ttl, times, concurrent).await;

            let mut failed = false;
            for (hit, result) in results.into_iter().enumerate() {
                let hit = hit + 1;
                match result {
                    Ok(allowed) if json => println!(
                        "{}",
                        serde_json::json!({ "hit": hit, "key": key, "allowed": allowed })
                    ),
                    Ok(allowed) => {
                        println!("{hit}: {}", if allowed { "pass" } else { "deny" })
                    }
                    Err(e) => {
                        error!(hit, error = %e, "Hit failed");
                        failed = true;
                    }
                }
            }

            if failed {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Whitelist { ip } => {
            let whitelisted = limiter.is_ip_whitelisted(&ip);
            println!("{ip}: {}", if whitelisted { "whitelisted" } else { "not whitelisted" });
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Count `times` hits against `key`, in order or all at once.
async fn send_hits(
    limiter: &Limiter,
    key: &str,
    limit: u64,
    ttl: u64,
    times: u64,
    concurrent: bool,
) -> Vec<ratewarden::Result<bool>> {
    if concurrent {
        join_all((0..times).map(|_| limiter.attempt(key, limit, ttl))).await
    } else {
        let mut results = Vec::new();
        for _ in 0..times {
            results.push(limiter.attempt(key, limit, ttl).await);
        }
        results
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.with_thread_ids(true).init(),
    }
}
