use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn, Level};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use rlim::config::{BundleConfig, LimiterConfig, PacingConfig, QuotaConfig};
use rlim::{Limiter, RlimError};

/// Run a command repeatedly without exceeding a rate limit
#[derive(Parser, Debug)]
#[command(name = "rlim")]
#[command(version)]
#[command(about = "Run a command repeatedly under pacing and quota limits", long_about = None)]
struct Args {
    /// YAML file describing a limiter (or a bundle, with --limiter)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Name of the limiter to use from a bundle config file
    #[arg(short, long, requires = "config")]
    limiter: Option<String>,

    /// Minimum seconds between runs
    #[arg(short, long)]
    interval: Option<f64>,

    /// Jitter fraction applied to the interval, in [0, 1)
    #[arg(long)]
    variation: Option<f64>,

    /// Quota as CALLS/SECONDS, e.g. 50/40; may be repeated
    #[arg(short, long, value_parser = parse_quota)]
    quota: Vec<QuotaConfig>,

    /// Skip a run instead of waiting when the limit is reached
    #[arg(long)]
    reject: bool,

    /// Derive pacing from the tightest quota
    #[arg(long)]
    autorate: bool,

    /// Number of runs
    #[arg(short = 'n', long, default_value_t = 1)]
    count: u32,

    /// Default log level (RUST_LOG takes precedence)
    #[arg(long, default_value_t = Level::INFO)]
    log_level: Level,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    /// Command to run, after `--`
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

fn parse_quota(value: &str) -> Result<QuotaConfig, String> {
    let (calls, secs) = value
        .split_once('/')
        .ok_or_else(|| format!("expected CALLS/SECONDS, got {:?}", value))?;
    Ok(QuotaConfig {
        max_calls: calls
            .trim()
            .parse()
            .map_err(|e| format!("invalid call count {:?}: {}", calls, e))?,
        window_secs: secs
            .trim()
            .parse()
            .map_err(|e| format!("invalid window {:?}: {}", secs, e))?,
    })
}

/// Merge the config file (if any) with command line flags.
fn limiter_config(args: &Args) -> anyhow::Result<LimiterConfig> {
    let mut config = match (&args.config, &args.limiter) {
        (Some(path), Some(name)) => BundleConfig::from_file(path)?
            .get(name)
            .cloned()
            .with_context(|| format!("no limiter named {:?} in {}", name, path.display()))?,
        (Some(path), None) => LimiterConfig::from_file(path)?,
        (None, _) => LimiterConfig::default(),
    };

    if let Some(interval_secs) = args.interval {
        config.pacing = Some(PacingConfig {
            interval_secs,
            variation: 0.0,
        });
    }
    if let Some(variation) = args.variation {
        match config.pacing.as_mut() {
            Some(pacing) => pacing.variation = variation,
            None => bail!("--variation needs a pacing interval"),
        }
    }
    config.quotas.extend(args.quota.iter().cloned());
    config.reject_on_wait |= args.reject;
    config.autorate |= args.autorate;

    Ok(config)
}

async fn run(limiter: Limiter, command: &[String], count: u32) -> anyhow::Result<()> {
    let (program, program_args) = command
        .split_first()
        .context("no command given")?;
    let mut failed = 0;
    let mut rejected = 0;

    for attempt in 1..=count {
        match limiter.acquire_async().await {
            Ok(()) => {}
            Err(RlimError::RateLimitExceeded { wait, .. }) => {
                warn!(attempt, wait = ?wait, "Rate limit reached, skipping run");
                rejected += 1;
                continue;
            }
            Err(e) => return Err(e.into()),
        }

        info!(attempt, program = %program, "Launching command");
        match tokio::process::Command::new(program)
            .args(program_args)
            .status()
            .await
        {
            Ok(status) if status.success() => {}
            Ok(status) => {
                warn!(attempt, status = %status, "Command exited unsuccessfully");
                failed += 1;
            }
            Err(e) => {
                error!(attempt, error = %e, "Failed to launch command");
                failed += 1;
            }
        }
    }

    info!(count, failed, rejected, "All runs finished");
    if failed > 0 {
        bail!("{} of {} runs failed", failed, count);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::from_level(args.log_level).into())
                .from_env_lossy(),
        )
        .with_target(false)
        .with_writer(std::io::stderr);
    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = limiter_config(&args)?;
    let limiter = config.build()?;
    info!(limiter = ?limiter, "Rate limiter initialized");

    tokio::select! {
        result = run(limiter, &args.command, args.count) => result,
        _ = shutdown_signal() => {
            info!("Interrupted, stopping before the next run");
            Ok(())
        }
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
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
