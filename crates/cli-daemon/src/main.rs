//! CLI entry point for easy-transcoder
//!
//! Loads configuration, sets up logging, runs startup checks and serves the
//! task API until interrupted.

use clap::Parser;
use easy_transcoder::config::{LogFormat, LoggingConfig};
use easy_transcoder::{run_server, run_startup_checks, Config, Processor};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// How long running encoders get to stop after shutdown starts
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// easy-transcoder - queue media files for transcoding and review the results
#[derive(Parser, Debug)]
#[command(name = "easy-transcoder")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file; defaults apply if it does not exist
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Skip the ffmpeg/ffprobe availability checks
    #[arg(long, default_value = "false")]
    skip_checks: bool,
}

fn init_logging(cfg: &LoggingConfig) {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match cfg.level.parse::<EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: logging level '{}' is not a valid filter ({}); falling back to 'info'",
                    cfg.level, e
                );
                EnvFilter::new("info")
            }
        },
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true);

    match cfg.format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Text => subscriber.init(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::load_or_default(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration from {}: {}", args.config.display(), e);
            return ExitCode::FAILURE;
        }
    };

    init_logging(&config.logging);
    info!(version = env!("CARGO_PKG_VERSION"), config = %args.config.display(), "easy-transcoder starting");

    if args.skip_checks {
        warn!("skipping startup checks (--skip-checks enabled)");
    } else if let Err(e) = run_startup_checks(&config) {
        error!(error = %e, "startup check failed");
        return ExitCode::FAILURE;
    }

    let bind = config.server.bind.clone();
    let (processor, worker) = Processor::new(config);

    let mut worker = tokio::spawn(worker.run());
    let scanner = processor.spawn_policy_scanner();

    let result = run_server(processor.clone(), &bind).await;

    scanner.abort();
    processor.shutdown().await;
    processor.cancel_all().await;
    match tokio::time::timeout(SHUTDOWN_GRACE, &mut worker).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "worker task failed"),
        Err(_) => {
            warn!(grace_secs = SHUTDOWN_GRACE.as_secs(), "worker did not stop in time; aborting");
            worker.abort();
        }
    }

    match result {
        Ok(()) => {
            info!("easy-transcoder stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "server error");
            ExitCode::FAILURE
        }
    }
}
