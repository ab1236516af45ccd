//! CLI entry point for loopcast
//!
//! Parses command line arguments, wires logging and signals, and runs the
//! supervisor until it terminates.

use clap::Parser;
use loopcast::{Supervisor, SupervisorHandle};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Exit code for failures before the supervisor starts
const SETUP_FAILURE: u8 = 2;

/// loopcast - keeps a playlist streaming through ffmpeg
#[derive(Parser, Debug)]
#[command(name = "loopcast")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Skip startup checks (ffmpeg, hardware encoders). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Do not serve the health endpoint
    #[arg(long, default_value = "false")]
    no_health_server: bool,
}

/// Request shutdown on SIGINT or SIGTERM
async fn forward_signals(handle: SupervisorHandle) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
                    _ = sigterm.recv() => info!("SIGTERM received"),
                }
            }
            Err(e) => {
                error!(error = %e, "cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
                info!("SIGINT received");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("interrupt received");
    }

    handle.shutdown();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(config = %args.config.display(), "loopcast starting");

    let supervisor = match Supervisor::from_config_file(&args.config, args.skip_checks) {
        Ok(supervisor) => supervisor,
        Err(e) => {
            error!(error = %e, "failed to initialize");
            return ExitCode::from(SETUP_FAILURE);
        }
    };

    if !args.no_health_server {
        supervisor.start_health_server();
    }
    tokio::spawn(forward_signals(supervisor.handle()));

    let status = supervisor.supervise().await;
    info!(status = ?status, "loopcast exiting");
    ExitCode::from(status.exit_code())
}
