//! fbuild daemon entry point.
//!
//! Resolves the data directory (honoring `FBUILD_DEV_MODE`), takes the PID
//! file, starts the message router and the main request loop, and maps the
//! loop's exit reason onto process exit codes: 0 for normal shutdown (or
//! an already-running daemon), 130 for a user interrupt outside an active
//! operation.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tracing::{info, warn};

use fbuild_core::FbuildHome;
use fbuild_kernel::context::DaemonContext;
use fbuild_kernel::devices::SerialPortEnumerator;
use fbuild_kernel::error::KernelError;
use fbuild_kernel::mainloop::{ExitReason, InterruptFlag, LoggingProcessor, MainLoop};
use fbuild_kernel::pidfile::PidFile;
use fbuild_kernel::serial::SystemSerialProvider;
use fbuild_kernel::server::DaemonServer;
use fbuild_kernel::status::DaemonState;
use fbuild_telemetry::{LogConfig, setup_logging};

/// Exit code for a user interrupt outside an active operation.
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Debug, Parser)]
#[command(name = "fbuild-daemon", version, about = "Persistent build daemon for embedded firmware projects")]
struct Args {
    /// TCP port to listen on (loopback only).
    #[arg(long)]
    port: Option<u16>,

    /// Stay in the foreground and log to stderr instead of the log file.
    #[arg(long)]
    foreground: bool,

    /// PID of the client process that spawned this daemon.
    #[arg(long = "spawned-by")]
    spawned_by: Option<u32>,

    /// Override the daemon data directory.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Path to a daemon config TOML file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level filter (e.g. info, debug, fbuild_kernel=trace).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<std::process::ExitCode> {
    let args = Args::parse();

    let home = match &args.data_dir {
        Some(dir) => FbuildHome::from_path(dir),
        None => FbuildHome::resolve().context("failed to resolve daemon data directory")?,
    };
    home.ensure().context("failed to create daemon data directory")?;

    let log_config = if args.foreground {
        LogConfig::new(&args.log_level)
    } else {
        LogConfig::new(&args.log_level).with_file_logging(home.logs_dir(), "fbuild-daemon")
    };
    let _log_guard = setup_logging(&log_config).context("failed to initialize logging")?;

    let mut config =
        fbuild_config::load(args.config.as_deref()).context("failed to load daemon config")?;
    if let Some(port) = args.port {
        config.network.port = port;
    }

    // One daemon per data directory. A second start is not an error.
    let pidfile = match PidFile::acquire(home.pid_file()) {
        Ok(pidfile) => pidfile,
        Err(KernelError::AlreadyRunning { pid }) => {
            info!(pid, "daemon already running, exiting");
            return Ok(std::process::ExitCode::SUCCESS);
        },
        Err(e) => return Err(e).context("failed to acquire pid file"),
    };

    info!(
        pid = std::process::id(),
        spawned_by = ?args.spawned_by,
        data_dir = %home.root().display(),
        "fbuild daemon starting"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    let exit = runtime.block_on(run_daemon(home, config, args.spawned_by))?;
    drop(pidfile);

    Ok(match exit {
        ExitReason::Interrupted => std::process::ExitCode::from(
            u8::try_from(EXIT_INTERRUPTED).unwrap_or(u8::MAX),
        ),
        _ => std::process::ExitCode::SUCCESS,
    })
}

async fn run_daemon(
    home: FbuildHome,
    config: fbuild_config::DaemonConfig,
    spawned_by: Option<u32>,
) -> anyhow::Result<ExitReason> {
    let context = DaemonContext::new(
        home,
        config,
        Box::new(SerialPortEnumerator),
        Arc::new(SystemSerialProvider),
        spawned_by,
    )
    .context("failed to construct daemon context")?;

    // Clients must never read a stale status from a previous daemon.
    context
        .status
        .update_status(DaemonState::Idle, "Daemon starting...");

    let server = DaemonServer::new(Arc::clone(&context));
    let handle = server.serve().await.context("failed to start daemon server")?;
    info!(addr = %handle.local_addr, "message router ready");

    let interrupt = InterruptFlag::new();
    spawn_signal_task(interrupt.clone());

    let main_loop = MainLoop::new(Arc::clone(&context), Arc::new(LoggingProcessor), interrupt);
    let reason = main_loop.run().await;

    info!(?reason, "daemon shutting down");
    context
        .status
        .update_status(DaemonState::ShuttingDown, "Daemon shutting down");
    handle.shutdown();
    // Give in-flight goodbyes a moment to drain.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    Ok(reason)
}

/// Forward SIGTERM/SIGINT to the main loop's interrupt flag. The loop
/// decides whether to honor it (it refuses during active operations).
fn spawn_signal_task(interrupt: InterruptFlag) {
    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                return;
            },
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to install SIGINT handler");
                return;
            },
        };
        loop {
            tokio::select! {
                _ = sigterm.recv() => info!("SIGTERM received"),
                _ = sigint.recv() => info!("SIGINT received"),
            }
            interrupt.raise();
        }
    });

    #[cfg(not(unix))]
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            info!("interrupt received");
            interrupt.raise();
        }
    });
}
