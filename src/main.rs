use anyhow::Result;
use clap::{Parser, Subcommand};
use fleetd::{
    config::Config,
    coordinator::{CoordinatorTiming, DeviceCoordinator},
    store::Store,
    ws::provider::{ProviderRegistry, ReleaseChannel},
    AppContext,
};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "fleetd", about = "fleetd — device-fleet broker daemon", version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// REST API port
    #[arg(long, env = "FLEETD_PORT")]
    port: Option<u16>,

    /// WebSocket port for provider heartbeats and change-feed subscribers
    #[arg(long, env = "FLEETD_WS_PORT")]
    ws_port: Option<u16>,

    /// Data directory for the SQLite database and config.toml
    #[arg(long, env = "FLEETD_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "FLEETD_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "FLEETD_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the broker in the foreground (default when no subcommand given).
    ///
    /// Examples:
    ///   fleetd serve
    ///   fleetd
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::new(args.port, args.ws_port, args.data_dir, args.log);
    let _log_guard = setup_logging(&config.log, args.log_file.as_deref());

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => run_server(config).await,
    }
}

/// Initialize the tracing subscriber.
/// If `log_file` is set, logs go to both stdout and a daily-rolling file.
/// Returns a `WorkerGuard` that must stay alive for the process lifetime.
///
/// If the log directory cannot be created, falls back to stdout-only logging
/// with a warning — never panics.
fn setup_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("fleetd.log"));

        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!(
                "warn: could not create log directory '{}': {e} — falling back to stdout",
                dir.display()
            );
            tracing_subscriber::fmt()
                .with_env_filter(log_level)
                .compact()
                .init();
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(log_level))
            .with(tracing_subscriber::fmt::layer().compact())
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .init();

        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(log_level)
            .compact()
            .init();
        None
    }
}

async fn run_server(config: Config) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "fleetd starting");
    let config = Arc::new(config);
    info!(
        data_dir = %config.data_dir.display(),
        port = config.port,
        ws_port = config.ws_port,
        "config loaded"
    );

    let store = Arc::new(Store::new(&config.data_dir).await?);
    let providers = Arc::new(ProviderRegistry::new());
    let timing = CoordinatorTiming {
        cold_timeout: config.cold_timeout,
        cold_grace: config.cold_grace,
        ..Default::default()
    };
    let coordinator = Arc::new(DeviceCoordinator::new(
        store.clone(),
        providers.clone() as Arc<dyn ReleaseChannel>,
        timing,
    ));

    let ctx = Arc::new(AppContext {
        config,
        store,
        providers,
        coordinator,
        started_at: std::time::Instant::now(),
    });

    // Leases that survived a restart get their idle watchers back.
    match ctx.coordinator.rearm_leases().await {
        Ok(n) if n > 0 => info!(leases = n, "recovered live leases from a previous run"),
        Ok(_) => {}
        Err(e) => error!(err = %e, "failed to re-arm idle watchers"),
    }

    let api_ctx = ctx.clone();
    tokio::spawn(async move {
        if let Err(e) = fleetd::api::run(api_ctx).await {
            error!(err = %e, "REST API server exited");
        }
    });
    let ws_ctx = ctx.clone();
    tokio::spawn(async move {
        if let Err(e) = fleetd::ws::run(ws_ctx).await {
            error!(err = %e, "websocket server exited");
        }
    });

    shutdown_signal().await;
    info!("shutdown signal received — stopping");
    Ok(())
}

/// Resolves when a shutdown signal is received.
///
/// On Unix we listen for SIGTERM *and* Ctrl-C.
/// On other platforms we listen for Ctrl-C only.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}
