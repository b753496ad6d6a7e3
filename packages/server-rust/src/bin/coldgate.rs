//! Gateway server binary.
//!
//! Wires local-filesystem storage and an in-process catalog into the
//! gateway, recovers unfinished writes, starts the queue drain, and
//! serves the REST surface until SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use coldgate_core::StorageUnit;
use coldgate_server::catalog::MemoryCatalog;
use coldgate_server::network::{self, AppState, ShutdownController};
use coldgate_server::storage::{ArchiveStorage, FsArchiveStorage, FsMainStorage};
use coldgate_server::{Gateway, GatewayConfig, NetworkConfig};

#[derive(Debug, Parser)]
#[command(name = "coldgate", about = "Data-archival gateway server")]
struct Args {
    /// Bind address.
    #[arg(long, env = "COLDGATE_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on (0 = OS-assigned).
    #[arg(long, env = "COLDGATE_PORT", default_value_t = 8181)]
    port: u16,

    /// Root directory of main (fast) storage.
    #[arg(long, env = "COLDGATE_MAIN_DIR")]
    main_dir: PathBuf,

    /// Root directory of archive (slow) storage. Omit for single-level
    /// operation.
    #[arg(long, env = "COLDGATE_ARCHIVE_DIR")]
    archive_dir: Option<PathBuf>,

    /// Directory for gateway-private state (markers, prepared selections).
    #[arg(long, env = "COLDGATE_CACHE_DIR", default_value = "cache")]
    cache_dir: PathBuf,

    /// Granularity of deferred storage transitions.
    #[arg(long, env = "COLDGATE_STORAGE_UNIT", default_value = "dataset")]
    storage_unit: StorageUnit,

    /// Seconds to delay (and coalesce) writes to archive storage.
    #[arg(long, env = "COLDGATE_WRITE_DELAY_SECONDS", default_value_t = 60)]
    write_delay_seconds: u64,

    /// Seconds between queue drain passes.
    #[arg(long, env = "COLDGATE_PROCESS_QUEUE_INTERVAL_SECONDS", default_value_t = 5)]
    process_queue_interval_seconds: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,coldgate_server=debug".into()),
        )
        .init();

    let args = Args::parse();

    let config = GatewayConfig {
        storage_unit: args.storage_unit,
        cache_dir: args.cache_dir.clone(),
        write_delay: Duration::from_secs(args.write_delay_seconds),
        process_queue_interval: Duration::from_secs(args.process_queue_interval_seconds),
    };
    let network_config = NetworkConfig {
        host: args.host.clone(),
        port: args.port,
        ..NetworkConfig::default()
    };

    let main = Arc::new(FsMainStorage::new(args.main_dir.clone())?);
    let archive: Option<Arc<dyn ArchiveStorage>> = match &args.archive_dir {
        Some(dir) => Some(Arc::new(FsArchiveStorage::new(dir.clone())?)),
        None => None,
    };
    let catalog = Arc::new(MemoryCatalog::new());

    let gateway = Arc::new(Gateway::new(config, catalog, main, archive)?);
    let shutdown = Arc::new(ShutdownController::new());

    // Recover unfinished writes, then start draining the queue.
    let drain = gateway.start(shutdown.shutdown_receiver()).await?;

    let state = AppState {
        gateway: gateway.clone(),
        shutdown: shutdown.clone(),
    };
    let app = network::router(state, &network_config);

    let listener =
        tokio::net::TcpListener::bind((network_config.host.as_str(), network_config.port)).await?;
    tracing::info!(addr = %listener.local_addr()?, unit = %args.storage_unit, "coldgate listening");
    shutdown.set_ready();

    let mut signal_rx = shutdown.shutdown_receiver();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = signal_rx.changed().await;
    });

    let signals = {
        let shutdown = shutdown.clone();
        let gateway = gateway.clone();
        tokio::spawn(async move {
            let ctrl_c = tokio::signal::ctrl_c();
            #[cfg(unix)]
            {
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(mut term) => {
                        tokio::select! {
                            _ = ctrl_c => {}
                            _ = term.recv() => {}
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to install SIGTERM handler");
                        let _ = ctrl_c.await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                let _ = ctrl_c.await;
            }
            tracing::info!("shutdown requested");
            gateway.stop_restores();
            shutdown.trigger_shutdown();
        })
    };

    server.await?;
    if let Some(drain) = drain {
        let _ = drain.await;
    }
    signals.abort();
    tracing::info!("coldgate stopped");
    Ok(())
}
