//! Tandem sync server.
//!
//! Configured through the environment (`TANDEM_BIND_ADDR`,
//! `TANDEM_BROADCAST_CAPACITY`, `TANDEM_LOG_WINDOW`,
//! `TANDEM_SNAPSHOT_INTERVAL`, `TANDEM_STORAGE_PATH`) and logs through
//! `RUST_LOG`, `info` by default.

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use log::info;
use tandem_collab::server::{ServerConfig, SyncServer};

const STATS_INTERVAL: Duration = Duration::from_secs(60);

#[cfg(feature = "rocksdb")]
fn build_server(config: ServerConfig) -> Result<SyncServer, Box<dyn Error>> {
    Ok(SyncServer::open(config)?)
}

#[cfg(not(feature = "rocksdb"))]
fn build_server(config: ServerConfig) -> Result<SyncServer, Box<dyn Error>> {
    if let Some(path) = &config.storage_path {
        log::warn!(
            "TANDEM_STORAGE_PATH={} ignored: built without the rocksdb feature",
            path.display()
        );
    }
    Ok(SyncServer::new(config))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env()?;
    info!(
        "Starting tandem-server on {} (log window {}, snapshot every {} versions)",
        config.bind_addr, config.log_window, config.snapshot_interval
    );
    let server = Arc::new(build_server(config)?);

    let reporter = server.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STATS_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let stats = reporter.stats().await;
            info!(
                "{} active connections, {} documents, {} ops applied, {} rejected",
                stats.active_connections,
                reporter.rooms().room_count().await,
                stats.applied_ops,
                stats.rejected_ops
            );
        }
    });

    tokio::select! {
        result = server.run() => result.map_err(|e| e as Box<dyn Error>)?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}
