//! Claude Code Usage Collector
//!
//! Receives Claude Code's OpenTelemetry log exports, keeps every API
//! request in a bounded local store and answers usage queries over HTTP.

pub mod commands;
pub mod usage;

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use usage::telemetry::{CollectorError, CollectorState, SqliteRepository, StorageError, TelemetryCollector};
use usage::{start_retention_sweeper, LogObserver, MemoryStatsCache, ServerConfig};

#[derive(Debug, Error)]
pub enum StartError {
    #[error("failed to open usage store: {0}")]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Collector(#[from] CollectorError),
}

/// A started collector with its retention sweeper
pub struct RunningCollector {
    collector: TelemetryCollector,
    sweeper: Option<JoinHandle<()>>,
    shutdown: CancellationToken,
    addr: SocketAddr,
}

impl RunningCollector {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop the sweeper and the server, waiting for in-flight calls
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.collector.shutdown().await;
        if let Some(sweeper) = self.sweeper {
            let _ = sweeper.await;
        }
        log::info!("Collector stopped");
    }
}

/// Open the store, wire the queries and start serving
pub async fn start(config: &ServerConfig) -> Result<RunningCollector, StartError> {
    let repository = Arc::new(SqliteRepository::new(&config.data_dir, config.retention.max_records)?);
    log::info!(
        "Retention: max_age={:?} max_records={:?}",
        config.retention.max_age,
        config.retention.max_records
    );

    let state = CollectorState::new(
        repository.clone(),
        Arc::new(MemoryStatsCache::new(config.cache_ttl)),
        Arc::new(LogObserver),
        config.timezone,
        config.plan.clone(),
    );

    let mut collector = TelemetryCollector::new(config.listen_addr, config.auth_token.clone(), state);
    let addr = collector.start().await?;

    let shutdown = CancellationToken::new();
    let sweeper = start_retention_sweeper(repository, config.retention, shutdown.clone());

    Ok(RunningCollector {
        collector,
        sweeper,
        shutdown,
        addr,
    })
}
