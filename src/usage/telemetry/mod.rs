//! OpenTelemetry ingestion and the collector's network surface
//!
//! A local OTLP HTTP collector receives log exports from Claude Code,
//! turns API request events into usage records and stores them in a local
//! SQLite database. The same server answers authenticated usage queries.

pub mod adapter;
pub mod auth;
pub mod client;
pub mod collector;
pub mod models;
pub mod storage;

pub use adapter::{IngestReport, UsageEventIngestor};
pub use client::{ClientError, UsageClient};
pub use collector::{router, CollectorError, CollectorState, TelemetryCollector};
pub use storage::{ApiRequestRepository, SqliteRepository, StorageError};
