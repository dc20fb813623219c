//! SQLite storage for usage records
//!
//! Records live in a single key/value table. Keys are a fixed-width UTC
//! timestamp followed by the session id, so key order is chronological
//! order. One mutex-guarded connection performs all writes; reads come
//! from a small WAL connection pool and see a consistent snapshot.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, Transaction};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::usage::models::{ApiRequest, Period};

/// Default hard cap on stored records
pub const DEFAULT_MAX_RECORDS: usize = 10_000;

/// Pass as `limit` to disable pagination
pub const UNLIMITED: usize = 0;

const DB_FILE_NAME: &str = "usage.db";
const BUSY_TIMEOUT: Duration = Duration::from_millis(2000);
const READER_POOL_SIZE: u32 = 4;
const DELETE_BATCH_SIZE: usize = 500;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Lock error")]
    Lock,
    #[error("Scan cancelled")]
    Cancelled,
}

/// Storage port used by commands and queries
pub trait ApiRequestRepository: Send + Sync {
    /// Durably store one record. A record with the same timestamp and
    /// session id replaces the previous one.
    fn save(&self, request: &ApiRequest) -> Result<(), StorageError>;

    /// Records in `period`, oldest first. `limit == UNLIMITED` returns all
    /// of them; `cancel` aborts the scan between rows.
    fn find_by_period_with_limit(
        &self,
        period: &Period,
        limit: usize,
        offset: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<ApiRequest>, StorageError>;

    /// Records in `period` whose storage key sorts after `after_key`,
    /// oldest first. Pages chained this way stay gapless while older
    /// records are evicted between calls.
    fn find_by_period_after(
        &self,
        period: &Period,
        after_key: Option<&str>,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<ApiRequest>, StorageError>;

    fn find_all(&self) -> Result<Vec<ApiRequest>, StorageError>;

    /// Remove records strictly older than `cutoff`, returning how many
    fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError>;

    /// Trim the oldest records beyond the configured cap
    fn evict_overflow(&self) -> Result<usize, StorageError> {
        Ok(0)
    }
}

/// Sortable key prefix for an instant
fn timestamp_key(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.9fZ").to_string()
}

/// Storage key for a record: timestamp then session id
pub fn storage_key(request: &ApiRequest) -> String {
    format!("{}_{}", timestamp_key(request.timestamp()), request.session_id())
}

/// SQLite-backed repository with a bounded record count
#[derive(Clone)]
pub struct SqliteRepository {
    writer: Arc<Mutex<Connection>>,
    readers: Pool<SqliteConnectionManager>,
    max_records: Option<usize>,
    path: PathBuf,
}

impl SqliteRepository {
    /// Open (or create) the store under `data_dir`
    pub fn new(data_dir: &Path, max_records: Option<usize>) -> Result<Self, StorageError> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join(DB_FILE_NAME);

        let writer = Connection::open(&path)?;
        writer.busy_timeout(BUSY_TIMEOUT)?;
        // FULL keeps every commit durable before save returns
        writer.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")?;
        init_schema(&writer)?;

        let manager = SqliteConnectionManager::file(&path).with_init(|conn| {
            conn.busy_timeout(BUSY_TIMEOUT)?;
            conn.execute_batch("PRAGMA query_only = ON;")
        });
        let readers = Pool::builder().max_size(READER_POOL_SIZE).build(manager)?;

        log::info!("Opened usage store at {}", path.display());

        Ok(Self {
            writer: Arc::new(Mutex::new(writer)),
            readers,
            max_records: max_records.filter(|max| *max > 0),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn max_records(&self) -> Option<usize> {
        self.max_records
    }

    /// Number of stored records
    pub fn count(&self) -> Result<usize, StorageError> {
        let conn = self.readers.get()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM api_requests", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn lock_writer(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.writer.lock().map_err(|_| StorageError::Lock)
    }
}

fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS api_requests (
            key TEXT PRIMARY KEY NOT NULL,
            value BLOB NOT NULL
        ) WITHOUT ROWID;
    "#,
    )?;
    Ok(())
}

/// Delete the oldest rows beyond `max_records` inside `tx`
fn evict_overflow_in(tx: &Transaction<'_>, max_records: usize) -> Result<usize, StorageError> {
    let count: i64 = tx.query_row("SELECT COUNT(*) FROM api_requests", [], |row| row.get(0))?;
    let excess = (count as usize).saturating_sub(max_records);
    if excess == 0 {
        return Ok(0);
    }

    let deleted = tx.execute(
        "DELETE FROM api_requests WHERE key IN (
             SELECT key FROM api_requests ORDER BY key ASC LIMIT ?1
         )",
        params![excess as i64],
    )?;
    Ok(deleted)
}

/// Decode `value` columns, checking `cancel` between rows
fn collect_rows(mut rows: rusqlite::Rows<'_>, cancel: &CancellationToken) -> Result<Vec<ApiRequest>, StorageError> {
    let mut requests = Vec::new();
    while let Some(row) = rows.next()? {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        let value: Vec<u8> = row.get(0)?;
        requests.push(serde_json::from_slice(&value)?);
    }
    Ok(requests)
}

impl ApiRequestRepository for SqliteRepository {
    fn save(&self, request: &ApiRequest) -> Result<(), StorageError> {
        let key = storage_key(request);
        let value = serde_json::to_vec(request)?;

        let mut conn = self.lock_writer()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO api_requests (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        let evicted = match self.max_records {
            Some(max) => evict_overflow_in(&tx, max)?,
            None => 0,
        };
        tx.commit()?;

        if evicted > 0 {
            log::debug!("Evicted {} oldest records over the cap", evicted);
        }
        Ok(())
    }

    fn find_by_period_with_limit(
        &self,
        period: &Period,
        limit: usize,
        offset: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<ApiRequest>, StorageError> {
        let conn = self.readers.get()?;
        let start = timestamp_key(period.start_at());
        let end = timestamp_key(period.end_at());
        // SQLite treats a negative LIMIT as no limit
        let limit = if limit == UNLIMITED { -1 } else { limit as i64 };

        let mut stmt = conn.prepare(
            "SELECT value FROM api_requests
             WHERE key >= ?1 AND key < ?2
             ORDER BY key ASC
             LIMIT ?3 OFFSET ?4",
        )?;
        let rows = stmt.query(params![start, end, limit, offset as i64])?;
        collect_rows(rows, cancel)
    }

    fn find_by_period_after(
        &self,
        period: &Period,
        after_key: Option<&str>,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<ApiRequest>, StorageError> {
        let conn = self.readers.get()?;
        let start = timestamp_key(period.start_at());
        let end = timestamp_key(period.end_at());
        let limit = if limit == UNLIMITED { -1 } else { limit as i64 };

        let mut stmt = conn.prepare(
            "SELECT value FROM api_requests
             WHERE key >= ?1 AND key < ?2 AND (?3 IS NULL OR key > ?3)
             ORDER BY key ASC
             LIMIT ?4",
        )?;
        let rows = stmt.query(params![start, end, after_key, limit])?;
        collect_rows(rows, cancel)
    }

    fn find_all(&self) -> Result<Vec<ApiRequest>, StorageError> {
        let conn = self.readers.get()?;
        let mut stmt = conn.prepare("SELECT value FROM api_requests ORDER BY key ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;

        let mut requests = Vec::new();
        for row in rows {
            requests.push(serde_json::from_slice(&row?)?);
        }

        Ok(requests)
    }

    fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
        let cutoff_key = timestamp_key(cutoff);
        let mut total = 0;

        // Small batches release the writer between transactions
        loop {
            let deleted = {
                let conn = self.lock_writer()?;
                conn.execute(
                    "DELETE FROM api_requests WHERE key IN (
                         SELECT key FROM api_requests WHERE key < ?1 ORDER BY key ASC LIMIT ?2
                     )",
                    params![cutoff_key, DELETE_BATCH_SIZE as i64],
                )?
            };
            total += deleted;
            if deleted < DELETE_BATCH_SIZE {
                break;
            }
        }

        Ok(total)
    }

    fn evict_overflow(&self) -> Result<usize, StorageError> {
        let Some(max) = self.max_records else {
            return Ok(0);
        };

        let mut conn = self.lock_writer()?;
        let tx = conn.transaction()?;
        let evicted = evict_overflow_in(&tx, max)?;
        tx.commit()?;
        Ok(evicted)
    }
}
