//! Test doubles shared by unit tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::usage::cache::{MemoryStatsCache, StatsCache};
use crate::usage::models::{ApiRequest, Period, Stats};
use crate::usage::telemetry::storage::{storage_key, ApiRequestRepository, StorageError, UNLIMITED};

/// In-memory repository with injectable failures
#[derive(Default)]
pub struct MockRepository {
    requests: Mutex<Vec<ApiRequest>>,
    error: Mutex<Option<String>>,
    find_calls: AtomicUsize,
}

impl MockRepository {
    pub fn with_data(requests: Vec<ApiRequest>) -> Self {
        let repo = Self::default();
        *repo.requests.lock().unwrap() = requests;
        repo
    }

    pub fn set_error(&self, message: &str) {
        *self.error.lock().unwrap() = Some(message.to_string());
    }

    pub fn find_calls(&self) -> usize {
        self.find_calls.load(Ordering::SeqCst)
    }

    pub fn stored(&self) -> Vec<ApiRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Records in `period` in storage-key order
    fn matching(&self, period: &Period) -> Vec<ApiRequest> {
        let mut matching: Vec<ApiRequest> = self
            .requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| period.contains(r.timestamp()))
            .cloned()
            .collect();
        matching.sort_by_key(storage_key);
        matching
    }

    fn check_error(&self) -> Result<(), StorageError> {
        match self.error.lock().unwrap().as_ref() {
            Some(message) => Err(StorageError::Io(std::io::Error::other(message.clone()))),
            None => Ok(()),
        }
    }
}

impl ApiRequestRepository for MockRepository {
    fn save(&self, request: &ApiRequest) -> Result<(), StorageError> {
        self.check_error()?;
        self.requests.lock().unwrap().push(request.clone());
        Ok(())
    }

    fn find_by_period_with_limit(
        &self,
        period: &Period,
        limit: usize,
        offset: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<ApiRequest>, StorageError> {
        self.find_calls.fetch_add(1, Ordering::SeqCst);
        self.check_error()?;
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }

        let take = if limit == UNLIMITED { usize::MAX } else { limit };
        Ok(self.matching(period).into_iter().skip(offset).take(take).collect())
    }

    fn find_by_period_after(
        &self,
        period: &Period,
        after_key: Option<&str>,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<ApiRequest>, StorageError> {
        self.find_calls.fetch_add(1, Ordering::SeqCst);
        self.check_error()?;
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }

        let take = if limit == UNLIMITED { usize::MAX } else { limit };
        Ok(self
            .matching(period)
            .into_iter()
            .filter(|r| after_key.map_or(true, |after| storage_key(r).as_str() > after))
            .take(take)
            .collect())
    }

    fn find_all(&self) -> Result<Vec<ApiRequest>, StorageError> {
        self.check_error()?;
        Ok(self.stored())
    }

    fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
        self.check_error()?;
        let mut requests = self.requests.lock().unwrap();
        let before = requests.len();
        requests.retain(|r| r.timestamp() >= cutoff);
        Ok(before - requests.len())
    }
}

/// Memory cache that counts hits and misses
#[derive(Default)]
pub struct CountingCache {
    inner: MemoryStatsCache,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl CountingCache {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn misses(&self) -> usize {
        self.misses.load(Ordering::SeqCst)
    }
}

impl StatsCache for CountingCache {
    fn get(&self, period: &Period) -> Option<Stats> {
        let found = self.inner.get(period);
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::SeqCst),
            None => self.misses.fetch_add(1, Ordering::SeqCst),
        };
        found
    }

    fn set(&self, period: Period, stats: Stats) {
        self.inner.set(period, stats);
    }
}
