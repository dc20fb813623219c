//! Write path for usage records

use std::sync::Arc;

use crate::usage::models::ApiRequest;
use crate::usage::telemetry::storage::{ApiRequestRepository, StorageError};

/// Single write path shared by every producer of usage records
#[derive(Clone)]
pub struct AppendApiRequestCommand {
    repository: Arc<dyn ApiRequestRepository>,
}

impl AppendApiRequestCommand {
    pub fn new(repository: Arc<dyn ApiRequestRepository>) -> Self {
        Self { repository }
    }

    pub fn execute(&self, request: &ApiRequest) -> Result<(), StorageError> {
        self.repository.save(request)
    }
}

/// Notified after each record is stored
pub trait IngestObserver: Send + Sync {
    fn on_appended(&self, request: &ApiRequest);
}

/// Writes one `info` line per stored record
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl IngestObserver for LogObserver {
    fn on_appended(&self, request: &ApiRequest) {
        log::info!(
            "Recorded API request: session={} model={} tokens={} cost=${:.6} duration={}ms",
            request.session_id(),
            request.model(),
            request.tokens().total(),
            request.cost().amount(),
            request.duration_ms(),
        );
    }
}
