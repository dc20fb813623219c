//! Translate OTLP log events into usage records

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use crate::usage::append::{AppendApiRequestCommand, IngestObserver};
use crate::usage::models::{ApiRequest, Cost, Token};

use super::models::ParsedEvent;

/// Log body used by Claude Code for API request events
pub const API_REQUEST_EVENT: &str = "claude_code.api_request";

const DEFAULT_MODEL: &str = "unknown";

/// Outcome of ingesting one export batch
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestReport {
    pub accepted: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl IngestReport {
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

/// Whether a log event carries the API request shape
pub fn is_usage_event(event: &ParsedEvent) -> bool {
    event.body.as_deref() == Some(API_REQUEST_EVENT)
        || matches!(event.name.as_deref(), Some("api_request") | Some(API_REQUEST_EVENT))
}

fn parse_u64(attrs: &HashMap<String, String>, key: &str) -> u64 {
    let Some(raw) = attrs.get(key) else {
        return 0;
    };
    let raw = raw.trim();
    raw.parse::<u64>()
        .ok()
        // "12.0" from a double-typed attribute
        .or_else(|| {
            raw.parse::<f64>()
                .ok()
                .filter(|v| v.is_finite() && *v >= 0.0)
                .map(|v| v as u64)
        })
        .unwrap_or(0)
}

fn parse_f64(attrs: &HashMap<String, String>, key: &str) -> f64 {
    attrs
        .get(key)
        .and_then(|raw| raw.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v >= 0.0)
        .unwrap_or(0.0)
}

fn parse_i64(attrs: &HashMap<String, String>, key: &str) -> i64 {
    let Some(raw) = attrs.get(key) else {
        return 0;
    };
    let raw = raw.trim();
    raw.parse::<i64>()
        .ok()
        .or_else(|| raw.parse::<f64>().ok().filter(|v| v.is_finite()).map(|v| v as i64))
        .unwrap_or(0)
        .max(0)
}

fn event_timestamp(event: &ParsedEvent) -> DateTime<Utc> {
    event
        .attributes
        .get("event.timestamp")
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|ts| ts.with_timezone(&Utc))
        .or_else(|| {
            (event.timestamp_ns > 0).then(|| Utc.timestamp_nanos(event.timestamp_ns))
        })
        .unwrap_or_else(Utc::now)
}

/// Build a usage record from a recognised event.
///
/// Every numeric field is parsed independently; one that does not parse
/// counts as zero.
pub fn to_api_request(event: &ParsedEvent) -> ApiRequest {
    let attrs = &event.attributes;

    let tokens = Token::new(
        parse_u64(attrs, "input_tokens"),
        parse_u64(attrs, "output_tokens"),
        parse_u64(attrs, "cache_read_tokens"),
        parse_u64(attrs, "cache_creation_tokens"),
    );

    ApiRequest::new(
        attrs.get("session.id").cloned().unwrap_or_default(),
        event_timestamp(event),
        attrs
            .get("model")
            .filter(|m| !m.is_empty())
            .cloned()
            .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        tokens,
        Cost::new(parse_f64(attrs, "cost_usd")),
        parse_i64(attrs, "duration_ms"),
    )
}

/// Feeds recognised events through the append command
#[derive(Clone)]
pub struct UsageEventIngestor {
    append: AppendApiRequestCommand,
    observer: Arc<dyn IngestObserver>,
}

impl UsageEventIngestor {
    pub fn new(append: AppendApiRequestCommand, observer: Arc<dyn IngestObserver>) -> Self {
        Self { append, observer }
    }

    /// Append every usage event in the batch. A failed append is logged
    /// and counted; the remaining events are still processed.
    pub fn ingest(&self, events: &[ParsedEvent]) -> IngestReport {
        let mut report = IngestReport::default();

        for event in events {
            if !is_usage_event(event) {
                report.skipped += 1;
                continue;
            }

            let request = to_api_request(event);
            match self.append.execute(&request) {
                Ok(()) => {
                    report.accepted += 1;
                    self.observer.on_appended(&request);
                }
                Err(e) => {
                    report.failed += 1;
                    log::error!(
                        "Failed to store API request for session {}: {}",
                        request.session_id(),
                        e
                    );
                }
            }
        }

        log::debug!(
            "Ingested batch: {} accepted, {} skipped, {} failed",
            report.accepted,
            report.skipped,
            report.failed
        );
        report
    }
}
