//! Query endpoints for the usage collector
//!
//! Every handler runs its storage work on the blocking pool under a
//! `CancellationToken`. The token fires when the caller's
//! `x-request-timeout-ms` deadline passes or when the handler future is
//! dropped because the caller went away.

use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use futures_util::stream;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::usage::block::Block;
use crate::usage::config::parse_timezone;
use crate::usage::models::{ApiRequest, Period, Stats, Token};
use crate::usage::pricing::Plan;
use crate::usage::period::PeriodFactory;
use crate::usage::stats::{BlockProgress, GetFilteredApiRequestsQuery, UsageSummary};
use crate::usage::telemetry::collector::CollectorState;
use crate::usage::telemetry::storage::{storage_key, StorageError};

/// Optional per-call deadline in milliseconds
pub const REQUEST_TIMEOUT_HEADER: &str = "x-request-timeout-ms";

/// Records fetched per storage round trip when streaming
pub const STREAM_PAGE_SIZE: usize = 500;

const DEFAULT_PAGE_LIMIT: usize = 100;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidArgument(String),
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidArgument(_) => "INVALID_ARGUMENT",
            ApiError::DeadlineExceeded => "DEADLINE_EXCEEDED",
            ApiError::Internal(_) => "INTERNAL",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            ApiError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Cancelled => ApiError::DeadlineExceeded,
            other => ApiError::Internal(other.to_string()),
        }
    }
}

/// Error body shared by every failing call
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(msg) = &self {
            log::error!("Query failed: {}", msg);
        }
        let body = ErrorResponse {
            code: self.code().to_string(),
            error: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodRequest {
    pub start_time: String,
    pub end_time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestsRequest {
    pub start_time: String,
    pub end_time: String,
    #[serde(default = "default_page_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_page_limit() -> usize {
    DEFAULT_PAGE_LIMIT
}

/// Stream arguments. `limit` 0 (the default) streams the whole range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRequest {
    pub start_time: String,
    pub end_time: String,
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockRequest {
    pub anchor_hour: u32,
    pub timezone: Option<String>,
    pub token_limit: Option<u64>,
    pub plan: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SummaryRequest {
    pub timezone: Option<String>,
    pub plan: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenDto {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_creation: u64,
    pub total: u64,
}

impl From<Token> for TokenDto {
    fn from(t: Token) -> Self {
        Self {
            input: t.input(),
            output: t.output(),
            cache_read: t.cache_read(),
            cache_creation: t.cache_creation(),
            total: t.total(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsResponse {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub base_requests: u64,
    pub premium_requests: u64,
    pub total_requests: u64,
    pub base_tokens: TokenDto,
    pub premium_tokens: TokenDto,
    pub total_tokens: TokenDto,
    pub base_cost: f64,
    pub premium_cost: f64,
    pub total_cost: f64,
}

impl From<&Stats> for StatsResponse {
    fn from(stats: &Stats) -> Self {
        Self {
            start_time: stats.period().start_at(),
            end_time: stats.period().end_at(),
            base_requests: stats.base_requests(),
            premium_requests: stats.premium_requests(),
            total_requests: stats.total_requests(),
            base_tokens: stats.base_tokens().into(),
            premium_tokens: stats.premium_tokens().into(),
            total_tokens: stats.total_tokens().into(),
            base_cost: stats.base_cost().amount(),
            premium_cost: stats.premium_cost().amount(),
            total_cost: stats.total_cost().amount(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiRequestDto {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cost_usd: f64,
    pub duration_ms: i64,
}

impl From<&ApiRequest> for ApiRequestDto {
    fn from(r: &ApiRequest) -> Self {
        let tokens = r.tokens();
        Self {
            session_id: r.session_id().to_string(),
            timestamp: r.timestamp(),
            model: r.model().name().to_string(),
            input_tokens: tokens.input(),
            output_tokens: tokens.output(),
            cache_read_tokens: tokens.cache_read(),
            cache_creation_tokens: tokens.cache_creation(),
            cost_usd: r.cost().amount(),
            duration_ms: r.duration_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestsResponse {
    pub requests: Vec<ApiRequestDto>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockResponse {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// e.g. "10am - 3pm" in the requested timezone
    pub label: String,
    pub token_limit: Option<u64>,
    pub used_tokens: u64,
    pub percentage: f64,
    pub clamped_percentage: f64,
    pub remaining_seconds: i64,
    pub stats: StatsResponse,
}

impl BlockResponse {
    fn new(progress: &BlockProgress, tz: &Tz) -> Self {
        Self {
            start_time: progress.block.start_at(),
            end_time: progress.block.end_at(),
            label: progress.block.format_block_time(tz),
            token_limit: progress.block.token_limit(),
            used_tokens: progress.used_tokens(),
            percentage: progress.percentage,
            clamped_percentage: progress.clamped_percentage(),
            remaining_seconds: progress.remaining.num_seconds(),
            stats: (&progress.stats).into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryResponse {
    pub plan: String,
    pub plan_price: f64,
    pub daily: StatsResponse,
    pub monthly: StatsResponse,
    pub daily_plan_usage: u64,
    pub monthly_plan_usage: u64,
}

impl From<&UsageSummary> for SummaryResponse {
    fn from(summary: &UsageSummary) -> Self {
        Self {
            plan: summary.plan.name().to_string(),
            plan_price: summary.plan.price().amount(),
            daily: (&summary.daily).into(),
            monthly: (&summary.monthly).into(),
            daily_plan_usage: summary.daily_plan_usage,
            monthly_plan_usage: summary.monthly_plan_usage,
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Decode a JSON body; an empty body reads as `{}`
fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    let body: &[u8] = if body.iter().all(u8::is_ascii_whitespace) {
        b"{}"
    } else {
        body
    };
    serde_json::from_slice(body).map_err(|e| ApiError::InvalidArgument(format!("invalid request body: {}", e)))
}

fn parse_time(field: &str, value: &str) -> Result<DateTime<Utc>, ApiError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ApiError::InvalidArgument(format!("{} is not an RFC 3339 timestamp: {}", field, e)))
}

fn parse_period(start_time: &str, end_time: &str) -> Result<Period, ApiError> {
    let start = parse_time("start_time", start_time)?;
    let end = parse_time("end_time", end_time)?;
    Period::new(start, end).map_err(|e| ApiError::InvalidArgument(e.to_string()))
}

fn request_timeout(headers: &HeaderMap) -> Result<Option<Duration>, ApiError> {
    let Some(value) = headers.get(REQUEST_TIMEOUT_HEADER) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|ms| Some(Duration::from_millis(ms)))
        .ok_or_else(|| {
            ApiError::InvalidArgument(format!("{} must be a number of milliseconds", REQUEST_TIMEOUT_HEADER))
        })
}

fn resolve_timezone(requested: Option<&str>, fallback: Tz) -> Result<Tz, ApiError> {
    match requested {
        Some(name) => parse_timezone(name).map_err(|e| ApiError::InvalidArgument(e.to_string())),
        None => Ok(fallback),
    }
}

fn resolve_plan(requested: Option<&str>, fallback: &Plan) -> Plan {
    requested.map(Plan::from_name).unwrap_or_else(|| fallback.clone())
}

/// Run a storage-bound closure on the blocking pool under the caller's
/// deadline. Dropping the returned future cancels the work.
async fn run_query<T, F>(headers: &HeaderMap, work: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&CancellationToken) -> Result<T, StorageError> + Send + 'static,
{
    let timeout = request_timeout(headers)?;
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let worker_cancel = cancel.clone();
    let task = tokio::task::spawn_blocking(move || work(&worker_cancel));

    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, task).await {
            Ok(joined) => joined,
            Err(_) => {
                cancel.cancel();
                return Err(ApiError::DeadlineExceeded);
            }
        },
        None => task.await,
    };

    joined
        .map_err(|e| ApiError::Internal(format!("query task failed: {}", e)))?
        .map_err(ApiError::from)
}

// ============================================================================
// Handlers
// ============================================================================

/// Query routes, mounted behind the auth middleware
pub fn routes() -> Router<CollectorState> {
    Router::new()
        .route("/v1/query/stats", post(get_stats))
        .route("/v1/query/requests", post(get_requests))
        .route("/v1/query/requests/stream", post(stream_requests))
        .route("/v1/query/block", post(get_block_progress))
        .route("/v1/query/summary", post(get_usage_summary))
}

/// Aggregated stats for `[start_time, end_time)`
pub async fn get_stats(
    State(state): State<CollectorState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<StatsResponse>, ApiError> {
    let req: PeriodRequest = parse_body(&body)?;
    let period = parse_period(&req.start_time, &req.end_time)?;

    let query = state.stats.clone();
    let stats = run_query(&headers, move |cancel| query.execute(&period, cancel)).await?;
    Ok(Json((&stats).into()))
}

/// One page of usage records, oldest first
pub async fn get_requests(
    State(state): State<CollectorState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<RequestsResponse>, ApiError> {
    let req: RequestsRequest = parse_body(&body)?;
    let period = parse_period(&req.start_time, &req.end_time)?;

    let query = state.requests.clone();
    let (limit, offset) = (req.limit, req.offset);
    let requests = run_query(&headers, move |cancel| {
        query.execute(&period, limit, offset, cancel)
    })
    .await?;

    Ok(Json(RequestsResponse {
        requests: requests.iter().map(ApiRequestDto::from).collect(),
    }))
}

struct StreamCursor {
    query: GetFilteredApiRequestsQuery,
    period: Period,
    /// Records to skip before the first page
    skip: usize,
    /// Storage key of the last record sent
    after_key: Option<String>,
    /// Records still owed to the caller; `None` streams everything
    remaining: Option<usize>,
    cancel: CancellationToken,
    done: bool,
    _guard: DropGuard,
}

impl StreamCursor {
    /// Fetch the next page and render it as NDJSON
    async fn next_chunk(mut self) -> Option<(Result<Bytes, std::io::Error>, Self)> {
        if self.done || self.remaining == Some(0) {
            return None;
        }

        let page = self.remaining.map_or(STREAM_PAGE_SIZE, |r| r.min(STREAM_PAGE_SIZE));
        let query = self.query.clone();
        let period = self.period;
        let skip = self.skip;
        let after_key = self.after_key.clone();
        let cancel = self.cancel.clone();

        // Later pages resume after the last key sent, so rows evicted
        // between pages cannot shift unsent rows out of reach
        let fetched = tokio::task::spawn_blocking(move || match after_key {
            Some(key) => query.execute_after(&period, Some(key.as_str()), page, &cancel),
            None if skip > 0 => query.execute(&period, page, skip, &cancel),
            None => query.execute_after(&period, None, page, &cancel),
        })
        .await;

        let records = match fetched {
            Ok(Ok(records)) => records,
            Ok(Err(e)) => {
                log::warn!("Request stream aborted after {:?}: {}", self.after_key, e);
                self.done = true;
                return Some((Err(std::io::Error::other(e.to_string())), self));
            }
            Err(e) => {
                self.done = true;
                return Some((Err(std::io::Error::other(e.to_string())), self));
            }
        };

        if records.len() < page {
            self.done = true;
        }
        if records.is_empty() {
            return None;
        }

        self.after_key = records.last().map(storage_key);
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(records.len());
        }

        let mut chunk = Vec::new();
        for record in &records {
            if let Err(e) = serde_json::to_writer(&mut chunk, &ApiRequestDto::from(record)) {
                self.done = true;
                return Some((Err(std::io::Error::other(e)), self));
            }
            chunk.push(b'\n');
        }

        Some((Ok(Bytes::from(chunk)), self))
    }
}

/// Usage records as newline-delimited JSON, paged from storage
pub async fn stream_requests(
    State(state): State<CollectorState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let req: StreamRequest = parse_body(&body)?;
    let period = parse_period(&req.start_time, &req.end_time)?;
    let timeout = request_timeout(&headers)?;

    let cancel = CancellationToken::new();
    if let Some(limit) = timeout {
        let deadline = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = deadline.cancelled() => {}
                _ = tokio::time::sleep(limit) => deadline.cancel(),
            }
        });
    }

    let cursor = StreamCursor {
        query: state.requests.clone(),
        period,
        skip: req.offset,
        after_key: None,
        remaining: (req.limit > 0).then_some(req.limit),
        _guard: cancel.clone().drop_guard(),
        cancel,
        done: false,
    };

    let body = Body::from_stream(stream::unfold(cursor, StreamCursor::next_chunk));
    Ok(([(header::CONTENT_TYPE, "application/x-ndjson")], body).into_response())
}

/// Progress of the current usage-limit block
pub async fn get_block_progress(
    State(state): State<CollectorState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<BlockResponse>, ApiError> {
    let req: BlockRequest = parse_body(&body)?;
    let tz = resolve_timezone(req.timezone.as_deref(), state.timezone)?;
    let plan = resolve_plan(req.plan.as_deref(), &state.plan);
    let limit = req.token_limit.or_else(|| plan.block_token_limit());

    let now = Utc::now();
    let block = Block::from_anchor(req.anchor_hour, &tz, now, limit)
        .ok_or_else(|| ApiError::InvalidArgument(format!("anchor_hour {} is not an hour of the day", req.anchor_hour)))?;

    let query = state.block.clone();
    let progress = run_query(&headers, move |cancel| query.execute(&block, now, cancel)).await?;
    Ok(Json(BlockResponse::new(&progress, &tz)))
}

/// Today's and this month's usage against the plan
pub async fn get_usage_summary(
    State(state): State<CollectorState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<SummaryResponse>, ApiError> {
    let req: SummaryRequest = parse_body(&body)?;
    let tz = resolve_timezone(req.timezone.as_deref(), state.timezone)?;
    let plan = resolve_plan(req.plan.as_deref(), &state.plan);
    let periods = PeriodFactory::new(tz);

    let query = state.summary.clone();
    let summary = run_query(&headers, move |cancel| {
        query.execute(&periods, &plan, Utc::now(), cancel)
    })
    .await?;
    Ok(Json((&summary).into()))
}
