//! OTLP HTTP collector for receiving telemetry data

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{header, HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono_tz::Tz;
use log::{debug, error, info, warn};
use prost::Message;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};

use crate::commands;
use crate::usage::append::{AppendApiRequestCommand, IngestObserver};
use crate::usage::cache::StatsCache;
use crate::usage::pricing::Plan;
use crate::usage::stats::{
    CalculateStatsQuery, GetBlockProgressQuery, GetFilteredApiRequestsQuery, GetUsageSummaryQuery,
};

use super::adapter::UsageEventIngestor;
use super::auth;
use super::models::{proto, ExportLogsServiceRequest, ParsedEvent};
use super::storage::ApiRequestRepository;

/// OTLP exports can be large; axum's default is 2 MiB
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Upper bound on an inflated gzip body
const MAX_DECOMPRESSED_BYTES: u64 = 64 * 1024 * 1024;

const PROTOBUF_CONTENT_TYPE: &str = "application/x-protobuf";
const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("failed to bind {0}: {1}")]
    Bind(SocketAddr, std::io::Error),
    #[error("collector already running")]
    AlreadyRunning,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to decompress gzip body: {0}")]
    Gzip(#[from] std::io::Error),
    #[error("decompressed body exceeds {limit} bytes")]
    TooLarge { limit: u64 },
    #[error("invalid OTLP JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid OTLP protobuf: {0}")]
    Protobuf(#[from] prost::DecodeError),
}

/// Shared handler state: the write path and every query
#[derive(Clone)]
pub struct CollectorState {
    pub ingestor: UsageEventIngestor,
    pub stats: CalculateStatsQuery,
    pub requests: GetFilteredApiRequestsQuery,
    pub block: GetBlockProgressQuery,
    pub summary: GetUsageSummaryQuery,
    /// Default timezone for calendar and block queries
    pub timezone: Tz,
    /// Default plan for summary and block queries
    pub plan: Plan,
}

impl CollectorState {
    /// Wire commands and queries over one repository and cache
    pub fn new(
        repository: Arc<dyn ApiRequestRepository>,
        cache: Arc<dyn StatsCache>,
        observer: Arc<dyn IngestObserver>,
        timezone: Tz,
        plan: Plan,
    ) -> Self {
        let stats = CalculateStatsQuery::new(repository.clone(), cache);
        Self {
            ingestor: UsageEventIngestor::new(AppendApiRequestCommand::new(repository.clone()), observer),
            requests: GetFilteredApiRequestsQuery::new(repository),
            block: GetBlockProgressQuery::new(stats.clone()),
            summary: GetUsageSummaryQuery::new(stats.clone()),
            stats,
            timezone,
            plan,
        }
    }
}

/// Build the full application router.
///
/// Everything except `/health` sits behind the token check.
pub fn router(state: CollectorState, auth_token: &str) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let token: Arc<str> = Arc::from(auth_token);

    let guarded = Router::new()
        .route("/v1/logs", post(handle_logs))
        .route("/v1/metrics", post(handle_ack))
        .route("/v1/traces", post(handle_ack))
        .merge(commands::routes())
        .route_layer(middleware::from_fn_with_state(token, auth::require_token));

    Router::new()
        .route("/health", get(health_check))
        .merge(guarded)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors)
        .with_state(state)
}

/// OTLP HTTP collector
pub struct TelemetryCollector {
    addr: SocketAddr,
    auth_token: String,
    state: CollectorState,
    shutdown_tx: Option<oneshot::Sender<()>>,
    server: Option<JoinHandle<()>>,
}

impl TelemetryCollector {
    /// Create a new collector
    pub fn new(addr: SocketAddr, auth_token: impl Into<String>, state: CollectorState) -> Self {
        Self {
            addr,
            auth_token: auth_token.into(),
            state,
            shutdown_tx: None,
            server: None,
        }
    }

    /// Start the collector server, returning the bound address
    pub async fn start(&mut self) -> Result<SocketAddr, CollectorError> {
        if self.is_running() {
            return Err(CollectorError::AlreadyRunning);
        }

        let app = router(self.state.clone(), &self.auth_token);

        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .map_err(|e| CollectorError::Bind(self.addr, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| CollectorError::Bind(self.addr, e))?;

        if self.auth_token.is_empty() {
            warn!("No auth token configured, accepting unauthenticated calls");
        }
        info!("Starting telemetry collector on {}", local_addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        self.shutdown_tx = Some(shutdown_tx);

        self.server = Some(tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                    info!("Telemetry collector shutting down");
                })
                .await;
            if let Err(e) = result {
                error!("Telemetry collector stopped with error: {}", e);
            }
        }));

        Ok(local_addr)
    }

    /// Signal the server to stop accepting calls
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Stop and wait for in-flight calls to finish
    pub async fn shutdown(mut self) {
        self.stop();
        if let Some(server) = self.server.take() {
            let _ = server.await;
        }
    }

    /// Check if the collector is running
    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
    }
}

/// Wire encoding of an OTLP export call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Json,
    Protobuf,
}

impl Encoding {
    fn from_headers(headers: &HeaderMap) -> Self {
        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if content_type.contains("protobuf") {
            Encoding::Protobuf
        } else {
            Encoding::Json
        }
    }

    /// Empty `Export*ServiceResponse` in this encoding
    fn empty_response(self) -> Response {
        match self {
            Encoding::Json => (StatusCode::OK, [(header::CONTENT_TYPE, JSON_CONTENT_TYPE)], "{}").into_response(),
            Encoding::Protobuf => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, PROTOBUF_CONTENT_TYPE)],
                proto::ExportLogsServiceResponse {}.encode_to_vec(),
            )
                .into_response(),
        }
    }
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Decompress gzip data, refusing to inflate past `limit` bytes
fn decompress_gzip(data: &[u8], limit: u64) -> Result<Vec<u8>, DecodeError> {
    use flate2::read::GzDecoder;
    use std::io::Read;

    let mut decoder = GzDecoder::new(data).take(limit.saturating_add(1));
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed)?;
    if decompressed.len() as u64 > limit {
        return Err(DecodeError::TooLarge { limit });
    }
    Ok(decompressed)
}

fn is_gzip(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("gzip"))
}

/// Decode an OTLP logs export into flattened events
pub fn decode_logs(headers: &HeaderMap, body: &[u8]) -> Result<Vec<ParsedEvent>, DecodeError> {
    let inflated;
    let body = if is_gzip(headers) {
        inflated = decompress_gzip(body, MAX_DECOMPRESSED_BYTES)?;
        inflated.as_slice()
    } else {
        body
    };

    match Encoding::from_headers(headers) {
        Encoding::Protobuf => Ok(proto::ExportLogsServiceRequest::decode(body)?.into_events()),
        Encoding::Json => {
            let request: ExportLogsServiceRequest = serde_json::from_slice(body)?;
            Ok(request.into_events())
        }
    }
}

/// Handle incoming logs/events data
async fn handle_logs(State(state): State<CollectorState>, headers: HeaderMap, body: Bytes) -> Response {
    debug!("Received logs request, {} bytes", body.len());
    let encoding = Encoding::from_headers(&headers);

    let events = match decode_logs(&headers, &body) {
        Ok(events) => events,
        Err(e) => {
            warn!("Rejected logs export: {}", e);
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    if events.is_empty() {
        return encoding.empty_response();
    }

    let ingestor = state.ingestor.clone();
    let report = match tokio::task::spawn_blocking(move || ingestor.ingest(&events)).await {
        Ok(report) => report,
        Err(e) => {
            error!("Ingestion task failed: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Ingestion failed").into_response();
        }
    };

    if report.has_failures() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Storage error").into_response();
    }

    encoding.empty_response()
}

/// Metrics and traces are acknowledged without being stored
async fn handle_ack(headers: HeaderMap, body: Bytes) -> Response {
    debug!("Acknowledged export, {} bytes", body.len());
    Encoding::from_headers(&headers).empty_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::append::LogObserver;
    use crate::usage::cache::NoOpStatsCache;
    use crate::usage::models::{ApiRequest, Cost, Token};
    use crate::usage::testutil::MockRepository;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use chrono::{TimeZone, Utc};
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tower::ServiceExt;

    const TOKEN: &str = "s3cret";

    const LOGS_JSON: &str = r#"{
        "resourceLogs": [{
            "resource": {"attributes": [
                {"key": "session.id", "value": {"stringValue": "session-1"}}
            ]},
            "scopeLogs": [{"logRecords": [
                {
                    "timeUnixNano": "1736935200000000000",
                    "body": {"stringValue": "claude_code.api_request"},
                    "attributes": [
                        {"key": "model", "value": {"stringValue": "claude-3-5-haiku"}},
                        {"key": "input_tokens", "value": {"stringValue": "200"}},
                        {"key": "output_tokens", "value": {"stringValue": "160"}},
                        {"key": "cost_usd", "value": {"stringValue": "0.01"}}
                    ]
                },
                {
                    "timeUnixNano": "1736935260000000000",
                    "body": {"stringValue": "claude_code.user_prompt"}
                }
            ]}]
        }]
    }"#;

    fn state_with(repo: Arc<MockRepository>) -> CollectorState {
        CollectorState::new(repo, Arc::new(NoOpStatsCache), Arc::new(LogObserver), Tz::UTC, Plan::unset())
    }

    fn post_request(uri: &str, token: Option<&str>, content_type: &str, body: impl Into<Body>) -> Request<Body> {
        let mut builder = Request::post(uri).header(header::CONTENT_TYPE, content_type);
        if let Some(token) = token {
            builder = builder.header(auth::AUTHORIZATION_HEADER, token);
        }
        builder.body(body.into()).unwrap()
    }

    async fn body_string(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn seeded_repo() -> Arc<MockRepository> {
        let at = |minute| Utc.with_ymd_and_hms(2025, 1, 15, 10, minute, 0).unwrap();
        Arc::new(MockRepository::with_data(vec![
            ApiRequest::new("a", at(0), "claude-3-5-haiku", Token::new(200, 160, 0, 0), Cost::new(0.01), 10),
            ApiRequest::new("b", at(1), "claude-sonnet-4", Token::new(666, 500, 0, 0), Cost::new(0.02), 20),
        ]))
    }

    #[tokio::test]
    async fn test_health_is_unauthenticated() {
        let app = router(state_with(Arc::new(MockRepository::default())), TOKEN);
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_json_logs_ingested() {
        let repo = Arc::new(MockRepository::default());
        let app = router(state_with(repo.clone()), TOKEN);

        let response = app
            .oneshot(post_request("/v1/logs", Some(TOKEN), JSON_CONTENT_TYPE, LOGS_JSON))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "{}");

        let stored = repo.stored();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].session_id(), "session-1");
        assert!(stored[0].model().is_base());
        assert_eq!(stored[0].tokens(), Token::new(200, 160, 0, 0));
    }

    #[tokio::test]
    async fn test_gzip_logs_ingested() {
        let repo = Arc::new(MockRepository::default());
        let app = router(state_with(repo.clone()), "");

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(LOGS_JSON.as_bytes()).unwrap();
        let compressed = encoder.finish().unwrap();

        let mut request = post_request("/v1/logs", None, JSON_CONTENT_TYPE, compressed);
        request
            .headers_mut()
            .insert(header::CONTENT_ENCODING, "gzip".parse().unwrap());

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(repo.stored().len(), 1);
    }

    #[tokio::test]
    async fn test_protobuf_logs_ingested() {
        let repo = Arc::new(MockRepository::default());
        let app = router(state_with(repo.clone()), TOKEN);

        let text = |s: &str| proto::AnyValue {
            value: Some(proto::any_value::Value::StringValue(s.to_string())),
        };
        let export = proto::ExportLogsServiceRequest {
            resource_logs: vec![proto::ResourceLogs {
                resource: None,
                scope_logs: vec![proto::ScopeLogs {
                    log_records: vec![proto::LogRecord {
                        time_unix_nano: 1_736_935_200_000_000_000,
                        body: Some(text("claude_code.api_request")),
                        attributes: vec![
                            proto::KeyValue { key: "session.id".into(), value: Some(text("pb")) },
                            proto::KeyValue {
                                key: "output_tokens".into(),
                                value: Some(proto::AnyValue {
                                    value: Some(proto::any_value::Value::IntValue(42)),
                                }),
                            },
                        ],
                        ..Default::default()
                    }],
                    schema_url: String::new(),
                }],
                schema_url: String::new(),
            }],
        };

        let response = app
            .oneshot(post_request("/v1/logs", Some(TOKEN), PROTOBUF_CONTENT_TYPE, export.encode_to_vec()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            PROTOBUF_CONTENT_TYPE
        );
        let stored = repo.stored();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].session_id(), "pb");
        assert_eq!(stored[0].tokens().output(), 42);
    }

    #[tokio::test]
    async fn test_malformed_logs_rejected() {
        let repo = Arc::new(MockRepository::default());
        let app = router(state_with(repo.clone()), "");

        let response = app
            .oneshot(post_request("/v1/logs", None, JSON_CONTENT_TYPE, "{not json"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(repo.stored().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_attribute_keeps_sibling_records() {
        let repo = Arc::new(MockRepository::default());
        let app = router(state_with(repo.clone()), "");
        let body = r#"{"resourceLogs": [{"scopeLogs": [{"logRecords": [
            {
                "timeUnixNano": "1736935200000000000",
                "eventName": "claude_code.api_request",
                "attributes": [
                    {"key": "session.id", "value": {"stringValue": "good"}},
                    {"key": "input_tokens", "value": {"intValue": "300"}},
                    {"key": "cost_usd", "value": {"doubleValue": 0.25}}
                ]
            },
            {
                "timeUnixNano": "1736935260000000000",
                "eventName": "claude_code.api_request",
                "attributes": [
                    {"key": "session.id", "value": {"stringValue": "odd"}},
                    {"key": "cost_usd", "value": {"doubleValue": "NaN"}},
                    {"key": "duration_ms", "value": {"doubleValue": "0.5"}}
                ]
            }
        ]}]}]}"#;

        let response = app
            .oneshot(post_request("/v1/logs", None, JSON_CONTENT_TYPE, body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let stored = repo.stored();
        let good = stored.iter().find(|r| r.session_id() == "good").unwrap();
        assert_eq!(good.tokens().input(), 300);
        assert_eq!(good.cost().amount(), 0.25);

        let odd = stored.iter().find(|r| r.session_id() == "odd").unwrap();
        assert_eq!(odd.cost().amount(), 0.0);
    }

    #[tokio::test]
    async fn test_gzip_body_over_inflate_limit_rejected() {
        let repo = Arc::new(MockRepository::default());
        let app = router(state_with(repo.clone()), "");

        let chunk = vec![b' '; 1024 * 1024];
        let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
        for _ in 0..=(MAX_DECOMPRESSED_BYTES / chunk.len() as u64) {
            encoder.write_all(&chunk).unwrap();
        }
        let compressed = encoder.finish().unwrap();
        assert!(compressed.len() < MAX_BODY_BYTES);

        let mut request = post_request("/v1/logs", None, JSON_CONTENT_TYPE, compressed);
        request
            .headers_mut()
            .insert(header::CONTENT_ENCODING, "gzip".parse().unwrap());

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(response).await.contains("exceeds"));
        assert!(repo.stored().is_empty());
    }

    #[test]
    fn test_decompress_gzip_limit() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&[b'x'; 100]).unwrap();
        let compressed = encoder.finish().unwrap();

        assert_eq!(decompress_gzip(&compressed, 100).unwrap().len(), 100);
        assert!(matches!(
            decompress_gzip(&compressed, 99),
            Err(DecodeError::TooLarge { limit: 99 })
        ));
    }

    #[tokio::test]
    async fn test_storage_failure_surfaces_as_internal_error() {
        let repo = Arc::new(MockRepository::default());
        repo.set_error("disk full");
        let app = router(state_with(repo), "");

        let response = app
            .oneshot(post_request("/v1/logs", None, JSON_CONTENT_TYPE, LOGS_JSON))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_metrics_and_traces_acknowledged() {
        let repo = Arc::new(MockRepository::default());
        let app = router(state_with(repo.clone()), TOKEN);

        for uri in ["/v1/metrics", "/v1/traces"] {
            let response = app
                .clone()
                .oneshot(post_request(uri, Some(TOKEN), PROTOBUF_CONTENT_TYPE, vec![0x0a_u8, 0x00]))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{}", uri);
        }
        assert!(repo.stored().is_empty());
    }

    #[tokio::test]
    async fn test_ingestion_requires_token() {
        let repo = Arc::new(MockRepository::default());
        let app = router(state_with(repo.clone()), TOKEN);

        let response = app
            .clone()
            .oneshot(post_request("/v1/logs", None, JSON_CONTENT_TYPE, LOGS_JSON))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(post_request("/v1/logs", Some("wrong"), JSON_CONTENT_TYPE, LOGS_JSON))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(repo.stored().is_empty());
    }

    #[tokio::test]
    async fn test_unary_and_stream_queries_require_token() {
        let app = router(state_with(seeded_repo()), TOKEN);
        let body = r#"{"start_time": "2025-01-15T00:00:00Z", "end_time": "2025-01-16T00:00:00Z"}"#;

        for uri in ["/v1/query/stats", "/v1/query/requests/stream"] {
            let rejected = app
                .clone()
                .oneshot(post_request(uri, Some("Bearer s3cret"), JSON_CONTENT_TYPE, body))
                .await
                .unwrap();
            assert_eq!(rejected.status(), StatusCode::UNAUTHORIZED, "{}", uri);
            assert!(body_string(rejected).await.contains("UNAUTHENTICATED"));

            let accepted = app
                .clone()
                .oneshot(post_request(uri, Some(TOKEN), JSON_CONTENT_TYPE, body))
                .await
                .unwrap();
            assert_eq!(accepted.status(), StatusCode::OK, "{}", uri);
        }
    }

    #[tokio::test]
    async fn test_empty_token_accepts_any_header() {
        let app = router(state_with(seeded_repo()), "");
        let body = r#"{"start_time": "2025-01-15T00:00:00Z", "end_time": "2025-01-16T00:00:00Z"}"#;

        for token in [None, Some("whatever")] {
            let response = app
                .clone()
                .oneshot(post_request("/v1/query/stats", token, JSON_CONTENT_TYPE, body))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn test_stats_query_splits_tiers() {
        let app = router(state_with(seeded_repo()), "");
        let body = r#"{"start_time": "2025-01-15T00:00:00Z", "end_time": "2025-01-16T00:00:00Z"}"#;

        let response = app
            .oneshot(post_request("/v1/query/stats", None, JSON_CONTENT_TYPE, body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let stats: commands::StatsResponse = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(stats.base_requests, 1);
        assert_eq!(stats.premium_requests, 1);
        assert!((stats.total_cost - 0.03).abs() < 1e-9);
        assert_eq!(stats.premium_tokens.input, 666);
    }

    #[tokio::test]
    async fn test_stats_query_saturates_huge_counters() {
        let at = Utc.with_ymd_and_hms(2025, 1, 15, 10, 0, 0).unwrap();
        let repo = Arc::new(MockRepository::with_data(vec![
            ApiRequest::new("x", at, "claude-sonnet-4", Token::new(10, u64::MAX, 0, 0), Cost::new(0.01), 10),
            ApiRequest::new("y", at, "claude-sonnet-4", Token::new(5, 5, 0, 0), Cost::new(0.01), 10),
        ]));
        let app = router(state_with(repo), "");
        let body = r#"{"start_time": "2025-01-15T00:00:00Z", "end_time": "2025-01-16T00:00:00Z"}"#;

        let response = app
            .oneshot(post_request("/v1/query/stats", None, JSON_CONTENT_TYPE, body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let stats: commands::StatsResponse = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(stats.premium_tokens.input, 15);
        assert_eq!(stats.premium_tokens.output, u64::MAX);
        assert_eq!(stats.premium_tokens.total, u64::MAX);
    }

    #[tokio::test]
    async fn test_requests_page_and_stream() {
        let app = router(state_with(seeded_repo()), "");

        let page = app
            .clone()
            .oneshot(post_request(
                "/v1/query/requests",
                None,
                JSON_CONTENT_TYPE,
                r#"{"start_time": "2025-01-15T00:00:00Z", "end_time": "2025-01-16T00:00:00Z", "limit": 1, "offset": 1}"#,
            ))
            .await
            .unwrap();
        assert_eq!(page.status(), StatusCode::OK);
        let page: commands::RequestsResponse = serde_json::from_str(&body_string(page).await).unwrap();
        assert_eq!(page.requests.len(), 1);
        assert_eq!(page.requests[0].session_id, "b");

        let stream = app
            .oneshot(post_request(
                "/v1/query/requests/stream",
                None,
                JSON_CONTENT_TYPE,
                r#"{"start_time": "2025-01-15T00:00:00Z", "end_time": "2025-01-16T00:00:00Z", "limit": 0}"#,
            ))
            .await
            .unwrap();
        assert_eq!(
            stream.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/x-ndjson"
        );
        let text = body_string(stream).await;
        let sessions: Vec<String> = text
            .lines()
            .map(|line| serde_json::from_str::<commands::ApiRequestDto>(line).unwrap().session_id)
            .collect();
        assert_eq!(sessions, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_stream_without_limit_covers_whole_range() {
        let start = Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap();
        let requests: Vec<ApiRequest> = (0..1_234)
            .map(|i| {
                ApiRequest::new(
                    format!("s{i}"),
                    start + chrono::Duration::seconds(i),
                    "claude-sonnet-4",
                    Token::new(1, 1, 0, 0),
                    Cost::new(0.001),
                    1,
                )
            })
            .collect();
        let repo = Arc::new(MockRepository::with_data(requests));
        let app = router(state_with(repo), "");

        let stream = app
            .oneshot(post_request(
                "/v1/query/requests/stream",
                None,
                JSON_CONTENT_TYPE,
                r#"{"start_time": "2025-01-15T00:00:00Z", "end_time": "2025-01-16T00:00:00Z"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(stream.status(), StatusCode::OK);

        let text = body_string(stream).await;
        let timestamps: Vec<_> = text
            .lines()
            .map(|line| serde_json::from_str::<commands::ApiRequestDto>(line).unwrap().timestamp)
            .collect();
        assert_eq!(timestamps.len(), 1_234);
        assert!(timestamps.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_invalid_query_arguments() {
        let app = router(state_with(seeded_repo()), "");

        let reversed = app
            .clone()
            .oneshot(post_request(
                "/v1/query/stats",
                None,
                JSON_CONTENT_TYPE,
                r#"{"start_time": "2025-01-16T00:00:00Z", "end_time": "2025-01-15T00:00:00Z"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(reversed.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(reversed).await.contains("INVALID_ARGUMENT"));

        let bad_zone = app
            .clone()
            .oneshot(post_request("/v1/query/summary", None, JSON_CONTENT_TYPE, r#"{"timezone": "Nowhere/Land"}"#))
            .await
            .unwrap();
        assert_eq!(bad_zone.status(), StatusCode::BAD_REQUEST);

        let bad_hour = app
            .oneshot(post_request("/v1/query/block", None, JSON_CONTENT_TYPE, r#"{"anchor_hour": 24}"#))
            .await
            .unwrap();
        assert_eq!(bad_hour.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_block_and_summary_queries() {
        let app = router(state_with(seeded_repo()), "");

        let block = app
            .clone()
            .oneshot(post_request(
                "/v1/query/block",
                None,
                JSON_CONTENT_TYPE,
                r#"{"anchor_hour": 6, "timezone": "Asia/Tokyo", "plan": "pro"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(block.status(), StatusCode::OK);
        let block: commands::BlockResponse = serde_json::from_str(&body_string(block).await).unwrap();
        assert_eq!(block.token_limit, Some(7_000));
        assert_eq!(block.end_time - block.start_time, chrono::Duration::hours(5));

        let summary = app
            .oneshot(post_request("/v1/query/summary", None, JSON_CONTENT_TYPE, r#"{"plan": "max"}"#))
            .await
            .unwrap();
        assert_eq!(summary.status(), StatusCode::OK);
        let summary: commands::SummaryResponse = serde_json::from_str(&body_string(summary).await).unwrap();
        assert_eq!(summary.plan, "max");
        assert_eq!(summary.plan_price, 100.0);
    }

    #[tokio::test]
    async fn test_start_serves_and_stops() {
        let state = state_with(Arc::new(MockRepository::default()));
        let mut collector = TelemetryCollector::new(SocketAddr::from(([127, 0, 0, 1], 0)), "", state);

        let addr = collector.start().await.unwrap();
        assert!(collector.is_running());
        assert_ne!(addr.port(), 0);
        assert!(matches!(collector.start().await, Err(CollectorError::AlreadyRunning)));

        let stream = tokio::net::TcpStream::connect(addr).await;
        assert!(stream.is_ok());
        drop(stream);

        collector.shutdown().await;
    }
}
