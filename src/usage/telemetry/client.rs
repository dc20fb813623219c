//! HTTP client for the collector's query routes

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::StreamExt;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::commands::{
    ApiRequestDto, BlockRequest, BlockResponse, ErrorResponse, PeriodRequest, RequestsRequest,
    RequestsResponse, StatsResponse, StreamRequest, SummaryRequest, SummaryResponse, REQUEST_TIMEOUT_HEADER,
};

use super::auth::AUTHORIZATION_HEADER;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{status} {code}: {message}")]
    Api {
        status: StatusCode,
        code: String,
        message: String,
    },
    #[error("invalid response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ClientError {
    pub fn is_unauthenticated(&self) -> bool {
        matches!(self, ClientError::Api { status, .. } if *status == StatusCode::UNAUTHORIZED)
    }
}

fn wire_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Query client. Attaches the shared token to every call when one is set.
#[derive(Debug, Clone)]
pub struct UsageClient {
    client: reqwest::Client,
    base_url: String,
    auth_token: String,
    timeout: Option<Duration>,
}

impl UsageClient {
    pub fn new(base_url: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_token: auth_token.into(),
            timeout: None,
        }
    }

    /// Deadline sent to the server with each call
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Add the `authorization` header unless auth is disabled
    pub fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        if self.auth_token.is_empty() {
            builder
        } else {
            builder.header(AUTHORIZATION_HEADER, &self.auth_token)
        }
    }

    fn post<B: Serialize>(&self, path: &str, body: &B) -> RequestBuilder {
        let mut builder = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(body);
        if let Some(timeout) = self.timeout {
            builder = builder.header(REQUEST_TIMEOUT_HEADER, timeout.as_millis().to_string());
        }
        self.authorize(builder)
    }

    async fn check(response: Response) -> Result<Response, ClientError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await?;
        let (code, message) = match serde_json::from_str::<ErrorResponse>(&text) {
            Ok(body) => (body.code, body.error),
            Err(_) => (status.as_str().to_string(), text),
        };
        Err(ClientError::Api { status, code, message })
    }

    async fn call<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, ClientError> {
        let response = Self::check(self.post(path, body).send().await?).await?;
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn stats(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<StatsResponse, ClientError> {
        let body = PeriodRequest {
            start_time: wire_time(start),
            end_time: wire_time(end),
        };
        self.call("/v1/query/stats", &body).await
    }

    pub async fn requests(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ApiRequestDto>, ClientError> {
        let body = RequestsRequest {
            start_time: wire_time(start),
            end_time: wire_time(end),
            limit,
            offset,
        };
        let page: RequestsResponse = self.call("/v1/query/requests", &body).await?;
        Ok(page.requests)
    }

    /// Stream every record in the range, calling `on_record` per record.
    /// Returns the number of records seen.
    pub async fn stream_requests<F>(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        mut on_record: F,
    ) -> Result<usize, ClientError>
    where
        F: FnMut(ApiRequestDto),
    {
        let body = StreamRequest {
            start_time: wire_time(start),
            end_time: wire_time(end),
            limit: 0,
            offset: 0,
        };
        let response = Self::check(self.post("/v1/query/requests/stream", &body).send().await?).await?;

        let mut chunks = response.bytes_stream();
        let mut pending: Vec<u8> = Vec::new();
        let mut seen = 0;

        while let Some(chunk) = chunks.next().await {
            pending.extend_from_slice(&chunk?);
            while let Some(newline) = pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = pending.drain(..=newline).collect();
                let line = &line[..line.len() - 1];
                if line.is_empty() {
                    continue;
                }
                on_record(serde_json::from_slice(line)?);
                seen += 1;
            }
        }

        if !pending.iter().all(u8::is_ascii_whitespace) {
            on_record(serde_json::from_slice(&pending)?);
            seen += 1;
        }

        Ok(seen)
    }

    pub async fn block(&self, request: &BlockRequest) -> Result<BlockResponse, ClientError> {
        self.call("/v1/query/block", request).await
    }

    pub async fn summary(&self, request: &SummaryRequest) -> Result<SummaryResponse, ClientError> {
        self.call("/v1/query/summary", request).await
    }
}
