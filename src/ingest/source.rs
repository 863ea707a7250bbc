//! Upstream fetch adapter.
//!
//! Classifies failures for the retry policy: network errors, timeouts,
//! 408, 429 and 5xx are transient; every other non-success status is
//! permanent.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub query: Vec<(String, String)>,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            query: Vec::new(),
        }
    }

    pub fn param(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }
}

#[async_trait]
pub trait SourceClient: Send + Sync {
    async fn fetch(&self, request: &FetchRequest, timeout: Duration) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone)]
pub struct HttpSourceClient {
    client: reqwest::Client,
}

impl HttpSourceClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("bluetrace/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

fn source_name(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| url.to_string())
}

fn classify_status(source: &str, status: StatusCode) -> Error {
    let message = format!("HTTP {status}");
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        Error::transient_upstream(source, message)
    } else {
        Error::permanent_upstream(source, message)
    }
}

fn classify_transport(source: &str, err: reqwest::Error) -> Error {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        Error::transient_upstream(source, err)
    } else {
        Error::permanent_upstream(source, err)
    }
}

#[async_trait]
impl SourceClient for HttpSourceClient {
    async fn fetch(&self, request: &FetchRequest, timeout: Duration) -> Result<Vec<u8>> {
        let source = source_name(&request.url);
        tracing::debug!("Fetching {} ({} params)", request.url, request.query.len());

        let response = self
            .client
            .get(&request.url)
            .query(&request.query)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify_transport(&source, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(&source, status));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| classify_transport(&source, e))?;
        Ok(body.to_vec())
    }
}
