//! REST adapters behind the fetcher and mutator interfaces.
//!
//! Queries are `GET {base}/api/v1/{entity}?{params}` and mutations are
//! `POST {base}/api/v1/{entity}/actions` with the payload as JSON body.
//! Transport statuses are mapped into [`FetchError`]; retry and timeout
//! policy stay with the engine.

use crate::config::ConsoleConfig;
use crate::error::ConsoleResult;
use async_trait::async_trait;
use pulse_core::FetchError;
use pulse_engine::{QueryFetcher, QueryMutator};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

const API_PREFIX: &str = "/api/v1";

/// Shared HTTP client.
#[derive(Debug, Clone)]
pub struct RestClient {
    client: reqwest::Client,
    base_url: String,
    headers: HeaderMap,
    timeout: Duration,
}

impl RestClient {
    pub fn new(config: &ConsoleConfig) -> ConsoleResult<Self> {
        let timeout = config.request_timeout();
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        let mut headers = HeaderMap::new();
        if let Some(api_key) = &config.api_key {
            headers.insert(HeaderName::from_static("x-api-key"), HeaderValue::from_str(api_key)?);
        }

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            headers,
            timeout,
        })
    }

    pub fn query_url(&self, entity: &str) -> String {
        format!("{}{}/{}", self.base_url, API_PREFIX, entity)
    }

    pub fn action_url(&self, entity: &str) -> String {
        format!("{}/actions", self.query_url(entity))
    }

    async fn get_json(&self, entity: &str, params: &Value) -> Result<Value, FetchError> {
        let response = self
            .client
            .get(self.query_url(entity))
            .headers(self.headers.clone())
            .query(&query_pairs(params))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        self.parse_response(response).await
    }

    async fn post_json(&self, entity: &str, payload: &Value) -> Result<Value, FetchError> {
        let response = self
            .client
            .post(self.action_url(entity))
            .headers(self.headers.clone())
            .json(payload)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        self.parse_response(response).await
    }

    async fn parse_response(&self, response: reqwest::Response) -> Result<Value, FetchError> {
        let status = response.status();
        let body = response.bytes().await.map_err(|e| self.transport_error(e))?;
        if !status.is_success() {
            return Err(status_error(status.as_u16(), &body));
        }
        parse_body(&body)
    }

    fn transport_error(&self, error: reqwest::Error) -> FetchError {
        if error.is_timeout() {
            FetchError::Timeout { after: self.timeout }
        } else {
            FetchError::network(error.to_string())
        }
    }
}

/// Flatten key params into query pairs. Nulls are omitted.
pub fn query_pairs(params: &Value) -> Vec<(String, String)> {
    let Value::Object(map) = params else {
        return Vec::new();
    };
    map.iter()
        .filter_map(|(name, value)| match value {
            Value::Null => None,
            Value::String(s) => Some((name.clone(), s.clone())),
            other => Some((name.clone(), other.to_string())),
        })
        .collect()
}

/// Classify a non-success response, preferring the body's `message` field.
pub fn status_error(status: u16, body: &[u8]) -> FetchError {
    let message = serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| String::from_utf8_lossy(body).trim().to_string());
    FetchError::from_status(status, message)
}

/// An empty success body reads as `null`.
pub fn parse_body(body: &[u8]) -> Result<Value, FetchError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(body).map_err(|e| FetchError::network(format!("invalid response body: {}", e)))
}

/// Query fetcher over [`RestClient`].
#[derive(Debug, Clone)]
pub struct RestFetcher {
    client: Arc<RestClient>,
}

impl RestFetcher {
    pub fn new(client: Arc<RestClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl QueryFetcher for RestFetcher {
    async fn fetch(&self, entity: &str, params: &Value) -> Result<Value, FetchError> {
        self.client.get_json(entity, params).await
    }
}

/// Mutation transport over [`RestClient`].
#[derive(Debug, Clone)]
pub struct RestMutator {
    client: Arc<RestClient>,
}

impl RestMutator {
    pub fn new(client: Arc<RestClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl QueryMutator for RestMutator {
    async fn mutate(&self, entity: &str, payload: &Value) -> Result<Value, FetchError> {
        self.client.post_json(entity, payload).await
    }
}
