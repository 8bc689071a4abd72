//! Outbound requests issued through `pm.sendRequest`.
//!
//! The sandbox never talks to the network itself. Requests are handed to a
//! [`RequestSender`](crate::RequestSender); [`HttpRequestSender`] is the
//! reqwest-backed implementation used by the CLI.

use std::time::{Duration, Instant};

use postcheck_error::RequestError;
use serde::{Deserialize, Serialize};

use crate::response::{reason_phrase, Headers};

/// A request as described by the script, after normalization in the JS
/// surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundRequest {
    /// Absolute URL.
    pub url: String,
    /// HTTP method, upper case.
    #[serde(default = "default_method")]
    pub method: String,
    /// Request headers.
    #[serde(default)]
    pub headers: Headers,
    /// Raw request body.
    #[serde(default)]
    pub body: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl OutboundRequest {
    /// A GET request to `url`.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: default_method(),
            headers: Headers::new(),
            body: None,
        }
    }
}

/// The response handed back to the script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestReply {
    /// HTTP status code.
    pub code: u16,
    /// Reason phrase.
    pub status: String,
    /// Response headers.
    pub headers: Headers,
    /// Response body as text.
    pub body: String,
    /// Round-trip time in milliseconds.
    pub response_time: u64,
}

/// [`RequestSender`](crate::RequestSender) backed by a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpRequestSender {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpRequestSender {
    /// Build a sender with a per-request timeout and user agent.
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self, RequestError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| RequestError::Internal(anyhow::Error::new(e)))?;
        Ok(Self { client, timeout })
    }

    fn map_error(&self, url: &str, err: reqwest::Error) -> RequestError {
        if err.is_timeout() {
            RequestError::Timeout {
                url: url.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            }
        } else {
            RequestError::Transport {
                url: url.to_string(),
                message: err.to_string(),
            }
        }
    }
}

#[async_trait::async_trait]
impl crate::RequestSender for HttpRequestSender {
    async fn send(&self, request: OutboundRequest) -> Result<RequestReply, RequestError> {
        let url = reqwest::Url::parse(&request.url).map_err(|e| RequestError::InvalidUrl {
            url: request.url.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(RequestError::InvalidUrl {
                url: request.url,
                reason: format!("unsupported scheme '{}'", url.scheme()),
            });
        }
        let method = reqwest::Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| {
                RequestError::InvalidRequest(format!("invalid method '{}'", request.method))
            })?;

        let mut builder = self.client.request(method, url);
        for (name, value) in request.headers.iter() {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let started = Instant::now();
        tracing::debug!(url = %request.url, "sendRequest: dispatching");
        let response = builder
            .send()
            .await
            .map_err(|e| self.map_error(&request.url, e))?;
        let code = response.status().as_u16();
        let headers: Headers = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    String::from_utf8_lossy(v.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response
            .text()
            .await
            .map_err(|e| self.map_error(&request.url, e))?;

        Ok(RequestReply {
            code,
            status: reason_phrase(code).to_string(),
            headers,
            body,
            response_time: started.elapsed().as_millis() as u64,
        })
    }
}
