//! HTTP transport seam for the Sign client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use signsync_core::error::{Result, SignSyncError};

/// One outbound API call.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    pub fn new(method: Method, url: String, headers: Vec<(String, String)>) -> Self {
        Self {
            method,
            url,
            headers,
            body: None,
        }
    }

    pub fn with_json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    /// `METHOD url`, for log and error messages.
    pub fn describe(&self) -> String {
        format!("{} {}", self.method, self.url)
    }
}

/// Raw response; the status is not interpreted here.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl ApiResponse {
    pub fn new(status: u16, body: &str) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.to_string(),
        }
    }

    pub fn headers_display(&self) -> String {
        self.headers
            .iter()
            .map(|(name, value)| format!("{name}: {value}"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Sends a single request. Implementations must be shareable across tasks.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse>;
}

/// [`Transport`] backed by one shared `reqwest::Client`.
pub struct HttpTransport {
    http: reqwest::Client,
}

impl HttpTransport {
    /// Build a transport whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SignSyncError::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let mut req = self.http.request(request.method.clone(), &request.url);
        for (name, value) in &request.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            req = req.json(body);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                SignSyncError::Timeout(format!("{}: {e}", request.describe()))
            } else {
                SignSyncError::Transport(format!("{}: {e}", request.describe()))
            }
        })?;

        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();
        let body = resp.text().await.map_err(|e| {
            if e.is_timeout() {
                SignSyncError::Timeout(format!("{}: {e}", request.describe()))
            } else {
                SignSyncError::Transport(format!("{} body read failed: {e}", request.describe()))
            }
        })?;

        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}
