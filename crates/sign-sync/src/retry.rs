//! Retry with exponential backoff for Sign API calls.

use std::time::Duration;

use signsync_core::error::{Result, SignSyncError};
use tracing::{debug, error, warn};

use crate::transport::{ApiRequest, ApiResponse, Transport};

const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(10);
const DEFAULT_BACKOFF_FACTOR: u32 = 3;

/// Retry policy for a single API call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = no retries).
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub backoff_factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: DEFAULT_INITIAL_DELAY,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Wait after the failed attempt `attempt` (0-based):
    /// `initial_delay * backoff_factor^(attempt + 1)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.saturating_pow(attempt.saturating_add(1));
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
    }

    /// Send `request`, retrying transient failures.
    ///
    /// 2xx responses are returned. 429, 5xx and connection failures are
    /// retried up to `max_retries` times; any other status fails at once.
    pub async fn call(
        &self,
        transport: &dyn Transport,
        request: &ApiRequest,
        org: &str,
    ) -> Result<ApiResponse> {
        let mut attempt: u32 = 0;
        loop {
            debug!(org, attempt = attempt + 1, request = %request.describe(), "calling Sign API");
            let outcome = match transport.send(request).await {
                Ok(resp) => classify(request, resp, org),
                Err(e) => Err(e),
            };

            match outcome {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_retryable() => {
                    warn!(org, attempt = attempt + 1, request = %request.describe(), error = %e, "Sign API call failed");
                    if attempt >= self.max_retries {
                        return Err(SignSyncError::RetriesExhausted {
                            attempts: attempt + 1,
                            message: format!("{}: {e}", request.describe()),
                        });
                    }
                    let delay = self.delay_for(attempt);
                    warn!(org, delay_secs = delay.as_secs(), "waiting before retry");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Map a response status onto success or an error kind.
fn classify(request: &ApiRequest, resp: ApiResponse, org: &str) -> Result<ApiResponse> {
    match resp.status {
        200..=299 => Ok(resp),
        429 => Err(SignSyncError::RateLimited(format!(
            "too many calls, headers: {}",
            resp.headers_display()
        ))),
        500.. => Err(SignSyncError::Server {
            status: resp.status,
            message: format!("headers: {}", resp.headers_display()),
        }),
        status => {
            error!(
                org,
                status,
                request = %request.describe(),
                headers = %resp.headers_display(),
                body = %resp.body,
                "Sign API call rejected"
            );
            Err(SignSyncError::Api {
                status,
                message: format!("{}: {}", request.describe(), resp.body),
            })
        }
    }
}
