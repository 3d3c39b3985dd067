//! Resilient request executor
//!
//! Issues one logical request with a per-attempt timeout, classifies the
//! response and retries transient failures with exponential backoff.
//!
//! Classification, in priority order:
//! 1. 429 and 5xx are retried until the attempt budget runs out
//! 2. 401 fails immediately
//! 3. other non-2xx fail with the server's error message
//! 4. an empty 2xx body fails as [`Error::EmptyResponse`]
//! 5. an unparsable 2xx body fails as [`Error::MalformedResponse`]
//!
//! Timeouts and dropped connections are retried like 5xx. Terminal failures
//! are reported to the observer's fault channel.

mod policy;

pub use policy::RetryPolicy;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};
use vesper_core::observer::{Breadcrumb, FaultReport, ObserverHandle};

use crate::error::{Error, Result};
use crate::transport::{HttpRequest, HttpResponse, Transport};

/// What to do after one attempt
enum Step<T> {
    Done(T),
    Retry(Error),
    Fail(Error),
}

/// Retrying request executor
#[derive(Clone)]
pub struct Executor {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    observer: ObserverHandle,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl Executor {
    /// Create an executor with the default policy
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, observer: ObserverHandle) -> Self {
        Self {
            transport,
            policy: RetryPolicy::default(),
            observer,
        }
    }

    /// Replace the default policy
    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The default policy
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute with the default policy and return the parsed body
    pub async fn execute(&self, request: HttpRequest) -> Result<Value> {
        self.execute_with(request, &self.policy).await
    }

    /// Execute and deserialize the body into `T`
    pub async fn execute_json<T: DeserializeOwned>(&self, request: HttpRequest) -> Result<T> {
        let method = request.method.to_string();
        let endpoint = request.path.clone();
        let value = self.execute(request).await?;
        serde_json::from_value(value).map_err(|e| {
            let err = Error::MalformedResponse {
                endpoint: endpoint.clone(),
                method: method.clone(),
                reason: e.to_string(),
            };
            self.report(&method, &endpoint, &err);
            err
        })
    }

    /// Execute with an explicit policy and return the parsed body
    pub async fn execute_with(&self, request: HttpRequest, policy: &RetryPolicy) -> Result<Value> {
        let method = request.method.to_string();
        let max_attempts = policy.attempts();

        for attempt in 1..=max_attempts {
            self.observer.breadcrumb(
                Breadcrumb::http(&method, &request.path, "request sent").with_attempt(attempt),
            );

            let step = match timeout(policy.timeout, self.round_trip(&request)).await {
                Err(_) => {
                    self.observer.breadcrumb(
                        Breadcrumb::http(&method, &request.path, "request timed out")
                            .with_attempt(attempt),
                    );
                    Step::Retry(Error::Timeout {
                        endpoint: request.path.clone(),
                        method: method.clone(),
                        timeout_ms: policy.timeout.as_millis() as u64,
                        attempts: attempt,
                    })
                }
                Ok(Err(e)) => {
                    self.observer.breadcrumb(
                        Breadcrumb::http(&method, &request.path, format!("request failed: {}", e))
                            .with_attempt(attempt),
                    );
                    if e.is_transient() {
                        Step::Retry(e)
                    } else {
                        Step::Fail(e)
                    }
                }
                Ok(Ok((status, body))) => {
                    self.observer.breadcrumb(
                        Breadcrumb::http(&method, &request.path, "response received")
                            .with_status(status)
                            .with_attempt(attempt),
                    );
                    classify_body(&request, &method, status, &body, attempt)
                }
            };

            match step {
                Step::Done(value) => {
                    if attempt > 1 {
                        debug!(
                            method = %method,
                            path = %request.path,
                            attempt,
                            "Request succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Step::Retry(err) if attempt < max_attempts => {
                    let delay = policy.delay_for(attempt - 1);
                    warn!(
                        method = %method,
                        path = %request.path,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Request failed, retrying"
                    );
                    sleep(delay).await;
                }
                Step::Retry(err) | Step::Fail(err) => {
                    self.report(&method, &request.path, &err);
                    return Err(err);
                }
            }
        }

        // max_attempts >= 1, so the loop always returns
        Err(Error::Network(format!(
            "{} {} made no attempt",
            method, request.path
        )))
    }

    /// Open a streaming response with a single attempt.
    ///
    /// The response head is classified like [`Executor::execute`], but a
    /// successful body is handed back unread. `head_timeout` bounds only the
    /// wait for the response head.
    pub async fn open_stream(
        &self,
        request: HttpRequest,
        head_timeout: Duration,
    ) -> Result<HttpResponse> {
        let method = request.method.to_string();
        let path = request.path.clone();
        self.observer
            .breadcrumb(Breadcrumb::http(&method, &path, "stream opened").with_attempt(1));

        let result = match timeout(head_timeout, self.transport.send(request)).await {
            Err(_) => Err(Error::Timeout {
                endpoint: path.clone(),
                method: method.clone(),
                timeout_ms: head_timeout.as_millis() as u64,
                attempts: 1,
            }),
            Ok(Err(e)) => Err(e),
            Ok(Ok(response)) => {
                self.observer.breadcrumb(
                    Breadcrumb::http(&method, &path, "stream head received")
                        .with_status(response.status)
                        .with_attempt(1),
                );
                if response.is_success() {
                    Ok(response)
                } else {
                    let status = response.status;
                    let body = response.bytes().await.unwrap_or_default();
                    Err(status_error(&path, &method, status, &body, 1))
                }
            }
        };

        if let Err(err) = &result {
            self.report(&method, &path, err);
        }
        result
    }

    async fn round_trip(&self, request: &HttpRequest) -> Result<(u16, Bytes)> {
        let response = self.transport.send(request.clone()).await?;
        let status = response.status;
        let body = response.bytes().await?;
        Ok((status, body))
    }

    fn report(&self, method: &str, endpoint: &str, err: &Error) {
        self.observer.report_fault(FaultReport {
            error: err.to_string(),
            category: err.category().as_str().to_string(),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
            status_code: err.status_code(),
        });
    }
}

fn classify_body(
    request: &HttpRequest,
    method: &str,
    status: u16,
    body: &[u8],
    attempt: u32,
) -> Step<Value> {
    if !(200..300).contains(&status) {
        let err = status_error(&request.path, method, status, body, attempt);
        return if err.is_transient() {
            Step::Retry(err)
        } else {
            Step::Fail(err)
        };
    }

    if body.iter().all(u8::is_ascii_whitespace) {
        return Step::Fail(Error::EmptyResponse {
            endpoint: request.path.clone(),
            method: method.to_string(),
        });
    }

    match serde_json::from_slice(body) {
        Ok(value) => Step::Done(value),
        Err(e) => Step::Fail(Error::MalformedResponse {
            endpoint: request.path.clone(),
            method: method.to_string(),
            reason: e.to_string(),
        }),
    }
}

/// Error for a non-2xx status
fn status_error(endpoint: &str, method: &str, status: u16, body: &[u8], attempts: u32) -> Error {
    match status {
        429 => Error::RateLimited {
            endpoint: endpoint.to_string(),
            method: method.to_string(),
            attempts,
        },
        s if s >= 500 => Error::Server {
            endpoint: endpoint.to_string(),
            method: method.to_string(),
            status: s,
            attempts,
        },
        401 => Error::Unauthorized {
            endpoint: endpoint.to_string(),
            method: method.to_string(),
        },
        s => Error::Api {
            endpoint: endpoint.to_string(),
            method: method.to_string(),
            status: s,
            message: error_message(body).unwrap_or_else(|| format!("HTTP {}", s)),
        },
    }
}

/// Pull a human-readable message out of an error body.
///
/// Looks at `detail`, `message` and `error` (string or `{message}`), then
/// falls back to the raw text.
pub(crate) fn error_message(body: &[u8]) -> Option<String> {
    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        for key in ["detail", "message", "error"] {
            match value.get(key) {
                Some(Value::String(s)) => {
                    if !s.is_empty() {
                        return Some(s.clone());
                    }
                }
                Some(Value::Object(inner)) => {
                    if let Some(Value::String(s)) = inner.get("message") {
                        return Some(s.clone());
                    }
                }
                Some(other) if !other.is_null() => return Some(other.to_string()),
                _ => {}
            }
        }
    }
    let text = String::from_utf8_lossy(body).trim().to_string();
    (!text.is_empty()).then_some(text)
}

#[cfg(test)]
mod tests;
