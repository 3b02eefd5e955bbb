//! Retry-with-backoff stage.
//!
//! Retryable outcomes are I/O level failures (network errors, timeouts) and
//! responses with status 429 or 5xx. Any other response is returned to the
//! caller as is. Requests that are not retry safe (see
//! [`HttpRequest::is_retry_safe`]) get exactly one attempt.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::{HttpRequest, HttpResponse, Interceptor, Next, TransportError};
use crate::modules::events::{EngineEvent, EventDispatcher, RetryEvent};

/// Backoff parameters for the retry stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Additional attempts after the first one.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Budget for all attempts and backoff sleeps together.
    pub overall_timeout_ms: u64,
    /// Random extra delay as a fraction of the computed backoff, `0.0..=1.0`.
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            overall_timeout_ms: 60_000,
            jitter_ratio: 0.0,
        }
    }
}

impl RetryPolicy {
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn overall_timeout(&self) -> Duration {
        Duration::from_millis(self.overall_timeout_ms)
    }

    /// Upper bound on attempts for `request`.
    pub fn max_attempts(&self, request: &HttpRequest) -> u32 {
        if request.is_retry_safe() {
            self.max_retries.saturating_add(1)
        } else {
            1
        }
    }

    /// Backoff before retry number `retry` (0 based): `base * 2^retry`,
    /// capped at `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u64.saturating_pow(retry);
        let delay = Duration::from_millis(self.base_delay_ms.saturating_mul(factor));
        delay.min(self.max_delay())
    }

    fn jittered(&self, delay: Duration) -> Duration {
        let ratio = self.jitter_ratio.clamp(0.0, 1.0);
        if ratio == 0.0 {
            return delay;
        }
        let extra = delay.mul_f64(ratio * rand::random::<f64>());
        (delay + extra).min(self.max_delay())
    }
}

/// Status codes worth another attempt.
pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

#[derive(Clone, Default)]
pub struct RetryInterceptor {
    policy: RetryPolicy,
    events: Option<Arc<EventDispatcher>>,
}

impl RetryInterceptor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            events: None,
        }
    }

    pub fn with_events(mut self, events: Arc<EventDispatcher>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn notify(&self, request: &HttpRequest, attempt: u32, reason: &str, delay: Duration) {
        match &self.events {
            Some(events) => events.dispatch(EngineEvent::Retry(RetryEvent {
                url: request.url.clone(),
                attempt,
                reason: reason.to_string(),
                scheduled_after: delay,
                timestamp: Utc::now(),
            })),
            None => log::warn!(
                "retrying {} {} (attempt {}) in {:?}: {}",
                request.method,
                request.url,
                attempt,
                delay,
                reason
            ),
        }
    }
}

#[async_trait]
impl Interceptor for RetryInterceptor {
    fn name(&self) -> &'static str {
        "retry"
    }

    async fn intercept(
        &self,
        request: HttpRequest,
        next: Next<'_>,
    ) -> Result<HttpResponse, TransportError> {
        let max_attempts = self.policy.max_attempts(&request);
        let overall = self.policy.overall_timeout();
        let deadline = Instant::now() + overall;
        let mut previous_delay = Duration::ZERO;
        let mut attempts = 0u32;

        let last = loop {
            attempts += 1;

            let outcome = match tokio::time::timeout_at(deadline, next.run(request.clone())).await {
                Ok(outcome) => outcome,
                Err(_) => break TransportError::Timeout(overall),
            };

            let failure = match outcome {
                Ok(response) if is_retryable_status(response.status) => TransportError::Status {
                    status: response.status,
                    url: response.url.to_string(),
                },
                Ok(response) => return Ok(response),
                Err(err) if err.is_retryable() => err,
                Err(err) => return Err(err),
            };

            if attempts >= max_attempts {
                break failure;
            }

            let delay = self
                .policy
                .jittered(self.policy.delay_for(attempts - 1))
                .max(previous_delay);
            if Instant::now() + delay >= deadline {
                log::debug!("retry budget for {} spent, giving up", request.url);
                break failure;
            }

            self.notify(&request, attempts + 1, &failure.to_string(), delay);
            previous_delay = delay;
            tokio::time::sleep(delay).await;
        };

        Err(TransportError::RetriesExhausted {
            attempts,
            last: Box::new(last),
        })
    }
}
