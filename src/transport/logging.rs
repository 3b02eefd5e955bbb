//! Diagnostic stage. Observes traffic, never changes it.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;

use super::{HttpRequest, HttpResponse, Interceptor, Next, TransportError};
use crate::modules::events::{EngineEvent, EventDispatcher, RequestEvent, ResponseEvent};

#[derive(Clone, Default)]
pub struct LoggingInterceptor {
    events: Option<Arc<EventDispatcher>>,
}

impl LoggingInterceptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also publish request/response events to `events`.
    pub fn with_events(events: Arc<EventDispatcher>) -> Self {
        Self {
            events: Some(events),
        }
    }
}

#[async_trait]
impl Interceptor for LoggingInterceptor {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn intercept(
        &self,
        request: HttpRequest,
        next: Next<'_>,
    ) -> Result<HttpResponse, TransportError> {
        let method = request.method.clone();
        let url = request.url.clone();
        let started = Instant::now();

        match &self.events {
            Some(events) => events.dispatch(EngineEvent::Request(RequestEvent {
                url: url.clone(),
                method: method.clone(),
                timestamp: Utc::now(),
            })),
            None => log::debug!("-> {} {}", method, url),
        }

        let result = next.run(request).await;
        let latency = started.elapsed();

        match &self.events {
            Some(events) => {
                let (status, error) = match &result {
                    Ok(response) => (Some(response.status), None),
                    Err(err) => (None, Some(err.to_string())),
                };
                events.dispatch(EngineEvent::Response(ResponseEvent {
                    url,
                    method,
                    status,
                    error,
                    latency,
                    timestamp: Utc::now(),
                }));
            }
            None => match &result {
                Ok(response) => log::debug!(
                    "<- {} {} -> {} ({:.2}s)",
                    method,
                    url,
                    response.status,
                    latency.as_secs_f64()
                ),
                Err(err) => log::debug!("<- {} {} failed: {}", method, url, err),
            },
        }

        result
    }
}
