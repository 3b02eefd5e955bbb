//! Event system for the source engine.
//!
//! Provides hooks for logging and custom reactions around transport,
//! bypass, dispatch and registry activity.

use chrono::{DateTime, Utc};
use http::Method;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Emitted by the logging stage before a request goes further down the chain.
#[derive(Debug, Clone)]
pub struct RequestEvent {
    pub url: Url,
    pub method: Method,
    pub timestamp: DateTime<Utc>,
}

/// Emitted by the logging stage once the downstream call returned.
#[derive(Debug, Clone)]
pub struct ResponseEvent {
    pub url: Url,
    pub method: Method,
    pub status: Option<u16>,
    pub error: Option<String>,
    pub latency: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RetryEvent {
    pub url: Url,
    pub attempt: u32,
    pub reason: String,
    pub scheduled_after: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct BypassEvent {
    pub source_id: String,
    pub url: String,
    pub success: bool,
    pub detail: String,
    pub elapsed: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DispatchEvent {
    pub source_id: String,
    pub method: String,
    pub adapter: &'static str,
    pub success: bool,
    pub latency: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryAction {
    Installed,
    Upgraded,
    Uninstalled,
    Enabled,
    Disabled,
}

#[derive(Debug, Clone)]
pub struct RegistryEvent {
    pub source_id: String,
    pub version: String,
    pub action: RegistryAction,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum EngineEvent {
    Request(RequestEvent),
    Response(ResponseEvent),
    Retry(RetryEvent),
    Bypass(BypassEvent),
    Dispatch(DispatchEvent),
    Registry(RegistryEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &EngineEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Dispatcher with the [`LoggingHandler`] already registered.
    pub fn with_logging() -> Self {
        let mut dispatcher = Self::new();
        dispatcher.register_handler(Arc::new(LoggingHandler));
        dispatcher
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: EngineEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &EngineEvent) {
        match event {
            EngineEvent::Request(request) => {
                log::debug!("-> {} {}", request.method, request.url);
            }
            EngineEvent::Response(response) => match (response.status, &response.error) {
                (Some(status), _) => log::debug!(
                    "<- {} {} -> {} ({:.2}s)",
                    response.method,
                    response.url,
                    status,
                    response.latency.as_secs_f64()
                ),
                (None, Some(error)) => log::debug!(
                    "<- {} {} failed: {} ({:.2}s)",
                    response.method,
                    response.url,
                    error,
                    response.latency.as_secs_f64()
                ),
                (None, None) => {}
            },
            EngineEvent::Retry(retry) => {
                log::warn!(
                    "retry {} attempt {} after {:.2}s ({})",
                    retry.url,
                    retry.attempt,
                    retry.scheduled_after.as_secs_f64(),
                    retry.reason
                );
            }
            EngineEvent::Bypass(bypass) if bypass.success => {
                log::info!(
                    "bypass {} for {} resolved in {:.2}s",
                    bypass.url,
                    bypass.source_id,
                    bypass.elapsed.as_secs_f64()
                );
            }
            EngineEvent::Bypass(bypass) => {
                log::warn!(
                    "bypass {} for {} failed: {}",
                    bypass.url,
                    bypass.source_id,
                    bypass.detail
                );
            }
            EngineEvent::Dispatch(dispatch) => {
                log::debug!(
                    "dispatch {}::{} via {} success={} ({:.2}s)",
                    dispatch.source_id,
                    dispatch.method,
                    dispatch.adapter,
                    dispatch.success,
                    dispatch.latency.as_secs_f64()
                );
            }
            EngineEvent::Registry(registry) => {
                log::info!(
                    "source {} {:?} (version {})",
                    registry.source_id,
                    registry.action,
                    registry.version
                );
            }
        }
    }
}
