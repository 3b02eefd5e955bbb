//! Resilient HTTP transport.
//!
//! Every outbound call issued on behalf of a source runs through an
//! [`InterceptorChain`] layered around a terminal [`Transport`]. Stages are
//! applied in a fixed order on the way out and unwound in reverse on the way
//! back:
//!
//! ```text
//! Headers -> Connectivity -> Logging -> Retry -> transport
//! ```

pub mod chain;
pub mod connectivity;
pub mod headers;
pub mod logging;
pub mod reqwest_client;
pub mod retry;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::errors::ErrorKind;

pub use chain::{ChainBuilder, InterceptorChain};
pub use connectivity::{ConnectivityInterceptor, ConnectivityProbe, StaticConnectivity, TcpConnectivityProbe};
pub use headers::{HeadersInterceptor, RefererRule};
pub use logging::LoggingInterceptor;
pub use reqwest_client::{ReqwestTransport, ReqwestTransportBuilder};
pub use retry::{RetryInterceptor, RetryPolicy, is_retryable_status};
pub use types::{HeaderEntry, HttpRequest, HttpResponse, Idempotency, header_map_from_entries};

/// Terminal (or composite) component able to execute a request.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// A single policy layer of the chain.
///
/// Implementations receive the request plus a [`Next`] handle for the rest of
/// the chain and decide whether, how often and with what request to call it.
#[async_trait]
pub trait Interceptor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn intercept(
        &self,
        request: HttpRequest,
        next: Next<'_>,
    ) -> Result<HttpResponse, TransportError>;
}

/// Remainder of the chain below the current interceptor.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    interceptors: &'a [Arc<dyn Interceptor>],
    transport: &'a dyn Transport,
}

impl<'a> Next<'a> {
    pub(crate) fn new(interceptors: &'a [Arc<dyn Interceptor>], transport: &'a dyn Transport) -> Self {
        Self {
            interceptors,
            transport,
        }
    }

    /// Hand `request` to the next stage. `Next` is `Copy`, so a stage may run
    /// the remainder several times.
    pub async fn run(self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        match self.interceptors.split_first() {
            Some((head, tail)) => head.intercept(request, Next::new(tail, self.transport)).await,
            None => self.transport.execute(request).await,
        }
    }
}

/// Failures surfaced by the transport layer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no network connectivity")]
    NoConnectivity,
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("network failure: {0}")]
    Network(String),
    #[error("server answered {url} with retryable status {status}")]
    Status { status: u16, url: String },
    #[error("retries exhausted after {attempts} attempt(s): {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<TransportError>,
    },
    #[error("invalid header '{0}'")]
    InvalidHeader(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("failed to decode response: {0}")]
    Decode(String),
    #[error("failed to build transport: {0}")]
    Build(String),
}

impl TransportError {
    /// I/O level failures worth another attempt. Retryable statuses are
    /// judged separately by the retry stage.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Network(_) | TransportError::Timeout(_) | TransportError::Status { .. }
        )
    }

    /// Attempt count for exhausted retries, `None` otherwise.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            TransportError::RetriesExhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::NoConnectivity => ErrorKind::NoConnectivity,
            TransportError::Timeout(_) => ErrorKind::Timeout,
            TransportError::RetriesExhausted { .. } => ErrorKind::RetriesExhausted,
            TransportError::Network(_)
            | TransportError::Status { .. }
            | TransportError::InvalidHeader(_)
            | TransportError::InvalidRequest(_)
            | TransportError::Decode(_)
            | TransportError::Build(_) => ErrorKind::Http,
        }
    }
}
