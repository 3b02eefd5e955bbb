//! Connectivity precondition stage.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

use super::{HttpRequest, HttpResponse, Interceptor, Next, TransportError};

/// Answers whether the network is currently reachable.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_connected(&self) -> bool;
}

/// Probe driven by the host, e.g. from platform network callbacks.
#[derive(Debug)]
pub struct StaticConnectivity {
    online: AtomicBool,
}

impl StaticConnectivity {
    pub fn online() -> Self {
        Self {
            online: AtomicBool::new(true),
        }
    }

    pub fn offline() -> Self {
        Self {
            online: AtomicBool::new(false),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectivityProbe for StaticConnectivity {
    async fn is_connected(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

/// Considers the network reachable when a TCP connection to `target`
/// succeeds within `timeout`.
#[derive(Debug, Clone)]
pub struct TcpConnectivityProbe {
    target: String,
    timeout: Duration,
}

impl TcpConnectivityProbe {
    pub fn new(target: impl Into<String>, timeout: Duration) -> Self {
        Self {
            target: target.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ConnectivityProbe for TcpConnectivityProbe {
    async fn is_connected(&self) -> bool {
        match tokio::time::timeout(self.timeout, TcpStream::connect(self.target.as_str())).await {
            Ok(Ok(_)) => true,
            Ok(Err(err)) => {
                log::debug!("connectivity probe to {} failed: {}", self.target, err);
                false
            }
            Err(_) => {
                log::debug!("connectivity probe to {} timed out", self.target);
                false
            }
        }
    }
}

/// Fails fast with [`TransportError::NoConnectivity`] while offline, without
/// reaching the retry stage.
#[derive(Clone)]
pub struct ConnectivityInterceptor {
    probe: Arc<dyn ConnectivityProbe>,
}

impl ConnectivityInterceptor {
    pub fn new(probe: Arc<dyn ConnectivityProbe>) -> Self {
        Self { probe }
    }
}

#[async_trait]
impl Interceptor for ConnectivityInterceptor {
    fn name(&self) -> &'static str {
        "connectivity"
    }

    async fn intercept(
        &self,
        request: HttpRequest,
        next: Next<'_>,
    ) -> Result<HttpResponse, TransportError> {
        if !self.probe.is_connected().await {
            log::warn!("offline, refusing {} {}", request.method, request.url);
            return Err(TransportError::NoConnectivity);
        }
        next.run(request).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use url::Url;

    use super::*;
    use crate::transport::{ChainBuilder, RetryInterceptor, RetryPolicy, Transport};

    #[derive(Default)]
    struct Counting {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Transport for Counting {
        async fn execute(&self, _request: HttpRequest) -> Result<HttpResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::Network("unreachable".into()))
        }
    }

    #[tokio::test]
    async fn offline_fails_before_any_attempt() {
        let transport = Arc::new(Counting::default());
        let chain = ChainBuilder::new(transport.clone())
            .with_connectivity(ConnectivityInterceptor::new(Arc::new(
                StaticConnectivity::offline(),
            )))
            .with_retry(RetryInterceptor::new(RetryPolicy::default()))
            .build();

        let err = chain
            .execute(HttpRequest::get(Url::parse("https://example.com").unwrap()))
            .await
            .unwrap_err();

        assert!(matches!(err, TransportError::NoConnectivity));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }
}
