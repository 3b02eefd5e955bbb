//! Ordered interceptor stack around a terminal transport.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use super::{
    ConnectivityInterceptor, HeadersInterceptor, HttpRequest, HttpResponse, Interceptor,
    LoggingInterceptor, Next, RetryInterceptor, Transport, TransportError,
};

/// Interceptors applied in order, followed by the terminal transport.
///
/// The chain itself is a [`Transport`], so it can be handed to anything that
/// expects one.
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn Interceptor>>,
    transport: Arc<dyn Transport>,
}

impl InterceptorChain {
    pub fn builder(transport: Arc<dyn Transport>) -> ChainBuilder {
        ChainBuilder::new(transport)
    }

    /// Names of the installed stages, outermost first.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.interceptors.iter().map(|stage| stage.name()).collect()
    }
}

impl fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("stages", &self.stage_names())
            .finish()
    }
}

#[async_trait]
impl Transport for InterceptorChain {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        Next::new(&self.interceptors, self.transport.as_ref())
            .run(request)
            .await
    }
}

/// Assembles an [`InterceptorChain`].
///
/// Each stage has a fixed slot, so the resulting order is always
/// headers, connectivity, logging, retry regardless of the order the
/// `with_*` calls were made in. Absent stages are skipped.
pub struct ChainBuilder {
    transport: Arc<dyn Transport>,
    headers: Option<HeadersInterceptor>,
    connectivity: Option<ConnectivityInterceptor>,
    logging: Option<LoggingInterceptor>,
    retry: Option<RetryInterceptor>,
}

impl ChainBuilder {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            headers: None,
            connectivity: None,
            logging: None,
            retry: None,
        }
    }

    pub fn with_headers(mut self, stage: HeadersInterceptor) -> Self {
        self.headers = Some(stage);
        self
    }

    pub fn with_connectivity(mut self, stage: ConnectivityInterceptor) -> Self {
        self.connectivity = Some(stage);
        self
    }

    pub fn with_logging(mut self, stage: LoggingInterceptor) -> Self {
        self.logging = Some(stage);
        self
    }

    pub fn with_retry(mut self, stage: RetryInterceptor) -> Self {
        self.retry = Some(stage);
        self
    }

    pub fn build(self) -> InterceptorChain {
        let mut interceptors: Vec<Arc<dyn Interceptor>> = Vec::with_capacity(4);
        if let Some(stage) = self.headers {
            interceptors.push(Arc::new(stage));
        }
        if let Some(stage) = self.connectivity {
            interceptors.push(Arc::new(stage));
        }
        if let Some(stage) = self.logging {
            interceptors.push(Arc::new(stage));
        }
        if let Some(stage) = self.retry {
            interceptors.push(Arc::new(stage));
        }

        InterceptorChain {
            interceptors,
            transport: self.transport,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use http::HeaderMap;
    use url::Url;

    use super::*;
    use crate::transport::{RetryPolicy, StaticConnectivity};

    /// Records the order in which stages saw the request and the response.
    struct Tracer {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Interceptor for Tracer {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn intercept(
            &self,
            request: HttpRequest,
            next: Next<'_>,
        ) -> Result<HttpResponse, TransportError> {
            self.log.lock().unwrap().push(format!("> {}", self.name));
            let result = next.run(request).await;
            self.log.lock().unwrap().push(format!("< {}", self.name));
            result
        }
    }

    struct Ok200;

    #[async_trait]
    impl Transport for Ok200 {
        async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
            Ok(HttpResponse {
                status: 200,
                headers: HeaderMap::new(),
                body: Default::default(),
                url: request.url,
            })
        }
    }

    #[tokio::test]
    async fn stages_unwind_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let interceptors: Vec<Arc<dyn Interceptor>> = ["a", "b"]
            .into_iter()
            .map(|name| {
                Arc::new(Tracer {
                    name,
                    log: log.clone(),
                }) as Arc<dyn Interceptor>
            })
            .collect();
        let chain = InterceptorChain {
            interceptors,
            transport: Arc::new(Ok200),
        };

        chain
            .execute(HttpRequest::get(Url::parse("https://example.com").unwrap()))
            .await
            .unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["> a", "> b", "< b", "< a"]);
    }

    #[test]
    fn builder_enforces_fixed_order() {
        let chain = ChainBuilder::new(Arc::new(Ok200))
            .with_retry(RetryInterceptor::new(RetryPolicy::default()))
            .with_logging(LoggingInterceptor::new())
            .with_connectivity(ConnectivityInterceptor::new(Arc::new(
                StaticConnectivity::online(),
            )))
            .with_headers(HeadersInterceptor::new(HeaderMap::new()))
            .build();

        assert_eq!(
            chain.stage_names(),
            vec!["headers", "connectivity", "logging", "retry"]
        );
    }
}
