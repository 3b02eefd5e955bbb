//! Transport handed to sources.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use url::Url;

use crate::modules::cookies::SourceCookieJar;
use crate::transport::{HttpRequest, HttpResponse, InterceptorChain, Transport, TransportError};

/// An interceptor chain bound to one source.
#[derive(Clone)]
pub struct SourceClient {
    source_id: String,
    chain: Arc<InterceptorChain>,
    cookie_jar: Option<Arc<SourceCookieJar>>,
}

impl SourceClient {
    pub(crate) fn new(
        source_id: impl Into<String>,
        chain: InterceptorChain,
        cookie_jar: Option<Arc<SourceCookieJar>>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            chain: Arc::new(chain),
            cookie_jar,
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// The jar backing this client, when one was requested.
    pub fn cookie_jar(&self) -> Option<&Arc<SourceCookieJar>> {
        self.cookie_jar.as_ref()
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.chain.stage_names()
    }

    pub async fn get(&self, url: &str) -> Result<HttpResponse, TransportError> {
        let url = Url::parse(url).map_err(|err| TransportError::InvalidRequest(err.to_string()))?;
        self.chain.execute(HttpRequest::get(url)).await
    }

    pub async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.chain.execute(request).await
    }
}

impl fmt::Debug for SourceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceClient")
            .field("source_id", &self.source_id)
            .field("stages", &self.chain.stage_names())
            .field("cookie_jar", &self.cookie_jar.is_some())
            .finish()
    }
}

#[async_trait]
impl Transport for SourceClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.chain.execute(request).await
    }
}
