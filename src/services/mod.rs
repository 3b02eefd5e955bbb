//! Capability provider handed to every source.
//!
//! [`SourceServices`] is the only way a source obtains a transport, a cookie
//! jar, a trust context or a browser session. Every transport it builds runs
//! through the full interceptor chain.

mod client;
mod config;

use std::sync::Arc;

use async_trait::async_trait;
use crate::browser::{BypassOrchestrator, BypassResult, ExtractionResult, SessionPlan};
use crate::config::EngineConfig;
use crate::modules::cancel::CancellationToken;
use crate::modules::cookies::{CookieJarRegistry, SourceCookieJar};
use crate::modules::events::EventDispatcher;
use crate::modules::tls::{SslConfig, TlsError, TrustContext, create_trust_context};
use crate::registry::SourceRegistry;
use crate::transport::{
    ChainBuilder, ConnectivityInterceptor, ConnectivityProbe, HeadersInterceptor,
    LoggingInterceptor, RefererRule, ReqwestTransport, RetryInterceptor, TransportError,
    header_map_from_entries,
};

pub use client::SourceClient;
pub use config::{CloudflareBypassConfig, HttpClientConfig, WebViewConfig};

/// Network capabilities available to a source.
#[async_trait]
pub trait SourceServices: Send + Sync {
    /// Transport with the interceptor chain, plus trust-all TLS and a
    /// per-source cookie jar when `config` asks for them.
    fn create_http_client(
        &self,
        source_id: &str,
        config: &HttpClientConfig,
    ) -> Result<SourceClient, TransportError>;

    /// Default-policy transport for `source_id`.
    fn get_base_http_client(&self, source_id: &str) -> Result<SourceClient, TransportError>;

    /// In-memory jar owned by `source_id`.
    fn create_cookie_manager(&self, source_id: &str) -> Arc<SourceCookieJar>;

    /// Trust override for `config`, `None` for platform defaults.
    async fn create_ssl_context(
        &self,
        config: &SslConfig,
    ) -> Result<Option<TrustContext>, TlsError>;

    async fn bypass_cloudflare(
        &self,
        url: &str,
        source_id: &str,
        config: &CloudflareBypassConfig,
        cancel: &CancellationToken,
    ) -> BypassResult;

    async fn extract_url_from_webview(
        &self,
        url: &str,
        source_id: &str,
        config: &WebViewConfig,
        cancel: &CancellationToken,
    ) -> ExtractionResult;
}

/// [`SourceServices`] backed by reqwest and a [`BypassOrchestrator`].
pub struct DefaultSourceServices {
    config: Arc<EngineConfig>,
    probe: Arc<dyn ConnectivityProbe>,
    orchestrator: BypassOrchestrator,
    jars: CookieJarRegistry,
    registry: Option<Arc<SourceRegistry>>,
    events: Arc<EventDispatcher>,
}

impl DefaultSourceServices {
    pub fn new(
        config: Arc<EngineConfig>,
        probe: Arc<dyn ConnectivityProbe>,
        orchestrator: BypassOrchestrator,
        events: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            config,
            probe,
            orchestrator,
            jars: CookieJarRegistry::new(),
            registry: None,
            events,
        }
    }

    /// Look up manifest-driven header rules (image `Referer`) in `registry`.
    pub fn with_registry(mut self, registry: Arc<SourceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Forget the cookie jar of an uninstalled source.
    pub fn forget_source(&self, source_id: &str) {
        self.jars.remove(source_id);
    }

    fn referer_rule(&self, source_id: &str) -> Option<RefererRule> {
        let entry = self.registry.as_ref()?.get(source_id)?;
        entry
            .metadata
            .image_referer_pattern
            .as_deref()
            .map(RefererRule::new)
    }

    fn headers_stage(
        &self,
        source_id: &str,
        config: &HttpClientConfig,
    ) -> Result<HeadersInterceptor, TransportError> {
        let mut headers = header_map_from_entries(&self.config.default_headers)?;
        for (name, value) in header_map_from_entries(&config.custom_headers)? {
            if let Some(name) = name {
                headers.insert(name, value);
            }
        }

        let stage = HeadersInterceptor::new(headers);
        Ok(match self.referer_rule(source_id) {
            Some(rule) => stage.with_referer(rule),
            None => stage,
        })
    }

    fn build_client(
        &self,
        source_id: &str,
        config: &HttpClientConfig,
    ) -> Result<SourceClient, TransportError> {
        let trust = config.requires_ssl_trust_all.then(|| {
            log::warn!("certificate validation disabled for {source_id}");
            TrustContext::TrustAll
        });
        let jar = config
            .requires_cookie_jar
            .then(|| self.create_cookie_manager(source_id));

        let mut transport = ReqwestTransport::builder()
            .timeout(config.timeout())
            .trust(trust);
        if let Some(jar) = &jar {
            transport = transport.cookie_jar(jar.clone());
        }

        let chain = ChainBuilder::new(Arc::new(transport.build()?))
            .with_headers(self.headers_stage(source_id, config)?)
            .with_connectivity(ConnectivityInterceptor::new(self.probe.clone()))
            .with_logging(LoggingInterceptor::with_events(self.events.clone()))
            .with_retry(
                RetryInterceptor::new(self.config.retry.clone()).with_events(self.events.clone()),
            )
            .build();

        log::debug!(
            "client for {} (trust_all={}, cookie_jar={})",
            source_id,
            config.requires_ssl_trust_all,
            jar.is_some()
        );
        Ok(SourceClient::new(source_id, chain, jar))
    }

    /// Seed the source's jar with cookies a browser session harvested, so
    /// a follow-up download through a jar-backed client carries them.
    fn remember_cookies(&self, source_id: &str, result: &ExtractionResult) {
        let (Some(cookies), Some(final_url)) = (&result.cookies, &result.final_url) else {
            return;
        };
        if cookies.is_empty() {
            return;
        }
        let jar = self.jars.jar_for(source_id);
        for target in [result.original_url.as_str(), final_url.as_str()] {
            if let Ok(mut url) = url::Url::parse(target) {
                url.set_path("/");
                url.set_query(None);
                jar.add_cookie_header(cookies, &url);
            }
        }
    }
}

#[async_trait]
impl SourceServices for DefaultSourceServices {
    fn create_http_client(
        &self,
        source_id: &str,
        config: &HttpClientConfig,
    ) -> Result<SourceClient, TransportError> {
        self.build_client(source_id, config)
    }

    fn get_base_http_client(&self, source_id: &str) -> Result<SourceClient, TransportError> {
        let config = HttpClientConfig {
            timeout_seconds: self.config.default_timeout_seconds,
            ..HttpClientConfig::default()
        };
        self.build_client(source_id, &config)
    }

    fn create_cookie_manager(&self, source_id: &str) -> Arc<SourceCookieJar> {
        self.jars.jar_for(source_id)
    }

    async fn create_ssl_context(
        &self,
        config: &SslConfig,
    ) -> Result<Option<TrustContext>, TlsError> {
        let context = create_trust_context(config).await?;
        if context.as_ref().is_some_and(TrustContext::is_trust_all) {
            log::warn!("certificate validation disabled on request");
        }
        Ok(context)
    }

    async fn bypass_cloudflare(
        &self,
        url: &str,
        source_id: &str,
        config: &CloudflareBypassConfig,
        cancel: &CancellationToken,
    ) -> BypassResult {
        let plan = SessionPlan::from(config);
        let result = self.orchestrator.run(url, source_id, &plan, cancel).await;
        self.remember_cookies(source_id, &result);
        result
    }

    async fn extract_url_from_webview(
        &self,
        url: &str,
        source_id: &str,
        config: &WebViewConfig,
        cancel: &CancellationToken,
    ) -> ExtractionResult {
        let plan = SessionPlan::from(config);
        let result = self.orchestrator.run(url, source_id, &plan, cancel).await;
        self.remember_cookies(source_id, &result);
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use url::Url;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::browser::{BrowserEngine, BrowserError, BrowserSession, StaticPageEngine};
    use crate::errors::ErrorKind;
    use crate::transport::{HeaderEntry, HttpRequest, StaticConnectivity};

    fn services_with(engine: Arc<dyn BrowserEngine>) -> DefaultSourceServices {
        let config = Arc::new(EngineConfig::default());
        DefaultSourceServices::new(
            config.clone(),
            Arc::new(StaticConnectivity::online()),
            BypassOrchestrator::new(engine, config.bypass.clone()),
            Arc::new(EventDispatcher::new()),
        )
    }

    fn services() -> DefaultSourceServices {
        services_with(Arc::new(StaticPageEngine::new()))
    }

    #[test]
    fn every_client_runs_the_full_chain() {
        let client = services().get_base_http_client("alpha").unwrap();
        assert_eq!(
            client.stage_names(),
            vec!["headers", "connectivity", "logging", "retry"]
        );
        assert!(client.cookie_jar().is_none());
    }

    #[tokio::test]
    async fn custom_headers_override_defaults_but_not_caller() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a"))
            .and(header("user-agent", "source-agent/1"))
            .and(header("x-token", "second"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/b"))
            .and(header("user-agent", "caller/9"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let config = HttpClientConfig {
            custom_headers: vec![
                HeaderEntry::new("User-Agent", "source-agent/1"),
                HeaderEntry::new("X-Token", "first"),
                HeaderEntry::new("x-token", "second"),
            ],
            ..HttpClientConfig::default()
        };
        let client = services().create_http_client("alpha", &config).unwrap();

        let a = client.get(&format!("{}/a", server.uri())).await.unwrap();
        assert_eq!(a.status, 200);

        let request = HttpRequest::get(Url::parse(&format!("{}/b", server.uri())).unwrap())
            .with_header("User-Agent", "caller/9")
            .unwrap();
        assert_eq!(client.send(request).await.unwrap().status, 200);
    }

    #[tokio::test]
    async fn cookie_jars_are_isolated_per_source() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/login"))
            .respond_with(ResponseTemplate::new(200).insert_header("set-cookie", "sid=alpha; Path=/"))
            .mount(&server)
            .await;

        let services = services();
        let with_jar = HttpClientConfig {
            requires_cookie_jar: true,
            ..HttpClientConfig::default()
        };
        let alpha = services.create_http_client("alpha", &with_jar).unwrap();
        let beta = services.create_http_client("beta", &with_jar).unwrap();

        let login = format!("{}/login", server.uri());
        let root = server.uri();
        let (first, second) = tokio::join!(alpha.get(&login), beta.get(&root));
        first.unwrap();
        let _ = second;

        let url = Url::parse(&server.uri()).unwrap();
        assert_eq!(
            services.create_cookie_manager("alpha").cookie_header(&url).as_deref(),
            Some("sid=alpha")
        );
        assert!(services.create_cookie_manager("beta").cookie_header(&url).is_none());
    }

    #[tokio::test]
    async fn trust_is_only_relaxed_on_request() {
        let services = services();
        assert!(
            services
                .create_ssl_context(&SslConfig::default())
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            services
                .create_ssl_context(&SslConfig::trust_all())
                .await
                .unwrap()
                .unwrap()
                .is_trust_all()
        );
    }

    struct Broken {
        opened: AtomicUsize,
    }

    #[async_trait]
    impl BrowserEngine for Broken {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn open_session(
            &self,
            _source_id: &str,
        ) -> Result<Box<dyn BrowserSession>, BrowserError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Err(BrowserError::Unavailable("no browser".into()))
        }
    }

    #[tokio::test]
    async fn failed_bypass_is_reported_not_retried() {
        let engine = Arc::new(Broken {
            opened: AtomicUsize::new(0),
        });
        let services = services_with(engine.clone());

        let result = services
            .bypass_cloudflare(
                "https://site.example/",
                "alpha",
                &CloudflareBypassConfig::default(),
                &CancellationToken::new(),
            )
            .await;

        assert!(!result.success);
        assert_eq!(result.kind(), Some(ErrorKind::BypassFailed));
        assert!(result.error.is_some());
        assert_eq!(engine.opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn webview_cookies_seed_the_source_jar() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("set-cookie", "cf_clearance=abc; Path=/")
                    .set_body_raw("<a href=\"/f/game.zip\">dl</a>", "text/html"),
            )
            .mount(&server)
            .await;

        let services = services();
        let config = WebViewConfig {
            scan_links: true,
            ..WebViewConfig::default()
        };
        let result = services
            .extract_url_from_webview(
                &format!("{}/page", server.uri()),
                "alpha",
                &config,
                &CancellationToken::new(),
            )
            .await;

        assert!(result.success, "{:?}", result.error);
        let final_url = Url::parse(result.final_url.as_deref().unwrap()).unwrap();
        assert_eq!(final_url.path(), "/f/game.zip");
        assert_eq!(
            services.create_cookie_manager("alpha").cookie_header(&final_url).as_deref(),
            Some("cf_clearance=abc")
        );
        assert!(services.create_cookie_manager("beta").cookie_header(&final_url).is_none());
    }
}
