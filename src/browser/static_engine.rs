//! Plain HTTP browser engine.
//!
//! Follows HTTP redirects and `<meta http-equiv="refresh">` hops one by one,
//! reporting each hop as an observed navigation. It cannot run scripts, so
//! pages that need a JavaScript challenge solved require the Chromium engine.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::header::{CONTENT_TYPE, LOCATION, USER_AGENT};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::redirect::Policy;
use reqwest::{Client, StatusCode};
use scraper::{Html, Selector};
use url::Url;

use super::{BrowserCookie, BrowserEngine, BrowserError, BrowserSession};

const MAX_HOPS: usize = 10;
const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Linux; Android 14) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0 Mobile Safari/537.36";

static META_REFRESH: Lazy<Selector> =
    Lazy::new(|| Selector::parse("meta[http-equiv][content]").expect("valid selector"));
static REFRESH_TARGET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)url\s*=\s*['"]?([^'"]+)"#).expect("valid regex"));

#[derive(Debug, Clone)]
pub struct StaticPageEngine {
    user_agent: String,
    request_timeout: Duration,
}

impl Default for StaticPageEngine {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl StaticPageEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[async_trait]
impl BrowserEngine for StaticPageEngine {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn open_session(&self, source_id: &str) -> Result<Box<dyn BrowserSession>, BrowserError> {
        let jar = Arc::new(Jar::default());
        let client = Client::builder()
            .redirect(Policy::none())
            .cookie_provider(jar.clone())
            .timeout(self.request_timeout)
            .gzip(true)
            .brotli(true)
            .build()
            .map_err(|err| BrowserError::Unavailable(err.to_string()))?;

        log::debug!("static session opened for {}", source_id);
        Ok(Box::new(StaticSession {
            client,
            jar,
            user_agent: self.user_agent.clone(),
            observed: VecDeque::new(),
            visited: Vec::new(),
            current: None,
            html: String::new(),
        }))
    }
}

struct StaticSession {
    client: Client,
    jar: Arc<Jar>,
    user_agent: String,
    observed: VecDeque<Url>,
    visited: Vec<Url>,
    current: Option<Url>,
    html: String,
}

impl StaticSession {
    fn record(&mut self, url: &Url) {
        self.observed.push_back(url.clone());
        if !self
            .visited
            .iter()
            .any(|seen| seen.origin() == url.origin())
        {
            self.visited.push(url.clone());
        }
    }
}

#[async_trait]
impl BrowserSession for StaticSession {
    async fn navigate(&mut self, url: &Url) -> Result<(), BrowserError> {
        let mut next = url.clone();

        for _ in 0..MAX_HOPS {
            self.record(&next);
            let response = self
                .client
                .get(next.clone())
                .header(USER_AGENT, self.user_agent.as_str())
                .send()
                .await
                .map_err(|err| BrowserError::Navigation(err.to_string()))?;

            let status = response.status();
            self.current = Some(response.url().clone());

            if status.is_redirection() && status != StatusCode::NOT_MODIFIED {
                let target = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|location| next.join(location).ok())
                    .ok_or_else(|| {
                        BrowserError::Navigation(format!("{status} without a usable Location"))
                    })?;
                next = target;
                continue;
            }

            let is_html = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .is_none_or(|value| value.contains("html"));
            if !is_html {
                // A download; leave the body alone.
                self.html.clear();
                return Ok(());
            }

            self.html = response
                .text()
                .await
                .map_err(|err| BrowserError::Navigation(err.to_string()))?;

            match meta_refresh_target(&self.html, &next) {
                Some(target) if target != next => next = target,
                _ => return Ok(()),
            }
        }

        Err(BrowserError::Navigation(format!(
            "more than {MAX_HOPS} redirects starting at {url}"
        )))
    }

    async fn next_observed_url(&mut self) -> Option<Url> {
        self.observed.pop_front()
    }

    async fn current_url(&mut self) -> Result<Url, BrowserError> {
        self.current
            .clone()
            .ok_or_else(|| BrowserError::Navigation("no page loaded".into()))
    }

    async fn evaluate(&mut self, _script: &str) -> Result<Option<String>, BrowserError> {
        Err(BrowserError::Unsupported("static"))
    }

    async fn page_html(&mut self) -> Result<String, BrowserError> {
        Ok(self.html.clone())
    }

    async fn cookies(&mut self) -> Result<Vec<BrowserCookie>, BrowserError> {
        let mut cookies = Vec::new();
        for url in &self.visited {
            let Some(header) = self.jar.cookies(url) else {
                continue;
            };
            let Ok(header) = header.to_str() else {
                continue;
            };
            let domain = url.host_str().unwrap_or_default().to_string();
            for pair in header.split(';') {
                if let Some((name, value)) = pair.trim().split_once('=') {
                    cookies.push(BrowserCookie {
                        name: name.to_string(),
                        value: value.to_string(),
                        domain: domain.clone(),
                        path: "/".to_string(),
                    });
                }
            }
        }
        Ok(cookies)
    }

    async fn close(&mut self) {
        self.observed.clear();
    }
}

fn meta_refresh_target(html: &str, base: &Url) -> Option<Url> {
    let document = Html::parse_document(html);
    let content = document
        .select(&META_REFRESH)
        .find(|meta| {
            meta.value()
                .attr("http-equiv")
                .is_some_and(|equiv| equiv.eq_ignore_ascii_case("refresh"))
        })?
        .value()
        .attr("content")?;

    let decoded = html_escape::decode_html_entities(content);
    let target = REFRESH_TARGET.captures(&decoded)?.get(1)?.as_str().trim();
    base.join(target).ok()
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::browser::{BypassOrchestrator, BypassTimeouts, SessionPlan, compile_patterns};
    use crate::modules::cancel::CancellationToken;

    async fn challenge_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/challenge"))
            .respond_with(
                ResponseTemplate::new(302)
                    .insert_header("location", "/landing")
                    .insert_header("set-cookie", "cf_clearance=abc; Path=/"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/landing"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"<html><head><meta http-equiv="Refresh" content="0; URL='/file.zip'"></head></html>"#,
                "text/html",
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/file.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(vec![0u8; 16], "application/zip"))
            .mount(&server)
            .await;
        server
    }

    #[test]
    fn parses_meta_refresh() {
        let base = Url::parse("https://site.example/a/").unwrap();
        let html = r#"<meta http-equiv="refresh" content="5;url=next.html">"#;
        assert_eq!(
            meta_refresh_target(html, &base).unwrap().as_str(),
            "https://site.example/a/next.html"
        );
        assert!(meta_refresh_target("<p>plain</p>", &base).is_none());
    }

    #[tokio::test]
    async fn follows_hops_and_keeps_cookies() {
        let server = challenge_server().await;
        let engine = StaticPageEngine::new();
        let mut session = engine.open_session("vimms").await.unwrap();
        let start = Url::parse(&format!("{}/challenge", server.uri())).unwrap();

        session.navigate(&start).await.unwrap();

        let mut observed = Vec::new();
        while let Some(url) = session.next_observed_url().await {
            observed.push(url.path().to_string());
        }
        assert_eq!(observed, vec!["/challenge", "/landing", "/file.zip"]);
        assert_eq!(session.current_url().await.unwrap().path(), "/file.zip");

        let cookies = session.cookies().await.unwrap();
        assert!(cookies.iter().any(|c| c.pair() == "cf_clearance=abc"));
        assert!(session.evaluate("1").await.is_err());
    }

    #[tokio::test]
    async fn orchestrated_intercept_over_http() {
        let server = challenge_server().await;
        let orchestrator =
            BypassOrchestrator::new(Arc::new(StaticPageEngine::new()), BypassTimeouts::default());
        let plan = SessionPlan::new(Duration::from_secs(5))
            .with_intercept(compile_patterns(&["*/file.zip"]));

        let result = tokio::time::timeout(
            Duration::from_secs(4),
            orchestrator.run(
                &format!("{}/challenge", server.uri()),
                "vimms",
                &plan,
                &CancellationToken::new(),
            ),
        )
        .await
        .expect("intercept should not wait for the full settle delay");

        assert!(result.success, "{:?}", result.error);
        assert!(result.final_url.unwrap().ends_with("/file.zip"));
        assert_eq!(result.cookies.as_deref(), Some("cf_clearance=abc"));
    }
}
