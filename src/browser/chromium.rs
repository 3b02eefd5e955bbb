//! Headless Chromium engine (feature `chromium`).
//!
//! Each session runs in its own incognito browser context, so cookies and
//! storage never cross between sources. Requests are observed through the
//! `Network.requestWillBeSent` event.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::EventRequestWillBeSent;
use chromiumoxide::cdp::browser_protocol::storage::GetCookiesParams;
use chromiumoxide::cdp::browser_protocol::target::{
    BrowserContextId, CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::page::Page;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

use super::{BrowserCookie, BrowserEngine, BrowserError, BrowserSession};

pub struct ChromiumEngine {
    browser: Arc<Browser>,
    handler: JoinHandle<()>,
}

impl ChromiumEngine {
    /// Launch headless Chromium. Without `executable` the binary is looked
    /// up the way `chromiumoxide` does by default.
    pub async fn launch(executable: Option<PathBuf>) -> Result<Self, BrowserError> {
        let mut builder = BrowserConfig::builder()
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions");
        if let Some(path) = executable {
            builder = builder.chrome_executable(path);
        }
        let config = builder.build().map_err(BrowserError::Unavailable)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|err| BrowserError::Unavailable(err.to_string()))?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    log::debug!("chromium handler: {}", err);
                }
            }
        });

        Ok(Self {
            browser: Arc::new(browser),
            handler,
        })
    }
}

impl Drop for ChromiumEngine {
    fn drop(&mut self) {
        self.handler.abort();
    }
}

fn protocol(err: impl std::fmt::Display) -> BrowserError {
    BrowserError::Protocol(err.to_string())
}

#[async_trait]
impl BrowserEngine for ChromiumEngine {
    fn name(&self) -> &'static str {
        "chromium"
    }

    async fn open_session(&self, source_id: &str) -> Result<Box<dyn BrowserSession>, BrowserError> {
        let context_id = self
            .browser
            .execute(CreateBrowserContextParams::default())
            .await
            .map_err(protocol)?
            .result
            .browser_context_id;

        let target = CreateTargetParams::builder()
            .url("about:blank")
            .browser_context_id(context_id.clone())
            .build()
            .map_err(BrowserError::Protocol)?;
        let page = self.browser.new_page(target).await.map_err(protocol)?;

        let mut requests = page
            .event_listener::<EventRequestWillBeSent>()
            .await
            .map_err(protocol)?;
        let (sender, observed) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = requests.next().await {
                if let Ok(url) = Url::parse(&event.request.url)
                    && sender.send(url).is_err()
                {
                    break;
                }
            }
        });

        log::debug!("chromium context {:?} opened for {}", context_id, source_id);
        Ok(Box::new(ChromiumSession {
            browser: self.browser.clone(),
            context_id,
            page,
            observed,
            forwarder,
        }))
    }
}

struct ChromiumSession {
    browser: Arc<Browser>,
    context_id: BrowserContextId,
    page: Page,
    observed: mpsc::UnboundedReceiver<Url>,
    forwarder: JoinHandle<()>,
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    async fn navigate(&mut self, url: &Url) -> Result<(), BrowserError> {
        self.page
            .goto(url.as_str())
            .await
            .map_err(|err| BrowserError::Navigation(err.to_string()))?;
        Ok(())
    }

    async fn next_observed_url(&mut self) -> Option<Url> {
        self.observed.recv().await
    }

    async fn current_url(&mut self) -> Result<Url, BrowserError> {
        let current = self
            .page
            .url()
            .await
            .map_err(protocol)?
            .ok_or_else(|| BrowserError::Navigation("page has no url".into()))?;
        Url::parse(&current).map_err(protocol)
    }

    async fn evaluate(&mut self, script: &str) -> Result<Option<String>, BrowserError> {
        let value: serde_json::Value = self
            .page
            .evaluate(script)
            .await
            .map_err(|err| BrowserError::Script(err.to_string()))?
            .into_value()
            .map_err(|err| BrowserError::Script(err.to_string()))?;

        Ok(match value {
            serde_json::Value::Null => None,
            serde_json::Value::String(text) if text.is_empty() => None,
            serde_json::Value::String(text) => Some(text),
            other => Some(other.to_string()),
        })
    }

    async fn page_html(&mut self) -> Result<String, BrowserError> {
        self.page.content().await.map_err(protocol)
    }

    async fn cookies(&mut self) -> Result<Vec<BrowserCookie>, BrowserError> {
        let mut params = GetCookiesParams::default();
        params.browser_context_id = Some(self.context_id.clone());
        let cookies = self
            .browser
            .execute(params)
            .await
            .map_err(protocol)?
            .result
            .cookies;

        Ok(cookies
            .into_iter()
            .map(|cookie| BrowserCookie {
                name: cookie.name,
                value: cookie.value,
                domain: cookie.domain,
                path: cookie.path,
            })
            .collect())
    }

    async fn close(&mut self) {
        self.forwarder.abort();
        if let Err(err) = self.page.clone().close().await {
            log::debug!("closing chromium page: {}", err);
        }
        if let Err(err) = self
            .browser
            .execute(DisposeBrowserContextParams::new(self.context_id.clone()))
            .await
        {
            log::debug!("disposing chromium context: {}", err);
        }
    }
}
