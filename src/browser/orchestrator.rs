//! Bypass state machine.
//!
//! ```text
//! Idle -> Navigating -> Settling -> Extracting -> Succeeded | Failed
//! ```
//!
//! Every state is bounded by its own limit and by the overall session limit,
//! and races a [`CancellationToken`]. An observed request matching one of the
//! plan's intercept patterns ends Settling early and skips URL extraction.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use url::Url;

use super::links::find_download_link;
use super::patterns::{UrlPattern, any_match, default_download_patterns};
use super::{
    BrowserCookie, BrowserEngine, BrowserError, BrowserSession, BypassError, BypassStage,
    BypassTimeouts, ExtractionResult, domain_matches,
};
use crate::modules::cancel::CancellationToken;
use crate::modules::events::{BypassEvent, EngineEvent, EventDispatcher};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// How the final URL is obtained once the page has settled.
#[derive(Debug, Clone)]
pub enum Extraction {
    /// Evaluate a script in the page and use its return value.
    Script(String),
    /// Scan the page for `#download-link` or the first anchor matching a pattern.
    LinkScan(Vec<UrlPattern>),
    /// Use the page's current URL.
    CurrentUrl,
}

/// What one session should do, derived from a bypass or WebView config.
#[derive(Debug, Clone)]
pub struct SessionPlan {
    pub settle: Duration,
    pub extraction: Extraction,
    pub intercept: Vec<UrlPattern>,
    pub harvest_cookies: bool,
    /// Allow-list of cookie domains. `None` keeps every cookie of the session.
    pub cookie_domains: Option<Vec<String>>,
}

impl SessionPlan {
    pub fn new(settle: Duration) -> Self {
        Self {
            settle,
            extraction: Extraction::CurrentUrl,
            intercept: Vec::new(),
            harvest_cookies: true,
            cookie_domains: None,
        }
    }

    pub fn with_script(mut self, script: impl Into<String>) -> Self {
        self.extraction = Extraction::Script(script.into());
        self
    }

    /// Link scan using `patterns`, or the default archive patterns when empty.
    pub fn with_link_scan(mut self, patterns: Vec<UrlPattern>) -> Self {
        let patterns = if patterns.is_empty() {
            default_download_patterns()
        } else {
            patterns
        };
        self.extraction = Extraction::LinkScan(patterns);
        self
    }

    pub fn with_intercept(mut self, patterns: Vec<UrlPattern>) -> Self {
        self.intercept = patterns;
        self
    }

    pub fn with_cookie_harvest(mut self, harvest: bool) -> Self {
        self.harvest_cookies = harvest;
        self
    }

    pub fn with_cookie_domains(mut self, domains: Option<Vec<String>>) -> Self {
        self.cookie_domains = domains.filter(|domains| !domains.is_empty());
        self
    }
}

/// Runs bypass sessions on a [`BrowserEngine`].
///
/// The orchestrator never retries: a failed session is reported once.
#[derive(Clone)]
pub struct BypassOrchestrator {
    engine: Arc<dyn BrowserEngine>,
    timeouts: BypassTimeouts,
    events: Option<Arc<EventDispatcher>>,
}

impl BypassOrchestrator {
    pub fn new(engine: Arc<dyn BrowserEngine>, timeouts: BypassTimeouts) -> Self {
        Self {
            engine,
            timeouts,
            events: None,
        }
    }

    pub fn with_events(mut self, events: Arc<EventDispatcher>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    pub fn timeouts(&self) -> &BypassTimeouts {
        &self.timeouts
    }

    /// Drive one session for `url` on behalf of `source_id`.
    ///
    /// Never returns an error: every failure, timeout or cancellation is
    /// folded into a failed [`ExtractionResult`].
    pub async fn run(
        &self,
        url: &str,
        source_id: &str,
        plan: &SessionPlan,
        cancel: &CancellationToken,
    ) -> ExtractionResult {
        let started = Instant::now();
        log::debug!(
            "bypass {} for {}: {} -> {} ({} engine)",
            url,
            source_id,
            BypassStage::Idle,
            BypassStage::Navigating,
            self.engine.name()
        );

        let result = match self.drive(url, source_id, plan, cancel, started).await {
            Ok((final_url, cookies)) => ExtractionResult::succeeded(url, &final_url, cookies),
            Err(failure) => ExtractionResult::failed(url, failure),
        };

        self.report(url, source_id, &result, started.elapsed());
        result
    }

    async fn drive(
        &self,
        url: &str,
        source_id: &str,
        plan: &SessionPlan,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<(Url, String), BypassError> {
        let target = Url::parse(url).map_err(|err| BypassError::Failed {
            stage: BypassStage::Navigating,
            message: format!("invalid url '{url}': {err}"),
        })?;
        let deadline = started + self.timeouts.overall();

        let mut session = self
            .guarded(
                BypassStage::Navigating,
                self.timeouts.navigation(),
                deadline,
                cancel,
                self.engine.open_session(source_id),
            )
            .await?;

        let outcome = self
            .drive_session(session.as_mut(), &target, plan, cancel, deadline)
            .await;

        if tokio::time::timeout(CLOSE_TIMEOUT, session.close()).await.is_err() {
            log::warn!("closing bypass session for {} timed out", source_id);
        }
        outcome
    }

    async fn drive_session(
        &self,
        session: &mut dyn BrowserSession,
        target: &Url,
        plan: &SessionPlan,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<(Url, String), BypassError> {
        self.guarded(
            BypassStage::Navigating,
            self.timeouts.navigation(),
            deadline,
            cancel,
            session.navigate(target),
        )
        .await?;

        let intercepted = self.settle(session, plan, cancel, deadline).await?;

        let final_url = match intercepted {
            Some(url) => url,
            None => self
                .guarded(
                    BypassStage::Extracting,
                    self.timeouts.extraction(),
                    deadline,
                    cancel,
                    resolve_final_url(session, &plan.extraction),
                )
                .await?
                .ok_or_else(|| BypassError::Failed {
                    stage: BypassStage::Extracting,
                    message: "no final url found in page".to_string(),
                })?,
        };

        let cookies = if plan.harvest_cookies {
            let harvested = self
                .guarded(
                    BypassStage::Extracting,
                    self.timeouts.extraction(),
                    deadline,
                    cancel,
                    session.cookies(),
                )
                .await?;
            cookie_header(&harvested, target, &final_url, plan.cookie_domains.as_deref())
        } else {
            String::new()
        };

        Ok((final_url, cookies))
    }

    /// Wait out the settle delay. Returns the first observed URL matching an
    /// intercept pattern, if one shows up before the delay ends.
    async fn settle(
        &self,
        session: &mut dyn BrowserSession,
        plan: &SessionPlan,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<Option<Url>, BypassError> {
        let entered = Instant::now();
        let settle_end = entered + plan.settle;
        let wake = settle_end.min(deadline);
        let mut observing = !plan.intercept.is_empty();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(BypassError::Cancelled { stage: BypassStage::Settling });
                }
                observed = session.next_observed_url(), if observing => match observed {
                    Some(url) => {
                        if let Some(pattern) = any_match(&plan.intercept, url.as_str()) {
                            log::debug!(
                                "intercepted {} via '{}' after {:?}",
                                url,
                                pattern.as_str(),
                                entered.elapsed()
                            );
                            return Ok(Some(url));
                        }
                    }
                    None => observing = false,
                },
                _ = tokio::time::sleep_until(wake) => {
                    if settle_end > deadline {
                        return Err(BypassError::Timeout {
                            stage: BypassStage::Settling,
                            elapsed: entered.elapsed(),
                        });
                    }
                    return Ok(None);
                }
            }
        }
    }

    /// Run `work` for `stage`, bounded by `limit` and the session deadline.
    async fn guarded<T, F>(
        &self,
        stage: BypassStage,
        limit: Duration,
        deadline: Instant,
        cancel: &CancellationToken,
        work: F,
    ) -> Result<T, BypassError>
    where
        F: Future<Output = Result<T, BrowserError>>,
    {
        let entered = Instant::now();
        let stage_deadline = (entered + limit).min(deadline);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BypassError::Cancelled { stage }),
            outcome = tokio::time::timeout_at(stage_deadline, work) => match outcome {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(BypassError::Failed {
                    stage,
                    message: err.to_string(),
                }),
                Err(_) => Err(BypassError::Timeout {
                    stage,
                    elapsed: entered.elapsed(),
                }),
            },
        }
    }

    fn report(&self, url: &str, source_id: &str, result: &ExtractionResult, elapsed: Duration) {
        let detail = match (&result.final_url, &result.error) {
            (Some(final_url), _) => final_url.clone(),
            (None, Some(error)) => error.clone(),
            (None, None) => String::new(),
        };

        match &self.events {
            Some(events) => events.dispatch(EngineEvent::Bypass(BypassEvent {
                source_id: source_id.to_string(),
                url: url.to_string(),
                success: result.success,
                detail,
                elapsed,
                timestamp: Utc::now(),
            })),
            None if result.success => {
                log::info!("bypass {} for {} -> {}", url, source_id, detail)
            }
            None => log::warn!("bypass {} for {} failed: {}", url, source_id, detail),
        }
    }
}

async fn resolve_final_url(
    session: &mut dyn BrowserSession,
    extraction: &Extraction,
) -> Result<Option<Url>, BrowserError> {
    match extraction {
        Extraction::Script(script) => {
            let Some(value) = session.evaluate(script).await? else {
                return Ok(None);
            };
            let value = value.trim().trim_matches('"');
            if value.is_empty() || value == "null" {
                return Ok(None);
            }
            match Url::parse(value) {
                Ok(url) => Ok(Some(url)),
                Err(_) => {
                    let base = session.current_url().await?;
                    Ok(base.join(value).ok())
                }
            }
        }
        Extraction::LinkScan(patterns) => {
            let page_url = session.current_url().await?;
            let html = session.page_html().await?;
            Ok(find_download_link(&html, &page_url, patterns))
        }
        Extraction::CurrentUrl => session.current_url().await.map(Some),
    }
}

/// Serialize harvested cookies in `Cookie` header form.
///
/// With an allow-list only cookies whose domain falls under a listed domain
/// are kept. Without one every cookie is kept, those of the original host
/// first, then those of the final host, then the rest. Duplicate pairs are
/// dropped.
pub fn cookie_header(
    cookies: &[BrowserCookie],
    original: &Url,
    final_url: &Url,
    allow: Option<&[String]>,
) -> String {
    let host_of = |cookie: &BrowserCookie| cookie.domain.trim_start_matches('.').to_string();

    let mut ordered: Vec<&BrowserCookie> = match allow {
        Some(domains) => cookies
            .iter()
            .filter(|cookie| {
                domains
                    .iter()
                    .any(|domain| domain_matches(domain, &host_of(*cookie)))
            })
            .collect(),
        None => {
            let rank = |cookie: &BrowserCookie| {
                let on = |url: &Url| {
                    url.host_str()
                        .is_some_and(|host| cookie.matches_host(host))
                };
                if on(original) {
                    0
                } else if on(final_url) {
                    1
                } else {
                    2
                }
            };
            let mut all: Vec<&BrowserCookie> = cookies.iter().collect();
            all.sort_by_key(|cookie| rank(*cookie));
            all
        }
    };

    let mut seen = HashSet::new();
    ordered.retain(|cookie| seen.insert(cookie.pair()));
    ordered
        .iter()
        .map(|cookie| cookie.pair())
        .collect::<Vec<_>>()
        .join("; ")
}
