//! Browser automation used to get past challenge pages and to pull download
//! URLs and cookies out of rendered pages.
//!
//! The [`BypassOrchestrator`] drives any [`BrowserEngine`] through a fixed
//! state machine. Two engines ship with the crate: [`StaticPageEngine`], a
//! plain HTTP engine that follows redirects and meta refreshes, and, behind
//! the `chromium` feature, a headless Chromium engine.

pub mod links;
pub mod orchestrator;
pub mod patterns;
pub mod static_engine;

#[cfg(feature = "chromium")]
pub mod chromium;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::errors::ErrorKind;

pub use orchestrator::{BypassOrchestrator, Extraction, SessionPlan};
pub use patterns::{DEFAULT_DOWNLOAD_PATTERNS, UrlPattern, compile_patterns};
pub use static_engine::StaticPageEngine;

#[cfg(feature = "chromium")]
pub use chromium::ChromiumEngine;

/// Creates isolated browsing sessions.
#[async_trait]
pub trait BrowserEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Open a fresh context for `source_id`. Cookies and storage of one
    /// session are never visible to another.
    async fn open_session(&self, source_id: &str) -> Result<Box<dyn BrowserSession>, BrowserError>;
}

/// One isolated browsing context.
#[async_trait]
pub trait BrowserSession: Send {
    /// Load `url` and return once the initial document is available.
    async fn navigate(&mut self, url: &Url) -> Result<(), BrowserError>;

    /// Next navigation or sub-resource request observed since the last call.
    /// Returns `None` once the session can report no further requests.
    ///
    /// Must be cancel safe: dropping the future loses no observation.
    async fn next_observed_url(&mut self) -> Option<Url>;

    async fn current_url(&mut self) -> Result<Url, BrowserError>;

    /// Run `script` in the page. `Ok(None)` when it yields null, undefined or
    /// an empty string.
    async fn evaluate(&mut self, script: &str) -> Result<Option<String>, BrowserError>;

    async fn page_html(&mut self) -> Result<String, BrowserError>;

    /// Every cookie set during the session.
    async fn cookies(&mut self) -> Result<Vec<BrowserCookie>, BrowserError>;

    async fn close(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
}

impl BrowserCookie {
    /// RFC 6265 domain match of the cookie's domain against `host`.
    pub fn matches_host(&self, host: &str) -> bool {
        domain_matches(&self.domain, host)
    }

    pub fn pair(&self) -> String {
        format!("{}={}", self.name, self.value)
    }
}

/// `host` equals `domain` or is a subdomain of it. A leading dot is ignored.
pub fn domain_matches(domain: &str, host: &str) -> bool {
    let domain = domain.trim_start_matches('.').to_ascii_lowercase();
    let host = host.to_ascii_lowercase();
    !domain.is_empty()
        && (host == domain
            || (host.ends_with(&domain) && host[..host.len() - domain.len()].ends_with('.')))
}

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("script evaluation failed: {0}")]
    Script(String),
    #[error("operation not supported by the {0} engine")]
    Unsupported(&'static str),
    #[error("browser unavailable: {0}")]
    Unavailable(String),
    #[error("browser protocol error: {0}")]
    Protocol(String),
}

/// Stages of a bypass session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BypassStage {
    Idle,
    Navigating,
    Settling,
    Extracting,
    Succeeded,
    Failed,
}

impl fmt::Display for BypassStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BypassStage::Idle => "idle",
            BypassStage::Navigating => "navigating",
            BypassStage::Settling => "settling",
            BypassStage::Extracting => "extracting",
            BypassStage::Succeeded => "succeeded",
            BypassStage::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Why a bypass session ended in `Failed`.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BypassError {
    #[error("bypass failed while {stage}: {message}")]
    Failed { stage: BypassStage, message: String },
    #[error("bypass timed out while {stage} after {elapsed:?}")]
    Timeout {
        stage: BypassStage,
        elapsed: Duration,
    },
    #[error("bypass cancelled while {stage}")]
    Cancelled { stage: BypassStage },
}

impl BypassError {
    pub fn stage(&self) -> BypassStage {
        match self {
            BypassError::Failed { stage, .. }
            | BypassError::Timeout { stage, .. }
            | BypassError::Cancelled { stage } => *stage,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BypassError::Failed { .. } => ErrorKind::BypassFailed,
            BypassError::Timeout { .. } => ErrorKind::Timeout,
            BypassError::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }
}

/// Outcome of a bypass or WebView extraction.
///
/// On success `final_url` and `cookies` are set and `error` is empty. On
/// failure only `original_url`, `error` and `failure` are set.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionResult {
    pub success: bool,
    pub final_url: Option<String>,
    /// `Cookie` header form, `name=value` pairs joined by `"; "`.
    pub cookies: Option<String>,
    pub original_url: String,
    pub error: Option<String>,
    #[serde(skip)]
    pub failure: Option<BypassError>,
}

pub type BypassResult = ExtractionResult;

impl ExtractionResult {
    pub fn succeeded(original_url: &str, final_url: &Url, cookies: String) -> Self {
        Self {
            success: true,
            final_url: Some(final_url.to_string()),
            cookies: Some(cookies),
            original_url: original_url.to_string(),
            error: None,
            failure: None,
        }
    }

    pub fn failed(original_url: &str, failure: BypassError) -> Self {
        Self {
            success: false,
            final_url: None,
            cookies: None,
            original_url: original_url.to_string(),
            error: Some(failure.to_string()),
            failure: Some(failure),
        }
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        self.failure.as_ref().map(BypassError::kind)
    }
}

/// Per-state limits for a bypass session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BypassTimeouts {
    pub navigation_seconds: u64,
    pub extraction_seconds: u64,
    pub overall_seconds: u64,
}

impl Default for BypassTimeouts {
    fn default() -> Self {
        Self {
            navigation_seconds: 30,
            extraction_seconds: 10,
            overall_seconds: 120,
        }
    }
}

impl BypassTimeouts {
    pub fn navigation(&self) -> Duration {
        Duration::from_secs(self.navigation_seconds)
    }

    pub fn extraction(&self) -> Duration {
        Duration::from_secs(self.extraction_seconds)
    }

    pub fn overall(&self) -> Duration {
        Duration::from_secs(self.overall_seconds)
    }
}
