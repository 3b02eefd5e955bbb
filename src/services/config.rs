//! Per-call capability configs built by adapters.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::browser::{SessionPlan, compile_patterns};
use crate::transport::HeaderEntry;

/// Transport policy for one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpClientConfig {
    pub requires_ssl_trust_all: bool,
    pub requires_cookie_jar: bool,
    /// Applied over the engine defaults. Names are case-insensitive and a
    /// later entry wins.
    pub custom_headers: Vec<HeaderEntry>,
    pub timeout_seconds: u64,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            requires_ssl_trust_all: false,
            requires_cookie_jar: false,
            custom_headers: Vec::new(),
            timeout_seconds: 30,
        }
    }
}

impl HttpClientConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1))
    }
}

/// Settings for getting past a challenge page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CloudflareBypassConfig {
    /// Settle time after the page loaded, before extraction.
    pub delay_seconds: u64,
    /// Script run in the page to resolve the final resource URL.
    pub extract_url_pattern: Option<String>,
    /// Cookie domain allow-list. Absent means every cookie of the session.
    pub cookie_domains: Option<Vec<String>>,
}

impl From<&CloudflareBypassConfig> for SessionPlan {
    fn from(config: &CloudflareBypassConfig) -> Self {
        let mut plan = SessionPlan::new(Duration::from_secs(config.delay_seconds))
            .with_cookie_domains(config.cookie_domains.clone());
        if let Some(script) = non_blank(&config.extract_url_pattern) {
            plan = plan.with_script(script);
        }
        plan
    }
}

/// Settings for pulling a URL and cookies out of an arbitrary page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebViewConfig {
    pub delay_seconds: u64,
    pub extract_url_script: Option<String>,
    /// Observed URLs matching one of these end the session early.
    pub intercept_patterns: Vec<String>,
    pub requires_cookie_extraction: bool,
    /// Without a script, look for a download link in the page instead of
    /// taking its current URL.
    pub scan_links: bool,
}

impl Default for WebViewConfig {
    fn default() -> Self {
        Self {
            delay_seconds: 0,
            extract_url_script: None,
            intercept_patterns: Vec::new(),
            requires_cookie_extraction: true,
            scan_links: false,
        }
    }
}

impl From<&WebViewConfig> for SessionPlan {
    fn from(config: &WebViewConfig) -> Self {
        let intercept = compile_patterns(&config.intercept_patterns);
        let mut plan = SessionPlan::new(Duration::from_secs(config.delay_seconds))
            .with_cookie_harvest(config.requires_cookie_extraction);

        if let Some(script) = non_blank(&config.extract_url_script) {
            plan = plan.with_script(script);
        } else if config.scan_links {
            plan = plan.with_link_scan(intercept.clone());
        }
        plan.with_intercept(intercept)
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
}
