//! Per-source cookie jars.
//!
//! Every source gets its own in-memory jar for the lifetime of the process.
//! Jars are never shared between source ids, even when two sources talk to
//! the same host.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use http::HeaderValue;
use reqwest::cookie::{CookieStore, Jar};
use url::Url;

/// Cookie jar owned by exactly one source.
#[derive(Debug)]
pub struct SourceCookieJar {
    source_id: String,
    jar: Jar,
}

impl SourceCookieJar {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            jar: Jar::default(),
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Store a single `Set-Cookie` style value for `url`.
    pub fn add_cookie_str(&self, cookie: &str, url: &Url) {
        self.jar.add_cookie_str(cookie, url);
    }

    /// Store every `name=value` pair of a `Cookie` header value for `url`.
    ///
    /// This is how cookies harvested by a bypass session are seeded into the
    /// jar used for the follow-up download.
    pub fn add_cookie_header(&self, header: &str, url: &Url) {
        for pair in header.split(';').map(str::trim).filter(|pair| pair.contains('=')) {
            self.jar.add_cookie_str(pair, url);
        }
    }

    /// Serialized `Cookie` header the jar would send to `url`.
    pub fn cookie_header(&self, url: &Url) -> Option<String> {
        self.jar
            .cookies(url)
            .and_then(|value| value.to_str().ok().map(str::to_string))
    }
}

impl CookieStore for SourceCookieJar {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url) {
        self.jar.set_cookies(cookie_headers, url);
    }

    fn cookies(&self, url: &Url) -> Option<HeaderValue> {
        self.jar.cookies(url)
    }
}

/// Hands out one jar per source id, creating it on first use.
#[derive(Debug, Default)]
pub struct CookieJarRegistry {
    jars: Mutex<HashMap<String, Arc<SourceCookieJar>>>,
}

impl CookieJarRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn jar_for(&self, source_id: &str) -> Arc<SourceCookieJar> {
        let mut guard = self.jars.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard
            .entry(source_id.to_string())
            .or_insert_with(|| Arc::new(SourceCookieJar::new(source_id)))
            .clone()
    }

    /// Drop the jar of an uninstalled source.
    pub fn remove(&self, source_id: &str) -> bool {
        let mut guard = self.jars.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.remove(source_id).is_some()
    }
}
