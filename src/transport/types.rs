//! Request/response representations shared by every interceptor and transport.

use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use super::TransportError;

/// Whether a request may be re-sent without risking duplicate side effects.
///
/// Body-bearing requests must state this explicitly; see
/// [`HttpRequest::with_body`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Idempotency {
    Idempotent,
    NonIdempotent,
}

impl Idempotency {
    /// Default for body-less requests, following RFC 9110 safe/idempotent methods.
    pub fn for_method(method: &Method) -> Self {
        match *method {
            Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE | Method::DELETE => {
                Idempotency::Idempotent
            }
            _ => Idempotency::NonIdempotent,
        }
    }
}

/// Outbound HTTP request travelling through the interceptor chain.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub idempotency: Idempotency,
    /// Per-attempt timeout; the transport default applies when absent.
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn new(method: Method, url: Url) -> Self {
        let idempotency = Idempotency::for_method(&method);
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            idempotency,
            timeout: None,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Attach a body. The idempotency flag is mandatory so a POST/PUT is
    /// never replayed by accident.
    pub fn with_body(mut self, body: impl Into<Bytes>, idempotency: Idempotency) -> Self {
        self.body = Some(body.into());
        self.idempotency = idempotency;
        self
    }

    /// JSON-encode `value` as the body and set `content-type`.
    pub fn with_json<T: Serialize + ?Sized>(
        self,
        value: &T,
        idempotency: Idempotency,
    ) -> Result<Self, TransportError> {
        let body = serde_json::to_vec(value)
            .map_err(|err| TransportError::InvalidRequest(err.to_string()))?;
        Ok(self
            .with_header_value(
                http::header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            )
            .with_body(body, idempotency))
    }

    pub fn with_header(self, name: &str, value: &str) -> Result<Self, TransportError> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| TransportError::InvalidHeader(name.to_string()))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| TransportError::InvalidHeader(name.as_str().to_string()))?;
        Ok(self.with_header_value(name, value))
    }

    pub fn with_header_value(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Replay is allowed for idempotent requests only.
    pub fn is_retry_safe(&self) -> bool {
        self.idempotency == Idempotency::Idempotent
    }
}

/// Fully read HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Final URL after redirects.
    pub url: Url,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, TransportError> {
        serde_json::from_slice(&self.body).map_err(|err| TransportError::Decode(err.to_string()))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

/// Header name/value pair as it appears in configuration and manifests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderEntry {
    pub name: String,
    pub value: String,
}

impl HeaderEntry {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Fold header entries into a map. Names are case-insensitive and a later
/// entry replaces an earlier one with the same name.
pub fn header_map_from_entries(entries: &[HeaderEntry]) -> Result<HeaderMap, TransportError> {
    let mut map = HeaderMap::new();
    for entry in entries {
        let name = HeaderName::from_bytes(entry.name.as_bytes())
            .map_err(|_| TransportError::InvalidHeader(entry.name.clone()))?;
        let value = HeaderValue::from_str(&entry.value)
            .map_err(|_| TransportError::InvalidHeader(entry.name.clone()))?;
        map.insert(name, value);
    }
    Ok(map)
}
