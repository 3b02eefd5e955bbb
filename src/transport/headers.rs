//! Identifying-header injection stage.

use async_trait::async_trait;
use http::header::REFERER;
use http::{HeaderMap, HeaderValue};
use url::Url;

use super::{HttpRequest, HttpResponse, Interceptor, Next, TransportError};

/// Adds the configured headers to every request that does not already carry
/// them. A header the caller set is left untouched.
#[derive(Debug, Clone, Default)]
pub struct HeadersInterceptor {
    headers: HeaderMap,
    referer: Option<RefererRule>,
}

impl HeadersInterceptor {
    pub fn new(headers: HeaderMap) -> Self {
        Self {
            headers,
            referer: None,
        }
    }

    pub fn with_referer(mut self, rule: RefererRule) -> Self {
        self.referer = Some(rule);
        self
    }

    fn apply(&self, request: &mut HttpRequest) {
        for name in self.headers.keys() {
            if request.headers.contains_key(name) {
                continue;
            }
            for value in self.headers.get_all(name) {
                request.headers.append(name.clone(), value.clone());
            }
        }

        if !request.headers.contains_key(REFERER)
            && let Some(rule) = &self.referer
            && let Some(referer) = rule.referer_for(&request.url)
            && let Ok(value) = HeaderValue::from_str(&referer)
        {
            request.headers.insert(REFERER, value);
        }
    }
}

#[async_trait]
impl Interceptor for HeadersInterceptor {
    fn name(&self) -> &'static str {
        "headers"
    }

    async fn intercept(
        &self,
        mut request: HttpRequest,
        next: Next<'_>,
    ) -> Result<HttpResponse, TransportError> {
        self.apply(&mut request);
        next.run(request).await
    }
}

/// Derives a `Referer` from the item id embedded in a request URL.
///
/// The pattern contains an `{id}` placeholder. The id is taken from the `id`
/// query parameter, or from the last path segment when it is purely numeric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefererRule {
    pattern: String,
}

impl RefererRule {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
        }
    }

    pub fn referer_for(&self, url: &Url) -> Option<String> {
        let id = url
            .query_pairs()
            .find(|(key, _)| key == "id")
            .map(|(_, value)| value.into_owned())
            .filter(|value| !value.is_empty())
            .or_else(|| {
                url.path_segments()?
                    .filter(|segment| !segment.is_empty())
                    .next_back()
                    .filter(|segment| segment.chars().all(|c| c.is_ascii_digit()))
                    .map(str::to_string)
            })?;

        Some(self.pattern.replace("{id}", &id))
    }
}
