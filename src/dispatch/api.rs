//! `api` sources: no code runs, the request is mapped onto the endpoints of
//! the source's `api_config.json`, as captured at install time, and issued
//! through its own client.

use async_trait::async_trait;
use serde_json::{Map, Value};
use url::Url;

use super::{AdapterContext, AdapterError, SourceAdapter, SourceRequest};
use crate::registry::{API_CONFIG_FILE, Endpoint, ManifestError, RegistryEntry, SourceKind};
use crate::transport::{HttpRequest, Idempotency};

#[derive(Debug, Default)]
pub struct ApiAdapter;

impl ApiAdapter {
    pub fn new() -> Self {
        Self
    }
}

/// Substitute `{name}` placeholders in `template` with parameters, removing
/// the ones used so they are not sent twice.
fn fill_path(template: &str, params: &mut Map<String, Value>) -> Result<String, AdapterError> {
    let mut path = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        let Some(len) = rest[start..].find('}') else {
            break;
        };
        let name = &rest[start + 1..start + len];
        let value = params
            .remove(name)
            .and_then(|value| scalar(&value))
            .ok_or_else(|| AdapterError::Protocol(format!("missing path parameter '{name}'")))?;
        path.push_str(&rest[..start]);
        let encoded: String = url::form_urlencoded::byte_serialize(value.as_bytes()).collect();
        path.push_str(&encoded.replace('+', "%20"));
        rest = &rest[start + len + 1..];
    }
    path.push_str(rest);
    Ok(path)
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

fn endpoint_url(base_url: &Url, path: &str) -> Result<Url, AdapterError> {
    let mut base = base_url.clone();
    if !base.path().ends_with('/') {
        let with_slash = format!("{}/", base.path());
        base.set_path(&with_slash);
    }
    base.join(path.trim_start_matches('/'))
        .map_err(|err| AdapterError::Protocol(format!("invalid endpoint path '{path}': {err}")))
}

fn build_request(
    endpoint: &Endpoint,
    mut url: Url,
    params: Map<String, Value>,
) -> Result<HttpRequest, AdapterError> {
    let method = endpoint.http_method().map_err(AdapterError::Protocol)?;

    if endpoint.sends_body() {
        let idempotency = if endpoint.idempotent == Some(true) {
            Idempotency::Idempotent
        } else {
            Idempotency::NonIdempotent
        };
        return Ok(HttpRequest::new(method, url).with_json(&params, idempotency)?);
    }

    {
        let mut query = url.query_pairs_mut();
        for (name, value) in &params {
            match value {
                Value::Array(items) => {
                    for item in items.iter().filter_map(scalar) {
                        query.append_pair(name, &item);
                    }
                }
                other => {
                    if let Some(text) = scalar(other) {
                        query.append_pair(name, &text);
                    }
                }
            }
        }
    }
    if url.query() == Some("") {
        url.set_query(None);
    }
    Ok(HttpRequest::new(method, url))
}

#[async_trait]
impl SourceAdapter for ApiAdapter {
    fn name(&self) -> &'static str {
        "api"
    }

    async fn execute(
        &self,
        entry: &RegistryEntry,
        request: &SourceRequest,
        ctx: &AdapterContext,
    ) -> Result<Value, AdapterError> {
        let SourceKind::Api { base_url } = &entry.metadata.kind else {
            return Err(AdapterError::Protocol(format!(
                "{} is not an api source",
                entry.id()
            )));
        };
        let config = entry.api_config.as_deref().ok_or_else(|| {
            ManifestError::MissingFile(entry.install_dir().join(API_CONFIG_FILE))
        })?;
        let endpoint = config
            .endpoints
            .get(request.method())
            .ok_or_else(|| AdapterError::Unsupported(request.method().to_string()))?;

        let mut params = request.params();
        let path = fill_path(&endpoint.path, &mut params)?;
        let http_request = build_request(endpoint, endpoint_url(base_url, &path)?, params)?;

        let client = ctx.services.create_http_client(entry.id(), &config.http)?;
        let response = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(AdapterError::Cancelled),
            response = client.send(http_request) => response?,
        };

        if !response.is_success() {
            return Err(AdapterError::Status {
                status: response.status,
                url: response.url.to_string(),
            });
        }
        if response.body.is_empty() {
            return Ok(Value::Null);
        }
        Ok(response.json()?)
    }
}
