//! Serving capability requests sent by source processes.
//!
//! A child never talks to the network itself; `http`, `bypass` and
//! `extract` are executed here through [`SourceServices`](crate::services::SourceServices),
//! so every request a child makes still runs through the interceptor chain.

use http::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use super::AdapterContext;
use crate::services::{CloudflareBypassConfig, HttpClientConfig, WebViewConfig};
use crate::transport::{HeaderEntry, HttpRequest, Idempotency};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HttpParams {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: Vec<HeaderEntry>,
    body: Option<String>,
    /// Required whenever `body` is set.
    idempotent: Option<bool>,
    #[serde(default)]
    client: HttpClientConfig,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Serialize)]
struct HttpAnswer {
    status: u16,
    url: String,
    headers: Vec<HeaderEntry>,
    body: String,
}

#[derive(Debug, Deserialize)]
struct SessionParams<C> {
    url: String,
    #[serde(default)]
    config: C,
}

/// Execute capability `op` for `source_id`. Errors are returned as text for
/// the child, prefixed with their kind.
pub async fn serve(
    op: &str,
    params: Value,
    source_id: &str,
    ctx: &AdapterContext,
) -> Result<Value, String> {
    match op {
        "http" => http(parse(params)?, source_id, ctx).await,
        "bypass" => {
            let params: SessionParams<CloudflareBypassConfig> = parse(params)?;
            let result = ctx
                .services
                .bypass_cloudflare(&params.url, source_id, &params.config, &ctx.cancel)
                .await;
            serde_json::to_value(result).map_err(|err| err.to_string())
        }
        "extract" => {
            let params: SessionParams<WebViewConfig> = parse(params)?;
            let result = ctx
                .services
                .extract_url_from_webview(&params.url, source_id, &params.config, &ctx.cancel)
                .await;
            serde_json::to_value(result).map_err(|err| err.to_string())
        }
        other => Err(format!("unsupported capability '{other}'")),
    }
}

fn parse<T: DeserializeOwned>(params: Value) -> Result<T, String> {
    serde_json::from_value(params).map_err(|err| format!("invalid capability params: {err}"))
}

async fn http(params: HttpParams, source_id: &str, ctx: &AdapterContext) -> Result<Value, String> {
    let url = Url::parse(&params.url).map_err(|err| format!("invalid url: {err}"))?;
    let method = Method::from_bytes(params.method.to_ascii_uppercase().as_bytes())
        .map_err(|_| format!("invalid method '{}'", params.method))?;

    let mut request = HttpRequest::new(method, url);
    for header in &params.headers {
        request = request
            .with_header(&header.name, &header.value)
            .map_err(|err| err.to_string())?;
    }
    if let Some(body) = params.body {
        let idempotency = match params.idempotent {
            Some(true) => Idempotency::Idempotent,
            Some(false) => Idempotency::NonIdempotent,
            None => return Err("requests with a body must declare 'idempotent'".to_string()),
        };
        request = request.with_body(body, idempotency);
    }

    let client = ctx
        .services
        .create_http_client(source_id, &params.client)
        .map_err(|err| format!("{}: {}", err.kind(), err))?;
    let response = client
        .send(request)
        .await
        .map_err(|err| format!("{}: {}", err.kind(), err))?;

    let headers = response
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| HeaderEntry::new(name.as_str(), value))
        })
        .collect();
    let answer = HttpAnswer {
        status: response.status,
        url: response.url.to_string(),
        headers,
        body: response.text(),
    };
    serde_json::to_value(answer).map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{body_string, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::dispatch::test_support;
    use crate::modules::cancel::CancellationToken;

    fn ctx() -> AdapterContext {
        AdapterContext {
            services: test_support::services(),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn http_capability_returns_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/lookup"))
            .and(body_string("q=metroid"))
            .respond_with(ResponseTemplate::new(200).set_body_string("found"))
            .mount(&server)
            .await;

        let answer = serve(
            "http",
            json!({
                "url": format!("{}/lookup", server.uri()),
                "method": "post",
                "body": "q=metroid",
                "idempotent": true
            }),
            "alpha",
            &ctx(),
        )
        .await
        .unwrap();

        assert_eq!(answer["status"], 200);
        assert_eq!(answer["body"], "found");
    }

    #[tokio::test]
    async fn body_without_idempotency_is_refused() {
        let err = serve(
            "http",
            json!({"url": "http://127.0.0.1:9/x", "method": "POST", "body": "{}"}),
            "alpha",
            &ctx(),
        )
        .await
        .unwrap_err();
        assert!(err.contains("idempotent"));
    }

    #[tokio::test]
    async fn unknown_capability_is_an_answer_not_a_crash() {
        let err = serve("shell", json!({}), "alpha", &ctx()).await.unwrap_err();
        assert!(err.contains("shell"));
    }
}
