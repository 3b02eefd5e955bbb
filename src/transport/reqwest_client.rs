//! Reqwest-backed terminal transport.
//!
//! Converts between the shared request/response representations used by the
//! interceptor chain and `reqwest`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use super::{HttpRequest, HttpResponse, Transport, TransportError};
use crate::modules::cookies::SourceCookieJar;
use crate::modules::tls::TrustContext;

/// Terminal transport issuing requests with a `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
    timeout: Duration,
}

impl ReqwestTransport {
    pub fn builder() -> ReqwestTransportBuilder {
        ReqwestTransportBuilder::default()
    }

    /// Wrap an existing client. `timeout` applies when a request carries none.
    pub fn from_client(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[derive(Debug, Default)]
pub struct ReqwestTransportBuilder {
    timeout: Option<Duration>,
    cookie_jar: Option<Arc<SourceCookieJar>>,
    trust: Option<TrustContext>,
}

impl ReqwestTransportBuilder {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cookie_jar(mut self, jar: Arc<SourceCookieJar>) -> Self {
        self.cookie_jar = Some(jar);
        self
    }

    pub fn trust(mut self, trust: Option<TrustContext>) -> Self {
        self.trust = trust;
        self
    }

    pub fn build(self) -> Result<ReqwestTransport, TransportError> {
        let timeout = self.timeout.unwrap_or(Duration::from_secs(30));
        let mut builder = Client::builder().gzip(true).brotli(true);

        if let Some(jar) = self.cookie_jar {
            builder = builder.cookie_provider(jar);
        }
        if let Some(trust) = &self.trust {
            builder = trust.apply(builder);
        }

        let client = builder
            .build()
            .map_err(|err| TransportError::Build(err.to_string()))?;

        Ok(ReqwestTransport { client, timeout })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let timeout = request.timeout.unwrap_or(self.timeout);
        let mut builder = self
            .client
            .request(request.method, request.url)
            .headers(request.headers)
            .timeout(timeout);

        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|err| map_error(err, timeout))?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response
            .bytes()
            .await
            .map_err(|err| map_error(err, timeout))?;

        Ok(HttpResponse {
            status,
            headers,
            body,
            url,
        })
    }
}

fn map_error(err: reqwest::Error, timeout: Duration) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(timeout)
    } else if err.is_builder() {
        TransportError::InvalidRequest(err.to_string())
    } else if err.is_decode() {
        TransportError::Decode(err.to_string())
    } else {
        TransportError::Network(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use url::Url;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[tokio::test]
    async fn forwards_headers_and_reads_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/platforms"))
            .and(header("x-client", "romsource"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[\"snes\"]"))
            .mount(&server)
            .await;

        let transport = ReqwestTransport::builder().build().unwrap();
        let url = Url::parse(&format!("{}/platforms", server.uri())).unwrap();
        let response = transport
            .execute(
                HttpRequest::get(url)
                    .with_header("x-client", "romsource")
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.json::<Vec<String>>().unwrap(), vec!["snes"]);
    }

    #[tokio::test]
    async fn per_source_jar_receives_cookies() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200).insert_header("set-cookie", "session=s1; Path=/"),
            )
            .mount(&server)
            .await;

        let jar = Arc::new(SourceCookieJar::new("alpha"));
        let transport = ReqwestTransport::builder()
            .cookie_jar(jar.clone())
            .build()
            .unwrap();
        let url = Url::parse(&server.uri()).unwrap();
        transport.execute(HttpRequest::get(url.clone())).await.unwrap();

        assert_eq!(jar.cookie_header(&url).as_deref(), Some("session=s1"));
    }
}
