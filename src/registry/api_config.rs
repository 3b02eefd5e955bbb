//! Declarative REST description shipped by `api` sources (`api_config.json`).
//!
//! ```json
//! {
//!   "endpoints": {
//!     "searchRoms":   { "path": "/search" },
//!     "getEntry":     { "path": "/entries/{slug}" },
//!     "getPlatforms": { "path": "/platforms" },
//!     "lookup":       { "method": "POST", "path": "/lookup", "idempotent": true }
//!   },
//!   "http": { "customHeaders": [{ "name": "X-Api-Key", "value": "..." }] }
//! }
//! ```

use std::collections::HashMap;
use std::path::Path;

use http::Method;
use serde::Deserialize;

use super::manifest::ManifestError;
use crate::services::HttpClientConfig;

pub const API_CONFIG_FILE: &str = "api_config.json";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfig {
    /// Keyed by request method name (`searchRoms`, `getEntry`, ...).
    pub endpoints: HashMap<String, Endpoint>,
    #[serde(default)]
    pub http: HttpClientConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    #[serde(default = "default_method")]
    pub method: String,
    /// Joined onto `baseUrl`. `{name}` placeholders take request parameters.
    pub path: String,
    /// Mandatory for body-bearing methods.
    pub idempotent: Option<bool>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl Endpoint {
    pub fn http_method(&self) -> Result<Method, String> {
        Method::from_bytes(self.method.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| format!("invalid http method '{}'", self.method))
    }

    /// Whether parameters travel as a JSON body instead of the query string.
    pub fn sends_body(&self) -> bool {
        matches!(
            self.http_method(),
            Ok(Method::POST) | Ok(Method::PUT) | Ok(Method::PATCH)
        )
    }
}

impl ApiConfig {
    pub fn parse(json: &str) -> Result<Self, String> {
        let config: ApiConfig = serde_json::from_str(json).map_err(|err| err.to_string())?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        for (name, endpoint) in &self.endpoints {
            endpoint
                .http_method()
                .map_err(|err| format!("endpoint '{name}': {err}"))?;
            if endpoint.sends_body() && endpoint.idempotent.is_none() {
                return Err(format!(
                    "endpoint '{name}' sends a body and must declare 'idempotent'"
                ));
            }
        }
        Ok(())
    }

    /// Read and validate `api_config.json` from `dir`.
    pub async fn load(dir: &Path) -> Result<Self, ManifestError> {
        let path = dir.join(API_CONFIG_FILE);
        let json = match tokio::fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ManifestError::MissingFile(path));
            }
            Err(source) => return Err(ManifestError::Read { path, source }),
        };
        Self::parse(&json).map_err(|message| ManifestError::InvalidApiConfig { path, message })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_endpoint_needs_idempotency_flag() {
        let err = ApiConfig::parse(r#"{"endpoints":{"searchRoms":{"method":"post","path":"/s"}}}"#)
            .unwrap_err();
        assert!(err.contains("idempotent"));

        let ok = ApiConfig::parse(
            r#"{"endpoints":{"searchRoms":{"method":"post","path":"/s","idempotent":false}}}"#,
        )
        .unwrap();
        assert!(ok.endpoints["searchRoms"].sends_body());
    }
}
