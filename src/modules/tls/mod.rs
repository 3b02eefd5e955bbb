//! TLS trust configuration for source transports.
//!
//! A source either uses the platform trust store (no override), extends it
//! with extra PEM roots, or explicitly opts into accepting any certificate.
//! Trust is never relaxed for a source that did not ask for it.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Requested trust policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SslConfig {
    pub trust_all: bool,
    /// PEM files whose certificates are added to the platform roots.
    pub custom_trust_anchors: Vec<PathBuf>,
}

impl SslConfig {
    pub fn trust_all() -> Self {
        Self {
            trust_all: true,
            custom_trust_anchors: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read trust anchor {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid PEM certificate in {path}: {message}")]
    InvalidCertificate { path: PathBuf, message: String },
}

/// Override applied on top of the platform defaults.
#[derive(Clone)]
pub enum TrustContext {
    /// Accept any certificate and host name.
    TrustAll,
    /// Platform roots plus these certificates.
    ExtraRoots(Vec<reqwest::Certificate>),
}

impl TrustContext {
    pub fn is_trust_all(&self) -> bool {
        matches!(self, TrustContext::TrustAll)
    }

    pub fn apply(&self, builder: reqwest::ClientBuilder) -> reqwest::ClientBuilder {
        match self {
            TrustContext::TrustAll => builder
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true),
            TrustContext::ExtraRoots(certificates) => certificates
                .iter()
                .cloned()
                .fold(builder, |builder, cert| builder.add_root_certificate(cert)),
        }
    }
}

impl fmt::Debug for TrustContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrustContext::TrustAll => f.write_str("TrustAll"),
            TrustContext::ExtraRoots(certs) => write!(f, "ExtraRoots({} certs)", certs.len()),
        }
    }
}

/// Build the trust override for `config`, or `None` to keep platform defaults.
pub async fn create_trust_context(config: &SslConfig) -> Result<Option<TrustContext>, TlsError> {
    if config.trust_all {
        return Ok(Some(TrustContext::TrustAll));
    }

    if config.custom_trust_anchors.is_empty() {
        return Ok(None);
    }

    let mut certificates = Vec::with_capacity(config.custom_trust_anchors.len());
    for path in &config.custom_trust_anchors {
        let pem = tokio::fs::read(path)
            .await
            .map_err(|source| TlsError::Read {
                path: path.clone(),
                source,
            })?;
        let cert = reqwest::Certificate::from_pem(&pem).map_err(|err| {
            TlsError::InvalidCertificate {
                path: path.clone(),
                message: err.to_string(),
            }
        })?;
        certificates.push(cert);
    }

    Ok(Some(TrustContext::ExtraRoots(certificates)))
}
