//! Source manifest (`source.json`) parsing and validation.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::errors::ErrorKind;

pub const MANIFEST_FILE: &str = "source.json";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("manifest is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("manifest field '{0}' is missing or blank")]
    MissingField(&'static str),
    #[error("invalid source id '{0}'")]
    InvalidId(String),
    #[error("unknown source type '{0}'")]
    UnknownSourceType(String),
    #[error("java sources must declare mainClass")]
    MissingMainClass,
    #[error("python sources must declare entryScript")]
    MissingEntryScript,
    #[error("invalid baseUrl '{value}': {message}")]
    InvalidBaseUrl { value: String, message: String },
    #[error("manifest field '{field}' must be a relative path inside the package, got '{value}'")]
    UnsafePath { field: &'static str, value: String },
    #[error("required file {0} is missing")]
    MissingFile(PathBuf),
    #[error("invalid api config {path}: {message}")]
    InvalidApiConfig { path: PathBuf, message: String },
    #[error("source requires app version {required}, running {current}")]
    IncompatibleAppVersion { required: String, current: String },
}

impl ManifestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ManifestError::UnknownSourceType(_) => ErrorKind::UnknownSourceType,
            ManifestError::Read { .. } => ErrorKind::Io,
            _ => ErrorKind::InvalidManifest,
        }
    }
}

/// Execution model of a source, each variant carrying exactly what it needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceKind {
    /// Declarative REST source. No code runs; calls go to `base_url`.
    Api {
        #[serde(rename = "baseUrl")]
        base_url: Url,
    },
    /// JVM class run in its own process.
    Java {
        #[serde(rename = "mainClass")]
        main_class: String,
    },
    /// Python script run in its own interpreter and environment.
    Python {
        #[serde(rename = "entryScript")]
        entry_script: String,
    },
}

impl SourceKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            SourceKind::Api { .. } => "api",
            SourceKind::Java { .. } => "java",
            SourceKind::Python { .. } => "python",
        }
    }
}

/// Immutable descriptor of one version of a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceMetadata {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    pub author: Option<String>,
    pub min_app_version: Option<String>,
    #[serde(flatten)]
    pub kind: SourceKind,
    /// Artifact references resolved before first execution, in order.
    pub dependencies: Vec<String>,
    /// `Referer` template with an `{id}` placeholder for image requests.
    pub image_referer_pattern: Option<String>,
    pub download_intercept_patterns: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawManifest {
    id: Option<String>,
    name: Option<String>,
    version: Option<String>,
    description: Option<String>,
    author: Option<String>,
    base_url: Option<String>,
    min_app_version: Option<String>,
    #[serde(rename = "type")]
    source_type: Option<String>,
    main_class: Option<String>,
    #[serde(alias = "pythonScript")]
    entry_script: Option<String>,
    #[serde(default)]
    dependencies: Vec<String>,
    image_referer_pattern: Option<String>,
    download_intercept_patterns: Option<Vec<String>>,
}

fn required(value: Option<String>, field: &'static str) -> Result<String, ManifestError> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or(ManifestError::MissingField(field))
}

fn optional(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Ids name install directories, so only a conservative charset is allowed.
fn valid_id(id: &str) -> bool {
    !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Relative path made of plain names only, so joining it onto a directory
/// cannot leave that directory.
pub fn is_confined_path(value: &str) -> bool {
    let path = Path::new(value);
    !value.is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
}

fn confined(value: String, field: &'static str) -> Result<String, ManifestError> {
    if is_confined_path(&value) {
        Ok(value)
    } else {
        Err(ManifestError::UnsafePath { field, value })
    }
}

impl SourceMetadata {
    /// Parse and validate manifest JSON.
    pub fn parse(json: &str) -> Result<Self, ManifestError> {
        let raw: RawManifest = serde_json::from_str(json)?;

        let id = required(raw.id, "id")?;
        if !valid_id(&id) {
            return Err(ManifestError::InvalidId(id));
        }
        let name = required(raw.name, "name")?;
        let version = required(raw.version, "version")?;

        let source_type = raw
            .source_type
            .map(|value| value.trim().to_ascii_lowercase())
            .unwrap_or_default();

        let kind = match source_type.as_str() {
            "" | "api" => {
                let value = required(raw.base_url, "baseUrl")?;
                let base_url = Url::parse(&value).map_err(|err| ManifestError::InvalidBaseUrl {
                    value: value.clone(),
                    message: err.to_string(),
                })?;
                SourceKind::Api { base_url }
            }
            "java" | "kotlin" => SourceKind::Java {
                main_class: optional(raw.main_class).ok_or(ManifestError::MissingMainClass)?,
            },
            "python" => SourceKind::Python {
                entry_script: confined(
                    optional(raw.entry_script).ok_or(ManifestError::MissingEntryScript)?,
                    "entryScript",
                )?,
            },
            other => return Err(ManifestError::UnknownSourceType(other.to_string())),
        };

        let mut dependencies: Vec<String> = raw
            .dependencies
            .into_iter()
            .map(|dep| dep.trim().to_string())
            .filter(|dep| !dep.is_empty())
            .collect();
        // Java dependencies name files under `libs/`; python ones are pip specs.
        if matches!(kind, SourceKind::Java { .. }) {
            dependencies = dependencies
                .into_iter()
                .map(|dep| confined(dep, "dependencies"))
                .collect::<Result<_, _>>()?;
        }

        Ok(Self {
            id,
            name,
            version,
            description: optional(raw.description),
            author: optional(raw.author),
            min_app_version: optional(raw.min_app_version),
            kind,
            dependencies,
            image_referer_pattern: optional(raw.image_referer_pattern)
                .filter(|pattern| pattern.contains("{id}")),
            download_intercept_patterns: raw.download_intercept_patterns,
        })
    }

    /// Read `source.json` from `dir`.
    pub async fn load(dir: &Path) -> Result<Self, ManifestError> {
        let path = dir.join(MANIFEST_FILE);
        let json = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| ManifestError::Read {
                path: path.clone(),
                source,
            })?;
        Self::parse(&json)
    }

    pub fn base_url(&self) -> Option<&Url> {
        match &self.kind {
            SourceKind::Api { base_url } => Some(base_url),
            _ => None,
        }
    }
}
