//! Catalog of installed sources.
//!
//! Entries are immutable snapshots behind `Arc`. A mutation (install,
//! upgrade, enable/disable) swaps in a new snapshot, so a dispatch that
//! already resolved an entry keeps running against the config it captured.
//! Mutations of the same id are serialized through a per-id lock.
//!
//! Every install lives in its own generation directory held by an
//! [`InstallDir`]. A replaced or uninstalled generation is only deleted once
//! the last snapshot pointing at it is dropped.

pub mod api_config;
pub mod installer;
pub mod manifest;
pub mod version;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;

use crate::errors::ErrorKind;
use crate::modules::events::{EngineEvent, EventDispatcher, RegistryAction, RegistryEvent};

pub use api_config::{API_CONFIG_FILE, ApiConfig, Endpoint};
pub use installer::{InstallReport, SourceInstaller};
pub use manifest::{MANIFEST_FILE, ManifestError, SourceKind, SourceMetadata};
pub use version::{compare_versions, is_version_newer};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("source '{0}' is not installed")]
    NotFound(String),
    #[error("source '{0}' is disabled")]
    SourceDisabled(String),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("file system error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::NotFound(_) => ErrorKind::SourceNotFound,
            RegistryError::SourceDisabled(_) => ErrorKind::SourceDisabled,
            RegistryError::Manifest(err) => err.kind(),
            RegistryError::Io { .. } => ErrorKind::Io,
        }
    }
}

/// Installed-unit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    pub author: Option<String>,
    /// Empty for non-API sources.
    pub base_url: String,
    pub is_installed: bool,
    pub install_path: Option<PathBuf>,
}

impl Source {
    fn installed(metadata: &SourceMetadata, install_path: &Path) -> Self {
        Self {
            id: metadata.id.clone(),
            name: metadata.name.clone(),
            version: metadata.version.clone(),
            description: metadata.description.clone(),
            author: metadata.author.clone(),
            base_url: metadata
                .base_url()
                .map(|url| url.to_string())
                .unwrap_or_default(),
            is_installed: true,
            install_path: Some(install_path.to_path_buf()),
        }
    }
}

/// On-disk generation of a source.
///
/// Once [`retire`](Self::retire)d, the directory is removed when the last
/// handle drops.
#[derive(Debug)]
pub struct InstallDir {
    path: PathBuf,
    retired: AtomicBool,
}

impl InstallDir {
    pub fn new(path: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            path: path.into(),
            retired: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }
}

impl Drop for InstallDir {
    fn drop(&mut self) {
        if !*self.retired.get_mut() {
            return;
        }
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => log::debug!("removed retired install {}", self.path.display()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => log::warn!(
                "failed to remove retired install {}: {}",
                self.path.display(),
                err
            ),
        }
    }
}

/// A validated package, ready to register.
#[derive(Debug, Clone)]
pub struct SourcePackage {
    pub metadata: SourceMetadata,
    /// Parsed `api_config.json` of `api` sources.
    pub api_config: Option<ApiConfig>,
}

impl From<SourceMetadata> for SourcePackage {
    fn from(metadata: SourceMetadata) -> Self {
        Self {
            metadata,
            api_config: None,
        }
    }
}

/// Per-install user state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledSourceConfig {
    pub source_id: String,
    pub version: String,
    /// Epoch milliseconds.
    pub install_date: i64,
    pub is_enabled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryEntry {
    pub source: Source,
    pub metadata: SourceMetadata,
    pub config: InstalledSourceConfig,
    /// Endpoints captured at install time.
    #[serde(skip)]
    pub api_config: Option<Arc<ApiConfig>>,
    #[serde(skip)]
    install: Arc<InstallDir>,
}

impl RegistryEntry {
    pub fn id(&self) -> &str {
        &self.source.id
    }

    pub fn install_dir(&self) -> &Path {
        self.install.path()
    }

    pub(crate) fn install_handle(&self) -> &Arc<InstallDir> {
        &self.install
    }

    pub fn is_enabled(&self) -> bool {
        self.config.is_enabled
    }
}

/// What an install did to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed,
    Upgraded { previous: String },
    /// Same or older version installed over an existing one.
    Replaced { previous: String },
}

#[derive(Default)]
pub struct SourceRegistry {
    entries: RwLock<HashMap<String, Arc<RegistryEntry>>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    events: Option<Arc<EventDispatcher>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(events: Arc<EventDispatcher>) -> Self {
        Self {
            events: Some(events),
            ..Self::default()
        }
    }

    /// Lock serializing mutations of `id`.
    pub(crate) fn lock_for(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<RegistryEntry>>> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<RegistryEntry>>> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, entry: &RegistryEntry, action: RegistryAction) {
        if let Some(events) = &self.events {
            events.dispatch(EngineEvent::Registry(RegistryEvent {
                source_id: entry.source.id.clone(),
                version: entry.source.version.clone(),
                action,
                timestamp: Utc::now(),
            }));
        } else {
            log::info!("source {} {:?}", entry.source.id, action);
        }
    }

    /// Insert or overwrite the entry for the package's id. An existing
    /// entry's enabled flag carries over. Callers hold
    /// [`lock_for`](Self::lock_for).
    pub(crate) fn register(
        &self,
        package: impl Into<SourcePackage>,
        install: Arc<InstallDir>,
    ) -> (Arc<RegistryEntry>, InstallOutcome) {
        let SourcePackage {
            metadata,
            api_config,
        } = package.into();
        let previous = self.get(&metadata.id);
        let outcome = match &previous {
            None => InstallOutcome::Installed,
            Some(existing) if is_version_newer(&metadata.version, &existing.source.version) => {
                InstallOutcome::Upgraded {
                    previous: existing.source.version.clone(),
                }
            }
            Some(existing) => InstallOutcome::Replaced {
                previous: existing.source.version.clone(),
            },
        };

        let entry = Arc::new(RegistryEntry {
            source: Source::installed(&metadata, install.path()),
            config: InstalledSourceConfig {
                source_id: metadata.id.clone(),
                version: metadata.version.clone(),
                install_date: Utc::now().timestamp_millis(),
                is_enabled: previous.as_ref().is_none_or(|existing| existing.is_enabled()),
            },
            metadata,
            api_config: api_config.map(Arc::new),
            install,
        });

        self.write()
            .insert(entry.source.id.clone(), entry.clone());

        let action = match outcome {
            InstallOutcome::Installed => RegistryAction::Installed,
            _ => RegistryAction::Upgraded,
        };
        self.emit(&entry, action);
        (entry, outcome)
    }

    /// Drop the entry for `id`. Callers hold [`lock_for`](Self::lock_for).
    pub(crate) fn remove(&self, id: &str) -> Result<Arc<RegistryEntry>, RegistryError> {
        let removed = self
            .write()
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        self.emit(&removed, RegistryAction::Uninstalled);
        Ok(removed)
    }

    pub async fn set_enabled(
        &self,
        id: &str,
        enabled: bool,
    ) -> Result<Arc<RegistryEntry>, RegistryError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let current = self
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        if current.is_enabled() == enabled {
            return Ok(current);
        }

        let mut updated = (*current).clone();
        updated.config.is_enabled = enabled;
        let updated = Arc::new(updated);
        self.write().insert(id.to_string(), updated.clone());

        self.emit(
            &updated,
            if enabled {
                RegistryAction::Enabled
            } else {
                RegistryAction::Disabled
            },
        );
        Ok(updated)
    }

    pub fn get(&self, id: &str) -> Option<Arc<RegistryEntry>> {
        self.read().get(id).cloned()
    }

    /// Entry for `id` if installed and enabled.
    pub fn resolve(&self, id: &str) -> Result<Arc<RegistryEntry>, RegistryError> {
        let entry = self
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        if !entry.is_enabled() {
            return Err(RegistryError::SourceDisabled(id.to_string()));
        }
        Ok(entry)
    }

    /// All entries ordered by id.
    pub fn list(&self) -> Vec<Arc<RegistryEntry>> {
        let mut entries: Vec<_> = self.read().values().cloned().collect();
        entries.sort_by(|a, b| a.source.id.cmp(&b.source.id));
        entries
    }

    pub fn enabled(&self) -> Vec<Arc<RegistryEntry>> {
        self.list()
            .into_iter()
            .filter(|entry| entry.is_enabled())
            .collect()
    }

    pub fn has_installed_sources(&self) -> bool {
        !self.read().is_empty()
    }

    pub fn has_enabled_sources(&self) -> bool {
        self.read().values().any(|entry| entry.is_enabled())
    }
}
