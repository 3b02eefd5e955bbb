//! Installing, validating and removing source packages on disk.
//!
//! Layout is `<sources_dir>/<id>/v<version>-<stamp>/`. Every install copies
//! the package into a fresh generation, so snapshots resolved before an
//! upgrade or uninstall keep their files until they are dropped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use chrono::Utc;

use super::api_config::ApiConfig;
use super::manifest::{ManifestError, SourceKind, SourceMetadata};
use super::version::compare_versions;
use super::{
    InstallDir, InstallOutcome, RegistryEntry, RegistryError, Source, SourcePackage,
    SourceRegistry,
};

const STAGING_PREFIX: &str = ".staging-";

#[derive(Debug, Clone)]
pub struct InstallReport {
    pub entry: Arc<RegistryEntry>,
    pub outcome: InstallOutcome,
}

/// Copies validated source packages under `sources_dir` and keeps the
/// registry in sync.
pub struct SourceInstaller {
    registry: Arc<SourceRegistry>,
    sources_dir: PathBuf,
    app_version: String,
    /// Generations with live handles. A reload never deletes these.
    live: Mutex<HashMap<PathBuf, Weak<InstallDir>>>,
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> RegistryError {
    let path = path.to_path_buf();
    move |source| RegistryError::Io { path, source }
}

async fn remove_tree(path: &Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => log::debug!("removed {}", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => log::warn!("failed to remove {}: {}", path.display(), err),
    }
}

impl SourceInstaller {
    pub fn new(
        registry: Arc<SourceRegistry>,
        sources_dir: impl Into<PathBuf>,
        app_version: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            sources_dir: sources_dir.into(),
            app_version: app_version.into(),
            live: Mutex::new(HashMap::new()),
        }
    }

    pub fn sources_dir(&self) -> &Path {
        &self.sources_dir
    }

    /// Check that `dir` holds an installable package without installing it.
    pub async fn validate_dir(&self, dir: &Path) -> Result<SourceMetadata, ManifestError> {
        Ok(self.inspect(dir).await?.metadata)
    }

    async fn inspect(&self, dir: &Path) -> Result<SourcePackage, ManifestError> {
        let metadata = SourceMetadata::load(dir).await?;

        if let Some(required) = &metadata.min_app_version
            && compare_versions(&self.app_version, required).is_lt()
        {
            return Err(ManifestError::IncompatibleAppVersion {
                required: required.clone(),
                current: self.app_version.clone(),
            });
        }

        let api_config = match &metadata.kind {
            SourceKind::Api { .. } => Some(ApiConfig::load(dir).await?),
            SourceKind::Python { entry_script } => {
                let script = dir.join(entry_script);
                let present = tokio::fs::metadata(&script)
                    .await
                    .is_ok_and(|meta| meta.is_file());
                if !present {
                    return Err(ManifestError::MissingFile(script));
                }
                None
            }
            SourceKind::Java { .. } => None,
        };

        Ok(SourcePackage {
            metadata,
            api_config,
        })
    }

    /// Validate `dir`, copy it into a new generation and register it.
    /// Re-installing an id keeps its enabled flag; the replaced generation
    /// is deleted once no in-flight call holds it.
    pub async fn install_dir(&self, dir: &Path) -> Result<InstallReport, RegistryError> {
        let package = self.inspect(dir).await?;
        let id = package.metadata.id.clone();
        let lock = self.registry.lock_for(&id);
        let _guard = lock.lock().await;

        let root = self.sources_dir.join(&id);
        let source = dir.to_path_buf();
        let version = package.metadata.version.clone();
        let staging_root = root.clone();
        let target =
            tokio::task::spawn_blocking(move || stage_generation(&source, &staging_root, &version))
                .await
                .map_err(|err| RegistryError::Io {
                    path: root.clone(),
                    source: std::io::Error::other(err.to_string()),
                })??;

        let previous = self.registry.get(&id);
        let (entry, outcome) = self.registry.register(package, self.track(&target));
        if let Some(previous) = previous {
            self.retire(previous).await;
        }

        log::info!(
            "installed {} {} at {} ({:?})",
            entry.source.id,
            entry.source.version,
            target.display(),
            outcome
        );
        Ok(InstallReport { entry, outcome })
    }

    /// Remove `id` from the registry and delete its files. Calls that already
    /// resolved the entry finish against their snapshot first.
    pub async fn uninstall(&self, id: &str) -> Result<Source, RegistryError> {
        let lock = self.registry.lock_for(id);
        let _guard = lock.lock().await;

        let removed = self.registry.remove(id)?;
        let source = removed.source.clone();
        self.retire(removed).await;
        // Only succeeds once the id holds no generation.
        let _ = tokio::fs::remove_dir(self.sources_dir.join(id)).await;
        Ok(source)
    }

    /// Register the newest valid generation of every source under
    /// `sources_dir`. Invalid generations are skipped and returned with their
    /// error; older valid ones nobody holds are deleted.
    pub async fn load_installed(&self) -> Result<Vec<(PathBuf, ManifestError)>, RegistryError> {
        let mut skipped = Vec::new();
        let mut roots = match tokio::fs::read_dir(&self.sources_dir).await {
            Ok(roots) => roots,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(skipped),
            Err(source) => {
                return Err(RegistryError::Io {
                    path: self.sources_dir.clone(),
                    source,
                });
            }
        };

        while let Some(item) = roots
            .next_entry()
            .await
            .map_err(io_error(&self.sources_dir))?
        {
            let root = item.path();
            let id = item.file_name().to_string_lossy().into_owned();
            let is_dir = item.file_type().await.map_err(io_error(&root))?.is_dir();
            if id.starts_with('.') || !is_dir {
                continue;
            }
            self.load_source(&id, &root, &mut skipped).await?;
        }
        Ok(skipped)
    }

    async fn load_source(
        &self,
        id: &str,
        root: &Path,
        skipped: &mut Vec<(PathBuf, ManifestError)>,
    ) -> Result<(), RegistryError> {
        let lock = self.registry.lock_for(id);
        let _guard = lock.lock().await;

        let mut candidates: Vec<(SourcePackage, PathBuf)> = Vec::new();
        let mut generations = tokio::fs::read_dir(root).await.map_err(io_error(root))?;
        while let Some(item) = generations.next_entry().await.map_err(io_error(root))? {
            let path = item.path();
            let name = item.file_name().to_string_lossy().into_owned();
            if !item.file_type().await.map_err(io_error(&path))?.is_dir() {
                continue;
            }
            if name.starts_with(STAGING_PREFIX) {
                // Interrupted install; installs of `id` hold the lock we hold.
                remove_tree(&path).await;
                continue;
            }
            if name.starts_with('.') {
                continue;
            }
            match self.inspect(&path).await {
                Ok(package) if package.metadata.id == id => candidates.push((package, path)),
                Ok(package) => {
                    let err = ManifestError::InvalidId(package.metadata.id);
                    log::warn!("skipping {}: {}", path.display(), err);
                    skipped.push((path, err));
                }
                Err(err) => {
                    log::warn!("skipping {}: {}", path.display(), err);
                    skipped.push((path, err));
                }
            }
        }

        candidates.sort_by(|(a, a_path), (b, b_path)| {
            compare_versions(&a.metadata.version, &b.metadata.version)
                .then_with(|| a_path.cmp(b_path))
        });
        let Some((package, path)) = candidates.pop() else {
            return Ok(());
        };
        for (_, stale) in candidates {
            if !self.is_live(&stale) {
                remove_tree(&stale).await;
            }
        }

        let current = self.registry.get(id);
        if current
            .as_ref()
            .is_some_and(|entry| entry.install_dir() == path)
        {
            return Ok(());
        }
        self.registry.register(package, self.track(&path));
        if let Some(previous) = current {
            self.retire(previous).await;
        }
        Ok(())
    }

    fn live(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, Weak<InstallDir>>> {
        self.live.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn track(&self, path: &Path) -> Arc<InstallDir> {
        let install = InstallDir::new(path);
        let mut live = self.live();
        live.retain(|_, handle| handle.strong_count() > 0);
        live.insert(path.to_path_buf(), Arc::downgrade(&install));
        install
    }

    fn is_live(&self, path: &Path) -> bool {
        self.live()
            .get(path)
            .is_some_and(|handle| handle.strong_count() > 0)
    }

    /// Delete the generation of a replaced or removed entry: now if nothing
    /// else holds it, otherwise when the last in-flight snapshot drops.
    async fn retire(&self, entry: Arc<RegistryEntry>) {
        let install = entry.install_handle().clone();
        drop(entry);
        if !install.path().starts_with(&self.sources_dir) {
            return;
        }
        if Arc::strong_count(&install) > 1 {
            log::info!(
                "{} still in use, removal deferred",
                install.path().display()
            );
            install.retire();
            return;
        }
        remove_tree(install.path()).await;
    }
}

/// Copy `source` into a new generation under `root` through a staging
/// directory, so a failed copy never leaves a half-written install behind.
fn stage_generation(source: &Path, root: &Path, version: &str) -> Result<PathBuf, RegistryError> {
    std::fs::create_dir_all(root).map_err(io_error(root))?;

    let label: String = version
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let mut stamp = Utc::now().timestamp_millis();
    let target = loop {
        let candidate = root.join(format!("v{label}-{stamp}"));
        if !candidate.exists() {
            break candidate;
        }
        stamp += 1;
    };

    let staging = root.join(format!("{STAGING_PREFIX}{stamp}"));
    if let Err(err) = copy_tree(source, &staging) {
        let _ = std::fs::remove_dir_all(&staging);
        return Err(err);
    }
    std::fs::rename(&staging, &target).map_err(io_error(&target))?;
    Ok(target)
}

fn copy_tree(from: &Path, to: &Path) -> Result<(), RegistryError> {
    std::fs::create_dir_all(to).map_err(io_error(to))?;
    for item in std::fs::read_dir(from).map_err(io_error(from))? {
        let item = item.map_err(io_error(from))?;
        let path = item.path();
        let destination = to.join(item.file_name());
        if item.file_type().map_err(io_error(&path))?.is_dir() {
            copy_tree(&path, &destination)?;
        } else {
            std::fs::copy(&path, &destination).map_err(io_error(&path))?;
        }
    }
    Ok(())
}
