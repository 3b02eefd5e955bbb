//! `java` sources: one JVM per call with a class path private to the source.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::process::{self, isolated_command};
use super::{AdapterContext, AdapterError, SourceAdapter, SourceRequest};
use crate::config::RuntimeConfig;
use crate::registry::manifest::is_confined_path;
use crate::registry::{RegistryEntry, SourceKind};

pub struct JavaAdapter {
    executable: String,
    call_timeout: Duration,
}

impl JavaAdapter {
    pub fn new(runtime: &RuntimeConfig) -> Self {
        Self {
            executable: runtime.java.clone(),
            call_timeout: runtime.call_timeout(),
        }
    }

    /// `<install>/classes` followed by every declared dependency, in order.
    ///
    /// A dependency is either a file name under `<install>/libs` or a
    /// `group:artifact:version` coordinate resolved to
    /// `<install>/libs/<artifact>-<version>.jar`.
    pub async fn class_path(
        install_dir: &Path,
        dependencies: &[String],
    ) -> Result<OsString, AdapterError> {
        let libs = install_dir.join("libs");
        let mut entries = vec![install_dir.join("classes")];
        for dependency in dependencies {
            entries.push(resolve_dependency(&libs, dependency).await?);
        }
        std::env::join_paths(entries)
            .map_err(|err| AdapterError::DependencyResolution(err.to_string()))
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .is_ok_and(|meta| meta.is_file())
}

async fn resolve_dependency(libs: &Path, dependency: &str) -> Result<PathBuf, AdapterError> {
    if !is_confined_path(dependency) {
        return Err(AdapterError::DependencyResolution(format!(
            "'{dependency}' points outside {}",
            libs.display()
        )));
    }

    let direct = libs.join(dependency);
    if is_file(&direct).await {
        return Ok(direct);
    }

    let parts: Vec<&str> = dependency.split(':').collect();
    if let [_group, artifact, version] = parts.as_slice() {
        let jar = libs.join(format!("{artifact}-{version}.jar"));
        if is_confined_path(&format!("{artifact}-{version}.jar")) && is_file(&jar).await {
            return Ok(jar);
        }
    }

    Err(AdapterError::DependencyResolution(format!(
        "'{}' not found under {}",
        dependency,
        libs.display()
    )))
}

#[async_trait]
impl SourceAdapter for JavaAdapter {
    fn name(&self) -> &'static str {
        "java"
    }

    async fn execute(
        &self,
        entry: &RegistryEntry,
        request: &SourceRequest,
        ctx: &AdapterContext,
    ) -> Result<Value, AdapterError> {
        let SourceKind::Java { main_class } = &entry.metadata.kind else {
            return Err(AdapterError::Protocol(format!(
                "{} is not a java source",
                entry.id()
            )));
        };
        let install_dir = entry.install_dir();
        let class_path = Self::class_path(install_dir, &entry.metadata.dependencies).await?;

        let mut command = isolated_command(&self.executable);
        command
            .arg("-cp")
            .arg(class_path)
            .arg(main_class)
            .current_dir(install_dir);

        process::call(command, entry.id(), request, ctx, self.call_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::errors::ErrorKind;

    #[tokio::test]
    async fn class_path_resolves_files_and_coordinates() {
        let dir = tempfile::tempdir().unwrap();
        let libs = dir.path().join("libs");
        fs::create_dir_all(&libs).unwrap();
        fs::write(libs.join("jsoup-1.17.2.jar"), b"").unwrap();
        fs::write(libs.join("gson.jar"), b"").unwrap();

        let class_path = JavaAdapter::class_path(
            dir.path(),
            &["org.jsoup:jsoup:1.17.2".to_string(), "gson.jar".to_string()],
        )
        .await
        .unwrap();
        let entries: Vec<PathBuf> = std::env::split_paths(&class_path).collect();

        assert_eq!(
            entries,
            vec![
                dir.path().join("classes"),
                libs.join("jsoup-1.17.2.jar"),
                libs.join("gson.jar"),
            ]
        );
    }

    #[tokio::test]
    async fn missing_dependency_fails_before_launch() {
        let dir = tempfile::tempdir().unwrap();
        let err = JavaAdapter::class_path(dir.path(), &["com.example:absent:1.0".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DependencyResolutionFailed);
    }

    #[tokio::test]
    async fn dependency_outside_libs_is_refused_even_if_present() {
        let dir = tempfile::tempdir().unwrap();
        let install = dir.path().join("install");
        fs::create_dir_all(install.join("libs")).unwrap();
        fs::write(dir.path().join("stray.jar"), b"").unwrap();

        for dependency in ["../../stray.jar", "../stray.jar"] {
            let err = JavaAdapter::class_path(&install, &[dependency.to_string()])
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::DependencyResolutionFailed);
        }
        let absolute = dir.path().join("stray.jar").to_string_lossy().into_owned();
        assert!(JavaAdapter::class_path(&install, &[absolute]).await.is_err());
    }
}
