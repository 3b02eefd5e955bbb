//! `python` sources: a fresh interpreter per call running the bundled runner.
//!
//! Dependencies go into a private `<install>/.venv`, created once per source
//! version. Sources without dependencies run on the configured interpreter.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use super::process::{self, isolated_command};
use super::{AdapterContext, AdapterError, SourceAdapter, SourceRequest};
use crate::config::RuntimeConfig;
use crate::modules::cancel::CancellationToken;
use crate::registry::{RegistryEntry, SourceKind};

const RUNNER: &str = include_str!("runner.py");
const VENV_DIR: &str = ".venv";
const READY_MARKER: &str = ".romsource-ready";

pub struct PythonAdapter {
    executable: String,
    call_timeout: Duration,
    setup_timeout: Duration,
    /// Environment setup is serialized per source, never across sources.
    setup_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl PythonAdapter {
    pub fn new(runtime: &RuntimeConfig) -> Self {
        Self {
            executable: runtime.python.clone(),
            call_timeout: runtime.call_timeout(),
            setup_timeout: runtime.setup_timeout(),
            setup_locks: Mutex::new(HashMap::new()),
        }
    }

    fn setup_lock(&self, source_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .setup_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(source_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Interpreter for `entry`, installing its dependencies first if the
    /// private environment is missing or belongs to another version.
    async fn interpreter(
        &self,
        entry: &RegistryEntry,
        cancel: &CancellationToken,
    ) -> Result<OsString, AdapterError> {
        let dependencies = &entry.metadata.dependencies;
        if dependencies.is_empty() {
            return Ok(OsString::from(&self.executable));
        }

        let venv = entry.install_dir().join(VENV_DIR);
        let python = venv_python(&venv);
        let marker = venv.join(READY_MARKER);
        let stamp = format!("{}\n{}", entry.source.version, dependencies.join("\n"));

        let lock = self.setup_lock(entry.id());
        let _guard = lock.lock().await;
        if tokio::fs::read_to_string(&marker).await.ok().as_deref() == Some(stamp.as_str()) {
            return Ok(python.into_os_string());
        }

        log::info!(
            "preparing python environment for {} {}",
            entry.id(),
            entry.source.version
        );
        let mut create = isolated_command(&self.executable);
        create.arg("-m").arg("venv").arg("--clear").arg(&venv);
        self.setup_step(create, "venv", cancel).await?;

        let mut install = isolated_command(&python);
        install
            .args(["-m", "pip", "install", "--disable-pip-version-check", "--no-input"])
            .args(dependencies);
        self.setup_step(install, "pip install", cancel).await?;

        tokio::fs::write(&marker, stamp).await?;
        Ok(python.into_os_string())
    }

    async fn setup_step(
        &self,
        mut command: Command,
        step: &str,
        cancel: &CancellationToken,
    ) -> Result<(), AdapterError> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AdapterError::Cancelled),
            output = tokio::time::timeout(self.setup_timeout, command.output()) => output,
        };
        let output = match output {
            Err(_) => {
                return Err(AdapterError::DependencyResolution(format!(
                    "{step} timed out after {:?}",
                    self.setup_timeout
                )));
            }
            Ok(Err(err)) => {
                return Err(AdapterError::DependencyResolution(format!(
                    "{step} could not start: {err}"
                )));
            }
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: Vec<&str> = stderr.lines().rev().take(3).collect();
            return Err(AdapterError::DependencyResolution(format!(
                "{step} failed ({}): {}",
                output.status,
                tail.into_iter().rev().collect::<Vec<_>>().join(" | ")
            )));
        }
        Ok(())
    }
}

fn venv_python(venv: &Path) -> PathBuf {
    if cfg!(windows) {
        venv.join("Scripts").join("python.exe")
    } else {
        venv.join("bin").join("python")
    }
}

#[async_trait]
impl SourceAdapter for PythonAdapter {
    fn name(&self) -> &'static str {
        "python"
    }

    async fn execute(
        &self,
        entry: &RegistryEntry,
        request: &SourceRequest,
        ctx: &AdapterContext,
    ) -> Result<Value, AdapterError> {
        let SourceKind::Python { entry_script } = &entry.metadata.kind else {
            return Err(AdapterError::Protocol(format!(
                "{} is not a python source",
                entry.id()
            )));
        };
        let interpreter = self.interpreter(entry, &ctx.cancel).await?;

        let mut command = isolated_command(interpreter);
        command
            .arg("-u")
            .arg("-c")
            .arg(RUNNER)
            .arg(entry.install_dir().join(entry_script))
            .current_dir(entry.install_dir())
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env("PYTHONIOENCODING", "utf-8");

        process::call(command, entry.id(), request, ctx, self.call_timeout).await
    }
}
