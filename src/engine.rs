use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;
use thiserror::Error;

use crate::browser::{
	BrowserEngine, BypassOrchestrator, DEFAULT_DOWNLOAD_PATTERNS, ExtractionResult, StaticPageEngine,
};
use crate::config::{ConfigError, EngineConfig};
use crate::dispatch::{DispatchError, SourceAdapter, SourceDispatcher, SourceRequest};
use crate::errors::ErrorKind;
use crate::modules::cancel::CancellationToken;
use crate::modules::events::{EventDispatcher, EventHandler, LoggingHandler};
use crate::registry::{
	InstallReport, ManifestError, RegistryEntry, RegistryError, Source, SourceInstaller, SourceMetadata,
	SourceRegistry,
};
use crate::services::{DefaultSourceServices, SourceServices, WebViewConfig};
use crate::transport::{
	ConnectivityProbe, StaticConnectivity, TcpConnectivityProbe, TransportError,
	header_map_from_entries,
};

/// Result alias used by the engine facade.
pub type SourceEngineResult<T> = Result<T, SourceEngineError>;

/// Top-level error surfaced to the host application.
#[derive(Debug, Error)]
pub enum SourceEngineError {
	#[error(transparent)]
	Registry(#[from] RegistryError),
	#[error(transparent)]
	Manifest(#[from] ManifestError),
	#[error(transparent)]
	Dispatch(#[from] DispatchError),
	#[error(transparent)]
	Transport(#[from] TransportError),
	#[error("configuration error: {0}")]
	Config(#[from] ConfigError),
	#[error("no sources installed")]
	NoSourcesInstalled,
	#[error("no sources enabled")]
	NoSourcesEnabled,
}

impl SourceEngineError {
	pub fn kind(&self) -> ErrorKind {
		match self {
			SourceEngineError::Registry(err) => err.kind(),
			SourceEngineError::Manifest(err) => err.kind(),
			SourceEngineError::Dispatch(err) => err.kind(),
			SourceEngineError::Transport(err) => err.kind(),
			SourceEngineError::Config(_) => ErrorKind::InvalidManifest,
			SourceEngineError::NoSourcesInstalled => ErrorKind::SourceNotFound,
			SourceEngineError::NoSourcesEnabled => ErrorKind::SourceDisabled,
		}
	}

	/// Short text for the host UI, shown next to [`kind`](Self::kind).
	pub fn user_message(&self) -> &'static str {
		match self {
			SourceEngineError::NoSourcesInstalled => "No sources installed",
			SourceEngineError::NoSourcesEnabled => "All sources are disabled",
			other => other.kind().user_message(),
		}
	}
}

/// Per-source outcome of [`SourceEngine::search_all`], ordered by source id.
#[derive(Debug, Default)]
pub struct SearchOutcome {
	pub results: Vec<(String, Value)>,
	pub errors: Vec<(String, DispatchError)>,
}

/// Builder for [`SourceEngine`].
pub struct SourceEngineBuilder {
	config: EngineConfig,
	browser: Option<Arc<dyn BrowserEngine>>,
	probe: Option<Arc<dyn ConnectivityProbe>>,
	handlers: Vec<Arc<dyn EventHandler>>,
	java: Option<Arc<dyn SourceAdapter>>,
	python: Option<Arc<dyn SourceAdapter>>,
}

impl SourceEngineBuilder {
	pub fn new() -> Self {
		Self {
			config: EngineConfig::default(),
			browser: None,
			probe: None,
			handlers: Vec::new(),
			java: None,
			python: None,
		}
	}

	pub fn with_config(mut self, config: EngineConfig) -> Self {
		self.config = config;
		self
	}

	/// Browser used for bypass and extraction. Defaults to the HTTP-only
	/// [`StaticPageEngine`].
	pub fn with_browser_engine(mut self, engine: Arc<dyn BrowserEngine>) -> Self {
		self.browser = Some(engine);
		self
	}

	/// Connectivity source for the pre-flight stage. Defaults to a TCP probe
	/// when the config names a target, otherwise to "always online".
	pub fn with_connectivity_probe(mut self, probe: Arc<dyn ConnectivityProbe>) -> Self {
		self.probe = Some(probe);
		self
	}

	pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
		self.handlers.push(handler);
		self
	}

	pub fn with_java_adapter(mut self, adapter: Arc<dyn SourceAdapter>) -> Self {
		self.java = Some(adapter);
		self
	}

	pub fn with_python_adapter(mut self, adapter: Arc<dyn SourceAdapter>) -> Self {
		self.python = Some(adapter);
		self
	}

	pub fn build(self) -> SourceEngineResult<SourceEngine> {
		SourceEngine::from_builder(self)
	}
}

impl Default for SourceEngineBuilder {
	fn default() -> Self {
		Self::new()
	}
}

/// Entry point for the host: installs sources, runs requests against them
/// and hands out the network capabilities they use.
pub struct SourceEngine {
	config: Arc<EngineConfig>,
	events: Arc<EventDispatcher>,
	registry: Arc<SourceRegistry>,
	installer: SourceInstaller,
	services: Arc<DefaultSourceServices>,
	dispatcher: SourceDispatcher,
}

impl SourceEngine {
	/// Engine with default configuration.
	pub fn new() -> SourceEngineResult<Self> {
		SourceEngine::builder().build()
	}

	pub fn builder() -> SourceEngineBuilder {
		SourceEngineBuilder::new()
	}

	fn from_builder(builder: SourceEngineBuilder) -> SourceEngineResult<Self> {
		let config = Arc::new(builder.config);
		header_map_from_entries(&config.default_headers)?;

		let mut events = EventDispatcher::new();
		events.register_handler(Arc::new(LoggingHandler));
		for handler in builder.handlers {
			events.register_handler(handler);
		}
		let events = Arc::new(events);

		let browser = builder.browser.unwrap_or_else(|| {
			let mut engine = StaticPageEngine::new().with_request_timeout(config.default_timeout());
			if let Some(agent) = config
				.default_headers
				.iter()
				.find(|header| header.name.eq_ignore_ascii_case("user-agent"))
			{
				engine = engine.with_user_agent(agent.value.clone());
			}
			Arc::new(engine)
		});
		let probe = builder.probe.unwrap_or_else(|| match &config.connectivity.probe_target {
			Some(target) => Arc::new(TcpConnectivityProbe::new(
				target.clone(),
				config.connectivity.probe_timeout(),
			)),
			None => Arc::new(StaticConnectivity::online()),
		});

		let registry = Arc::new(SourceRegistry::with_events(events.clone()));
		let orchestrator =
			BypassOrchestrator::new(browser, config.bypass.clone()).with_events(events.clone());
		let services = Arc::new(
			DefaultSourceServices::new(config.clone(), probe, orchestrator, events.clone())
				.with_registry(registry.clone()),
		);

		let mut dispatcher = SourceDispatcher::new(registry.clone(), services.clone(), &config.runtime)
			.with_events(events.clone());
		if let Some(java) = builder.java {
			dispatcher = dispatcher.with_java_adapter(java);
		}
		if let Some(python) = builder.python {
			dispatcher = dispatcher.with_python_adapter(python);
		}

		let installer = SourceInstaller::new(
			registry.clone(),
			config.sources_dir.clone(),
			config.app_version.clone(),
		);

		log::debug!(
			"source engine {} ready (sources in {})",
			config.app_version,
			config.sources_dir.display()
		);

		Ok(Self {
			config,
			events,
			registry,
			installer,
			services,
			dispatcher,
		})
	}

	pub fn config(&self) -> &EngineConfig {
		&self.config
	}

	pub fn events(&self) -> &Arc<EventDispatcher> {
		&self.events
	}

	/// Capability provider shared by every source.
	pub fn services(&self) -> Arc<dyn SourceServices> {
		self.services.clone()
	}

	pub fn registry(&self) -> &Arc<SourceRegistry> {
		&self.registry
	}

	pub fn sources_dir(&self) -> &Path {
		self.installer.sources_dir()
	}

	/// Register the packages already present in the sources directory.
	/// Returns the ones that failed validation.
	pub async fn load_installed(&self) -> SourceEngineResult<Vec<(PathBuf, ManifestError)>> {
		Ok(self.installer.load_installed().await?)
	}

	pub async fn validate_dir(&self, dir: impl AsRef<Path>) -> SourceEngineResult<SourceMetadata> {
		Ok(self.installer.validate_dir(dir.as_ref()).await?)
	}

	pub async fn install_dir(&self, dir: impl AsRef<Path>) -> SourceEngineResult<InstallReport> {
		Ok(self.installer.install_dir(dir.as_ref()).await?)
	}

	/// Remove a source, its files and its cookies. Calls already running
	/// against the source finish before its files go away.
	pub async fn uninstall(&self, source_id: &str) -> SourceEngineResult<Source> {
		let removed = self.installer.uninstall(source_id).await?;
		self.services.forget_source(source_id);
		Ok(removed)
	}

	pub async fn set_enabled(
		&self,
		source_id: &str,
		enabled: bool,
	) -> SourceEngineResult<Arc<RegistryEntry>> {
		Ok(self.registry.set_enabled(source_id, enabled).await?)
	}

	/// Every installed source, enabled or not, ordered by id.
	pub fn sources(&self) -> Vec<Arc<RegistryEntry>> {
		self.registry.list()
	}

	pub fn source(&self, source_id: &str) -> Option<Arc<RegistryEntry>> {
		self.registry.get(source_id)
	}

	pub async fn dispatch(
		&self,
		source_id: &str,
		request: &SourceRequest,
		cancel: &CancellationToken,
	) -> SourceEngineResult<Value> {
		Ok(self.dispatcher.dispatch(source_id, request, cancel).await?)
	}

	/// Send `request` to every enabled source, or to the enabled ones among
	/// `selected`, concurrently. One source failing does not affect the rest.
	pub async fn search_all(
		&self,
		request: &SourceRequest,
		selected: Option<&[String]>,
		cancel: &CancellationToken,
	) -> SourceEngineResult<SearchOutcome> {
		if !self.registry.has_installed_sources() {
			return Err(SourceEngineError::NoSourcesInstalled);
		}
		let targets: Vec<Arc<RegistryEntry>> = self
			.registry
			.enabled()
			.into_iter()
			.filter(|entry| selected.is_none_or(|ids| ids.iter().any(|id| id == entry.id())))
			.collect();
		if targets.is_empty() {
			return Err(SourceEngineError::NoSourcesEnabled);
		}

		let calls = targets.iter().map(|entry| async move {
			let outcome = self.dispatcher.dispatch(entry.id(), request, cancel).await;
			(entry.id().to_string(), outcome)
		});

		let mut outcome = SearchOutcome::default();
		for (source_id, result) in join_all(calls).await {
			match result {
				Ok(value) => outcome.results.push((source_id, value)),
				Err(err) => outcome.errors.push((source_id, err)),
			}
		}
		Ok(outcome)
	}

	/// Open `url` in a browser session for `source_id` and pull out the
	/// download link, using the source's declared intercept patterns or the
	/// default archive patterns.
	pub async fn resolve_download(
		&self,
		source_id: &str,
		url: &str,
		cancel: &CancellationToken,
	) -> SourceEngineResult<ExtractionResult> {
		let entry = self.registry.resolve(source_id)?;
		let intercept_patterns = entry
			.metadata
			.download_intercept_patterns
			.clone()
			.filter(|patterns| !patterns.is_empty())
			.unwrap_or_else(|| {
				DEFAULT_DOWNLOAD_PATTERNS
					.iter()
					.map(|pattern| pattern.to_string())
					.collect()
			});

		let config = WebViewConfig {
			intercept_patterns,
			scan_links: true,
			..WebViewConfig::default()
		};
		Ok(self
			.services
			.extract_url_from_webview(url, source_id, &config, cancel)
			.await)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::transport::HeaderEntry;

	#[test]
	fn invalid_default_header_fails_build() {
		let mut config = EngineConfig::default();
		config.default_headers.push(HeaderEntry::new("bad header", "x"));

		let err = SourceEngine::builder().with_config(config).build().err().unwrap();

		assert!(matches!(err, SourceEngineError::Transport(TransportError::InvalidHeader(_))));
	}

	#[tokio::test]
	async fn search_all_needs_installed_and_enabled_sources() {
		let dir = tempfile::tempdir().unwrap();
		let engine = SourceEngine::builder()
			.with_config(EngineConfig::builder().with_sources_dir(dir.path()).build())
			.build()
			.unwrap();
		let request = SourceRequest::search("zelda");
		let cancel = CancellationToken::new();

		let err = engine.search_all(&request, None, &cancel).await.unwrap_err();
		assert!(matches!(err, SourceEngineError::NoSourcesInstalled));

		let package = dir.path().join("incoming");
		std::fs::create_dir_all(&package).unwrap();
		std::fs::write(
			package.join("source.json"),
			r#"{"id":"py","name":"Py","version":"1","type":"python","entryScript":"m.py"}"#,
		)
		.unwrap();
		std::fs::write(package.join("m.py"), "").unwrap();
		engine.install_dir(&package).await.unwrap();
		engine.set_enabled("py", false).await.unwrap();

		let err = engine.search_all(&request, None, &cancel).await.unwrap_err();
		assert!(matches!(err, SourceEngineError::NoSourcesEnabled));
		assert_eq!(err.kind(), ErrorKind::SourceDisabled);
	}
}
