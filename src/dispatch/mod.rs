//! Routing source requests to the adapter matching the source's type.
//!
//! The adapter is chosen by an exhaustive match on [`SourceKind`]; a new
//! source type cannot be added without deciding how it is executed.

pub mod api;
pub mod capability;
pub mod java;
pub mod process;
pub mod protocol;
pub mod python;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::RuntimeConfig;
use crate::errors::ErrorKind;
use crate::modules::cancel::CancellationToken;
use crate::modules::events::{DispatchEvent, EngineEvent, EventDispatcher};
use crate::registry::{ManifestError, RegistryEntry, RegistryError, SourceKind, SourceRegistry};
use crate::services::SourceServices;
use crate::transport::TransportError;

pub use api::ApiAdapter;
pub use java::JavaAdapter;
pub use protocol::{Envelope, Message, PROTOCOL_VERSION};
pub use python::PythonAdapter;

/// Structured request every adapter understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum SourceRequest {
    SearchRoms {
        search_key: String,
        #[serde(default)]
        platforms: Vec<String>,
        #[serde(default)]
        regions: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_results: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        page: Option<u32>,
    },
    GetEntry {
        slug: String,
    },
    GetPlatforms,
    GetRegions,
}

impl SourceRequest {
    pub fn search(search_key: impl Into<String>) -> Self {
        SourceRequest::SearchRoms {
            search_key: search_key.into(),
            platforms: Vec::new(),
            regions: Vec::new(),
            max_results: None,
            page: None,
        }
    }

    /// Wire name, also the endpoint key of `api` sources.
    pub fn method(&self) -> &'static str {
        match self {
            SourceRequest::SearchRoms { .. } => "searchRoms",
            SourceRequest::GetEntry { .. } => "getEntry",
            SourceRequest::GetPlatforms => "getPlatforms",
            SourceRequest::GetRegions => "getRegions",
        }
    }

    /// Parameters without the `method` tag.
    pub fn params(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(mut map)) => {
                map.remove("method");
                map
            }
            _ => Map::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("dependency resolution failed: {0}")]
    DependencyResolution(String),
    #[error("source runtime terminated unexpectedly: {0}")]
    Crashed(String),
    #[error("source call timed out after {0:?}")]
    Timeout(Duration),
    #[error("source call cancelled")]
    Cancelled,
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("source error: {0}")]
    Source(String),
    #[error("'{0}' is not supported by this source")]
    Unsupported(String),
    #[error("{url} answered with status {status}")]
    Status { status: u16, url: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Config(#[from] ManifestError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl AdapterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AdapterError::DependencyResolution(_) => ErrorKind::DependencyResolutionFailed,
            AdapterError::Crashed(_) => ErrorKind::AdapterCrashed,
            AdapterError::Timeout(_) => ErrorKind::Timeout,
            AdapterError::Cancelled => ErrorKind::Cancelled,
            AdapterError::Protocol(_) => ErrorKind::Protocol,
            AdapterError::Source(_) | AdapterError::Unsupported(_) => ErrorKind::SourceFailed,
            AdapterError::Status { .. } => ErrorKind::Http,
            AdapterError::Transport(err) => err.kind(),
            AdapterError::Config(err) => err.kind(),
            AdapterError::Io(_) => ErrorKind::Io,
        }
    }
}

/// Dispatch failure, tagged with the source it came from.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("source '{source_id}': {error}")]
    Adapter {
        source_id: String,
        #[source]
        error: AdapterError,
    },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::Adapter { error, .. } => error.kind(),
            DispatchError::Registry(err) => err.kind(),
        }
    }
}

/// What an adapter gets besides the request.
#[derive(Clone)]
pub struct AdapterContext {
    /// The source's only network channel.
    pub services: Arc<dyn SourceServices>,
    pub cancel: CancellationToken,
}

/// Executes requests for one source type.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(
        &self,
        entry: &RegistryEntry,
        request: &SourceRequest,
        ctx: &AdapterContext,
    ) -> Result<Value, AdapterError>;
}

pub struct SourceDispatcher {
    registry: Arc<SourceRegistry>,
    services: Arc<dyn SourceServices>,
    api: Arc<dyn SourceAdapter>,
    java: Arc<dyn SourceAdapter>,
    python: Arc<dyn SourceAdapter>,
    events: Option<Arc<EventDispatcher>>,
}

impl SourceDispatcher {
    pub fn new(
        registry: Arc<SourceRegistry>,
        services: Arc<dyn SourceServices>,
        runtime: &RuntimeConfig,
    ) -> Self {
        Self {
            registry,
            services,
            api: Arc::new(ApiAdapter::new()),
            java: Arc::new(JavaAdapter::new(runtime)),
            python: Arc::new(PythonAdapter::new(runtime)),
            events: None,
        }
    }

    pub fn with_api_adapter(mut self, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.api = adapter;
        self
    }

    pub fn with_java_adapter(mut self, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.java = adapter;
        self
    }

    pub fn with_python_adapter(mut self, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.python = adapter;
        self
    }

    pub fn with_events(mut self, events: Arc<EventDispatcher>) -> Self {
        self.events = Some(events);
        self
    }

    fn adapter_for(&self, kind: &SourceKind) -> &Arc<dyn SourceAdapter> {
        match kind {
            SourceKind::Api { .. } => &self.api,
            SourceKind::Java { .. } => &self.java,
            SourceKind::Python { .. } => &self.python,
        }
    }

    /// Run `request` against the enabled source `source_id`.
    ///
    /// The registry entry is captured once; a concurrent upgrade or disable
    /// does not affect a call already past resolution.
    pub async fn dispatch(
        &self,
        source_id: &str,
        request: &SourceRequest,
        cancel: &CancellationToken,
    ) -> Result<Value, DispatchError> {
        let entry = self.registry.resolve(source_id)?;
        let adapter = self.adapter_for(&entry.metadata.kind);
        let ctx = AdapterContext {
            services: self.services.clone(),
            cancel: cancel.clone(),
        };

        let started = Instant::now();
        let outcome = match adapter.execute(&entry, request, &ctx).await {
            Ok(value) => reported_error(&value).map_or(Ok(value), |message| {
                Err(AdapterError::Source(message))
            }),
            Err(err) => Err(err),
        };

        self.report(source_id, request, adapter.name(), &outcome, started.elapsed());
        outcome.map_err(|error| DispatchError::Adapter {
            source_id: source_id.to_string(),
            error,
        })
    }

    fn report(
        &self,
        source_id: &str,
        request: &SourceRequest,
        adapter: &'static str,
        outcome: &Result<Value, AdapterError>,
        latency: Duration,
    ) {
        if let Err(err) = outcome {
            log::warn!("{} {} via {} failed: {}", source_id, request.method(), adapter, err);
        }
        if let Some(events) = &self.events {
            events.dispatch(EngineEvent::Dispatch(DispatchEvent {
                source_id: source_id.to_string(),
                method: request.method().to_string(),
                adapter,
                success: outcome.is_ok(),
                latency,
                timestamp: Utc::now(),
            }));
        }
    }
}

/// `{"error": "..."}` answers count as failures.
fn reported_error(value: &Value) -> Option<String> {
    value
        .as_object()?
        .get("error")?
        .as_str()
        .map(str::to_string)
}


#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::registry::{InstallDir, SourceMetadata};

    struct Recording {
        name: &'static str,
        answer: Value,
        calls: Mutex<Vec<String>>,
    }

    impl Recording {
        fn new(name: &'static str, answer: Value) -> Arc<Self> {
            Arc::new(Self {
                name,
                answer,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SourceAdapter for Recording {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn execute(
            &self,
            entry: &RegistryEntry,
            request: &SourceRequest,
            _ctx: &AdapterContext,
        ) -> Result<Value, AdapterError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("{}:{}", entry.id(), request.method()));
            Ok(self.answer.clone())
        }
    }

    fn register(registry: &SourceRegistry, manifest: &str) {
        let metadata = SourceMetadata::parse(manifest).unwrap();
        let dir = format!("/tmp/{}", metadata.id);
        registry.register(metadata, InstallDir::new(dir));
    }

    fn dispatcher(
        registry: Arc<SourceRegistry>,
        java: Arc<Recording>,
        python: Arc<Recording>,
    ) -> SourceDispatcher {
        SourceDispatcher::new(
            registry,
            test_support::services(),
            &RuntimeConfig::default(),
        )
        .with_java_adapter(java)
        .with_python_adapter(python)
    }

    #[test]
    fn request_serializes_with_method_tag() {
        let request = SourceRequest::SearchRoms {
            search_key: "zelda".into(),
            platforms: vec!["snes".into()],
            regions: Vec::new(),
            max_results: Some(20),
            page: None,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["method"], "searchRoms");
        assert_eq!(value["search_key"], "zelda");
        assert!(value.get("page").is_none());

        let params = request.params();
        assert!(!params.contains_key("method"));
        assert_eq!(params["max_results"], 20);

        let parsed: SourceRequest = serde_json::from_str(r#"{"method":"getPlatforms"}"#).unwrap();
        assert_eq!(parsed, SourceRequest::GetPlatforms);
    }

    #[tokio::test]
    async fn routes_by_declared_type() {
        let registry = Arc::new(SourceRegistry::new());
        register(
            &registry,
            r#"{"id":"jv","name":"Jv","version":"1","type":"java","mainClass":"a.B"}"#,
        );
        register(
            &registry,
            r#"{"id":"py","name":"Py","version":"1","type":"python","entryScript":"m.py"}"#,
        );
        let java = Recording::new("java", json!(["snes"]));
        let python = Recording::new("python", json!(["eu"]));
        let dispatcher = dispatcher(registry, java.clone(), python.clone());
        let cancel = CancellationToken::new();

        let platforms = dispatcher
            .dispatch("jv", &SourceRequest::GetPlatforms, &cancel)
            .await
            .unwrap();
        let regions = dispatcher
            .dispatch("py", &SourceRequest::GetRegions, &cancel)
            .await
            .unwrap();

        assert_eq!(platforms, json!(["snes"]));
        assert_eq!(regions, json!(["eu"]));
        assert_eq!(java.calls(), vec!["jv:getPlatforms"]);
        assert_eq!(python.calls(), vec!["py:getRegions"]);
    }

    #[tokio::test]
    async fn disabled_source_never_reaches_adapter() {
        let registry = Arc::new(SourceRegistry::new());
        register(
            &registry,
            r#"{"id":"py","name":"Py","version":"1","type":"python","entryScript":"m.py"}"#,
        );
        registry.set_enabled("py", false).await.unwrap();
        let python = Recording::new("python", json!({}));
        let dispatcher = dispatcher(
            registry,
            Recording::new("java", json!({})),
            python.clone(),
        );

        let err = dispatcher
            .dispatch("py", &SourceRequest::GetRegions, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::SourceDisabled);
        assert!(python.calls().is_empty());
    }

    #[tokio::test]
    async fn error_answers_are_tagged_with_source_id() {
        let registry = Arc::new(SourceRegistry::new());
        register(
            &registry,
            r#"{"id":"jv","name":"Jv","version":"1","type":"java","mainClass":"a.B"}"#,
        );
        let dispatcher = dispatcher(
            registry,
            Recording::new("java", json!({"error": "site changed its layout"})),
            Recording::new("python", json!({})),
        );

        let err = dispatcher
            .dispatch("jv", &SourceRequest::GetPlatforms, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::SourceFailed);
        match err {
            DispatchError::Adapter { source_id, error } => {
                assert_eq!(source_id, "jv");
                assert!(error.to_string().contains("site changed its layout"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
