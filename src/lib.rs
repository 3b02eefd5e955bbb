//! # romsource-rs
//!
//! Engine behind installable ROM sources. A source is a package with a
//! `source.json` manifest that is either a declarative REST description, a
//! JVM class or a Python script. The engine installs and validates sources,
//! routes requests to them, and gives every source the same network
//! capabilities.
//!
//! ## Features
//!
//! - Interceptor chain on every request: headers, connectivity, logging, retry
//! - Retries with exponential backoff for idempotent requests only
//! - Per-source cookie jars and TLS trust
//! - Browser-driven challenge bypass and download URL extraction with
//!   per-stage timeouts and cancellation
//! - `api`, `java` and `python` adapters behind one dispatcher
//!
//! ## Example
//!
//! ```no_run
//! use romsource_rs::{CancellationToken, SourceEngine, SourceRequest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = SourceEngine::new()?;
//!     engine.load_installed().await?;
//!
//!     let outcome = engine
//!         .search_all(&SourceRequest::search("metroid"), None, &CancellationToken::new())
//!         .await?;
//!     for (source, results) in outcome.results {
//!         println!("{source}: {results}");
//!     }
//!     Ok(())
//! }
//! ```

mod engine;

pub mod browser;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod modules;
pub mod registry;
pub mod services;
pub mod transport;

pub use crate::engine::{
    SearchOutcome,
    SourceEngine,
    SourceEngineBuilder,
    SourceEngineError,
    SourceEngineResult,
};

pub use crate::errors::ErrorKind;

pub use crate::config::{
    ConfigError,
    ConnectivityConfig,
    EngineConfig,
    EngineConfigBuilder,
    RuntimeConfig,
};

pub use crate::transport::{
    HeaderEntry,
    HttpRequest,
    HttpResponse,
    Idempotency,
    InterceptorChain,
    RetryPolicy,
    Transport,
    TransportError,
};

pub use crate::browser::{
    BrowserCookie,
    BrowserEngine,
    BrowserError,
    BrowserSession,
    BypassError,
    BypassOrchestrator,
    BypassResult,
    BypassStage,
    BypassTimeouts,
    ExtractionResult,
    StaticPageEngine,
};

#[cfg(feature = "chromium")]
pub use crate::browser::ChromiumEngine;

pub use crate::services::{
    CloudflareBypassConfig,
    DefaultSourceServices,
    HttpClientConfig,
    SourceClient,
    SourceServices,
    WebViewConfig,
};

pub use crate::registry::{
    InstallDir,
    InstallOutcome,
    InstallReport,
    InstalledSourceConfig,
    ManifestError,
    RegistryEntry,
    RegistryError,
    Source,
    SourceInstaller,
    SourceKind,
    SourceMetadata,
    SourcePackage,
    SourceRegistry,
};

pub use crate::dispatch::{
    AdapterContext,
    AdapterError,
    DispatchError,
    SourceAdapter,
    SourceDispatcher,
    SourceRequest,
};

pub use crate::modules::{
    CancellationToken,
    EngineEvent,
    EventDispatcher,
    EventHandler,
    LoggingHandler,
    SourceCookieJar,
    SslConfig,
    TrustContext,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
