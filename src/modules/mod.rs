//! Cross-cutting building blocks shared by transport, browser and dispatch.
//!
//! Cancellation, per-source cookie and trust state, and engine events.

pub mod cancel;
pub mod cookies;
pub mod events;
pub mod tls;

pub use cancel::CancellationToken;
pub use cookies::{CookieJarRegistry, SourceCookieJar};
pub use events::{
    BypassEvent, DispatchEvent, EngineEvent, EventDispatcher, EventHandler, LoggingHandler,
    RegistryAction, RegistryEvent, RequestEvent, ResponseEvent, RetryEvent,
};
pub use tls::{SslConfig, TlsError, TrustContext, create_trust_context};
