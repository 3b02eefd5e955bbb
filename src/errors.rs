//! Closed classification shared by every error in the crate.

use std::fmt;

/// What went wrong, independent of which layer noticed it.
///
/// Hosts surface [`ErrorKind::user_message`] next to the kind instead of the
/// full error chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NoConnectivity,
    Timeout,
    RetriesExhausted,
    BypassFailed,
    SourceDisabled,
    UnknownSourceType,
    DependencyResolutionFailed,
    AdapterCrashed,
    /// The source ran but reported a failure of its own.
    SourceFailed,
    Cancelled,
    SourceNotFound,
    InvalidManifest,
    Http,
    Protocol,
    Io,
}

impl ErrorKind {
    pub fn user_message(self) -> &'static str {
        match self {
            ErrorKind::NoConnectivity => "No internet connection",
            ErrorKind::Timeout => "The request timed out",
            ErrorKind::RetriesExhausted => "The server kept failing, try again later",
            ErrorKind::BypassFailed => "Could not get past the site's protection page",
            ErrorKind::SourceDisabled => "This source is disabled",
            ErrorKind::UnknownSourceType => "Unsupported source type",
            ErrorKind::DependencyResolutionFailed => "Source dependencies could not be resolved",
            ErrorKind::AdapterCrashed => "The source stopped unexpectedly",
            ErrorKind::SourceFailed => "The source reported an error",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::SourceNotFound => "Source is not installed",
            ErrorKind::InvalidManifest => "Invalid source package",
            ErrorKind::Http => "Network request failed",
            ErrorKind::Protocol => "The source sent an invalid response",
            ErrorKind::Io => "File system error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
