//! Error types for the update pipeline.

use serde::Serialize;
use thiserror::Error;

use crate::artifact::VerificationFailure;

/// Errors that can occur during update operations.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// Host unreachable, timeout, or a transport-level failure
    #[error("network error: {0}")]
    Network(String),

    /// Terminal response was not 2xx (after at most one redirect hop)
    #[error("unexpected HTTP status {status} from {url}")]
    HttpStatus { status: u16, url: String },

    /// Manifest body was malformed or missing required keys
    #[error("malformed manifest: {0}")]
    ManifestParse(String),

    /// Download stream ended before completion was observed
    #[error("download ended early: received {received} of {} bytes", describe_len(.expected))]
    PartialDownload { received: u64, expected: Option<u64> },

    /// Downloaded artifact failed integrity checks
    #[error("artifact verification failed: {0}")]
    Verification(#[from] VerificationFailure),

    /// Archive extraction or filesystem move into the install directory failed
    #[error("install move failed: {0}")]
    InstallMove(String),

    /// Delegated installation through the managed updater failed
    #[error("installation failed: {0}")]
    InstallationFailed(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Catch-all for faults that escaped a stage boundary
    #[error("unexpected fault: {0}")]
    Unexpected(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while reading or writing local state
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<reqwest::Error> for UpdateError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return UpdateError::HttpStatus {
                status: status.as_u16(),
                url: err.url().map(|u| u.to_string()).unwrap_or_default(),
            };
        }
        UpdateError::Network(err.to_string())
    }
}

impl From<semver::Error> for UpdateError {
    fn from(err: semver::Error) -> Self {
        UpdateError::ManifestParse(format!("invalid version: {}", err))
    }
}

impl UpdateError {
    /// Coarse category reported to the host alongside the message.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network(_) | Self::HttpStatus { .. } => ErrorKind::Network,
            Self::ManifestParse(_) => ErrorKind::ManifestParse,
            Self::PartialDownload { .. } => ErrorKind::PartialDownload,
            Self::Verification(_) => ErrorKind::Verification,
            Self::InstallMove(_) => ErrorKind::InstallMove,
            Self::InstallationFailed(_) => ErrorKind::Install,
            Self::Config(_) => ErrorKind::Config,
            Self::Unexpected(_) | Self::Io(_) | Self::Json(_) => ErrorKind::Unexpected,
        }
    }

    /// Whether retrying the same request could plausibly succeed.
    ///
    /// Transport failures and 5xx responses are transient; everything
    /// else (4xx, parse errors, truncated streams) is not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::HttpStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

fn describe_len(expected: &Option<u64>) -> String {
    match expected {
        Some(len) => len.to_string(),
        None => "unknown".to_string(),
    }
}

/// Error taxonomy surfaced in `error` events and dialogs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Network,
    ManifestParse,
    PartialDownload,
    Verification,
    InstallMove,
    Install,
    Config,
    Unexpected,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Network => "network",
            Self::ManifestParse => "manifest-parse",
            Self::PartialDownload => "partial-download",
            Self::Verification => "verification",
            Self::InstallMove => "install-move",
            Self::Install => "install",
            Self::Config => "config",
            Self::Unexpected => "unexpected",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(UpdateError::Network("down".into()).kind(), ErrorKind::Network);
        assert_eq!(
            UpdateError::HttpStatus { status: 404, url: "http://x".into() }.kind(),
            ErrorKind::Network
        );
        assert_eq!(
            UpdateError::Verification(VerificationFailure::Empty).kind(),
            ErrorKind::Verification
        );
        assert_eq!(
            UpdateError::PartialDownload { received: 3, expected: Some(10) }.kind(),
            ErrorKind::PartialDownload
        );
    }

    #[test]
    fn test_transient() {
        assert!(UpdateError::Network("timeout".into()).is_transient());
        assert!(UpdateError::HttpStatus { status: 503, url: String::new() }.is_transient());
        assert!(!UpdateError::HttpStatus { status: 404, url: String::new() }.is_transient());
        assert!(!UpdateError::ManifestParse("bad".into()).is_transient());
    }

    #[test]
    fn test_partial_download_message() {
        let err = UpdateError::PartialDownload { received: 5, expected: None };
        assert_eq!(err.to_string(), "download ended early: received 5 of unknown bytes");
    }
}
