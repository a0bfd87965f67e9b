//! Failure taxonomy for handle resolution and windowed browsing.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::models::ImageKind;

/// Coarse failure class recorded in a `Failed` load state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    EmptyPath,
    InvalidFormat,
    IoFailure,
    Timeout,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EmptyPath => "empty-path",
            Self::InvalidFormat => "invalid-format",
            Self::IoFailure => "io-failure",
            Self::Timeout => "timeout",
        }
    }

    /// Everything except an empty path is worth another attempt.
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::EmptyPath)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single failed resolution attempt.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("empty-path")]
    EmptyPath,
    #[error("invalid-format: {path:?} has no recognized image signature")]
    InvalidFormat { path: PathBuf },
    #[error("io-failure: {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("timeout: {kind} attempt exceeded {budget:?}")]
    Timeout { kind: ImageKind, budget: Duration },
}

impl ResolveError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::EmptyPath => FailureKind::EmptyPath,
            Self::InvalidFormat { .. } => FailureKind::InvalidFormat,
            Self::Io { .. } => FailureKind::IoFailure,
            Self::Timeout { .. } => FailureKind::Timeout,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

/// Errors from big-page window navigation.
#[derive(Debug, thiserror::Error)]
pub enum WindowError {
    #[error("leaf index must be 1-based, got 0")]
    InvalidLeaf,
    #[error("leaf {index} is out of range ({leaves} leaves available)")]
    OutOfRange { index: usize, leaves: usize },
}

/// Errors while loading an engine config file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to determine project directories")]
    NoProjectDirs,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_empty_path_is_terminal() {
        assert!(!FailureKind::EmptyPath.is_retryable());
        assert!(FailureKind::InvalidFormat.is_retryable());
        assert!(FailureKind::IoFailure.is_retryable());
        assert!(FailureKind::Timeout.is_retryable());
    }

    #[test]
    fn test_error_kind_mapping() {
        let err = ResolveError::Io {
            path: PathBuf::from("/missing.jpg"),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert_eq!(err.kind(), FailureKind::IoFailure);
        assert!(err.to_string().starts_with("io-failure"));
        assert_eq!(ResolveError::EmptyPath.to_string(), "empty-path");
    }
}
