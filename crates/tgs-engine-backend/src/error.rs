use thiserror::Error;

use crate::types::{EngineType, VersionParseError};

/// Stable classification for errors that are safe to surface to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    EngineVersionInvalid,
    EngineUnsupported,
    EngineDownloadFail,
    EngineNoVersionsInstalled,
    EngineNonExistentVersion,
    EngineCannotDeleteActiveVersion,
    EngineInstallInProgress,
    EngineRedistributableInstallFail,
    EngineFirewallFail,
    EngineEventFail,
    EngineInstallRootLocked,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error(transparent)]
    InvalidVersion(#[from] VersionParseError),

    #[error("Engine {engine} is not supported by the {installer} installer")]
    UnsupportedEngine {
        engine: EngineType,
        installer: &'static str,
    },

    #[error("Failed to download {url}: {details}")]
    Download { url: String, details: String },

    #[error("No engine versions installed")]
    NoVersionsInstalled,

    #[error("Engine version {key} is not installed")]
    VersionNotInstalled { key: String },

    #[error("Cannot delete engine version {key} while it is the active version")]
    CannotDeleteActiveVersion { key: String },

    #[error("Engine version {key} is currently being installed")]
    InstallInProgress { key: String },

    #[error("Failed to install the bundled redistributable: {details}")]
    RedistributableInstall { details: String },

    #[error("Failed to add firewall rule (exit code {exit_code:?}): {output}")]
    FirewallRule {
        exit_code: Option<i32>,
        output: String,
    },

    #[error("Event handler for {event} failed: {details}")]
    Event { event: &'static str, details: String },

    #[error("Install root {path} is in use by another process")]
    InstallRootLocked { path: String },

    #[error("Failed to extract archive: {details}")]
    Extraction { details: String },

    #[error("IO error ({kind}): {message}")]
    Io {
        kind: std::io::ErrorKind,
        message: String,
    },

    #[error("Operation cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn download(url: impl Into<String>, details: impl Into<String>) -> Self {
        Self::Download {
            url: url.into(),
            details: details.into(),
        }
    }

    pub fn extraction<E>(error: E) -> Self
    where
        E: std::fmt::Display,
    {
        Self::Extraction {
            details: error.to_string(),
        }
    }

    /// Attach a path to an I/O error so the message says what was touched.
    #[must_use]
    pub fn io_with_path(path: &std::path::Path, source: &std::io::Error) -> Self {
        Self::Io {
            kind: source.kind(),
            message: format!("{}: {source}", path.display()),
        }
    }

    /// Classification of this error; `None` for cancellation and for
    /// unexpected I/O or extraction failures.
    #[must_use]
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::InvalidVersion(_) => Some(ErrorCode::EngineVersionInvalid),
            Self::UnsupportedEngine { .. } => Some(ErrorCode::EngineUnsupported),
            Self::Download { .. } => Some(ErrorCode::EngineDownloadFail),
            Self::NoVersionsInstalled => Some(ErrorCode::EngineNoVersionsInstalled),
            Self::VersionNotInstalled { .. } => Some(ErrorCode::EngineNonExistentVersion),
            Self::CannotDeleteActiveVersion { .. } => {
                Some(ErrorCode::EngineCannotDeleteActiveVersion)
            }
            Self::InstallInProgress { .. } => Some(ErrorCode::EngineInstallInProgress),
            Self::RedistributableInstall { .. } => {
                Some(ErrorCode::EngineRedistributableInstallFail)
            }
            Self::FirewallRule { .. } => Some(ErrorCode::EngineFirewallFail),
            Self::Event { .. } => Some(ErrorCode::EngineEventFail),
            Self::InstallRootLocked { .. } => Some(ErrorCode::EngineInstallRootLocked),
            Self::Extraction { .. } | Self::Io { .. } | Self::Cancelled => None,
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}
