use std::path::PathBuf;
use thiserror::Error;

const APP_DIR_NAME: &str = "tgs-engine";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AppPathsError {
    #[error("Could not determine home directory")]
    HomeDirUnavailable,
    #[error("Could not determine documents directory")]
    DocumentsDirUnavailable,
    #[error("Could not determine config directory")]
    ConfigDirUnavailable,
    #[error("Could not determine data directory")]
    DataDirUnavailable,
}

pub struct AppPaths {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
}

impl AppPaths {
    /// Build application paths for the current platform.
    ///
    /// # Errors
    /// Returns an error when the user config or data directory cannot be
    /// determined.
    pub fn new() -> Result<Self, AppPathsError> {
        Ok(Self {
            config_dir: dirs::config_dir()
                .ok_or(AppPathsError::ConfigDirUnavailable)?
                .join(APP_DIR_NAME),
            data_dir: dirs::data_dir()
                .ok_or(AppPathsError::DataDirUnavailable)?
                .join(APP_DIR_NAME),
        })
    }

    #[must_use]
    pub fn settings_file(&self) -> PathBuf {
        self.config_dir.join("settings.json")
    }

    #[must_use]
    pub fn log_file(&self) -> PathBuf {
        self.data_dir.join("tgs-engine.log")
    }

    /// Default install root for engine versions.
    #[must_use]
    pub fn engine_root(&self) -> PathBuf {
        self.data_dir.join("engine")
    }

    /// Ensure all application directories exist on disk.
    ///
    /// # Errors
    /// Returns an error if any directory cannot be created.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.config_dir)?;
        std::fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }
}

/// Folder the engine itself keeps per-user state in.
///
/// # Errors
/// Returns an error when the home (POSIX) or documents (Windows) directory
/// cannot be determined.
pub fn engine_user_dir() -> Result<PathBuf, AppPathsError> {
    #[cfg(windows)]
    {
        Ok(dirs::document_dir()
            .ok_or(AppPathsError::DocumentsDirUnavailable)?
            .join("BYOND"))
    }

    #[cfg(not(windows))]
    {
        Ok(dirs::home_dir()
            .ok_or(AppPathsError::HomeDirUnavailable)?
            .join(".byond"))
    }
}
