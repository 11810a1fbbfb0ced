use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tgs_engine_installer::{InstallerKind, InstallerOptions};
use tgs_engine_platform::{AppPaths, AppPathsError};

/// The `engine` section of the settings file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Where version directories live; defaults to the application data
    /// directory.
    #[serde(default)]
    pub install_root: Option<PathBuf>,

    #[serde(default)]
    pub download_url_template: Option<String>,

    #[serde(default)]
    pub installer: InstallerKind,

    #[serde(default)]
    pub skip_firewall_rule: bool,

    #[serde(default)]
    pub user_data_dir: Option<PathBuf>,

    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
}

fn default_http_timeout() -> u64 {
    300
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            install_root: None,
            download_url_template: None,
            installer: InstallerKind::default(),
            skip_firewall_rule: false,
            user_data_dir: None,
            http_timeout_secs: default_http_timeout(),
        }
    }
}

impl EngineSettings {
    /// # Errors
    /// Returns an error when no root is configured and the application data
    /// directory cannot be determined.
    pub fn resolve_install_root(&self) -> Result<PathBuf, AppPathsError> {
        match &self.install_root {
            Some(root) => Ok(root.clone()),
            None => Ok(AppPaths::new()?.engine_root()),
        }
    }

    #[must_use]
    pub fn installer_options(&self) -> InstallerOptions {
        InstallerOptions {
            kind: self.installer,
            download_url_template: self.download_url_template.clone(),
            user_data_dir: self.user_data_dir.clone(),
            skip_firewall_rule: self.skip_firewall_rule,
            http_timeout: Duration::from_secs(self.http_timeout_secs),
        }
    }
}
