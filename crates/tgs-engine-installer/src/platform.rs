use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};
use tgs_engine_backend::{
    CancellationToken, EngineError, EngineInstaller, EngineType, EngineVersion, ExecutableNames,
    PostInstallReport, ProgressReporter,
};

use crate::download::{ArchiveDownloader, LINUX_URL_TEMPLATE, WINDOWS_URL_TEMPLATE};
use crate::posix::PosixInstaller;
use crate::remote::RemoteInstaller;
use crate::windows::WindowsInstaller;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallerKind {
    /// Probe the host platform.
    #[default]
    Auto,
    Remote,
}

#[derive(Debug, Clone)]
pub struct InstallerOptions {
    pub kind: InstallerKind,
    pub download_url_template: Option<String>,
    pub user_data_dir: Option<PathBuf>,
    pub skip_firewall_rule: bool,
    pub http_timeout: Duration,
}

impl Default for InstallerOptions {
    fn default() -> Self {
        Self {
            kind: InstallerKind::Auto,
            download_url_template: None,
            user_data_dir: None,
            skip_firewall_rule: false,
            http_timeout: Duration::from_secs(300),
        }
    }
}

/// The closed set of installers, chosen once at startup.
#[derive(Debug)]
pub enum PlatformInstaller {
    Posix(PosixInstaller),
    Windows(WindowsInstaller),
    Remote(RemoteInstaller),
}

impl PlatformInstaller {
    /// Select the installer for this host according to `options`.
    ///
    /// # Errors
    /// Returns an error when the engine user folder cannot be determined or
    /// the HTTP client cannot be built.
    pub fn select(options: &InstallerOptions) -> Result<Self, EngineError> {
        let user_data_dir = match &options.user_data_dir {
            Some(dir) => dir.clone(),
            None => tgs_engine_platform::engine_user_dir().map_err(|e| EngineError::Io {
                kind: std::io::ErrorKind::NotFound,
                message: e.to_string(),
            })?,
        };

        let installer = match options.kind {
            InstallerKind::Remote => Self::Remote(RemoteInstaller::new(user_data_dir)),
            InstallerKind::Auto if cfg!(windows) => {
                let downloader = Self::downloader(options, WINDOWS_URL_TEMPLATE)?;
                Self::Windows(WindowsInstaller::new(
                    downloader,
                    user_data_dir,
                    options.skip_firewall_rule,
                ))
            }
            InstallerKind::Auto => {
                let downloader = Self::downloader(options, LINUX_URL_TEMPLATE)?;
                Self::Posix(PosixInstaller::new(downloader, user_data_dir))
            }
        };

        info!("Using {} engine installer", installer.name());
        Ok(installer)
    }

    fn downloader(
        options: &InstallerOptions,
        default_template: &str,
    ) -> Result<ArchiveDownloader, EngineError> {
        let template = options
            .download_url_template
            .as_deref()
            .unwrap_or(default_template);
        ArchiveDownloader::new(template, options.http_timeout)
    }

    fn inner(&self) -> &dyn EngineInstaller {
        match self {
            Self::Posix(installer) => installer,
            Self::Windows(installer) => installer,
            Self::Remote(installer) => installer,
        }
    }
}

#[async_trait]
impl EngineInstaller for PlatformInstaller {
    fn name(&self) -> &'static str {
        self.inner().name()
    }

    fn supports(&self, engine: EngineType) -> bool {
        self.inner().supports(engine)
    }

    fn executable_names(&self, version: &EngineVersion) -> ExecutableNames {
        self.inner().executable_names(version)
    }

    fn user_data_dir(&self) -> &Path {
        self.inner().user_data_dir()
    }

    async fn download(
        &self,
        version: &EngineVersion,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<u8>>, EngineError> {
        self.inner().download(version, progress, cancel).await
    }

    async fn install(
        &self,
        version: &EngineVersion,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<PostInstallReport, EngineError> {
        self.inner().install(version, path, cancel).await
    }

    async fn upgrade_installation(
        &self,
        version: &EngineVersion,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        self.inner().upgrade_installation(version, path, cancel).await
    }

    async fn clean_cache(&self, cancel: &CancellationToken) {
        self.inner().clean_cache(cancel).await;
    }
}
