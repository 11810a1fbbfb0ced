use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::debug;
use tgs_engine_backend::{
    CancellationToken, EngineError, EngineInstaller, EngineType, EngineVersion, ExecutableNames,
    PostInstallReport, ProgressReporter,
};

use crate::MAP_THREADS_VERSION;

/// Installer for engines that run somewhere else.
///
/// Nothing is downloaded or extracted; an "installation" is just the
/// version directory and its marker.
#[derive(Debug, Clone)]
pub struct RemoteInstaller {
    user_data_dir: PathBuf,
}

impl RemoteInstaller {
    #[must_use]
    pub fn new(user_data_dir: PathBuf) -> Self {
        Self { user_data_dir }
    }
}

#[async_trait]
impl EngineInstaller for RemoteInstaller {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn supports(&self, _engine: EngineType) -> bool {
        true
    }

    fn executable_names(&self, version: &EngineVersion) -> ExecutableNames {
        ExecutableNames {
            server: "DreamDaemon".to_string(),
            compiler: "DreamMaker".to_string(),
            supports_cli: true,
            supports_map_threads: version.engine == EngineType::Byond
                && version.at_least(MAP_THREADS_VERSION.0, MAP_THREADS_VERSION.1),
        }
    }

    fn user_data_dir(&self) -> &Path {
        &self.user_data_dir
    }

    async fn download(
        &self,
        version: &EngineVersion,
        _progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<u8>>, EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        debug!("remote: nothing to download for {version}");
        Ok(None)
    }

    async fn install(
        &self,
        _version: &EngineVersion,
        _path: &Path,
        cancel: &CancellationToken,
    ) -> Result<PostInstallReport, EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        Ok(PostInstallReport::default())
    }

    async fn upgrade_installation(
        &self,
        _version: &EngineVersion,
        _path: &Path,
        _cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        Ok(())
    }

    async fn clean_cache(&self, _cancel: &CancellationToken) {}
}
