use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, info, warn};
use tgs_engine_backend::{
    CancellationToken, EngineError, EngineInstaller, EngineType, EngineVersion, ExecutableNames,
    PostInstallReport, ProgressReporter,
};

use crate::download::ArchiveDownloader;
use crate::{BIN_DIR, MAP_THREADS_VERSION, cache_dir, remove_cache_dir};

const SERVER_BINARY: &str = "DreamDaemon";
const COMPILER_BINARY: &str = "DreamMaker";
const SHIM_EXTENSION: &str = "sh";

/// Installer for the primary engine on Linux and other POSIX hosts.
///
/// The stock binaries expect their own directory on the library search
/// path, so each one gets a `.sh` shim beside it that fixes the environment
/// and execs the real binary.
#[derive(Debug, Clone)]
pub struct PosixInstaller {
    downloader: ArchiveDownloader,
    user_data_dir: PathBuf,
}

impl PosixInstaller {
    #[must_use]
    pub fn new(downloader: ArchiveDownloader, user_data_dir: PathBuf) -> Self {
        Self {
            downloader,
            user_data_dir,
        }
    }

    fn shim_name(binary: &str) -> String {
        format!("{binary}.{SHIM_EXTENSION}")
    }

    async fn write_shims(bin_dir: &Path) -> Result<(), EngineError> {
        tokio::fs::create_dir_all(bin_dir)
            .await
            .map_err(|e| EngineError::io_with_path(bin_dir, &e))?;

        for binary in [SERVER_BINARY, COMPILER_BINARY] {
            let shim_path = bin_dir.join(Self::shim_name(binary));
            tokio::fs::write(&shim_path, shim_script(binary))
                .await
                .map_err(|e| EngineError::io_with_path(&shim_path, &e))?;
            make_executable(&shim_path).await?;

            let binary_path = bin_dir.join(binary);
            if tokio::fs::try_exists(&binary_path).await.unwrap_or(false) {
                make_executable(&binary_path).await?;
            }
        }

        debug!("Wrote launch shims in {}", bin_dir.display());
        Ok(())
    }

    async fn shims_present(bin_dir: &Path) -> bool {
        for binary in [SERVER_BINARY, COMPILER_BINARY] {
            let shim = bin_dir.join(Self::shim_name(binary));
            if !tokio::fs::try_exists(&shim).await.unwrap_or(false) {
                return false;
            }
        }
        true
    }
}

fn shim_script(binary: &str) -> String {
    format!(
        "#!/bin/sh\n\
         BIN_DIR=\"$(cd \"$(dirname \"$0\")\" && pwd)\"\n\
         if [ -f \"$BIN_DIR/byondsetup\" ]; then . \"$BIN_DIR/byondsetup\"; fi\n\
         export LD_LIBRARY_PATH=\"$BIN_DIR${{LD_LIBRARY_PATH:+:$LD_LIBRARY_PATH}}\"\n\
         exec \"$BIN_DIR/{binary}\" \"$@\"\n"
    )
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> Result<(), EngineError> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .await
        .map_err(|e| EngineError::io_with_path(path, &e))
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> Result<(), EngineError> {
    Ok(())
}

#[async_trait]
impl EngineInstaller for PosixInstaller {
    fn name(&self) -> &'static str {
        "posix"
    }

    fn supports(&self, engine: EngineType) -> bool {
        engine == EngineType::Byond
    }

    fn executable_names(&self, version: &EngineVersion) -> ExecutableNames {
        ExecutableNames {
            server: Self::shim_name(SERVER_BINARY),
            compiler: Self::shim_name(COMPILER_BINARY),
            supports_cli: true,
            supports_map_threads: version.at_least(MAP_THREADS_VERSION.0, MAP_THREADS_VERSION.1),
        }
    }

    fn user_data_dir(&self) -> &Path {
        &self.user_data_dir
    }

    async fn download(
        &self,
        version: &EngineVersion,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<u8>>, EngineError> {
        self.downloader
            .fetch(version, progress, cancel)
            .await
            .map(Some)
    }

    async fn install(
        &self,
        version: &EngineVersion,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<PostInstallReport, EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        info!("posix: preparing engine {version} in {}", path.display());
        Self::write_shims(&path.join(BIN_DIR)).await?;
        Ok(PostInstallReport::default())
    }

    async fn upgrade_installation(
        &self,
        version: &EngineVersion,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let bin_dir = path.join(BIN_DIR);
        if Self::shims_present(&bin_dir).await {
            return Ok(());
        }
        warn!("posix: engine {version} is missing launch shims, rewriting them");
        Self::write_shims(&bin_dir).await
    }

    async fn clean_cache(&self, _cancel: &CancellationToken) {
        remove_cache_dir(&cache_dir(&self.user_data_dir)).await;
    }
}
