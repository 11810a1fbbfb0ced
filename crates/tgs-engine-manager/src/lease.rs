use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::debug;
use tgs_engine_backend::{CancellationToken, EngineError, EngineVersion, ExecutableNames};

use crate::trust::TrustList;

/// Handle on one installed version's executables for the duration of a
/// session.
///
/// Releasing a lease never removes the version; [`Self::cleanup_on_detach`]
/// only records what the holder asked for.
#[derive(Debug)]
pub struct ExecutableLease {
    version: EngineVersion,
    server_path: PathBuf,
    compiler_path: PathBuf,
    supports_cli: bool,
    supports_map_threads: bool,
    acquired_at: DateTime<Utc>,
    cleanup_on_detach: bool,
    trust: Arc<TrustList>,
}

impl ExecutableLease {
    pub(crate) fn new(
        version: EngineVersion,
        bin_dir: &Path,
        names: ExecutableNames,
        trust: Arc<TrustList>,
    ) -> Result<Self, EngineError> {
        let resolve = |name: &str| {
            let path = bin_dir.join(name);
            std::path::absolute(&path).map_err(|e| EngineError::io_with_path(&path, &e))
        };
        Ok(Self {
            server_path: resolve(&names.server)?,
            compiler_path: resolve(&names.compiler)?,
            supports_cli: names.supports_cli,
            supports_map_threads: names.supports_map_threads,
            acquired_at: Utc::now(),
            cleanup_on_detach: true,
            trust,
            version,
        })
    }

    #[must_use]
    pub fn version(&self) -> &EngineVersion {
        &self.version
    }

    #[must_use]
    pub fn key(&self) -> String {
        self.version.key(true)
    }

    /// Absolute path of the server executable.
    #[must_use]
    pub fn server_path(&self) -> &Path {
        &self.server_path
    }

    /// Absolute path of the compiler executable.
    #[must_use]
    pub fn compiler_path(&self) -> &Path {
        &self.compiler_path
    }

    #[must_use]
    pub fn supports_cli(&self) -> bool {
        self.supports_cli
    }

    #[must_use]
    pub fn supports_map_threads(&self) -> bool {
        self.supports_map_threads
    }

    #[must_use]
    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    pub fn do_not_cleanup_on_detach(&mut self) {
        self.cleanup_on_detach = false;
    }

    #[must_use]
    pub fn cleanup_on_detach(&self) -> bool {
        self.cleanup_on_detach
    }

    /// Add `path` to the engine's trusted content list.
    ///
    /// # Errors
    /// See [`TrustList::trust`].
    pub async fn trust_path(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        self.trust.trust(path, cancel).await
    }
}

impl Drop for ExecutableLease {
    fn drop(&mut self) {
        debug!(
            "Released executables of {} (cleanup on detach: {})",
            self.version, self.cleanup_on_detach
        );
    }
}
