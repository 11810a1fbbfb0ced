use std::path::{Path, PathBuf};

use log::{debug, info};
use tgs_engine_backend::{CancellationToken, EngineError};
use tokio::sync::Mutex;

const TRUST_DIR: &str = "cfg";
const TRUST_FILE: &str = "trusted.txt";

/// The engine's allow-list of content paths it may run without prompting.
///
/// Guarded by its own lock so trusting a path never queues behind an
/// install.
#[derive(Debug)]
pub struct TrustList {
    path: PathBuf,
    lock: Mutex<()>,
}

impl TrustList {
    #[must_use]
    pub fn new(user_data_dir: &Path) -> Self {
        Self {
            path: user_data_dir.join(TRUST_DIR).join(TRUST_FILE),
            lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `content_path` to the list unless it is already there.
    ///
    /// # Errors
    /// Returns [`EngineError::Cancelled`] if `cancel` fires before the lock
    /// is acquired, or an I/O error if the list cannot be read or written.
    pub async fn trust(
        &self,
        content_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let _guard = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(EngineError::Cancelled),
            guard = self.lock.lock() => guard,
        };

        let entry = content_path.display().to_string();
        let existing = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(EngineError::io_with_path(&self.path, &e)),
        };

        if existing.lines().any(|line| line.trim() == entry) {
            debug!("{entry} is already trusted");
            return Ok(());
        }

        let mut updated = existing;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str(&entry);
        updated.push('\n');

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| EngineError::io_with_path(parent, &e))?;
        }
        tokio::fs::write(&self.path, updated)
            .await
            .map_err(|e| EngineError::io_with_path(&self.path, &e))?;

        info!("Trusted {entry} in {}", self.path.display());
        Ok(())
    }
}
