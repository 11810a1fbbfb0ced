use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tgs_engine_backend::EngineError;

const LOCK_FILE: &str = "engine.lock";

/// Exclusive claim on an install root, held for the manager's lifetime.
///
/// The OS releases the lock when the file handle closes, so a crashed
/// process never leaves the root stuck.
#[derive(Debug)]
pub struct InstallRootLock {
    _file: File,
    path: PathBuf,
}

impl InstallRootLock {
    /// # Errors
    /// Returns [`EngineError::InstallRootLocked`] when another process holds
    /// the root, or an I/O error when the lock file cannot be opened.
    pub fn acquire(root: &Path) -> Result<Self, EngineError> {
        std::fs::create_dir_all(root).map_err(|e| EngineError::io_with_path(root, &e))?;
        let path = root.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| EngineError::io_with_path(&path, &e))?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(error) if error.kind() == fs2::lock_contended_error().kind() => {
                return Err(EngineError::InstallRootLocked {
                    path: root.display().to_string(),
                });
            }
            Err(error) => return Err(EngineError::io_with_path(&path, &error)),
        }

        file.set_len(0)
            .and_then(|()| file.seek(SeekFrom::Start(0)).map(|_| ()))
            .and_then(|()| writeln!(file, "{}", std::process::id()))
            .map_err(|e| EngineError::io_with_path(&path, &e))?;

        Ok(Self { _file: file, path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}
