use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::debug;
use tgs_engine_backend::{EngineError, EngineVersion};

/// Marker inside a version directory; its presence is the sole proof the
/// install completed.
pub const VERSION_MARKER: &str = "Version.txt";

/// Pointer file in the install root naming the active version key.
pub const ACTIVE_VERSION_FILE: &str = "ActiveVersion.txt";

/// Replace `path` with `data` through a synced sibling temp file.
///
/// The rename is followed by a sync of the parent directory, so once this
/// returns the new content survives a crash. Readers never observe a
/// partial write.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    let prefix = format!(
        ".{}.",
        path.file_name()
            .and_then(std::ffi::OsStr::to_str)
            .unwrap_or("engine")
    );

    let mut staged = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".tmp")
        .tempfile_in(parent)?;
    staged.write_all(data)?;
    staged.as_file().sync_all()?;
    staged.persist(path).map_err(|e| e.error)?;

    sync_dir(parent)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    std::fs::File::open(dir)?.sync_all()
}

// Directory handles cannot be synced on Windows; the rename is already
// durable there once it returns.
#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

pub(crate) async fn write_text(path: PathBuf, content: String) -> Result<(), EngineError> {
    tokio::task::spawn_blocking(move || {
        write_atomic(&path, content.as_bytes()).map_err(|e| EngineError::io_with_path(&path, &e))
    })
    .await
    .map_err(|e| EngineError::Io {
        kind: io::ErrorKind::Other,
        message: e.to_string(),
    })?
}

/// Read and validate the marker of a version directory.
///
/// Returns `None` when the marker is missing, unreadable, unparsable, or
/// names a key other than the directory's own.
pub(crate) async fn read_marker(version_dir: &Path) -> Option<EngineVersion> {
    let dir_name = version_dir.file_name()?.to_str()?;
    let marker = version_dir.join(VERSION_MARKER);
    let content = tokio::fs::read_to_string(&marker).await.ok()?;
    let content = content.trim();

    let version: EngineVersion = match content.parse() {
        Ok(version) => version,
        Err(e) => {
            debug!("Unparsable marker {}: {e}", marker.display());
            return None;
        }
    };
    if version.key(true) != dir_name {
        debug!(
            "Marker {} names {content}, expected {dir_name}",
            marker.display()
        );
        return None;
    }
    Some(version)
}

/// Read the persisted active version pointer, if any.
pub(crate) async fn read_active_pointer(root: &Path) -> Option<String> {
    let content = tokio::fs::read_to_string(root.join(ACTIVE_VERSION_FILE))
        .await
        .ok()?;
    let key = content.trim();
    (!key.is_empty()).then(|| key.to_string())
}
