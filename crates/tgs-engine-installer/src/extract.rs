use std::io::Cursor;
use std::path::{Component, Path, PathBuf};

use log::{debug, warn};
use tgs_engine_backend::EngineError;

use crate::BIN_DIR;

/// Extract a zip archive held in memory into `dest`.
///
/// Blocking; callers run it on the blocking pool. When every entry lives
/// under one top-level directory, that directory is stripped so the
/// archive's contents land directly in `dest`.
///
/// # Errors
/// Returns [`EngineError::Extraction`] for malformed archives and
/// [`EngineError::Io`] for filesystem failures.
pub fn extract_archive(archive: &[u8], dest: &Path) -> Result<(), EngineError> {
    let mut archive =
        zip::ZipArchive::new(Cursor::new(archive)).map_err(EngineError::extraction)?;

    let names: Vec<Option<PathBuf>> = (0..archive.len())
        .map(|i| {
            archive
                .by_index(i)
                .map(|entry| entry.enclosed_name())
                .map_err(EngineError::extraction)
        })
        .collect::<Result<_, _>>()?;
    let root = common_root(names.iter().flatten());

    for (i, name) in names.into_iter().enumerate() {
        let Some(name) = name else {
            warn!("Skipping zip entry with unsafe path");
            continue;
        };
        let relative = match &root {
            Some(root) => name.strip_prefix(root).unwrap_or(&name).to_path_buf(),
            None => name,
        };
        if relative.as_os_str().is_empty() {
            continue;
        }
        let out_path = dest.join(&relative);

        let mut entry = archive.by_index(i).map_err(EngineError::extraction)?;
        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)
                .map_err(|e| EngineError::io_with_path(&out_path, &e))?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| EngineError::io_with_path(parent, &e))?;
        }
        let mut outfile =
            std::fs::File::create(&out_path).map_err(|e| EngineError::io_with_path(&out_path, &e))?;
        std::io::copy(&mut entry, &mut outfile)
            .map_err(|e| EngineError::io_with_path(&out_path, &e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                let _ = std::fs::set_permissions(&out_path, std::fs::Permissions::from_mode(mode));
            }
        }
    }

    debug!("Extraction complete to {}", dest.display());
    Ok(())
}

/// The single top-level directory shared by every entry, if there is one
/// and it is not already the `bin` directory.
fn common_root<'a>(names: impl Iterator<Item = &'a PathBuf>) -> Option<PathBuf> {
    let mut root: Option<&std::ffi::OsStr> = None;
    let mut nested = false;
    for name in names {
        let mut components = name.components();
        let Some(Component::Normal(first)) = components.next() else {
            return None;
        };
        match root {
            Some(existing) if existing != first => return None,
            Some(_) => {}
            None => root = Some(first),
        }
        nested |= components.next().is_some();
    }
    // A lone file at the top level is content, not a wrapper directory.
    if !nested || root.is_some_and(|root| root == BIN_DIR) {
        return None;
    }
    root.map(PathBuf::from)
}
