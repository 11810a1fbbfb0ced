//! Platform installers for engine versions.
//!
//! Every installer satisfies [`tgs_engine_backend::EngineInstaller`]:
//! - [`PosixInstaller`] downloads the Linux archive and writes launch shims.
//! - [`WindowsInstaller`] downloads the Windows archive and applies the
//!   trust, redistributable and firewall fixups.
//! - [`RemoteInstaller`] has no local binaries at all.
//!
//! [`PlatformInstaller`] is the closed enum of the three, selected once at
//! startup.

mod download;
mod extract;
mod platform;
mod posix;
mod remote;
mod windows;

use std::path::{Path, PathBuf};

use log::{debug, warn};

pub use download::{ArchiveDownloader, LINUX_URL_TEMPLATE, WINDOWS_URL_TEMPLATE};
pub use extract::extract_archive;
pub use platform::{InstallerKind, InstallerOptions, PlatformInstaller};
pub use posix::PosixInstaller;
pub use remote::RemoteInstaller;
pub use windows::WindowsInstaller;

/// Directory inside an installation holding the executables.
pub const BIN_DIR: &str = "bin";

/// First build accepting the thread-count launch flag.
const MAP_THREADS_VERSION: (u32, u32) = (515, 1609);

fn cache_dir(user_data_dir: &Path) -> PathBuf {
    user_data_dir.join("cache")
}

async fn remove_cache_dir(cache: &Path) {
    match tokio::fs::remove_dir_all(cache).await {
        Ok(()) => debug!("Cleaned engine cache {}", cache.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to clean engine cache {}: {e}", cache.display()),
    }
}
