//! Engine version installation manager.
//!
//! [`EngineManager`] owns one install root: it deduplicates concurrent
//! installs per version key, persists the active version, hands out
//! [`ExecutableLease`]s and reconciles the root with what is on disk at
//! startup.

mod config;
mod lease;
mod lock;
mod manager;
mod persist;
mod registry;
mod trust;

pub use config::EngineSettings;
pub use lease::ExecutableLease;
pub use lock::InstallRootLock;
pub use manager::{CustomArchive, EngineManager};
pub use persist::{ACTIVE_VERSION_FILE, VERSION_MARKER};
pub use trust::TrustList;
