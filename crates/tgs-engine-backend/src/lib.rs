mod error;
mod progress;
mod traits;
mod types;

pub use error::{EngineError, ErrorCode};
pub use progress::ProgressReporter;
pub use traits::{
    EngineInstaller, EventConsumer, EventType, ExecutableNames, NoopEventConsumer,
    PostInstallReport,
};
pub use types::{EngineType, EngineVersion, VersionComponent, VersionParseError};

pub use tokio_util::sync::CancellationToken;
