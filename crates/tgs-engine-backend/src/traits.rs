use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::progress::ProgressReporter;
use crate::types::{EngineType, EngineVersion};

/// Executable names inside an installation's `bin` directory, plus the
/// launch capabilities of that build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutableNames {
    pub server: String,
    pub compiler: String,
    pub supports_cli: bool,
    pub supports_map_threads: bool,
}

/// Outcome of the first-time install hook.
///
/// Best-effort steps never fail the install; their classified errors are
/// collected here instead.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostInstallReport {
    pub warnings: Vec<EngineError>,
}

impl PostInstallReport {
    pub fn warn(&mut self, error: EngineError) {
        self.warnings.push(error);
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

#[async_trait]
pub trait EngineInstaller: Send + Sync {
    fn name(&self) -> &'static str;

    fn supports(&self, engine: EngineType) -> bool;

    fn executable_names(&self, version: &EngineVersion) -> ExecutableNames;

    /// Folder the engine keeps per-user state in (trust list, cache).
    fn user_data_dir(&self) -> &Path;

    /// Fetch the archive for `version`. `None` means there is nothing to
    /// extract for this installer.
    async fn download(
        &self,
        version: &EngineVersion,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<u8>>, EngineError>;

    /// First-time fixups for a freshly extracted installation.
    async fn install(
        &self,
        version: &EngineVersion,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<PostInstallReport, EngineError>;

    /// Idempotent fixups re-run at every startup for existing installations.
    async fn upgrade_installation(
        &self,
        version: &EngineVersion,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError>;

    /// Best-effort removal of the engine's own cache directory.
    async fn clean_cache(&self, cancel: &CancellationToken);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    EngineInstallStart,
    EngineInstallFail,
    EngineActiveVersionChange,
}

impl EventType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EngineInstallStart => "EngineInstallStart",
            Self::EngineInstallFail => "EngineInstallFail",
            Self::EngineActiveVersionChange => "EngineActiveVersionChange",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait EventConsumer: Send + Sync {
    async fn handle_event(
        &self,
        event: EventType,
        args: Vec<Option<String>>,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError>;
}

/// Event sink that drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventConsumer;

#[async_trait]
impl EventConsumer for NoopEventConsumer {
    async fn handle_event(
        &self,
        _event: EventType,
        _args: Vec<Option<String>>,
        _cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_install_report_collects_warnings() {
        let mut report = PostInstallReport::default();
        assert!(report.is_clean());

        report.warn(EngineError::RedistributableInstall {
            details: "exit code 5".to_string(),
        });

        assert!(!report.is_clean());
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn event_type_names_are_stable() {
        assert_eq!(EventType::EngineInstallStart.to_string(), "EngineInstallStart");
        assert_eq!(EventType::EngineInstallFail.to_string(), "EngineInstallFail");
        assert_eq!(
            EventType::EngineActiveVersionChange.to_string(),
            "EngineActiveVersionChange"
        );
    }

    #[tokio::test]
    async fn noop_consumer_accepts_events() {
        let consumer: Box<dyn EventConsumer> = Box::new(NoopEventConsumer);
        let result = consumer
            .handle_event(
                EventType::EngineInstallStart,
                vec![Some("515.1633".to_string())],
                &CancellationToken::new(),
            )
            .await;
        assert!(result.is_ok());
    }
}
