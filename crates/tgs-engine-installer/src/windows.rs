use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, info, warn};
use tgs_engine_backend::{
    CancellationToken, EngineError, EngineInstaller, EngineType, EngineVersion, ExecutableNames,
    PostInstallReport, ProgressReporter,
};
use tgs_engine_platform::run_process;
use tokio::sync::Mutex;

use crate::download::ArchiveDownloader;
use crate::{BIN_DIR, MAP_THREADS_VERSION, cache_dir, remove_cache_dir};

/// First build shipping the console-friendly `dd.exe`.
const CLI_SERVER_VERSION: (u32, u32) = (515, 1598);

const TRUSTED_CONFIG_DIR: &str = "cfg";
const TRUSTED_CONFIG_FILE: &str = "daemon.txt";
const TRUSTED_CONFIG_CONTENT: &str = "trusted-check 0";
const REDISTRIBUTABLE_DIR: &str = "directx";
const REDISTRIBUTABLE_SETUP: &str = "DXSETUP.exe";
const FIREWALL_TOOL: &str = "netsh.exe";

/// Installer for the primary engine on Windows hosts.
///
/// Besides the trust prompt fixup, two best-effort steps run after
/// extraction: the bundled redistributable (once per process) and an inbound
/// firewall rule for the server executable.
#[derive(Debug)]
pub struct WindowsInstaller {
    downloader: ArchiveDownloader,
    user_data_dir: PathBuf,
    skip_firewall_rule: bool,
    redistributable_installed: Mutex<bool>,
}

impl WindowsInstaller {
    #[must_use]
    pub fn new(
        downloader: ArchiveDownloader,
        user_data_dir: PathBuf,
        skip_firewall_rule: bool,
    ) -> Self {
        Self {
            downloader,
            user_data_dir,
            skip_firewall_rule,
            redistributable_installed: Mutex::new(false),
        }
    }

    async fn disable_trust_prompt(path: &Path) -> Result<(), EngineError> {
        let config_dir = path.join(TRUSTED_CONFIG_DIR);
        tokio::fs::create_dir_all(&config_dir)
            .await
            .map_err(|e| EngineError::io_with_path(&config_dir, &e))?;
        let config_path = config_dir.join(TRUSTED_CONFIG_FILE);
        debug!("windows: disabling trusted prompts in {}", config_path.display());
        tokio::fs::write(&config_path, TRUSTED_CONFIG_CONTENT)
            .await
            .map_err(|e| EngineError::io_with_path(&config_path, &e))
    }

    async fn install_redistributable(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let mut installed = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(EngineError::Cancelled),
            guard = self.redistributable_installed.lock() => guard,
        };
        if *installed {
            debug!("windows: redistributable already installed this session");
            return Ok(());
        }

        let redist_dir = path.join(REDISTRIBUTABLE_DIR);
        let setup = redist_dir.join(REDISTRIBUTABLE_SETUP);
        if !tokio::fs::try_exists(&setup).await.unwrap_or(false) {
            debug!("windows: no bundled redistributable in {}", path.display());
            return Ok(());
        }

        info!("windows: installing bundled redistributable");
        let output = run_process(&setup, ["/silent"], Some(&redist_dir), cancel)
            .await
            .map_err(|e| EngineError::RedistributableInstall {
                details: e.to_string(),
            })?
            .ok_or(EngineError::Cancelled)?;

        if !output.success() {
            return Err(EngineError::RedistributableInstall {
                details: format!("exit code {:?}: {}", output.exit_code, output.output.trim()),
            });
        }

        *installed = true;
        Ok(())
    }

    /// `netsh` arguments for an inbound rule on `server_path`, which is made
    /// absolute first.
    fn firewall_rule_args(
        version: &EngineVersion,
        server_path: &Path,
    ) -> Result<Vec<String>, EngineError> {
        let program = std::path::absolute(server_path)
            .map_err(|e| EngineError::io_with_path(server_path, &e))?;
        Ok(vec![
            "advfirewall".to_string(),
            "firewall".to_string(),
            "add".to_string(),
            "rule".to_string(),
            format!("name=TGS Engine {}", version.key(true)),
            format!("program={}", program.display()),
            "protocol=tcp".to_string(),
            "dir=in".to_string(),
            "enable=yes".to_string(),
            "action=allow".to_string(),
        ])
    }

    async fn add_firewall_rule(
        version: &EngineVersion,
        server_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let args = Self::firewall_rule_args(version, server_path)?;
        info!("windows: adding firewall rule for {}", server_path.display());

        let output = run_process(Path::new(FIREWALL_TOOL), &args, None, cancel)
            .await
            .map_err(|e| EngineError::FirewallRule {
                exit_code: None,
                output: e.to_string(),
            })?
            .ok_or(EngineError::Cancelled)?;

        if output.success() {
            Ok(())
        } else {
            Err(EngineError::FirewallRule {
                exit_code: output.exit_code,
                output: output.output.trim().to_string(),
            })
        }
    }
}

/// Record a best-effort failure; cancellation still aborts the install.
fn best_effort(
    report: &mut PostInstallReport,
    step: &str,
    result: Result<(), EngineError>,
) -> Result<(), EngineError> {
    match result {
        Ok(()) => Ok(()),
        Err(EngineError::Cancelled) => Err(EngineError::Cancelled),
        Err(error) => {
            warn!("windows: {step} failed: {error}");
            report.warn(error);
            Ok(())
        }
    }
}

#[async_trait]
impl EngineInstaller for WindowsInstaller {
    fn name(&self) -> &'static str {
        "windows"
    }

    fn supports(&self, engine: EngineType) -> bool {
        engine == EngineType::Byond
    }

    fn executable_names(&self, version: &EngineVersion) -> ExecutableNames {
        let supports_cli = version.at_least(CLI_SERVER_VERSION.0, CLI_SERVER_VERSION.1);
        ExecutableNames {
            server: if supports_cli { "dd.exe" } else { "dreamdaemon.exe" }.to_string(),
            compiler: "dm.exe".to_string(),
            supports_cli,
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
        Self::disable_trust_prompt(path).await?;

        let mut report = PostInstallReport::default();
        best_effort(
            &mut report,
            "redistributable install",
            self.install_redistributable(path, cancel).await,
        )?;

        if self.skip_firewall_rule {
            debug!("windows: firewall rule disabled by configuration");
        } else {
            let server = path
                .join(BIN_DIR)
                .join(self.executable_names(version).server);
            best_effort(
                &mut report,
                "firewall rule",
                Self::add_firewall_rule(version, &server, cancel).await,
            )?;
        }

        Ok(report)
    }

    async fn upgrade_installation(
        &self,
        _version: &EngineVersion,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        Self::disable_trust_prompt(path).await
    }

    async fn clean_cache(&self, _cancel: &CancellationToken) {
        remove_cache_dir(&cache_dir(&self.user_data_dir)).await;
    }
}
