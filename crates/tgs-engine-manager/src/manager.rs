use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, error, info, warn};
use tgs_engine_backend::{
    CancellationToken, EngineError, EngineInstaller, EngineVersion, EventConsumer, EventType,
    ProgressReporter,
};
use tgs_engine_installer::{BIN_DIR, extract_archive};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::lease::ExecutableLease;
use crate::lock::InstallRootLock;
use crate::persist::{self, ACTIVE_VERSION_FILE, VERSION_MARKER};
use crate::registry::{Claim, PendingGuard, VersionRegistry, wait_for};
use crate::trust::TrustList;

/// A user supplied engine archive.
pub type CustomArchive = Box<dyn AsyncRead + Send + Unpin>;

/// Orchestrates engine installs, the active version and executable leases
/// for one install root.
///
/// Every method may be called concurrently from any number of tasks.
pub struct EngineManager {
    root: PathBuf,
    installer: Arc<dyn EngineInstaller>,
    events: Arc<dyn EventConsumer>,
    registry: VersionRegistry,
    active: Mutex<ActiveState>,
    // Serialises the persist -> event -> publish tail of version switches.
    switch_lock: tokio::sync::Mutex<()>,
    trust: Arc<TrustList>,
    _root_lock: InstallRootLock,
}

impl EngineManager {
    /// Claim `root`, clean the engine cache and reconcile what is on disk.
    ///
    /// Corrupt installs and a dangling active pointer are discarded, never
    /// fatal.
    ///
    /// # Errors
    /// Returns [`EngineError::InstallRootLocked`] when another process owns
    /// `root`, [`EngineError::Cancelled`] when `cancel` fires, or an I/O
    /// error when the root cannot be created.
    pub async fn start(
        root: PathBuf,
        installer: Arc<dyn EngineInstaller>,
        events: Arc<dyn EventConsumer>,
        cancel: &CancellationToken,
    ) -> Result<Self, EngineError> {
        let root_lock = InstallRootLock::acquire(&root)?;
        info!(
            "Engine manager starting in {} with the {} installer",
            root.display(),
            installer.name()
        );

        installer.clean_cache(cancel).await;

        let manager = Self {
            trust: Arc::new(TrustList::new(installer.user_data_dir())),
            root,
            installer,
            events,
            registry: VersionRegistry::default(),
            active: Mutex::default(),
            switch_lock: tokio::sync::Mutex::new(()),
            _root_lock: root_lock,
        };
        manager.reconcile(cancel).await;

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        Ok(manager)
    }

    #[must_use]
    pub fn install_root(&self) -> &Path {
        &self.root
    }

    /// Version new sessions use when none is requested.
    #[must_use]
    pub fn active_version(&self) -> Option<EngineVersion> {
        lock_active(&self.active).current.clone()
    }

    /// Sorted snapshot of completed installs.
    #[must_use]
    pub fn installed_versions(&self) -> Vec<EngineVersion> {
        self.registry.installed_versions()
    }

    /// Make `version` the active version, installing it first if needed.
    ///
    /// With a `custom` archive the build always gets a fresh key of its
    /// own; the returned version carries that key.
    ///
    /// # Errors
    /// Returns [`EngineError::VersionNotInstalled`] when `allow_install` is
    /// false and the version is missing, any install error, or
    /// [`EngineError::Event`] when the change notification fails.
    pub async fn change_version(
        &self,
        progress: &ProgressReporter,
        version: &EngineVersion,
        custom: Option<CustomArchive>,
        allow_install: bool,
        cancel: &CancellationToken,
    ) -> Result<EngineVersion, EngineError> {
        let installed = if custom.is_some() || allow_install {
            self.request_install(version, custom, progress, cancel)
                .await?
        } else {
            let key = version.key(true);
            self.registry
                .installed(&key)
                .ok_or(EngineError::VersionNotInstalled { key })?
        };
        let key = installed.key(true);

        let _switch = self.lock_switch(cancel).await?;
        // Pin before checking the registry; deletion claims the key before
        // checking the pin, so one of the two always sees the other.
        let incoming = IncomingSwitch::pin(&self.active, &key);
        if self.registry.installed(&key).is_none() {
            return Err(EngineError::VersionNotInstalled { key });
        }

        let previous = incoming.previous.clone();
        persist::write_text(self.root.join(ACTIVE_VERSION_FILE), key.clone()).await?;
        self.emit(
            EventType::EngineActiveVersionChange,
            vec![previous.as_ref().map(|v| v.key(true)), Some(key.clone())],
            cancel,
        )
        .await?;
        incoming.publish(installed.clone());

        match previous {
            Some(previous) => info!("Active engine version changed from {previous} to {key}"),
            None => info!("Active engine version set to {key}"),
        }
        Ok(installed)
    }

    /// Remove an installed version that is neither active nor pending.
    ///
    /// Deleting a version that is not installed succeeds. Never waits on a
    /// version switch in progress.
    ///
    /// # Errors
    /// Returns [`EngineError::CannotDeleteActiveVersion`] for the active
    /// version or one being switched to, [`EngineError::InstallInProgress`],
    /// [`EngineError::Cancelled`], or an I/O error.
    pub async fn delete_version(
        &self,
        progress: &ProgressReporter,
        version: &EngineVersion,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let key = version.key(true);
        let Some((installed, guard)) = self.registry.claim_for_delete(&key)? else {
            debug!("Engine version {key} is not installed, nothing to delete");
            progress.report(100);
            return Ok(());
        };
        if lock_active(&self.active).holds(&key) {
            guard.restored(installed);
            return Err(EngineError::CannotDeleteActiveVersion { key });
        }

        let dir = self.root.join(&key);
        // Marker first: a crash after this line leaves a directory that
        // reconciliation deletes.
        let marker = dir.join(VERSION_MARKER);
        if let Err(e) = in_version_dir(&guard, move || clear_file(&marker)).await {
            warn!("Engine version {key} kept, its marker could not be removed: {e}");
            guard.restored(installed);
            return Err(e);
        }
        progress.report(50);

        let target = dir.clone();
        if let Err(e) = in_version_dir(&guard, move || clear_dir(&target)).await {
            warn!("Engine version {key} unregistered but its files remain: {e}");
            guard.failed(e.clone());
            return Err(e);
        }

        guard.removed();
        progress.report(100);
        info!("Deleted engine version {key}");
        Ok(())
    }

    /// Lease the executables of `required`, or of the active version.
    ///
    /// The version is installed first if it is missing. When `trust_path`
    /// is given it is added to the engine's trusted content list.
    ///
    /// # Errors
    /// Returns [`EngineError::NoVersionsInstalled`] when no version is
    /// requested and none is active, or any install or trust error.
    pub async fn use_executables(
        &self,
        required: Option<&EngineVersion>,
        trust_path: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<ExecutableLease, EngineError> {
        let version = match required {
            Some(version) => version.clone(),
            None => self
                .active_version()
                .ok_or(EngineError::NoVersionsInstalled)?,
        };

        let installed = self
            .request_install(&version, None, &ProgressReporter::disabled(), cancel)
            .await?;
        let bin_dir = self.root.join(installed.key(true)).join(BIN_DIR);
        let names = self.installer.executable_names(&installed);
        let lease = ExecutableLease::new(installed, &bin_dir, names, Arc::clone(&self.trust))?;

        if let Some(path) = trust_path {
            lease.trust_path(path, cancel).await?;
        }
        debug!(
            "Leased engine {} ({})",
            lease.key(),
            lease.server_path().display()
        );
        Ok(lease)
    }

    /// Ensure `version` is installed, deduplicating concurrent requests for
    /// the same key.
    async fn request_install(
        &self,
        version: &EngineVersion,
        custom: Option<CustomArchive>,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<EngineVersion, EngineError> {
        if !self.installer.supports(version.engine) {
            return Err(EngineError::UnsupportedEngine {
                engine: version.engine,
                installer: self.installer.name(),
            });
        }

        if let Some(archive) = custom {
            let (version, guard) = self.registry.claim_custom(version);
            info!("Installing custom engine build as {}", guard.key());
            return self
                .run_install(guard, version, Some(archive), progress, cancel)
                .await;
        }

        let version = EngineVersion {
            patch: version.patch.filter(|&patch| patch != 0),
            ..version.clone()
        };
        let key = version.key(true);
        loop {
            match self.registry.claim(&key) {
                Claim::Installed(installed) => return Ok(installed),
                Claim::Wait(signal) => {
                    debug!("Waiting on pending operation for engine {key}");
                    wait_for(signal, cancel).await?;
                }
                Claim::Owner(guard) => {
                    return self
                        .run_install(guard, version, None, progress, cancel)
                        .await;
                }
            }
        }
    }

    async fn run_install(
        &self,
        guard: PendingGuard,
        version: EngineVersion,
        custom: Option<CustomArchive>,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<EngineVersion, EngineError> {
        let key = guard.key().to_string();
        let dir = self.root.join(&key);

        match self
            .install_into(&guard, &version, &dir, custom, progress, cancel)
            .await
        {
            Ok(()) => {
                guard.installed(version.clone());
                info!("Installed engine version {key}");
                Ok(version)
            }
            Err(EngineError::Cancelled) => {
                // The directory is left behind; it has no marker, so the
                // next install of this key or the next startup clears it.
                warn!("Install of engine version {key} cancelled");
                guard.failed(EngineError::Cancelled);
                Err(EngineError::Cancelled)
            }
            Err(e) => {
                error!("Install of engine version {key} failed: {e}");
                if let Err(event_error) = self
                    .emit(EventType::EngineInstallFail, vec![Some(e.to_string())], cancel)
                    .await
                {
                    warn!("Install failure notification for {key} failed: {event_error}");
                }
                let target = dir.clone();
                if let Err(cleanup_error) = in_version_dir(&guard, move || clear_dir(&target)).await
                {
                    warn!("Failed to clean up {}: {cleanup_error}", dir.display());
                }
                guard.failed(e.clone());
                Err(e)
            }
        }
    }

    async fn install_into(
        &self,
        guard: &PendingGuard,
        version: &EngineVersion,
        dir: &Path,
        custom: Option<CustomArchive>,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let key = guard.key();
        self.emit(EventType::EngineInstallStart, vec![Some(key.to_string())], cancel)
            .await?;

        let target = dir.to_path_buf();
        in_version_dir(guard, move || {
            clear_dir(&target)?;
            std::fs::create_dir_all(&target).map_err(|e| EngineError::io_with_path(&target, &e))
        })
        .await?;

        let archive = match custom {
            Some(mut reader) => {
                let mut buffer = Vec::new();
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Err(EngineError::Cancelled),
                    read = reader.read_to_end(&mut buffer) => {
                        read.map_err(EngineError::from)?;
                    }
                }
                Some(buffer)
            }
            None => {
                self.installer
                    .download(version, &progress.section(0, 70), cancel)
                    .await?
            }
        };
        progress.report(70);

        if let Some(archive) = archive {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            debug!("Extracting engine {key} ({} bytes)", archive.len());
            let target = dir.to_path_buf();
            in_version_dir(guard, move || extract_archive(&archive, &target)).await?;
        }
        progress.report(90);

        let report = self.installer.install(version, dir, cancel).await?;
        for warning in &report.warnings {
            warn!("Post-install step for engine {key} failed: {warning}");
        }

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let marker = dir.join(VERSION_MARKER);
        let content = key.to_string();
        in_version_dir(guard, move || {
            persist::write_atomic(&marker, content.as_bytes())
                .map_err(|e| EngineError::io_with_path(&marker, &e))
        })
        .await?;
        progress.report(100);
        Ok(())
    }

    async fn reconcile(&self, cancel: &CancellationToken) {
        let mut dirs = Vec::new();
        match tokio::fs::read_dir(&self.root).await {
            Ok(mut entries) => loop {
                match entries.next_entry().await {
                    Ok(Some(entry)) => {
                        if entry.file_type().await.is_ok_and(|t| t.is_dir()) {
                            dirs.push(entry.path());
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Failed to scan {}: {e}", self.root.display());
                        break;
                    }
                }
            },
            Err(e) => warn!("Failed to scan {}: {e}", self.root.display()),
        }

        futures_util::future::join_all(dirs.iter().map(|dir| self.reconcile_dir(dir, cancel)))
            .await;

        let Some(key) = persist::read_active_pointer(&self.root).await else {
            return;
        };
        match self.registry.installed(&key) {
            Some(version) => {
                info!("Active engine version is {key}");
                lock_active(&self.active).current = Some(version);
            }
            None => {
                warn!("Active engine version {key} is not installed, discarding it");
                if let Err(e) = remove_file_if_exists(&self.root.join(ACTIVE_VERSION_FILE)).await
                {
                    warn!("Failed to remove stale active version pointer: {e}");
                }
            }
        }
    }

    async fn reconcile_dir(&self, dir: &Path, cancel: &CancellationToken) {
        let Some(version) = persist::read_marker(dir).await else {
            warn!("Deleting incomplete engine install {}", dir.display());
            if let Err(e) = remove_dir_if_exists(dir).await {
                warn!("Failed to delete {}: {e}", dir.display());
            }
            return;
        };

        if let Err(e) = self
            .installer
            .upgrade_installation(&version, dir, cancel)
            .await
        {
            warn!("Failed to upgrade engine installation {version}: {e}");
        }
        debug!("Found installed engine version {version}");
        self.registry.register_installed(version);
    }

    async fn lock_switch(
        &self,
        cancel: &CancellationToken,
    ) -> Result<tokio::sync::MutexGuard<'_, ()>, EngineError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(EngineError::Cancelled),
            guard = self.switch_lock.lock() => Ok(guard),
        }
    }

    async fn emit(
        &self,
        event: EventType,
        args: Vec<Option<String>>,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        match self.events.handle_event(event, args, cancel).await {
            Ok(()) => Ok(()),
            Err(e @ (EngineError::Cancelled | EngineError::Event { .. })) => Err(e),
            Err(e) => Err(EngineError::Event {
                event: event.as_str(),
                details: e.to_string(),
            }),
        }
    }
}

#[derive(Default)]
struct ActiveState {
    current: Option<EngineVersion>,
    /// Key a version switch is persisting and announcing.
    incoming: Option<String>,
}

impl ActiveState {
    fn holds(&self, key: &str) -> bool {
        self.incoming.as_deref() == Some(key)
            || self.current.as_ref().is_some_and(|v| v.key(true) == key)
    }
}

fn lock_active(active: &Mutex<ActiveState>) -> MutexGuard<'_, ActiveState> {
    active.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Marks a key as being switched to until the switch publishes or is
/// abandoned.
struct IncomingSwitch<'a> {
    active: &'a Mutex<ActiveState>,
    previous: Option<EngineVersion>,
}

impl<'a> IncomingSwitch<'a> {
    fn pin(active: &'a Mutex<ActiveState>, key: &str) -> Self {
        let mut state = lock_active(active);
        state.incoming = Some(key.to_string());
        let previous = state.current.clone();
        Self { active, previous }
    }

    fn publish(self, version: EngineVersion) {
        let mut state = lock_active(self.active);
        state.current = Some(version);
        state.incoming = None;
    }
}

impl Drop for IncomingSwitch<'_> {
    fn drop(&mut self) {
        lock_active(self.active).incoming = None;
    }
}

/// Run blocking work on a version directory. The key stays claimed until
/// the work finishes, even when the caller's future is dropped first.
async fn in_version_dir<F>(guard: &PendingGuard, work: F) -> Result<(), EngineError>
where
    F: FnOnce() -> Result<(), EngineError> + Send + 'static,
{
    let hold = guard.hold();
    tokio::task::spawn_blocking(move || {
        let _hold = hold;
        work()
    })
    .await
    .map_err(|e| EngineError::Io {
        kind: std::io::ErrorKind::Other,
        message: e.to_string(),
    })?
}

fn clear_dir(path: &Path) -> Result<(), EngineError> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(EngineError::io_with_path(path, &e)),
    }
}

fn clear_file(path: &Path) -> Result<(), EngineError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(EngineError::io_with_path(path, &e)),
    }
}

async fn remove_dir_if_exists(path: &Path) -> Result<(), EngineError> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(EngineError::io_with_path(path, &e)),
    }
}

async fn remove_file_if_exists(path: &Path) -> Result<(), EngineError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(EngineError::io_with_path(path, &e)),
    }
}
