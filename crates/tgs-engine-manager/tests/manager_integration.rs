use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tgs_engine_backend::{
    CancellationToken, EngineError, EngineInstaller, EngineType, EngineVersion, ErrorCode,
    EventConsumer, EventType, ExecutableNames, PostInstallReport, ProgressReporter,
};
use tgs_engine_manager::{CustomArchive, EngineManager};
use tokio::sync::Notify;

fn engine_zip() -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default().unix_permissions(0o755);
    for name in ["byond/bin/DreamDaemon", "byond/bin/DreamMaker"] {
        writer.start_file(name, options).expect("start file");
        writer.write_all(b"binary").expect("write file");
    }
    writer.finish().expect("finish zip").into_inner()
}

fn custom_archive() -> CustomArchive {
    Box::new(std::io::Cursor::new(engine_zip()))
}

struct MockInstaller {
    user_data_dir: PathBuf,
    downloads: AtomicUsize,
    installs: AtomicUsize,
    upgrades: AtomicUsize,
    fail_download: AtomicBool,
    warn_on_install: AtomicBool,
    download_started: Notify,
    release: CancellationToken,
}

impl MockInstaller {
    fn new(user_data_dir: PathBuf, gated: bool) -> Self {
        let release = CancellationToken::new();
        if !gated {
            release.cancel();
        }
        Self {
            user_data_dir,
            downloads: AtomicUsize::new(0),
            installs: AtomicUsize::new(0),
            upgrades: AtomicUsize::new(0),
            fail_download: AtomicBool::new(false),
            warn_on_install: AtomicBool::new(false),
            download_started: Notify::new(),
            release,
        }
    }

    fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EngineInstaller for MockInstaller {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn supports(&self, engine: EngineType) -> bool {
        engine == EngineType::Byond
    }

    fn executable_names(&self, version: &EngineVersion) -> ExecutableNames {
        ExecutableNames {
            server: "DreamDaemon".to_string(),
            compiler: "DreamMaker".to_string(),
            supports_cli: true,
            supports_map_threads: version.at_least(515, 1609),
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
        self.downloads.fetch_add(1, Ordering::SeqCst);
        self.download_started.notify_one();

        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(EngineError::Cancelled),
            () = self.release.cancelled() => {}
        }

        if self.fail_download.load(Ordering::SeqCst) {
            return Err(EngineError::download(
                format!("https://mock.invalid/{version}.zip"),
                "404 Not Found",
            ));
        }
        progress.report(100);
        Ok(Some(engine_zip()))
    }

    async fn install(
        &self,
        _version: &EngineVersion,
        _path: &Path,
        _cancel: &CancellationToken,
    ) -> Result<PostInstallReport, EngineError> {
        self.installs.fetch_add(1, Ordering::SeqCst);
        let mut report = PostInstallReport::default();
        if self.warn_on_install.load(Ordering::SeqCst) {
            report.warn(EngineError::FirewallRule {
                exit_code: Some(1),
                output: "access denied".to_string(),
            });
        }
        Ok(report)
    }

    async fn upgrade_installation(
        &self,
        _version: &EngineVersion,
        _path: &Path,
        _cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        self.upgrades.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn clean_cache(&self, _cancel: &CancellationToken) {}
}

#[derive(Default)]
struct RecordingEvents {
    events: Mutex<Vec<(EventType, Vec<Option<String>>)>>,
    hold_version_changes: Option<CancellationToken>,
    version_change_seen: Notify,
}

impl RecordingEvents {
    fn holding_version_changes(release: CancellationToken) -> Self {
        Self {
            hold_version_changes: Some(release),
            ..Self::default()
        }
    }

    fn of_type(&self, event: EventType) -> Vec<Vec<Option<String>>> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(kind, _)| *kind == event)
            .map(|(_, args)| args.clone())
            .collect()
    }
}

#[async_trait]
impl EventConsumer for RecordingEvents {
    async fn handle_event(
        &self,
        event: EventType,
        args: Vec<Option<String>>,
        _cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        self.events.lock().unwrap().push((event, args));
        if event == EventType::EngineActiveVersionChange {
            if let Some(release) = &self.hold_version_changes {
                self.version_change_seen.notify_one();
                release.cancelled().await;
            }
        }
        Ok(())
    }
}

struct Harness {
    temp: TempDir,
    installer: Arc<MockInstaller>,
    events: Arc<RecordingEvents>,
    manager: Arc<EngineManager>,
}

impl Harness {
    async fn start(gated: bool) -> Self {
        Self::start_with(tempfile::tempdir().unwrap(), gated, RecordingEvents::default()).await
    }

    async fn start_with(temp: TempDir, gated: bool, events: RecordingEvents) -> Self {
        let installer = Arc::new(MockInstaller::new(temp.path().join("user"), gated));
        let events = Arc::new(events);
        let manager = EngineManager::start(
            temp.path().join("engine"),
            installer.clone(),
            events.clone(),
            &CancellationToken::new(),
        )
        .await
        .expect("manager should start");
        Self {
            temp,
            installer,
            events,
            manager: Arc::new(manager),
        }
    }

    fn root(&self) -> PathBuf {
        self.temp.path().join("engine")
    }

    async fn change(&self, version: &str) -> Result<EngineVersion, EngineError> {
        self.manager
            .change_version(
                &ProgressReporter::disabled(),
                &version.parse().unwrap(),
                None,
                true,
                &CancellationToken::new(),
            )
            .await
    }
}

fn spawn_use(
    manager: &Arc<EngineManager>,
    version: &str,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<Result<String, EngineError>> {
    let manager = Arc::clone(manager);
    let version: EngineVersion = version.parse().unwrap();
    tokio::spawn(async move {
        manager
            .use_executables(Some(&version), None, &cancel)
            .await
            .map(|lease| lease.key())
    })
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_share_one_install() {
    let harness = Harness::start(true).await;

    let tasks: Vec<_> = (0..8)
        .map(|_| spawn_use(&harness.manager, "515.1633", CancellationToken::new()))
        .collect();
    harness.installer.download_started.notified().await;
    settle().await;
    harness.installer.release.cancel();

    for task in tasks {
        assert_eq!(task.await.unwrap(), Ok("515.1633".to_string()));
    }
    assert_eq!(harness.installer.downloads(), 1);
    assert_eq!(harness.installer.installs.load(Ordering::SeqCst), 1);
    assert_eq!(
        harness.events.of_type(EventType::EngineInstallStart),
        vec![vec![Some("515.1633".to_string())]]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_share_one_failure() {
    let harness = Harness::start(true).await;
    harness.installer.fail_download.store(true, Ordering::SeqCst);

    let tasks: Vec<_> = (0..4)
        .map(|_| spawn_use(&harness.manager, "515.1633", CancellationToken::new()))
        .collect();
    harness.installer.download_started.notified().await;
    settle().await;
    harness.installer.release.cancel();

    let mut errors = Vec::new();
    for task in tasks {
        errors.push(task.await.unwrap().unwrap_err());
    }
    assert_eq!(harness.installer.downloads(), 1);
    assert!(errors.iter().all(|e| *e == errors[0]));
    assert_eq!(errors[0].code(), Some(ErrorCode::EngineDownloadFail));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_custom_builds_get_distinct_keys() {
    let harness = Harness::start(false).await;
    let version: EngineVersion = "512.1".parse().unwrap();

    let spawn_custom = || {
        let manager = Arc::clone(&harness.manager);
        let version = version.clone();
        tokio::spawn(async move {
            manager
                .change_version(
                    &ProgressReporter::disabled(),
                    &version,
                    Some(custom_archive()),
                    false,
                    &CancellationToken::new(),
                )
                .await
        })
    };
    let first = spawn_custom();
    let second = spawn_custom();

    let mut keys = vec![
        first.await.unwrap().unwrap().key(true),
        second.await.unwrap().unwrap().key(true),
    ];
    keys.sort();

    assert_eq!(keys, vec!["512.1.1".to_string(), "512.1.2".to_string()]);
    assert_eq!(harness.installer.downloads(), 0);
    for key in &keys {
        let marker = std::fs::read_to_string(harness.root().join(key).join("Version.txt")).unwrap();
        assert_eq!(&marker, key);
        assert!(harness.root().join(key).join("bin/DreamDaemon").is_file());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn change_version_notifies_before_publishing() {
    let release = CancellationToken::new();
    let harness = Harness::start_with(
        tempfile::tempdir().unwrap(),
        false,
        RecordingEvents::holding_version_changes(release.clone()),
    )
    .await;

    let manager = Arc::clone(&harness.manager);
    let change = tokio::spawn(async move {
        manager
            .change_version(
                &ProgressReporter::disabled(),
                &"512.1.1545".parse().unwrap(),
                None,
                true,
                &CancellationToken::new(),
            )
            .await
    });

    harness.events.version_change_seen.notified().await;
    assert_eq!(harness.manager.active_version(), None);
    release.cancel();
    let installed = change.await.unwrap().expect("change should succeed");

    assert_eq!(installed.key(true), "512.1.1545");
    assert_eq!(harness.manager.active_version(), Some(installed));
    assert_eq!(
        std::fs::read_to_string(harness.root().join("512.1.1545/Version.txt")).unwrap(),
        "512.1.1545"
    );
    assert_eq!(
        std::fs::read_to_string(harness.root().join("ActiveVersion.txt")).unwrap(),
        "512.1.1545"
    );
    assert_eq!(
        harness.events.of_type(EventType::EngineActiveVersionChange),
        vec![vec![None, Some("512.1.1545".to_string())]]
    );
}

#[tokio::test]
async fn change_version_reports_previous_key() {
    let harness = Harness::start(false).await;

    harness.change("514.1589").await.unwrap();
    harness.change("515.1633").await.unwrap();

    assert_eq!(
        harness.events.of_type(EventType::EngineActiveVersionChange),
        vec![
            vec![None, Some("514.1589".to_string())],
            vec![Some("514.1589".to_string()), Some("515.1633".to_string())],
        ]
    );
}

#[tokio::test]
async fn change_without_install_requires_installed_version() {
    let harness = Harness::start(false).await;

    let error = harness
        .manager
        .change_version(
            &ProgressReporter::disabled(),
            &EngineVersion::byond(515, 1633),
            None,
            false,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert_eq!(error.code(), Some(ErrorCode::EngineNonExistentVersion));
    assert_eq!(harness.installer.downloads(), 0);
}

#[tokio::test]
async fn progress_runs_through_to_completion() {
    let harness = Harness::start(false).await;
    let (tx, mut rx) = tokio::sync::mpsc::channel(32);

    harness
        .manager
        .change_version(
            &ProgressReporter::new(tx),
            &EngineVersion::byond(515, 1633),
            None,
            true,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let mut reports = Vec::new();
    while let Ok(percent) = rx.try_recv() {
        reports.push(percent);
    }
    assert!(reports.windows(2).all(|pair| pair[0] <= pair[1]));
    assert_eq!(reports.last(), Some(&100));
    assert!(reports.contains(&70));
}

#[tokio::test]
async fn delete_rejects_active_and_removes_idle_versions() {
    let harness = Harness::start(false).await;
    harness.change("514.1589").await.unwrap();
    harness.change("515.1633").await.unwrap();
    let cancel = CancellationToken::new();
    let progress = ProgressReporter::disabled();

    let error = harness
        .manager
        .delete_version(&progress, &EngineVersion::byond(515, 1633), &cancel)
        .await
        .unwrap_err();
    assert_eq!(error.code(), Some(ErrorCode::EngineCannotDeleteActiveVersion));
    assert!(harness.root().join("515.1633").is_dir());

    let idle = EngineVersion::byond(514, 1589);
    harness
        .manager
        .delete_version(&progress, &idle, &cancel)
        .await
        .expect("idle version should delete");
    assert!(!harness.root().join("514.1589").exists());
    assert_eq!(
        harness.manager.installed_versions(),
        vec![EngineVersion::byond(515, 1633)]
    );

    harness
        .manager
        .delete_version(&progress, &idle, &cancel)
        .await
        .expect("repeat delete should be a no-op");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delete_rejects_pending_install() {
    let harness = Harness::start(true).await;
    let install = spawn_use(&harness.manager, "515.1633", CancellationToken::new());
    harness.installer.download_started.notified().await;

    let error = harness
        .manager
        .delete_version(
            &ProgressReporter::disabled(),
            &EngineVersion::byond(515, 1633),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(error.code(), Some(ErrorCode::EngineInstallInProgress));

    harness.installer.release.cancel();
    assert!(install.await.unwrap().is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn idle_delete_does_not_wait_on_version_switch() {
    let release = CancellationToken::new();
    let harness = Harness::start_with(
        tempfile::tempdir().unwrap(),
        false,
        RecordingEvents::holding_version_changes(release.clone()),
    )
    .await;
    let progress = ProgressReporter::disabled();
    let cancel = CancellationToken::new();
    spawn_use(&harness.manager, "514.1589", CancellationToken::new())
        .await
        .unwrap()
        .unwrap();

    let manager = Arc::clone(&harness.manager);
    let change = tokio::spawn(async move {
        manager
            .change_version(
                &ProgressReporter::disabled(),
                &EngineVersion::byond(515, 1633),
                None,
                true,
                &CancellationToken::new(),
            )
            .await
    });
    harness.events.version_change_seen.notified().await;

    let incoming = harness
        .manager
        .delete_version(&progress, &EngineVersion::byond(515, 1633), &cancel)
        .await
        .unwrap_err();
    assert_eq!(
        incoming.code(),
        Some(ErrorCode::EngineCannotDeleteActiveVersion)
    );

    tokio::time::timeout(
        Duration::from_secs(2),
        harness
            .manager
            .delete_version(&progress, &EngineVersion::byond(514, 1589), &cancel),
    )
    .await
    .expect("delete should not wait on the switch")
    .expect("idle version should delete");
    assert!(!harness.root().join("514.1589").exists());

    release.cancel();
    change.await.unwrap().expect("change should succeed");
    assert_eq!(
        harness.manager.installed_versions(),
        vec![EngineVersion::byond(515, 1633)]
    );
}

#[tokio::test]
async fn failed_marker_removal_keeps_version_installed() {
    let harness = Harness::start(false).await;
    spawn_use(&harness.manager, "514.1589", CancellationToken::new())
        .await
        .unwrap()
        .unwrap();
    let marker = harness.root().join("514.1589/Version.txt");
    std::fs::remove_file(&marker).unwrap();
    std::fs::create_dir(&marker).unwrap();
    std::fs::write(marker.join("pinned"), "x").unwrap();

    let result = harness
        .manager
        .delete_version(
            &ProgressReporter::disabled(),
            &EngineVersion::byond(514, 1589),
            &CancellationToken::new(),
        )
        .await;

    assert!(result.is_err());
    assert!(harness.root().join("514.1589/bin/DreamDaemon").is_file());
    assert_eq!(
        harness.manager.installed_versions(),
        vec![EngineVersion::byond(514, 1589)]
    );
    assert_eq!(
        spawn_use(&harness.manager, "514.1589", CancellationToken::new())
            .await
            .unwrap(),
        Ok("514.1589".to_string())
    );
    assert_eq!(harness.installer.downloads(), 1);
}

#[tokio::test]
async fn restart_reconciles_install_root() {
    let temp = tempfile::tempdir().unwrap();
    let root = temp.path().join("engine");
    std::fs::create_dir_all(root.join("515.1633/bin")).unwrap();
    std::fs::write(root.join("515.1633/Version.txt"), "515.1633").unwrap();
    std::fs::create_dir_all(root.join("514.1589/bin")).unwrap();
    std::fs::write(root.join("ActiveVersion.txt"), "514.1589").unwrap();

    let harness = Harness::start_with(temp, false, RecordingEvents::default()).await;

    assert!(!root.join("514.1589").exists());
    assert!(!root.join("ActiveVersion.txt").exists());
    assert_eq!(harness.manager.active_version(), None);
    assert_eq!(
        harness.manager.installed_versions(),
        vec![EngineVersion::byond(515, 1633)]
    );
    assert_eq!(harness.installer.upgrades.load(Ordering::SeqCst), 1);

    let lease = harness
        .manager
        .use_executables(
            Some(&EngineVersion::byond(515, 1633)),
            None,
            &CancellationToken::new(),
        )
        .await
        .expect("reconciled version should be usable");
    assert_eq!(lease.key(), "515.1633");
    assert_eq!(harness.installer.downloads(), 0);
}

#[tokio::test]
async fn restart_restores_active_version() {
    let temp = tempfile::tempdir().unwrap();
    let root = temp.path().join("engine");
    {
        let harness = Harness::start_with(temp, false, RecordingEvents::default()).await;
        harness.change("515.1633").await.unwrap();
        let Harness { temp, manager, .. } = harness;
        drop(manager);

        let restarted = Harness::start_with(temp, false, RecordingEvents::default()).await;
        assert_eq!(
            restarted.manager.active_version(),
            Some(EngineVersion::byond(515, 1633))
        );
        assert!(root.join("ActiveVersion.txt").is_file());
    }
}

#[tokio::test]
async fn second_manager_on_same_root_is_refused() {
    let harness = Harness::start(false).await;

    let error = EngineManager::start(
        harness.root(),
        harness.installer.clone(),
        harness.events.clone(),
        &CancellationToken::new(),
    )
    .await
    .err()
    .expect("root should be locked");

    assert_eq!(error.code(), Some(ErrorCode::EngineInstallRootLocked));
}

#[tokio::test]
async fn use_executables_needs_an_active_version() {
    let harness = Harness::start(false).await;
    let cancel = CancellationToken::new();

    let error = harness
        .manager
        .use_executables(None, None, &cancel)
        .await
        .unwrap_err();
    assert_eq!(error.code(), Some(ErrorCode::EngineNoVersionsInstalled));

    harness.change("515.1633").await.unwrap();
    let lease = harness
        .manager
        .use_executables(None, None, &cancel)
        .await
        .expect("active version should lease");

    let bin = std::path::absolute(harness.root().join("515.1633/bin")).unwrap();
    assert_eq!(lease.server_path(), bin.join("DreamDaemon"));
    assert_eq!(lease.compiler_path(), bin.join("DreamMaker"));
    assert!(lease.server_path().is_file());
    assert!(lease.supports_map_threads());
}

#[tokio::test]
async fn trusting_a_path_twice_writes_one_entry() {
    let harness = Harness::start(false).await;
    harness.change("515.1633").await.unwrap();
    let cancel = CancellationToken::new();
    let content = harness.temp.path().join("game/tgstation.dmb");

    let lease = harness
        .manager
        .use_executables(None, Some(&content), &cancel)
        .await
        .unwrap();
    lease.trust_path(&content, &cancel).await.unwrap();

    let list = std::fs::read_to_string(harness.temp.path().join("user/cfg/trusted.txt")).unwrap();
    assert_eq!(list.lines().count(), 1);
    assert_eq!(list.trim(), content.display().to_string());
}

#[tokio::test]
async fn unsupported_engine_is_classified() {
    let harness = Harness::start(false).await;

    let error = harness.change("opendream-0.2").await.unwrap_err();

    assert_eq!(error.code(), Some(ErrorCode::EngineUnsupported));
    assert_eq!(harness.installer.downloads(), 0);
}

#[tokio::test]
async fn post_install_warnings_do_not_fail_install() {
    let harness = Harness::start(false).await;
    harness.installer.warn_on_install.store(true, Ordering::SeqCst);

    let installed = harness.change("515.1633").await.expect("install should succeed");

    assert_eq!(installed, EngineVersion::byond(515, 1633));
    assert!(harness.root().join("515.1633/Version.txt").is_file());
}

#[tokio::test]
async fn failed_install_cleans_up_and_frees_key() {
    let harness = Harness::start(false).await;
    harness.installer.fail_download.store(true, Ordering::SeqCst);

    let error = harness.change("515.1633").await.unwrap_err();

    assert_eq!(error.code(), Some(ErrorCode::EngineDownloadFail));
    assert!(!harness.root().join("515.1633").exists());
    assert_eq!(harness.events.of_type(EventType::EngineInstallFail).len(), 1);
    assert!(harness.manager.installed_versions().is_empty());

    harness.installer.fail_download.store(false, Ordering::SeqCst);
    harness.change("515.1633").await.expect("retry should succeed");
    assert_eq!(harness.installer.downloads(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_install_leaves_directory_and_frees_key() {
    let harness = Harness::start(true).await;
    let cancel = CancellationToken::new();
    let install = spawn_use(&harness.manager, "515.1633", cancel.clone());
    harness.installer.download_started.notified().await;

    cancel.cancel();

    assert_eq!(install.await.unwrap(), Err(EngineError::Cancelled));
    assert!(harness.root().join("515.1633").is_dir());
    assert!(!harness.root().join("515.1633/Version.txt").exists());
    assert!(harness.events.of_type(EventType::EngineInstallFail).is_empty());

    harness.installer.release.cancel();
    let retry = spawn_use(&harness.manager, "515.1633", CancellationToken::new());
    assert_eq!(retry.await.unwrap(), Ok("515.1633".to_string()));
    assert_eq!(harness.installer.downloads(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_waiter_does_not_cancel_install() {
    let harness = Harness::start(true).await;
    let installer_task = spawn_use(&harness.manager, "515.1633", CancellationToken::new());
    harness.installer.download_started.notified().await;

    let waiter_cancel = CancellationToken::new();
    let waiter = spawn_use(&harness.manager, "515.1633", waiter_cancel.clone());
    settle().await;
    waiter_cancel.cancel();
    assert_eq!(waiter.await.unwrap(), Err(EngineError::Cancelled));

    harness.installer.release.cancel();
    assert_eq!(installer_task.await.unwrap(), Ok("515.1633".to_string()));
    assert_eq!(harness.installer.downloads(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropped_installer_releases_waiters() {
    let harness = Harness::start(true).await;
    let installer_task = spawn_use(&harness.manager, "515.1633", CancellationToken::new());
    harness.installer.download_started.notified().await;
    let waiter = spawn_use(&harness.manager, "515.1633", CancellationToken::new());
    settle().await;

    installer_task.abort();

    assert_eq!(waiter.await.unwrap(), Err(EngineError::Cancelled));
    assert!(harness.manager.installed_versions().is_empty());
}
