use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use log::debug;
use tgs_engine_backend::{CancellationToken, EngineError, EngineVersion};
use tokio::sync::oneshot;

/// Completion signal of a pending operation on one version key, shared by
/// every caller waiting on it.
pub(crate) type CompletionSignal = Shared<BoxFuture<'static, Result<(), EngineError>>>;

type Entries = Arc<Mutex<HashMap<String, Entry>>>;
type Sender = oneshot::Sender<Result<(), EngineError>>;

enum Entry {
    Installed(EngineVersion),
    /// An install or a deletion currently owns the key.
    Pending(CompletionSignal),
}

/// What a caller asking for a version key should do next.
pub(crate) enum Claim {
    Installed(EngineVersion),
    Wait(CompletionSignal),
    Owner(PendingGuard),
}

fn lock(entries: &Entries) -> MutexGuard<'_, HashMap<String, Entry>> {
    entries.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory map of version key to install state.
///
/// The lock is only held for check-and-insert; waiting happens on the
/// shared signal with the lock released.
#[derive(Default)]
pub(crate) struct VersionRegistry {
    entries: Entries,
}

impl VersionRegistry {
    fn pend(&self, entries: &mut HashMap<String, Entry>, key: String) -> PendingGuard {
        let (guard, signal) = PendingGuard::new(Arc::clone(&self.entries), key.clone());
        entries.insert(key, Entry::Pending(signal));
        guard
    }

    /// Claim `key`: either it is installed, someone else owns it, or the
    /// caller becomes the sole owner of a new pending entry.
    pub(crate) fn claim(&self, key: &str) -> Claim {
        let mut entries = lock(&self.entries);
        match entries.get(key) {
            Some(Entry::Installed(version)) => Claim::Installed(version.clone()),
            Some(Entry::Pending(signal)) => Claim::Wait(signal.clone()),
            None => Claim::Owner(self.pend(&mut entries, key.to_string())),
        }
    }

    /// Claim a fresh key for a user supplied build of `base`, skipping every
    /// key currently registered.
    pub(crate) fn claim_custom(&self, base: &EngineVersion) -> (EngineVersion, PendingGuard) {
        let mut entries = lock(&self.entries);
        let (version, key) = base.custom_key(|candidate| entries.contains_key(candidate));
        let guard = self.pend(&mut entries, key);
        (version, guard)
    }

    /// Claim an installed key for deletion, returning the version it held.
    ///
    /// Returns `Ok(None)` when the key is not registered at all.
    ///
    /// # Errors
    /// Returns [`EngineError::InstallInProgress`] when the key is pending.
    pub(crate) fn claim_for_delete(
        &self,
        key: &str,
    ) -> Result<Option<(EngineVersion, PendingGuard)>, EngineError> {
        let mut entries = lock(&self.entries);
        match entries.get(key) {
            None => Ok(None),
            Some(Entry::Pending(_)) => Err(EngineError::InstallInProgress {
                key: key.to_string(),
            }),
            Some(Entry::Installed(version)) => {
                let version = version.clone();
                let guard = self.pend(&mut entries, key.to_string());
                Ok(Some((version, guard)))
            }
        }
    }

    /// Register an install found on disk at startup.
    pub(crate) fn register_installed(&self, version: EngineVersion) {
        lock(&self.entries).insert(version.key(true), Entry::Installed(version));
    }

    pub(crate) fn installed(&self, key: &str) -> Option<EngineVersion> {
        match lock(&self.entries).get(key) {
            Some(Entry::Installed(version)) => Some(version.clone()),
            _ => None,
        }
    }

    /// Sorted snapshot of completed installs; pending keys are excluded.
    pub(crate) fn installed_versions(&self) -> Vec<EngineVersion> {
        let mut versions: Vec<EngineVersion> = lock(&self.entries)
            .values()
            .filter_map(|entry| match entry {
                Entry::Installed(version) => Some(version.clone()),
                Entry::Pending(_) => None,
            })
            .collect();
        versions.sort();
        versions
    }
}

/// Wait for someone else's pending operation.
///
/// Only this caller's `cancel` is raced against the signal; cancelling it
/// detaches the caller without touching the shared work.
pub(crate) async fn wait_for(
    signal: CompletionSignal,
    cancel: &CancellationToken,
) -> Result<(), EngineError> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(EngineError::Cancelled),
        result = signal => result,
    }
}

/// Shared state of one pending key. The key is freed when it is resolved,
/// or when the last guard or hold on it goes away unresolved.
struct Pending {
    entries: Entries,
    key: String,
    sender: Mutex<Option<Sender>>,
}

impl Pending {
    fn resolve(&self, entry: Option<Entry>, result: Result<(), EngineError>) {
        let Some(sender) = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };
        {
            let mut entries = lock(&self.entries);
            match entry {
                Some(entry) => entries.insert(self.key.clone(), entry),
                None => entries.remove(&self.key),
            };
        }
        let _ = sender.send(result);
    }
}

impl Drop for Pending {
    fn drop(&mut self) {
        let sender = self
            .sender
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            debug!("Pending operation on {} abandoned", self.key);
            lock(&self.entries).remove(&self.key);
            let _ = sender.send(Err(EngineError::Cancelled));
        }
    }
}

/// Sole ownership of a pending key.
///
/// Must be resolved with one of the consuming methods. Dropping it
/// unresolved (the owner was cancelled or its future dropped) frees the key
/// and fails every waiter with [`EngineError::Cancelled`], as soon as no
/// [`KeyHold`] on it remains.
pub(crate) struct PendingGuard {
    pending: Arc<Pending>,
}

/// Keeps an abandoned key claimed while blocking work still writes into
/// its version directory.
pub(crate) struct KeyHold {
    _pending: Arc<Pending>,
}

impl PendingGuard {
    fn new(entries: Entries, key: String) -> (Self, CompletionSignal) {
        let (sender, receiver) = oneshot::channel();
        let signal = receiver
            .map(|result| result.unwrap_or(Err(EngineError::Cancelled)))
            .boxed()
            .shared();
        let pending = Pending {
            entries,
            key,
            sender: Mutex::new(Some(sender)),
        };
        (
            Self {
                pending: Arc::new(pending),
            },
            signal,
        )
    }

    pub(crate) fn key(&self) -> &str {
        &self.pending.key
    }

    pub(crate) fn hold(&self) -> KeyHold {
        KeyHold {
            _pending: Arc::clone(&self.pending),
        }
    }

    /// Mark the key installed and release waiters with success.
    pub(crate) fn installed(self, version: EngineVersion) {
        self.pending.resolve(Some(Entry::Installed(version)), Ok(()));
    }

    /// Put back an install whose deletion was abandoned before it touched
    /// the files, releasing waiters with success.
    pub(crate) fn restored(self, version: EngineVersion) {
        debug!("Engine version {} kept", self.key());
        self.installed(version);
    }

    /// Forget the key and release waiters with success.
    pub(crate) fn removed(self) {
        self.pending.resolve(None, Ok(()));
    }

    /// Forget the key and hand `error` to every waiter.
    pub(crate) fn failed(self, error: EngineError) {
        self.pending.resolve(None, Err(error));
    }
}
