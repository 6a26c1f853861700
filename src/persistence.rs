//! Durable local copy of the learner state plus best-effort replication to
//! a remote endpoint.
//!
//! Every save writes the whole snapshot to the [`LocalStore`] synchronously
//! and marks it pending. A single debounce timer collapses bursts of saves
//! into one remote send, and a gate makes sure at most one send is in
//! flight. On failure the local store is rolled back to the last snapshot
//! the remote acknowledged and a retry is scheduled with exponential
//! backoff. In-memory state is never touched by any of this.

use std::collections::HashMap;
use std::fs;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{StoreError, SyncError};
use crate::models::StudentState;

pub const DEFAULT_STORAGE_KEY: &str = "ml_learning_path_progress";

pub type SyncFuture = Pin<Box<dyn Future<Output = Result<(), SyncError>> + Send>>;

/// Remote replication target. Any async fn `StudentState -> Result<(), SyncError>`
/// can be used directly.
pub trait RemoteSync: Send + Sync {
    fn push(&self, snapshot: StudentState) -> SyncFuture;
}

impl<F, Fut> RemoteSync for F
where
    F: Fn(StudentState) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), SyncError>> + Send + 'static,
{
    fn push(&self, snapshot: StudentState) -> SyncFuture {
        Box::pin(self(snapshot))
    }
}

/// Synchronous key/blob store for the local copy.
pub trait LocalStore: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn write(&self, key: &str, body: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl LocalStore for MemoryStore {
    fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries().get(key).cloned())
    }

    fn write(&self, key: &str, body: &str) -> Result<(), StoreError> {
        self.entries().insert(key.to_string(), body.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries().remove(key);
        Ok(())
    }
}

/// One JSON file per key under `dir`. Writes go through a temp file and a
/// rename so a crash never leaves a torn blob behind.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl LocalStore for FileStore {
    fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        match fs::read_to_string(self.path(key)) {
            Ok(body) => Ok(Some(body)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, key: &str, body: &str) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)?;
        let tmp = self.dir.join(format!("{key}.json.tmp"));
        fs::write(&tmp, body)?;
        fs::rename(&tmp, self.path(key))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PersistenceConfig {
    /// Quiet period after the last save before a remote send.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "debounce_ms", default = "default_debounce")]
    pub debounce: Duration,

    /// Total remote attempts per snapshot, the first send included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff before retry n is `retry_base * 2^(n-1)`.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "retry_base_ms", default = "default_retry_base")]
    pub retry_base: Duration,

    #[serde(default = "default_storage_key")]
    pub storage_key: String,
}

fn default_debounce() -> Duration { Duration::from_millis(500) }
fn default_max_attempts() -> u32 { 3 }
fn default_retry_base() -> Duration { Duration::from_millis(1000) }
fn default_storage_key() -> String { DEFAULT_STORAGE_KEY.to_string() }

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            debounce: default_debounce(),
            max_attempts: default_max_attempts(),
            retry_base: default_retry_base(),
            storage_key: default_storage_key(),
        }
    }
}

impl PersistenceConfig {
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.retry_base.saturating_mul(1u32 << exp)
    }
}

/// Observable state of the replication state machine.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncStatus {
    /// Nothing to replicate.
    Idle,
    /// A snapshot is waiting for the debounce window or a retry.
    Pending,
    InFlight { attempt: u32 },
    /// The latest snapshot reached the remote endpoint.
    Synced,
    Retrying { attempt: u32, delay_ms: u64, error: String },
    /// Retries are exhausted. The local copy is intact; the remote copy lags.
    Failed { attempts: u32, error: String },
}

struct Inner {
    pending: Option<StudentState>,
    /// A background send found the gate taken and gave up its turn.
    missed_send: bool,
    last_synced: Option<StudentState>,
    /// The local store holds `last_synced` rather than `pending`.
    rolled_back: bool,
    debounce: Option<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
}

struct Shared {
    config: PersistenceConfig,
    store: Arc<dyn LocalStore>,
    remote: Option<Arc<dyn RemoteSync>>,
    inner: Mutex<Inner>,
    gate: tokio::sync::Mutex<()>,
    status: watch::Sender<SyncStatus>,
}

enum Next {
    Done,
    FollowUp,
    Retry(Duration),
    GiveUp,
}

pub struct ProgressPersistence {
    shared: Arc<Shared>,
}

#[derive(Clone)]
pub struct SyncHandle {
    shared: Arc<Shared>,
}

impl SyncHandle {
    pub async fn force_sync_now(&self) -> Result<(), SyncError> {
        Shared::force_sync(&self.shared).await
    }

    pub fn status(&self) -> SyncStatus {
        self.shared.status.borrow().clone()
    }
}

impl ProgressPersistence {
    pub fn new(
        store: Arc<dyn LocalStore>,
        remote: Option<Arc<dyn RemoteSync>>,
        config: PersistenceConfig,
    ) -> Self {
        let (status, _) = watch::channel(SyncStatus::Idle);
        Self {
            shared: Arc::new(Shared {
                config,
                store,
                remote,
                inner: Mutex::new(Inner {
                    pending: None,
                    missed_send: false,
                    last_synced: None,
                    rolled_back: false,
                    debounce: None,
                    tasks: Vec::new(),
                }),
                gate: tokio::sync::Mutex::new(()),
                status,
            }),
        }
    }

    /// Local-only persistence, e.g. for tests or offline use.
    pub fn local(store: Arc<dyn LocalStore>) -> Self {
        Self::new(store, None, PersistenceConfig::default())
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.shared.config
    }

    /// Reads the local copy. `None` means no progress yet.
    pub fn load(&self) -> Result<Option<StudentState>, StoreError> {
        let Some(body) = self.shared.store.read(&self.shared.config.storage_key)? else {
            return Ok(None);
        };
        let mut state: StudentState = serde_json::from_str(&body)?;
        state.normalize();
        Ok(Some(state))
    }

    /// Writes `state` to the local store and (re)arms the debounce timer.
    /// Only the local write can fail.
    pub fn save(&self, state: &StudentState) -> Result<(), StoreError> {
        let body = serde_json::to_string(state)?;
        let mut inner = self.shared.lock_inner();
        self.shared.store.write(&self.shared.config.storage_key, &body)?;
        inner.rolled_back = false;

        if self.shared.remote.is_none() {
            return Ok(());
        }
        inner.pending = Some(state.clone());
        if !matches!(*self.shared.status.borrow(), SyncStatus::InFlight { .. }) {
            self.shared.status.send_replace(SyncStatus::Pending);
        }
        self.shared.arm_debounce(&mut inner);
        Ok(())
    }

    /// Skips the debounce window and sends the pending snapshot now, waiting
    /// for any send already in flight first. A failure is reported to the
    /// caller and then handled like any other failed attempt.
    pub async fn force_sync_now(&self) -> Result<(), SyncError> {
        Shared::force_sync(&self.shared).await
    }

    /// A handle that can flush after the owner of this persistence has been
    /// unlocked. It does not keep timers alive on its own.
    pub fn handle(&self) -> SyncHandle {
        SyncHandle { shared: Arc::clone(&self.shared) }
    }

    pub fn has_pending_sync(&self) -> bool {
        self.shared.lock_inner().pending.is_some()
    }

    pub fn last_synced(&self) -> Option<StudentState> {
        self.shared.lock_inner().last_synced.clone()
    }

    pub fn status(&self) -> SyncStatus {
        self.shared.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.shared.status.subscribe()
    }

    /// Drops the local copy and anything pending.
    pub fn clear(&self) -> Result<(), StoreError> {
        self.shutdown();
        let mut inner = self.shared.lock_inner();
        inner.pending = None;
        inner.rolled_back = false;
        self.shared.status.send_replace(SyncStatus::Idle);
        self.shared.store.remove(&self.shared.config.storage_key)
    }

    /// Cancels the debounce timer and every scheduled retry. State is left
    /// as it is.
    pub fn shutdown(&self) {
        let mut inner = self.shared.lock_inner();
        if let Some(timer) = inner.debounce.take() {
            timer.abort();
        }
        for task in inner.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for ProgressPersistence {
    /// Scheduled retries die with the owner, so a rolled-back local copy is
    /// brought forward to the newest snapshot first.
    fn drop(&mut self) {
        self.shutdown();
        let mut inner = self.shared.lock_inner();
        if inner.rolled_back {
            if let Some(latest) = inner.pending.clone() {
                self.shared.write_local(&self.shared.config.storage_key, &latest);
            }
            inner.rolled_back = false;
        }
    }
}

impl Shared {
    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn force_sync(shared: &Arc<Self>) -> Result<(), SyncError> {
        let Some(remote) = shared.remote.clone() else {
            return Ok(());
        };
        if let Some(timer) = shared.lock_inner().debounce.take() {
            timer.abort();
        }

        let gate = shared.gate.lock().await;
        let snapshot = {
            let mut inner = shared.lock_inner();
            inner.missed_send = false;
            inner.pending.clone()
        };
        let Some(snapshot) = snapshot else {
            return Ok(());
        };
        shared.status.send_replace(SyncStatus::InFlight { attempt: 1 });
        let result = remote.push(snapshot.clone()).await;
        let next = shared.settle(&snapshot, &result, 1);
        drop(gate);
        Shared::follow(shared, next, 1);
        result
    }

    fn arm_debounce(self: &Arc<Self>, inner: &mut Inner) {
        if let Some(timer) = inner.debounce.take() {
            timer.abort();
        }
        let Ok(handle) = Handle::try_current() else {
            debug!("no async runtime, remote sync waits for an explicit flush");
            return;
        };
        let shared = Arc::clone(self);
        let delay = self.config.debounce;
        debug!(delay_ms = delay.as_millis() as u64, "debounce armed");
        // The send runs in its own task so re-arming never cancels a request
        // that is already on the wire.
        inner.debounce = Some(handle.spawn(async move {
            tokio::time::sleep(delay).await;
            let send = tokio::spawn(run_sync(Arc::clone(&shared), 1));
            shared.track(send);
        }));
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut inner = self.lock_inner();
        inner.tasks.retain(|t| !t.is_finished());
        inner.tasks.push(task);
    }

    /// Applies the outcome of one remote attempt. Runs with the gate held.
    fn settle(&self, snapshot: &StudentState, result: &Result<(), SyncError>, attempt: u32) -> Next {
        let mut inner = self.lock_inner();
        let key = &self.config.storage_key;

        match result {
            Ok(()) => {
                info!(student = %snapshot.student_id, attempt, "progress synced");
                inner.last_synced = Some(snapshot.clone());
                if inner.pending.as_ref() == Some(snapshot) {
                    inner.pending = None;
                    if inner.rolled_back {
                        self.write_local(key, snapshot);
                        inner.rolled_back = false;
                    }
                    self.status.send_replace(SyncStatus::Synced);
                    return Next::Done;
                }
                self.status.send_replace(SyncStatus::Pending);
                match &inner.debounce {
                    Some(timer) if !timer.is_finished() => Next::Done,
                    _ => Next::FollowUp,
                }
            }
            Err(e) => {
                warn!(student = %snapshot.student_id, attempt, error = %e, "progress sync failed");
                if inner.pending.as_ref() == Some(snapshot) && !inner.rolled_back {
                    if let Some(previous) = inner.last_synced.clone() {
                        self.write_local(key, &previous);
                        inner.rolled_back = true;
                        warn!(student = %snapshot.student_id, "local copy rolled back to last synced snapshot");
                    }
                }

                if attempt >= self.config.max_attempts {
                    error!(
                        student = %snapshot.student_id,
                        attempts = attempt,
                        "giving up on remote sync; local progress is kept"
                    );
                    if inner.rolled_back {
                        if let Some(latest) = inner.pending.clone() {
                            self.write_local(key, &latest);
                            inner.rolled_back = false;
                        }
                    }
                    self.status.send_replace(SyncStatus::Failed {
                        attempts: attempt,
                        error: e.to_string(),
                    });
                    return Next::GiveUp;
                }

                let delay = self.config.backoff(attempt);
                self.status.send_replace(SyncStatus::Retrying {
                    attempt: attempt + 1,
                    delay_ms: delay.as_millis() as u64,
                    error: e.to_string(),
                });
                Next::Retry(delay)
            }
        }
    }

    fn write_local(&self, key: &str, state: &StudentState) {
        let written = serde_json::to_string(state)
            .map_err(StoreError::from)
            .and_then(|body| self.store.write(key, &body));
        if let Err(e) = written {
            error!(error = %e, "failed to rewrite local progress copy");
        }
    }

    /// Runs with the gate released, so a send that bailed while it was held
    /// is picked up here.
    fn follow(self: &Arc<Self>, next: Next, attempt: u32) {
        if Handle::try_current().is_err() {
            return;
        }
        let next = match next {
            Next::Done if std::mem::take(&mut self.lock_inner().missed_send) => Next::FollowUp,
            other => other,
        };
        match next {
            Next::Done | Next::GiveUp => {}
            Next::FollowUp => {
                let task = tokio::spawn(run_sync(Arc::clone(self), 1));
                self.track(task);
            }
            Next::Retry(delay) => {
                let shared = Arc::clone(self);
                let task = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    run_sync(shared, attempt + 1).await;
                });
                self.track(task);
            }
        }
    }
}

/// One background remote attempt. Bails out if another send holds the
/// gate; that send schedules a follow-up when it finishes.
fn run_sync(shared: Arc<Shared>, attempt: u32) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        let Some(remote) = shared.remote.clone() else {
            return;
        };
        let Ok(gate) = shared.gate.try_lock() else {
            debug!("remote sync already in flight");
            shared.lock_inner().missed_send = true;
            return;
        };
        let snapshot = {
            let mut inner = shared.lock_inner();
            inner.missed_send = false;
            inner.pending.clone()
        };
        let Some(snapshot) = snapshot else {
            return;
        };

        shared.status.send_replace(SyncStatus::InFlight { attempt });
        let result = remote.push(snapshot.clone()).await;
        let next = shared.settle(&snapshot, &result, attempt);
        drop(gate);
        Shared::follow(&shared, next, attempt);
    })
}
