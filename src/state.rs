//! Durable state: subscriptions and delivery records.
//!
//! Persisted as a versioned JSON document shared by the running service and
//! the subscription commands. Every change re-reads the file under a lock
//! file, applies itself and writes the result back, so concurrent processes
//! never drop each other's changes. The service reloads the file before each
//! pass. A file that exists but cannot be read or parsed is fatal: delivery
//! history is never guessed.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};

use crate::error::{DigestError, Result};
use crate::period::{Granularity, Period};
use crate::subscriptions::{RecipientId, SubscriptionConfig};

const STATE_VERSION: u8 = 1;
/// How long a writer waits for another process to release the state lock.
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
/// A lock file older than this belongs to a dead process.
const STALE_LOCK: Duration = Duration::from_secs(30);

/// How a period was closed for a recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum Closure {
    /// The digest was acknowledged by the transport.
    Sent,
    /// No digest will ever be sent for this period.
    NotApplicable { reason: String },
}

/// Write-once record closing one period for one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub recipient: RecipientId,
    /// Stream set the digest covered, see [`SubscriptionConfig::signature`].
    pub signature: String,
    pub period: Period,
    /// Local time the record was written.
    pub closed_at: NaiveDateTime,
    #[serde(flatten)]
    pub closure: Closure,
}

impl DeliveryRecord {
    pub fn is_sent(&self) -> bool {
        self.closure == Closure::Sent
    }
}

/// On-disk document.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    #[serde(default = "default_state_version")]
    version: u8,
    #[serde(default)]
    subscriptions: BTreeMap<RecipientId, SubscriptionConfig>,
    #[serde(default)]
    deliveries: Vec<DeliveryRecord>,
}

fn default_state_version() -> u8 {
    STATE_VERSION
}

#[derive(Default)]
struct State {
    subscriptions: BTreeMap<RecipientId, SubscriptionConfig>,
    deliveries: BTreeMap<(RecipientId, Period), DeliveryRecord>,
}

impl State {
    fn from_persisted(persisted: PersistedState) -> Result<Self> {
        if persisted.version > STATE_VERSION {
            return Err(DigestError::State(format!(
                "state version {} is newer than supported {}",
                persisted.version, STATE_VERSION
            )));
        }

        let mut deliveries = BTreeMap::new();
        for record in persisted.deliveries {
            let key = (record.recipient.clone(), record.period);
            if deliveries.insert(key, record).is_some() {
                return Err(DigestError::State("duplicate delivery record in state".into()));
            }
        }

        Ok(Self {
            subscriptions: persisted.subscriptions,
            deliveries,
        })
    }

    fn to_persisted(&self) -> PersistedState {
        PersistedState {
            version: STATE_VERSION,
            subscriptions: self.subscriptions.clone(),
            deliveries: self.deliveries.values().cloned().collect(),
        }
    }
}

pub struct StateStore {
    /// `None` keeps everything in memory.
    path: Option<PathBuf>,
    state: RwLock<State>,
    /// Serializes writers within this process; the lock file covers the others.
    flush_lock: Mutex<()>,
}

/// Lock file held while a process rewrites the state file.
struct FileLock {
    path: PathBuf,
}

impl FileLock {
    fn acquire(state_path: &Path) -> Result<Self> {
        let path = state_path.with_extension("json.lock");
        let started = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let _ = file.write_all(std::process::id().to_string().as_bytes());
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    evict_stale_lock(&path);
                    if started.elapsed() > LOCK_TIMEOUT {
                        return Err(DigestError::State(format!(
                            "timed out waiting for state lock {}",
                            path.display()
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => {
                    return Err(DigestError::State(format!(
                        "cannot create state lock {}: {e}",
                        path.display()
                    )));
                }
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Removes a lock left behind by a process that died while holding it.
fn evict_stale_lock(path: &Path) {
    let age = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok());
    if age.is_some_and(|age| age > STALE_LOCK) {
        warn!(path = %path.display(), "Removing stale state lock");
        let _ = std::fs::remove_file(path);
    }
}

/// Reads the state file. A missing file is an empty state.
fn read_state(path: &Path) -> Result<State> {
    let persisted = match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice::<PersistedState>(&bytes).map_err(|e| {
            DigestError::State(format!("cannot parse state {}: {e}", path.display()))
        })?,
        Err(e) if e.kind() == ErrorKind::NotFound => PersistedState::default(),
        Err(e) => {
            return Err(DigestError::State(format!(
                "cannot read state {}: {e}",
                path.display()
            )));
        }
    };
    State::from_persisted(persisted)
}

/// Writes `state` to a temporary file, syncs it, then renames it over
/// `path`. A crash mid-write leaves the previous version intact.
fn write_state(path: &Path, state: &State) -> Result<()> {
    let json = serde_json::to_vec_pretty(&state.to_persisted())
        .map_err(|e| DigestError::State(format!("cannot serialize state: {e}")))?;

    let tmp = path.with_extension("json.tmp");
    let mut file = File::create(&tmp)
        .map_err(|e| DigestError::State(format!("cannot create {}: {e}", tmp.display())))?;
    file.write_all(&json)
        .map_err(|e| DigestError::State(format!("cannot write state: {e}")))?;
    file.sync_all()
        .map_err(|e| DigestError::State(format!("cannot sync state: {e}")))?;
    drop(file);

    std::fs::rename(&tmp, path)
        .map_err(|e| DigestError::State(format!("cannot replace state: {e}")))?;

    debug!(path = %path.display(), bytes = json.len(), "State flushed");
    Ok(())
}

impl StateStore {
    /// Loads state from `path`. A missing file is an empty state.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            info!(path = %path.display(), "No state file, starting empty");
        }

        let state = read_state(&path)?;
        info!(
            path = %path.display(),
            subscriptions = state.subscriptions.len(),
            deliveries = state.deliveries.len(),
            "State loaded"
        );

        Ok(Self {
            path: Some(path),
            state: RwLock::new(state),
            flush_lock: Mutex::new(()),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: RwLock::new(State::default()),
            flush_lock: Mutex::new(()),
        }
    }

    /// Re-reads the state file to pick up changes made by other processes.
    pub fn reload(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self.flush_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let fresh = read_state(path)?;
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = fresh;
        Ok(())
    }

    /// Applies `change` to the latest persisted state and writes it back.
    ///
    /// The file is re-read under the state lock, so changes made by another
    /// process since this one last looked are kept. `change` returns its
    /// result and whether it modified the state; unmodified state is not
    /// rewritten.
    fn transact<R>(&self, change: impl FnOnce(&mut State) -> (R, bool)) -> Result<R> {
        let _guard = self.flush_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(path) = &self.path else {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            return Ok(change(&mut *state).0);
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| DigestError::State(format!("cannot create state dir: {e}")))?;
        }

        let _lock = FileLock::acquire(path)?;
        let mut fresh = read_state(path)?;
        let (result, changed) = change(&mut fresh);
        if changed {
            write_state(path, &fresh)?;
        }
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = fresh;
        Ok(result)
    }

    pub fn subscription(&self, recipient: &RecipientId) -> Option<SubscriptionConfig> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.subscriptions.get(recipient).cloned()
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionConfig> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.subscriptions.values().cloned().collect()
    }

    pub fn put_subscription(&self, config: SubscriptionConfig) -> Result<()> {
        self.transact(|state| {
            state.subscriptions.insert(config.recipient.clone(), config);
            ((), true)
        })
    }

    pub fn remove_subscription(&self, recipient: &RecipientId) -> Result<bool> {
        self.transact(|state| {
            let removed = state.subscriptions.remove(recipient).is_some();
            (removed, removed)
        })
    }

    pub fn is_closed(&self, recipient: &RecipientId, period: &Period) -> bool {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.deliveries.contains_key(&(recipient.clone(), *period))
    }

    /// Latest closed period of `granularity` for `recipient`.
    pub fn last_closed(&self, recipient: &RecipientId, granularity: Granularity) -> Option<Period> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .deliveries
            .keys()
            .filter(|(r, p)| r == recipient && p.granularity == granularity)
            .map(|(_, p)| *p)
            .max_by_key(|p| p.end)
    }

    /// Latest period actually sent to `recipient`, any granularity.
    pub fn last_sent(&self, recipient: &RecipientId) -> Option<DeliveryRecord> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .deliveries
            .values()
            .filter(|r| &r.recipient == recipient && r.is_sent())
            .max_by_key(|r| r.closed_at)
            .cloned()
    }

    /// Stores a record unless the period is already closed, checked against
    /// the latest persisted state. Returns whether the record was written.
    /// Flushes before returning.
    pub fn record(&self, record: DeliveryRecord) -> Result<bool> {
        self.transact(|state| {
            let key = (record.recipient.clone(), record.period);
            if state.deliveries.contains_key(&key) {
                (false, false)
            } else {
                state.deliveries.insert(key, record);
                (true, true)
            }
        })
    }

    pub fn deliveries(&self, recipient: &RecipientId) -> Vec<DeliveryRecord> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .deliveries
            .values()
            .filter(|r| &r.recipient == recipient)
            .cloned()
            .collect()
    }
}
