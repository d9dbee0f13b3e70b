//! Durable agent identity records.
//!
//! The [`IdentityStore`] is the single source of truth for which agents
//! exist on the host. It is consulted by the provisioner (idempotence,
//! uniqueness) and by the relay (classifying a connection as agent or
//! client). Records persist as a JSON file so identities survive a
//! process restart; live connections never do.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

/// Errors from loading or persisting the identity store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem error reading or writing the backing file.
    #[error("identity store IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The backing file exists but does not parse.
    #[error("identity store is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Lifecycle state of an agent identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentStatus {
    /// Allocation in progress; not yet usable.
    Pending,
    /// Fully provisioned and reachable.
    Active,
    /// A previous allocation attempt failed.
    Failed,
}

/// A provisioned agent identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentIdentity {
    /// Unique name, immutable once created.
    pub name: String,
    /// Home directory exclusively owned by this agent.
    pub home: PathBuf,
    /// When the identity was created.
    pub created_at: DateTime<Utc>,
    /// Current lifecycle state.
    pub status: AgentStatus,
}

impl AgentIdentity {
    /// Create a new identity in the [`AgentStatus::Pending`] state.
    pub fn new(name: impl Into<String>, home: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            home: home.into(),
            created_at: Utc::now(),
            status: AgentStatus::Pending,
        }
    }
}

/// File-backed store of agent identities.
///
/// All mutation goes through a single async mutex; the store persists the
/// full record set on every change by writing a temporary file and
/// renaming it over the previous one, so a crash mid-write never leaves a
/// truncated store behind.
///
/// The backing file is shared across processes: `create_agent` writes it
/// while the relay reads it. Lookups that miss the in-memory records
/// re-read the file when its modification time has changed, so an agent
/// provisioned after this process started is still recognized.
#[derive(Debug)]
pub struct IdentityStore {
    path: PathBuf,
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    records: HashMap<String, AgentIdentity>,
    /// Modification time of the backing file at the last load, `None`
    /// when the file did not exist.
    modified: Option<SystemTime>,
}

impl IdentityStore {
    /// Open the store at `path`, creating parent directories as needed.
    ///
    /// A missing file is an empty store, not an error.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let state = read_state(&path).await?;
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Look up an identity by name.
    pub async fn get(&self, name: &str) -> Option<AgentIdentity> {
        let mut state = self.state.lock().await;
        if !state.records.contains_key(name) {
            self.refresh(&mut state).await;
        }
        state.records.get(name).cloned()
    }

    /// Whether `name` refers to an [`AgentStatus::Active`] identity.
    ///
    /// Used by the relay to classify connections; a name with no Active
    /// record is treated as an external client.
    pub async fn is_active(&self, name: &str) -> bool {
        let active = |state: &State| {
            state
                .records
                .get(name)
                .is_some_and(|id| id.status == AgentStatus::Active)
        };

        let mut state = self.state.lock().await;
        if active(&state) {
            return true;
        }
        self.refresh(&mut state).await;
        active(&state)
    }

    /// Insert or replace an identity and persist the store.
    pub async fn insert(&self, identity: AgentIdentity) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        self.refresh(&mut state).await;
        state.records.insert(identity.name.clone(), identity);
        self.persist(&mut state).await
    }

    /// Remove an identity and persist the store.
    ///
    /// Returns the removed record, if any.
    pub async fn remove(&self, name: &str) -> Result<Option<AgentIdentity>, StoreError> {
        let mut state = self.state.lock().await;
        self.refresh(&mut state).await;
        let removed = state.records.remove(name);
        if removed.is_some() {
            self.persist(&mut state).await?;
        }
        Ok(removed)
    }

    /// Names of all recorded identities, in no particular order.
    pub async fn names(&self) -> Vec<String> {
        self.state.lock().await.records.keys().cloned().collect()
    }

    /// Number of recorded identities.
    pub async fn len(&self) -> usize {
        self.state.lock().await.records.len()
    }

    /// Whether the store has no records.
    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.records.is_empty()
    }

    /// Re-read the backing file if another process has replaced it since
    /// the last load. A failed re-read keeps the current records.
    async fn refresh(&self, state: &mut State) {
        let on_disk = modification_time(&self.path).await;
        if on_disk == state.modified {
            return;
        }
        match read_state(&self.path).await {
            Ok(fresh) => *state = fresh,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "identity store refresh failed");
            }
        }
    }

    async fn persist(&self, state: &mut State) -> Result<(), StoreError> {
        let mut list: Vec<&AgentIdentity> = state.records.values().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        let json = serde_json::to_vec_pretty(&list)?;

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        state.modified = modification_time(&self.path).await;
        Ok(())
    }
}

async fn read_state(path: &Path) -> Result<State, StoreError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let list: Vec<AgentIdentity> = serde_json::from_slice(&bytes)?;
            Ok(State {
                records: list.into_iter().map(|id| (id.name.clone(), id)).collect(),
                modified: modification_time(path).await,
            })
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(State {
            records: HashMap::new(),
            modified: None,
        }),
        Err(e) => Err(e.into()),
    }
}

async fn modification_time(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path)
        .await
        .ok()
        .and_then(|m| m.modified().ok())
}
