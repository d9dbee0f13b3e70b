//! Agent provisioning.
//!
//! [`AgentProvisioner`] turns a name into a fully provisioned agent: a
//! home directory under the agent root, a system account for SSH access,
//! and a grant on the shared exchange folder. Provisioning is idempotent
//! per name and serialized per name, so concurrent `create_agent` calls
//! for the same agent cannot race the allocation; the loser simply
//! observes the winner's Active record.
//!
//! Any failure mid-allocation rolls the agent back to absent. No partial
//! Active record is ever persisted.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::guard::{GuardError, SharedFolderGuard};
use crate::identity::{AgentIdentity, AgentStatus, IdentityStore, StoreError};

/// Maximum length of an agent name.
pub const MAX_NAME_LEN: usize = 64;

/// Errors from agent provisioning.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The requested name does not match the allowed pattern
    /// (1-64 alphanumeric or underscore characters).
    #[error("invalid agent name {name:?}: expected 1-{MAX_NAME_LEN} alphanumeric or underscore characters")]
    InvalidName {
        /// The rejected name.
        name: String,
    },
    /// Home directory allocation failed.
    #[error("home directory allocation failed: {0}")]
    Home(#[from] std::io::Error),
    /// System account creation failed.
    #[error("system account creation failed: {0}")]
    Account(String),
    /// The shared-folder grant was refused.
    #[error(transparent)]
    Guard(#[from] GuardError),
    /// The identity store could not be updated.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Manages OS-level accounts for provisioned agents.
///
/// The OS account namespace is process-global mutable state owned by an
/// external collaborator (the host's account database, consumed by its
/// SSH daemon). This trait is the seam: production uses
/// [`SystemAccounts`], tests substitute a fake.
#[async_trait]
pub trait AccountManager: Send + Sync {
    /// Create an account named `name` whose home is the already-created
    /// directory `home`.
    ///
    /// Must be idempotent: creating an account that already exists is
    /// success, not an error.
    async fn create(&self, name: &str, home: &Path) -> std::io::Result<()>;

    /// Remove the account named `name`, ignoring accounts that do not
    /// exist. Used for rollback; best-effort.
    async fn remove(&self, name: &str) -> std::io::Result<()>;
}

/// [`AccountManager`] backed by the host's `useradd`/`userdel`.
#[derive(Debug, Default)]
pub struct SystemAccounts;

// useradd exits 9 when the account already exists; provisioning treats
// that as success so a leftover account from an interrupted run does not
// wedge the name forever.
const USERADD_EXIT_NAME_IN_USE: i32 = 9;

#[async_trait]
impl AccountManager for SystemAccounts {
    async fn create(&self, name: &str, home: &Path) -> std::io::Result<()> {
        let status = tokio::process::Command::new("useradd")
            .arg("--home-dir")
            .arg(home)
            .arg("--no-create-home")
            .arg("--shell")
            .arg("/bin/bash")
            .arg(name)
            .status()
            .await?;

        match status.code() {
            Some(0) | Some(USERADD_EXIT_NAME_IN_USE) => Ok(()),
            code => Err(std::io::Error::other(format!(
                "useradd for {name} exited with {code:?}"
            ))),
        }
    }

    async fn remove(&self, name: &str) -> std::io::Result<()> {
        // Home directory removal is handled separately by the rollback.
        let status = tokio::process::Command::new("userdel")
            .arg(name)
            .status()
            .await?;
        if !status.success() {
            tracing::debug!(agent = name, ?status, "userdel did not succeed");
        }
        Ok(())
    }
}

/// [`AccountManager`] that manages nothing.
///
/// For hosts where SSH access is not wired up, and for tests.
#[derive(Debug, Default)]
pub struct NoopAccounts;

#[async_trait]
impl AccountManager for NoopAccounts {
    async fn create(&self, _name: &str, _home: &Path) -> std::io::Result<()> {
        Ok(())
    }

    async fn remove(&self, _name: &str) -> std::io::Result<()> {
        Ok(())
    }
}

/// Creates agents: system account, home directory, shared-folder grant.
pub struct AgentProvisioner {
    agent_root: PathBuf,
    store: Arc<IdentityStore>,
    guard: Arc<SharedFolderGuard>,
    accounts: Arc<dyn AccountManager>,
    name_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl fmt::Debug for AgentProvisioner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentProvisioner")
            .field("agent_root", &self.agent_root)
            .finish_non_exhaustive()
    }
}

impl AgentProvisioner {
    /// Create a provisioner allocating homes under `agent_root`.
    pub fn new(
        agent_root: impl Into<PathBuf>,
        store: Arc<IdentityStore>,
        guard: Arc<SharedFolderGuard>,
        accounts: Arc<dyn AccountManager>,
    ) -> Self {
        Self {
            agent_root: agent_root.into(),
            store,
            guard,
            accounts,
            name_locks: DashMap::new(),
        }
    }

    /// Provision the agent named `name`.
    ///
    /// Idempotent: if an Active identity already exists it is returned
    /// unchanged with no side effects. Calls for the same name serialize
    /// on a per-name lock; calls for different names run in parallel.
    pub async fn create_agent(&self, name: &str) -> Result<AgentIdentity, ProvisionError> {
        validate_name(name)?;

        let lock = self
            .name_locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = {
            let _serialized = lock.lock().await;
            self.create_locked(name).await
        };

        // A strong count of two means only the map and this call hold the
        // lock; cloning requires the same shard lock as remove_if, so no
        // waiter can appear between the check and the removal.
        self.name_locks
            .remove_if(name, |_, l| Arc::strong_count(l) <= 2);
        result
    }

    async fn create_locked(&self, name: &str) -> Result<AgentIdentity, ProvisionError> {
        if let Some(existing) = self.store.get(name).await {
            if existing.status == AgentStatus::Active {
                tracing::debug!(agent = name, "agent already active, idempotent success");
                return Ok(existing);
            }
        }

        let home = self.agent_root.join(name);
        match self.allocate(name, &home).await {
            Ok(identity) => {
                tracing::info!(agent = name, home = %home.display(), "agent created");
                Ok(identity)
            }
            Err(e) => {
                tracing::warn!(agent = name, error = %e, "provisioning failed, rolling back");
                self.rollback(name, &home).await;
                Err(e)
            }
        }
    }

    async fn allocate(&self, name: &str, home: &Path) -> Result<AgentIdentity, ProvisionError> {
        let mut identity = AgentIdentity::new(name, home);
        debug_assert_eq!(identity.status, AgentStatus::Pending);

        tokio::fs::create_dir_all(home).await?;
        self.accounts
            .create(name, home)
            .await
            .map_err(|e| ProvisionError::Account(e.to_string()))?;
        self.guard.grant(name).await?;

        identity.status = AgentStatus::Active;
        self.store.insert(identity.clone()).await?;
        Ok(identity)
    }

    /// Undo whatever parts of the allocation happened. Best-effort; the
    /// goal is that the agent is absent afterwards.
    async fn rollback(&self, name: &str, home: &Path) {
        if let Err(e) = self.store.remove(name).await {
            tracing::warn!(agent = name, error = %e, "rollback: store removal failed");
        }
        self.guard.revoke(name);
        if let Err(e) = self.accounts.remove(name).await {
            tracing::warn!(agent = name, error = %e, "rollback: account removal failed");
        }
        if let Err(e) = tokio::fs::remove_dir_all(home).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(agent = name, error = %e, "rollback: home removal failed");
            }
        }
    }
}

fn validate_name(name: &str) -> Result<(), ProvisionError> {
    let ok = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(ProvisionError::InvalidName {
            name: name.to_string(),
        })
    }
}
