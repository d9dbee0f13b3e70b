//! Access policy for the shared exchange folder.
//!
//! The shared folder is one directory that every active agent can read
//! and write; agents use it to pass artifacts between each other. The
//! guard does not touch filesystem permissions per agent. It verifies the
//! folder is usable at grant time and keeps a bookkeeping record per
//! agent, which is what auditing and any future per-agent policy
//! tightening hang off.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from the shared-folder guard.
#[derive(Debug, Error)]
pub enum GuardError {
    /// The shared path is missing or not writable.
    ///
    /// Fatal to the current provisioning attempt; the operator retries
    /// once the path is restored.
    #[error("shared folder {path} is unavailable: {source}")]
    StorageUnavailable {
        /// The shared folder path that failed the probe.
        path: PathBuf,
        /// Underlying filesystem error.
        #[source]
        source: std::io::Error,
    },
}

/// Access level recorded on a grant.
///
/// Every grant issued today is [`GrantPermissions::ReadWrite`]; `Read` is
/// the extension point for stricter per-agent policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GrantPermissions {
    /// Read-only access.
    Read,
    /// Full read-write access.
    ReadWrite,
}

/// Bookkeeping record of one agent's access to the shared folder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedFolderGrant {
    /// Name of the agent holding the grant. Back-reference only; the
    /// grant does not own the identity.
    pub agent_name: String,
    /// Access level.
    pub permissions: GrantPermissions,
    /// When the grant was issued.
    pub granted_at: DateTime<Utc>,
}

/// Enforces the access policy on the shared exchange directory.
#[derive(Debug)]
pub struct SharedFolderGuard {
    shared_dir: PathBuf,
    grants: DashMap<String, SharedFolderGrant>,
}

impl SharedFolderGuard {
    /// Create a guard over `shared_dir`.
    ///
    /// The directory is probed lazily on each [`grant`](Self::grant), not
    /// here, so a guard can be constructed before the mount exists.
    pub fn new(shared_dir: impl Into<PathBuf>) -> Self {
        Self {
            shared_dir: shared_dir.into(),
            grants: DashMap::new(),
        }
    }

    /// The shared directory this guard covers.
    pub fn shared_dir(&self) -> &Path {
        &self.shared_dir
    }

    /// Issue a grant for `agent_name`.
    ///
    /// Probes the shared directory with a write-then-delete to confirm it
    /// is mounted and writable. Granting an agent that already holds a
    /// grant returns the existing record; grants are never duplicated.
    pub async fn grant(&self, agent_name: &str) -> Result<SharedFolderGrant, GuardError> {
        self.probe(agent_name).await?;

        let grant = self
            .grants
            .entry(agent_name.to_string())
            .or_insert_with(|| SharedFolderGrant {
                agent_name: agent_name.to_string(),
                permissions: GrantPermissions::ReadWrite,
                granted_at: Utc::now(),
            })
            .clone();

        tracing::debug!(agent = agent_name, "shared folder grant issued");
        Ok(grant)
    }

    /// Revoke `agent_name`'s grant, returning it if one existed.
    pub fn revoke(&self, agent_name: &str) -> Option<SharedFolderGrant> {
        let removed = self.grants.remove(agent_name).map(|(_, g)| g);
        if removed.is_some() {
            tracing::debug!(agent = agent_name, "shared folder grant revoked");
        }
        removed
    }

    /// Current grant for `agent_name`, if any.
    pub fn grant_for(&self, agent_name: &str) -> Option<SharedFolderGrant> {
        self.grants.get(agent_name).map(|g| g.clone())
    }

    /// Number of outstanding grants.
    pub fn grant_count(&self) -> usize {
        self.grants.len()
    }

    async fn probe(&self, agent_name: &str) -> Result<(), GuardError> {
        let unavailable = |source| GuardError::StorageUnavailable {
            path: self.shared_dir.clone(),
            source,
        };

        let probe = self.shared_dir.join(format!(".grant-probe-{agent_name}"));
        tokio::fs::write(&probe, b"probe").await.map_err(unavailable)?;
        tokio::fs::remove_file(&probe).await.map_err(unavailable)?;
        Ok(())
    }
}
