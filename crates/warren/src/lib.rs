//! Warren: agent lifecycle and message relay for shared sandbox hosts
//!
//! Warren provisions isolated, SSH-reachable sandbox identities for
//! autonomous LLM agents living on a shared container host, grants each
//! agent access to a common exchange folder, and routes IRC-style messages
//! between agents and external clients over persistent relay connections.
//!
//! The library is transport-free: the websocket server lives in the
//! `warren-relay` crate and drives the [`Router`] and
//! [`ConnectionRegistry`] defined here.

mod config;
mod guard;
mod identity;
mod provision;

pub mod relay;

pub use config::RelayConfig;
pub use guard::{GrantPermissions, GuardError, SharedFolderGrant, SharedFolderGuard};
pub use identity::{AgentIdentity, AgentStatus, IdentityStore, StoreError};
pub use provision::{AccountManager, AgentProvisioner, NoopAccounts, ProvisionError, SystemAccounts};
pub use relay::{ConnectionId, ConnectionRegistry, Role, Router};
