//! Live-connection and channel-membership bookkeeping.
//!
//! The registry is pure bookkeeping: no I/O, no protocol logic. It is
//! driven concurrently by one task per connection, so both maps are
//! sharded concurrent maps rather than a single lock.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc;

use super::protocol::{Role, ServerFrame, normalize_channel};

/// Opaque token identifying one live connection.
///
/// Assigned at accept time, never reused within a process, never
/// persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Snapshot of one connection's bookkeeping state.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// The connection's id.
    pub id: ConnectionId,
    /// The name presented at handshake.
    pub name: String,
    /// Role classified at handshake.
    pub role: Role,
    /// Channels currently joined (normalized names).
    pub channels: Vec<String>,
    /// When the last inbound frame arrived.
    pub last_seen: Instant,
}

#[derive(Debug)]
struct ConnectionEntry {
    name: String,
    role: Role,
    sender: mpsc::Sender<ServerFrame>,
    channels: HashSet<String>,
    last_seen: Instant,
}

#[derive(Debug, Default)]
struct ChannelEntry {
    members: HashSet<ConnectionId>,
    /// Set when the last member leaves; cleared on rejoin. Drives lazy
    /// garbage collection.
    emptied_at: Option<Instant>,
}

/// Tracks live connections and their channel memberships.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    connections: DashMap<ConnectionId, ConnectionEntry>,
    channels: DashMap<String, ChannelEntry>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and hand back its id.
    ///
    /// `sender` is the connection's bounded outbound queue; the registry
    /// holds it so other connections' tasks can enqueue frames for this
    /// one.
    pub fn register(
        &self,
        name: impl Into<String>,
        role: Role,
        sender: mpsc::Sender<ServerFrame>,
    ) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.connections.insert(
            id,
            ConnectionEntry {
                name: name.into(),
                role,
                sender,
                channels: HashSet::new(),
                last_seen: Instant::now(),
            },
        );
        id
    }

    /// Remove a connection, clearing its channel memberships.
    ///
    /// Returns the connection's name and the (normalized) channels it was
    /// in, so the caller can emit departure notices to the survivors.
    pub fn unregister(&self, id: ConnectionId) -> Option<(String, Vec<String>)> {
        let (_, entry) = self.connections.remove(&id)?;
        let channels: Vec<String> = entry.channels.into_iter().collect();
        for channel in &channels {
            if let Some(mut ch) = self.channels.get_mut(channel) {
                ch.members.remove(&id);
                if ch.members.is_empty() {
                    ch.emptied_at = Some(Instant::now());
                }
            }
        }
        Some((entry.name, channels))
    }

    /// Snapshot a connection's state.
    pub fn lookup(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.connections.get(&id).map(|e| ConnectionInfo {
            id,
            name: e.name.clone(),
            role: e.role,
            channels: e.channels.iter().cloned().collect(),
            last_seen: e.last_seen,
        })
    }

    /// The outbound queue handle for a connection.
    pub fn sender_of(&self, id: ConnectionId) -> Option<mpsc::Sender<ServerFrame>> {
        self.connections.get(&id).map(|e| e.sender.clone())
    }

    /// Find a connection by its presented name.
    ///
    /// Names are not required to be unique across clients; if several
    /// connections share one, an arbitrary match is returned.
    pub fn find_by_name(&self, name: &str) -> Option<ConnectionId> {
        self.connections
            .iter()
            .find(|e| e.name == name)
            .map(|e| *e.key())
    }

    /// Record inbound activity on a connection.
    pub fn touch(&self, id: ConnectionId) {
        if let Some(mut e) = self.connections.get_mut(&id) {
            e.last_seen = Instant::now();
        }
    }

    /// Add a connection to a channel, creating the channel if needed.
    ///
    /// Returns false if the connection is unknown or already a member.
    pub fn join(&self, id: ConnectionId, channel: &str) -> bool {
        let channel = normalize_channel(channel);

        let newly_joined = match self.connections.get_mut(&id) {
            Some(mut e) => e.channels.insert(channel.clone()),
            None => return false,
        };
        if !newly_joined {
            return false;
        }

        let mut ch = self.channels.entry(channel).or_default();
        ch.members.insert(id);
        ch.emptied_at = None;
        true
    }

    /// Remove a connection from a channel.
    ///
    /// Returns false if it was not a member.
    pub fn leave(&self, id: ConnectionId, channel: &str) -> bool {
        let channel = normalize_channel(channel);

        let was_member = match self.connections.get_mut(&id) {
            Some(mut e) => e.channels.remove(&channel),
            None => return false,
        };
        if !was_member {
            return false;
        }

        if let Some(mut ch) = self.channels.get_mut(&channel) {
            ch.members.remove(&id);
            if ch.members.is_empty() {
                ch.emptied_at = Some(Instant::now());
            }
        }
        true
    }

    /// Whether a channel is currently alive: it has members, or sat empty
    /// for less than the sweep grace.
    pub fn contains_channel(&self, channel: &str) -> bool {
        self.channels.contains_key(&normalize_channel(channel))
    }

    /// Current members of a channel. Empty if the channel is unknown.
    pub fn members_of(&self, channel: &str) -> Vec<ConnectionId> {
        self.channels
            .get(&normalize_channel(channel))
            .map(|ch| ch.members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Names of all channels not yet garbage-collected.
    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Ids of all live connections.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|e| *e.key()).collect()
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Drop channels that have been empty for longer than `grace`.
    ///
    /// Lazy on purpose: a channel that everyone left and someone rejoins
    /// within the grace window is never observed to disappear. Returns
    /// how many channels were collected.
    pub fn sweep_empty_channels(&self, grace: Duration) -> usize {
        let before = self.channels.len();
        self.channels.retain(|_, ch| {
            if !ch.members.is_empty() {
                return true;
            }
            match ch.emptied_at {
                Some(at) => at.elapsed() < grace,
                // Empty but never marked: mark now, collect next sweep.
                None => {
                    ch.emptied_at = Some(Instant::now());
                    true
                }
            }
        });
        // Saturating: a concurrent join may create channels mid-sweep.
        before.saturating_sub(self.channels.len())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn registry_with(name: &str) -> (ConnectionRegistry, ConnectionId) {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(8);
        let id = registry.register(name, Role::Client, tx);
        (registry, id)
    }

    #[test]
    fn test_register_and_lookup() {
        let (registry, id) = registry_with("watcher");

        let info = registry.lookup(id).expect("connection should exist");
        assert_eq!(info.name, "watcher");
        assert_eq!(info.role, Role::Client);
        assert!(info.channels.is_empty());
        assert_eq!(registry.connection_count(), 1);
    }

    #[test]
    fn test_ids_are_unique() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(8);
        let a = registry.register("a", Role::Client, tx.clone());
        let b = registry.register("b", Role::Client, tx);
        assert_ne!(a, b);
    }

    #[test]
    fn test_join_and_leave() {
        let (registry, id) = registry_with("member");

        assert!(registry.join(id, "ops"));
        assert!(!registry.join(id, "ops"), "double join is not a new join");
        assert_eq!(registry.members_of("ops"), vec![id]);
        assert_eq!(registry.lookup(id).unwrap().channels, vec!["ops"]);

        assert!(registry.leave(id, "ops"));
        assert!(!registry.leave(id, "ops"), "double part is a no-op");
        assert!(registry.members_of("ops").is_empty());
    }

    #[test]
    fn test_channel_names_are_case_insensitive() {
        let (registry, id) = registry_with("member");

        registry.join(id, "Ops");
        assert_eq!(registry.members_of("OPS"), vec![id]);
        assert_eq!(registry.channel_names(), vec!["ops"]);

        assert!(!registry.join(id, "oPs"), "same channel, different case");
    }

    #[test]
    fn test_unregister_clears_memberships() {
        let (registry, id) = registry_with("leaver");
        registry.join(id, "ops");
        registry.join(id, "dev");

        let (name, mut channels) = registry.unregister(id).expect("was registered");
        channels.sort();
        assert_eq!(name, "leaver");
        assert_eq!(channels, vec!["dev", "ops"]);
        assert!(registry.members_of("ops").is_empty());
        assert!(registry.lookup(id).is_none());
        assert!(registry.unregister(id).is_none());
    }

    #[test]
    fn test_find_by_name() {
        let (registry, id) = registry_with("needle");
        assert_eq!(registry.find_by_name("needle"), Some(id));
        assert_eq!(registry.find_by_name("missing"), None);
    }

    #[test]
    fn test_sweep_respects_grace() {
        let (registry, id) = registry_with("member");
        registry.join(id, "ops");
        registry.leave(id, "ops");

        // Within the grace window the empty channel survives.
        assert_eq!(registry.sweep_empty_channels(Duration::from_secs(60)), 0);
        assert_eq!(registry.channel_names(), vec!["ops"]);

        // Rejoining clears the empty mark.
        registry.join(id, "ops");
        assert_eq!(registry.sweep_empty_channels(Duration::ZERO), 0);

        // Once emptied past the grace it is collected.
        registry.leave(id, "ops");
        assert_eq!(registry.sweep_empty_channels(Duration::ZERO), 1);
        assert!(registry.channel_names().is_empty());
    }

    #[test]
    fn test_contains_channel_until_swept() {
        let (registry, id) = registry_with("member");
        assert!(!registry.contains_channel("ops"));

        registry.join(id, "ops");
        assert!(registry.contains_channel("OPS"));

        registry.leave(id, "ops");
        assert!(
            registry.contains_channel("ops"),
            "an empty channel stays alive until the sweep"
        );

        registry.sweep_empty_channels(Duration::ZERO);
        assert!(!registry.contains_channel("ops"));
    }

    #[test]
    fn test_touch_advances_last_seen() {
        let (registry, id) = registry_with("busy");
        let before = registry.lookup(id).unwrap().last_seen;
        std::thread::sleep(Duration::from_millis(5));
        registry.touch(id);
        let after = registry.lookup(id).unwrap().last_seen;
        assert!(after > before);
    }
}
