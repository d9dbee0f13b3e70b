//! Tunables for the relay server.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Relay behavior knobs.
///
/// Every timeout here is a bound on how long the relay will wait on a
/// single connection; none of them affects other connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Capacity of each connection's outbound frame queue. When a
    /// recipient's queue is full, frames for that recipient are dropped
    /// rather than stalling the sender.
    pub outbound_queue: usize,
    /// Close a connection after this long without an inbound frame.
    #[serde(with = "duration_ms")]
    pub idle_timeout: Duration,
    /// How long a new connection gets to identify itself.
    #[serde(with = "duration_ms")]
    pub handshake_timeout: Duration,
    /// How long an empty channel survives before the sweep removes it.
    /// Tolerates transient all-leave/rejoin races.
    #[serde(with = "duration_ms")]
    pub empty_channel_grace: Duration,
    /// Interval between empty-channel sweeps.
    #[serde(with = "duration_ms")]
    pub sweep_interval: Duration,
    /// Bound on flushing queued frames when closing a connection.
    #[serde(with = "duration_ms")]
    pub close_flush_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            outbound_queue: 64,
            idle_timeout: Duration::from_secs(300),
            handshake_timeout: Duration::from_secs(10),
            empty_channel_grace: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(15),
            close_flush_timeout: Duration::from_secs(5),
        }
    }
}

/// Helper for serializing Duration as milliseconds
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
