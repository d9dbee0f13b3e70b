//! Message routing with IRC semantics.
//!
//! The [`Router`] owns the relay's behavior: presence notices, channel
//! fanout, direct messages, and the drop-don't-block overflow policy.
//! All methods are synchronous; they enqueue frames onto recipients'
//! bounded queues via `try_send` and never wait, so no sender can be
//! stalled by a slow recipient. The transport layer calls these from one
//! task per connection, which is what gives each connection's frames
//! their sequential, join-happens-before-send ordering.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::protocol::{ClientFrame, Role, ServerFrame, normalize_channel};
use super::registry::{ConnectionId, ConnectionRegistry};
use crate::config::RelayConfig;

/// Routes frames between registered connections.
#[derive(Debug)]
pub struct Router {
    registry: Arc<ConnectionRegistry>,
    config: RelayConfig,
}

impl Router {
    /// Create a router over `registry`.
    pub fn new(registry: Arc<ConnectionRegistry>, config: RelayConfig) -> Self {
        Self { registry, config }
    }

    /// The registry this router drives.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Admit an authenticated connection.
    ///
    /// Announces the arrival to every existing connection, registers the
    /// newcomer, and queues its welcome frame. Returns the connection id
    /// and the receiving end of its bounded outbound queue; the transport
    /// drains the receiver into the socket.
    pub fn connect(&self, name: &str, role: Role) -> (ConnectionId, mpsc::Receiver<ServerFrame>) {
        self.broadcast_server(ServerFrame::Notice {
            message: format!("{name} has joined the server"),
        });

        let (tx, rx) = mpsc::channel(self.config.outbound_queue);
        let id = self.registry.register(name, role, tx.clone());

        let welcome = ServerFrame::Welcome {
            name: name.to_string(),
            role,
            message: format!("Welcome {name}!"),
        };
        if tx.try_send(welcome).is_err() {
            // Queue capacity is at least 1 and the queue is new; only a
            // zero-capacity misconfiguration lands here.
            tracing::warn!(%id, "could not queue welcome frame");
        }

        tracing::info!(%id, name, ?role, "connection admitted");
        (id, rx)
    }

    /// Apply one inbound frame from an authenticated connection.
    pub fn handle(&self, id: ConnectionId, frame: ClientFrame) {
        self.registry.touch(id);
        match frame {
            ClientFrame::Identify { name } => {
                // Already identified at handshake; renaming is not
                // supported.
                tracing::debug!(%id, name, "ignoring IDENTIFY after handshake");
            }
            ClientFrame::Join { channel } => self.join(id, &channel),
            ClientFrame::Part { channel } => self.part(id, &channel),
            ClientFrame::Privmsg { target, text } => self.privmsg(id, &target, &text),
            ClientFrame::List => self.list(id),
        }
    }

    /// Join `id` to a channel and announce it to the members.
    pub fn join(&self, id: ConnectionId, channel: &str) {
        if !self.registry.join(id, channel) {
            return;
        }
        let Some(name) = self.name_of(id) else { return };

        let channel = normalize_channel(channel);
        tracing::debug!(%id, name, channel, "joined channel");
        self.broadcast_channel(
            &channel,
            None,
            ServerFrame::Presence {
                channel: channel.clone(),
                message: format!("{name} has joined {channel}"),
            },
        );
    }

    /// Remove `id` from a channel and announce the departure to the
    /// remaining members. Parting a channel the connection is not in is a
    /// no-op.
    pub fn part(&self, id: ConnectionId, channel: &str) {
        if !self.registry.leave(id, channel) {
            return;
        }
        let Some(name) = self.name_of(id) else { return };

        let channel = normalize_channel(channel);
        tracing::debug!(%id, name, channel, "left channel");
        self.broadcast_channel(
            &channel,
            None,
            ServerFrame::Presence {
                channel: channel.clone(),
                message: format!("{name} has left {channel}"),
            },
        );
    }

    /// Deliver a message to a channel, or directly to a named connection
    /// if no such channel is alive.
    ///
    /// Channel delivery excludes the sender's own echo. A message to an
    /// alive but momentarily empty channel stays channel-scoped; it never
    /// falls back to a connection sharing the channel's name. Unknown
    /// targets are a silent no-op: PRIVMSG is fire-and-forget.
    pub fn privmsg(&self, id: ConnectionId, target: &str, text: &str) {
        let Some(sender) = self.name_of(id) else {
            return;
        };

        if self.registry.contains_channel(target) {
            let channel = normalize_channel(target);
            self.broadcast_channel(
                &channel,
                Some(id),
                ServerFrame::Message {
                    channel: channel.clone(),
                    sender,
                    text: text.to_string(),
                },
            );
            return;
        }

        if let Some(peer) = self.registry.find_by_name(target) {
            self.send_to(
                peer,
                ServerFrame::Private {
                    sender,
                    text: text.to_string(),
                },
            );
            return;
        }

        tracing::debug!(%id, target, "PRIVMSG to unknown target dropped");
    }

    /// Send the requester the current channel list.
    pub fn list(&self, id: ConnectionId) {
        self.send_to(
            id,
            ServerFrame::ChannelList {
                channels: self.registry.channel_names(),
            },
        );
    }

    /// Tear down a connection: clear its memberships, announce its
    /// departure to each channel it was in and to the server at large.
    ///
    /// Called for clean PARTs of the transport and abrupt disconnects
    /// alike; the notices are identical.
    pub fn disconnect(&self, id: ConnectionId) {
        let Some((name, channels)) = self.registry.unregister(id) else {
            return;
        };

        for channel in channels {
            self.broadcast_channel(
                &channel,
                None,
                ServerFrame::Presence {
                    channel: channel.clone(),
                    message: format!("{name} has left {channel}"),
                },
            );
        }
        self.broadcast_server(ServerFrame::Notice {
            message: format!("{name} has left the server"),
        });
        tracing::info!(%id, name, "connection closed");
    }

    /// Queue a protocol error frame for a connection, ahead of the
    /// transport closing it.
    pub fn report_error(&self, id: ConnectionId, message: &str) {
        self.send_to(
            id,
            ServerFrame::Error {
                message: message.to_string(),
            },
        );
    }

    /// Collect channels that have sat empty past the configured grace.
    pub fn sweep(&self) {
        let collected = self
            .registry
            .sweep_empty_channels(self.config.empty_channel_grace);
        if collected > 0 {
            tracing::debug!(collected, "swept empty channels");
        }
    }

    fn name_of(&self, id: ConnectionId) -> Option<String> {
        self.registry.lookup(id).map(|info| info.name)
    }

    fn broadcast_channel(
        &self,
        channel: &str,
        exclude: Option<ConnectionId>,
        frame: ServerFrame,
    ) {
        for member in self.registry.members_of(channel) {
            if Some(member) != exclude {
                self.send_to(member, frame.clone());
            }
        }
    }

    fn broadcast_server(&self, frame: ServerFrame) {
        for id in self.registry.connection_ids() {
            self.send_to(id, frame.clone());
        }
    }

    /// Enqueue a frame for one recipient, dropping it if the recipient's
    /// queue is full. Best-effort by contract; a stalled consumer only
    /// loses its own frames.
    fn send_to(&self, id: ConnectionId, frame: ServerFrame) {
        let Some(sender) = self.registry.sender_of(id) else {
            return;
        };
        match sender.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::debug!(%id, "outbound queue full, dropping frame");
            }
            Err(TrySendError::Closed(_)) => {
                // Connection is on its way out; disconnect() cleans up.
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn router() -> Router {
        Router::new(Arc::new(ConnectionRegistry::new()), RelayConfig::default())
    }

    fn router_with_queue(capacity: usize) -> Router {
        let config = RelayConfig {
            outbound_queue: capacity,
            ..RelayConfig::default()
        };
        Router::new(Arc::new(ConnectionRegistry::new()), config)
    }

    fn drain(rx: &mut mpsc::Receiver<ServerFrame>) -> Vec<ServerFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn messages(frames: &[ServerFrame]) -> Vec<(String, String, String)> {
        frames
            .iter()
            .filter_map(|f| match f {
                ServerFrame::Message {
                    channel,
                    sender,
                    text,
                } => Some((channel.clone(), sender.clone(), text.clone())),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_connect_welcomes_and_announces() {
        let router = router();

        let (_a, mut a_rx) = router.connect("first", Role::Client);
        let frames = drain(&mut a_rx);
        assert!(matches!(
            frames.first(),
            Some(ServerFrame::Welcome { name, role: Role::Client, .. }) if name == "first"
        ));

        let (_b, mut b_rx) = router.connect("second", Role::Agent);
        // The existing connection hears about the newcomer.
        let notices = drain(&mut a_rx);
        assert!(notices.iter().any(|f| matches!(
            f,
            ServerFrame::Notice { message } if message == "second has joined the server"
        )));
        // The newcomer does not hear about itself, only its welcome.
        let frames = drain(&mut b_rx);
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames.first(), Some(ServerFrame::Welcome { .. })));
    }

    #[tokio::test]
    async fn test_join_then_send_is_delivered() {
        let router = router();
        let (a, mut a_rx) = router.connect("alpha", Role::Agent);
        let (b, mut b_rx) = router.connect("beta", Role::Client);

        router.join(a, "c");
        router.join(b, "c");
        drain(&mut a_rx);
        drain(&mut b_rx);

        router.privmsg(a, "c", "hi");

        let got = messages(&drain(&mut b_rx));
        assert_eq!(
            got,
            vec![("c".to_string(), "alpha".to_string(), "hi".to_string())]
        );
        // Sender gets no echo of its own message.
        assert!(messages(&drain(&mut a_rx)).is_empty());
    }

    #[tokio::test]
    async fn test_send_before_join_is_not_delivered() {
        let router = router();
        let (a, _a_rx) = router.connect("alpha", Role::Agent);
        let (b, mut b_rx) = router.connect("beta", Role::Client);

        router.join(a, "c");
        router.privmsg(a, "c", "hi");
        router.join(b, "c");

        assert!(
            messages(&drain(&mut b_rx)).is_empty(),
            "a message sent before B joined must not reach B"
        );
    }

    #[tokio::test]
    async fn test_join_presence_reaches_existing_members() {
        let router = router();
        let (a, mut a_rx) = router.connect("alpha", Role::Agent);
        let (b, _b_rx) = router.connect("beta", Role::Client);

        router.join(a, "ops");
        drain(&mut a_rx);
        router.join(b, "ops");

        let frames = drain(&mut a_rx);
        assert!(frames.iter().any(|f| matches!(
            f,
            ServerFrame::Presence { channel, message }
                if channel == "ops" && message == "beta has joined ops"
        )));
    }

    #[tokio::test]
    async fn test_privmsg_unknown_channel_is_noop() {
        let router = router();
        let (a, mut a_rx) = router.connect("alpha", Role::Agent);
        let (_b, mut b_rx) = router.connect("beta", Role::Client);
        drain(&mut a_rx);
        drain(&mut b_rx);

        router.privmsg(a, "nowhere_at_all", "hello?");

        assert!(drain(&mut a_rx).is_empty());
        assert!(drain(&mut b_rx).is_empty());
    }

    #[tokio::test]
    async fn test_privmsg_direct_to_named_connection() {
        let router = router();
        let (a, mut a_rx) = router.connect("alpha", Role::Agent);
        let (_b, mut b_rx) = router.connect("beta", Role::Client);
        let (_c, mut c_rx) = router.connect("gamma", Role::Client);
        drain(&mut a_rx);
        drain(&mut b_rx);
        drain(&mut c_rx);

        router.privmsg(a, "beta", "just for you");

        let frames = drain(&mut b_rx);
        assert!(matches!(
            frames.first(),
            Some(ServerFrame::Private { sender, text })
                if sender == "alpha" && text == "just for you"
        ));
        assert!(drain(&mut c_rx).is_empty());
    }

    #[tokio::test]
    async fn test_privmsg_to_empty_channel_stays_channel_scoped() {
        let router = router();
        let (a, mut a_rx) = router.connect("alpha", Role::Agent);
        // A connection whose name collides with the channel's.
        let (_b, mut b_rx) = router.connect("ops", Role::Client);
        let (c, mut c_rx) = router.connect("gamma", Role::Client);

        // The channel exists but everyone has left; it has not been
        // swept yet.
        router.join(c, "ops");
        router.part(c, "ops");
        drain(&mut a_rx);
        drain(&mut b_rx);
        drain(&mut c_rx);

        router.privmsg(a, "ops", "anyone here?");

        assert!(
            drain(&mut b_rx).is_empty(),
            "channel traffic must not turn into a direct message"
        );
        assert!(drain(&mut a_rx).is_empty());
        assert!(drain(&mut c_rx).is_empty());
    }

    #[tokio::test]
    async fn test_part_notifies_remaining_members() {
        let router = router();
        let (a, mut a_rx) = router.connect("alpha", Role::Agent);
        let (b, mut b_rx) = router.connect("beta", Role::Client);
        router.join(a, "ops");
        router.join(b, "ops");
        drain(&mut a_rx);
        drain(&mut b_rx);

        router.part(b, "ops");

        let frames = drain(&mut a_rx);
        assert!(frames.iter().any(|f| matches!(
            f,
            ServerFrame::Presence { message, .. } if message == "beta has left ops"
        )));
        // Departed member no longer receives channel traffic.
        router.privmsg(a, "ops", "after part");
        assert!(messages(&drain(&mut b_rx)).is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_announces_and_clears() {
        let router = router();
        let (a, mut a_rx) = router.connect("alpha", Role::Agent);
        let (b, _b_rx) = router.connect("beta", Role::Client);
        router.join(a, "ops");
        router.join(b, "ops");
        drain(&mut a_rx);

        router.disconnect(b);

        let frames = drain(&mut a_rx);
        assert!(frames.iter().any(|f| matches!(
            f,
            ServerFrame::Presence { message, .. } if message == "beta has left ops"
        )));
        assert!(frames.iter().any(|f| matches!(
            f,
            ServerFrame::Notice { message } if message == "beta has left the server"
        )));
        assert_eq!(router.registry().members_of("ops"), vec![a]);
        assert_eq!(router.registry().connection_count(), 1);
    }

    #[tokio::test]
    async fn test_full_queue_drops_instead_of_blocking() {
        let router = router_with_queue(1);
        let (a, _a_rx) = router.connect("alpha", Role::Agent);
        let (b, mut b_rx) = router.connect("beta", Role::Client);
        router.join(a, "ops");
        router.join(b, "ops");
        drain(&mut b_rx);

        // Recipient stops draining; capacity is one frame.
        router.privmsg(a, "ops", "first");
        router.privmsg(a, "ops", "second");

        let got = messages(&drain(&mut b_rx));
        assert_eq!(
            got,
            vec![("ops".to_string(), "alpha".to_string(), "first".to_string())],
            "overflow drops the newest frame for the slow recipient"
        );
    }

    #[tokio::test]
    async fn test_list_reports_live_channels() {
        let router = router();
        let (a, mut a_rx) = router.connect("alpha", Role::Agent);
        router.join(a, "ops");
        router.join(a, "dev");
        drain(&mut a_rx);

        router.list(a);

        let frames = drain(&mut a_rx);
        match frames.first() {
            Some(ServerFrame::ChannelList { channels }) => {
                assert_eq!(channels, &vec!["dev".to_string(), "ops".to_string()]);
            }
            other => panic!("expected ChannelList, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fifo_per_sender_channel_pair() {
        let router = router();
        let (a, _a_rx) = router.connect("alpha", Role::Agent);
        let (b, mut b_rx) = router.connect("beta", Role::Client);
        router.join(a, "ops");
        router.join(b, "ops");
        drain(&mut b_rx);

        for i in 0..10 {
            router.privmsg(a, "ops", &format!("msg-{i}"));
        }

        let texts: Vec<String> = messages(&drain(&mut b_rx))
            .into_iter()
            .map(|(_, _, text)| text)
            .collect();
        let expected: Vec<String> = (0..10).map(|i| format!("msg-{i}")).collect();
        assert_eq!(texts, expected);
    }
}
