//! Wire frames for the relay protocol.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from decoding an inbound frame.
///
/// A protocol error closes the offending connection and no other.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame was not valid JSON or not a known command.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    /// The frame was not a text frame.
    #[error("unsupported frame type: {0}")]
    Unsupported(&'static str),
}

/// How a connection was classified at handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The presented name matched a known, active agent identity.
    Agent,
    /// Anything else: web UIs, operators, tooling.
    Client,
}

/// Frames sent by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "UPPERCASE")]
pub enum ClientFrame {
    /// Handshake: present a name. Must be the first frame; anything
    /// arriving before it is dropped.
    Identify {
        /// Name this connection goes by. Matched against the identity
        /// store to classify the connection's role.
        name: String,
    },
    /// Join a channel, creating it if needed.
    Join {
        /// Channel name; compared case-insensitively.
        channel: String,
    },
    /// Leave a channel. Leaving a channel the connection is not in is a
    /// no-op.
    Part {
        /// Channel name.
        channel: String,
    },
    /// Send a message to a channel, or directly to a named connection if
    /// no such channel exists. Fire-and-forget; unknown targets are a
    /// silent no-op.
    Privmsg {
        /// Channel or connection name.
        target: String,
        /// Message body.
        text: String,
    },
    /// Request the current channel list.
    List,
}

impl ClientFrame {
    /// Decode a client frame from websocket text.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// First frame on every connection: prompt for identification.
    Hello {
        /// Human-readable prompt.
        message: String,
    },
    /// Handshake accepted.
    Welcome {
        /// The name the connection identified as.
        name: String,
        /// Classified role.
        role: Role,
        /// Greeting text.
        message: String,
    },
    /// Server-wide presence notice ("x has joined the server").
    Notice {
        /// Notice text.
        message: String,
    },
    /// Channel-scoped presence notice ("x has joined ops").
    Presence {
        /// Channel the notice concerns.
        channel: String,
        /// Notice text.
        message: String,
    },
    /// A channel message.
    Message {
        /// Channel the message was sent to.
        channel: String,
        /// Name of the sending connection.
        sender: String,
        /// Message body.
        text: String,
    },
    /// A direct message to this connection only.
    Private {
        /// Name of the sending connection.
        sender: String,
        /// Message body.
        text: String,
    },
    /// Response to LIST.
    ChannelList {
        /// Names of channels currently alive (including empty ones not
        /// yet swept).
        channels: Vec<String>,
    },
    /// Terminal protocol error; the connection closes after this frame.
    Error {
        /// What went wrong.
        message: String,
    },
}

impl ServerFrame {
    /// Encode for a websocket text message.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Canonical form of a channel name: equality is case-insensitive.
pub fn normalize_channel(name: &str) -> String {
    name.to_lowercase()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_client_frames() {
        let join = ClientFrame::decode(r#"{"command":"JOIN","channel":"ops"}"#).unwrap();
        assert_eq!(
            join,
            ClientFrame::Join {
                channel: "ops".to_string()
            }
        );

        let msg =
            ClientFrame::decode(r#"{"command":"PRIVMSG","target":"ops","text":"ping"}"#).unwrap();
        assert_eq!(
            msg,
            ClientFrame::Privmsg {
                target: "ops".to_string(),
                text: "ping".to_string()
            }
        );

        let list = ClientFrame::decode(r#"{"command":"LIST"}"#).unwrap();
        assert_eq!(list, ClientFrame::List);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(ClientFrame::decode("not json at all").is_err());
        assert!(ClientFrame::decode(r#"{"command":"SUDO","target":"x"}"#).is_err());
        assert!(ClientFrame::decode(r#"{"channel":"ops"}"#).is_err());
    }

    #[test]
    fn test_server_frame_round_trip() {
        let frame = ServerFrame::Message {
            channel: "ops".to_string(),
            sender: "test_agent".to_string(),
            text: "ping".to_string(),
        };

        let encoded = frame.encode().unwrap();
        assert!(encoded.contains("\"type\":\"message\""));
        assert!(encoded.contains("\"sender\":\"test_agent\""));

        let back: ServerFrame = serde_json::from_str(&encoded).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn test_role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Agent).unwrap(), "\"agent\"");
        assert_eq!(serde_json::to_string(&Role::Client).unwrap(), "\"client\"");
    }

    #[test]
    fn test_normalize_channel() {
        assert_eq!(normalize_channel("Ops"), "ops");
        assert_eq!(normalize_channel("OPS"), normalize_channel("ops"));
    }
}
