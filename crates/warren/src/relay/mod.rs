//! IRC-style message relay.
//!
//! The relay groups long-lived connections into named channels and routes
//! messages between them with IRC-inspired verbs. This module holds the
//! transport-free pieces: the wire frames, the connection registry, and
//! the router that implements JOIN/PART/PRIVMSG semantics. The websocket
//! transport that feeds them lives in the `warren-relay` crate.
//!
//! # Wire format
//!
//! Frames are JSON objects carried in websocket text messages:
//!
//! ```text
//! client -> server
//!   {"command": "IDENTIFY", "name": "test_agent"}
//!   {"command": "JOIN",     "channel": "ops"}
//!   {"command": "PRIVMSG",  "target": "ops", "text": "ping"}
//!   {"command": "PART",     "channel": "ops"}
//!   {"command": "LIST"}
//!
//! server -> client
//!   {"type": "hello",    "message": "please identify"}
//!   {"type": "welcome",  "name": "test_agent", "role": "agent", ...}
//!   {"type": "presence", "channel": "ops", "message": "..."}
//!   {"type": "message",  "channel": "ops", "sender": "test_agent", "text": "ping"}
//! ```
//!
//! # Ordering
//!
//! Each connection's inbound frames are processed sequentially by its own
//! task, so a JOIN is fully applied before any later frame from the same
//! connection; messages from one sender to one channel arrive at every
//! recipient in the order sent. No stronger cross-sender order is
//! guaranteed.

mod protocol;
mod registry;
mod router;

pub use protocol::{ClientFrame, ProtocolError, Role, ServerFrame, normalize_channel};
pub use registry::{ConnectionId, ConnectionInfo, ConnectionRegistry};
pub use router::Router;
