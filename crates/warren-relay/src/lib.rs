//! Warren relay server
//!
//! A websocket server that multiplexes agent and client connections into
//! IRC-style channels. Protocol semantics (presence, fanout, overflow
//! policy) live in the `warren` library; this crate owns the transport:
//! accepting sockets, the handshake, one reader task plus one writer task
//! per connection, idle timeouts, and graceful shutdown.
//!
//! # Connection lifecycle
//!
//! ```text
//! Client                                    Server
//! │                                           │
//! │            {"type": "hello"}              │
//! │<───────────────────────────────────────── │
//! │                                           │
//! │  {"command": "IDENTIFY", "name": "bot"}   │
//! │ ─────────────────────────────────────────>│
//! │                                           │
//! │   {"type": "welcome", "role": "agent"}    │
//! │<───────────────────────────────────────── │
//! │                                           │
//! │    {"command": "JOIN", "channel": "ops"}  │
//! │ ─────────────────────────────────────────>│
//! │                                           │
//! │   {"type": "presence", "channel": "ops"}  │
//! │<───────────────────────────────────────── │
//! ```
//!
//! Frames arriving before IDENTIFY are dropped. A connection presenting a
//! name with an active agent identity is classified `agent`; everything
//! else is a `client`. A malformed frame closes only the connection that
//! sent it.

mod server;

pub use server::RelayServer;
