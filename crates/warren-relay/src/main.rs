//! Warren relay server binary.
//!
//! Serves the IRC-style websocket relay for agents and clients on the
//! sandbox host.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use warren::{IdentityStore, RelayConfig};
use warren_relay::RelayServer;

/// Warren relay - IRC-style websocket relay for sandboxed agents
#[derive(Parser, Debug)]
#[command(name = "warren-relay")]
#[command(about = "Websocket relay multiplexing agent and client channels")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:6668")]
    addr: SocketAddr,

    /// Path to the identity store shared with create_agent
    #[arg(long, default_value = "/var/lib/warren/agents.json")]
    identity_store: PathBuf,

    /// Per-connection outbound queue capacity
    #[arg(long, default_value_t = 64)]
    outbound_queue: usize,

    /// Close connections idle for this many seconds
    #[arg(long, default_value_t = 300)]
    idle_timeout_secs: u64,

    /// Seconds an empty channel survives before being swept
    #[arg(long, default_value_t = 30)]
    empty_channel_grace_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();

    let identities = Arc::new(IdentityStore::open(&args.identity_store).await?);
    let config = RelayConfig {
        outbound_queue: args.outbound_queue,
        idle_timeout: Duration::from_secs(args.idle_timeout_secs),
        empty_channel_grace: Duration::from_secs(args.empty_channel_grace_secs),
        ..RelayConfig::default()
    };

    let server = RelayServer::bind(args.addr, identities, config).await?;
    server.run().await?;

    Ok(())
}
