//! Websocket transport for the relay.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;

use warren::relay::{ClientFrame, ProtocolError, Role, Router, ServerFrame};
use warren::{ConnectionRegistry, IdentityStore, RelayConfig};

type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// The websocket relay server.
///
/// One reader task per accepted connection, plus a writer task draining
/// that connection's bounded outbound queue into the socket. A stalled
/// socket therefore never blocks delivery to anyone else.
#[derive(Debug)]
pub struct RelayServer {
    listener: TcpListener,
    router: Arc<Router>,
    identities: Arc<IdentityStore>,
    config: RelayConfig,
}

impl RelayServer {
    /// Bind to `addr` and prepare the routing state.
    ///
    /// Pass port 0 to bind an ephemeral port; [`local_addr`](Self::local_addr)
    /// reports what was chosen.
    pub async fn bind(
        addr: SocketAddr,
        identities: Arc<IdentityStore>,
        config: RelayConfig,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let registry = Arc::new(ConnectionRegistry::new());
        let router = Arc::new(Router::new(registry, config.clone()));
        Ok(Self {
            listener,
            router,
            identities,
            config,
        })
    }

    /// The address the server is listening on.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// The router driving this server's connections.
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Run until SIGTERM or Ctrl+C.
    pub async fn run(self) -> anyhow::Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Run until `shutdown` resolves.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        tracing::info!("relay listening on {}", self.local_addr()?);

        let sweeper = tokio::spawn({
            let router = Arc::clone(&self.router);
            let interval = self.config.sweep_interval;
            async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    router.sweep();
                }
            }
        });

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let router = Arc::clone(&self.router);
                        let identities = Arc::clone(&self.identities);
                        let config = self.config.clone();
                        tokio::spawn(async move {
                            if let Err(e) =
                                handle_connection(stream, peer, router, identities, config).await
                            {
                                tracing::debug!(%peer, error = %e, "connection ended with error");
                            }
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                },
            }
        }

        sweeper.abort();
        tracing::info!("relay shut down");
        Ok(())
    }
}

/// Why the reader loop ended.
#[derive(Debug)]
enum CloseReason {
    /// Peer closed the websocket or the transport failed.
    Transport,
    /// No inbound frame within the idle timeout.
    Idle,
    /// Malformed or unsupported frame.
    Violation,
}

/// Outcome of waiting for the IDENTIFY frame.
enum Handshake {
    Identified(String),
    Closed,
    Violation(String),
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    router: Arc<Router>,
    identities: Arc<IdentityStore>,
    config: RelayConfig,
) -> anyhow::Result<()> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut sink, mut source) = ws.split();
    tracing::debug!(%peer, "websocket accepted");

    sink.send(frame_message(&ServerFrame::Hello {
        message: "please identify".to_string(),
    })?)
    .await?;

    let name = match tokio::time::timeout(config.handshake_timeout, await_identify(&mut source))
        .await
    {
        Ok(Handshake::Identified(name)) => name,
        Ok(Handshake::Closed) => {
            tracing::debug!(%peer, "closed before identifying");
            return Ok(());
        }
        Ok(Handshake::Violation(reason)) => {
            tracing::debug!(%peer, reason, "protocol violation during handshake");
            let _ = sink
                .send(frame_message(&ServerFrame::Error { message: reason })?)
                .await;
            let _ = sink.close().await;
            return Ok(());
        }
        Err(_) => {
            tracing::debug!(%peer, "handshake timed out");
            let _ = sink
                .send(frame_message(&ServerFrame::Error {
                    message: "handshake timed out".to_string(),
                })?)
                .await;
            let _ = sink.close().await;
            return Ok(());
        }
    };

    // Names backed by an active identity are agents; everyone else is a
    // client. A stale name (identity deleted while connected) still
    // routes, it just never classifies as an agent again.
    let role = if identities.is_active(&name).await {
        Role::Agent
    } else {
        Role::Client
    };
    let (id, mut outbound) = router.connect(&name, role);

    // Writer: drain the bounded queue into the socket. Ends when every
    // sender is gone, i.e. after the router unregisters the connection.
    let mut writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            match frame_message(&frame) {
                Ok(message) => {
                    if sink.send(message).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "dropping unencodable frame"),
            }
        }
        let _ = sink.close().await;
    });

    // Reader: apply frames in arrival order. Sequential processing here
    // is what makes a JOIN visible before any later frame from this
    // connection.
    let reason = loop {
        let next = tokio::time::timeout(config.idle_timeout, source.next()).await;
        match next {
            Err(_) => break CloseReason::Idle,
            Ok(None) => break CloseReason::Transport,
            Ok(Some(Err(_))) => break CloseReason::Transport,
            Ok(Some(Ok(message))) => match message {
                Message::Text(text) => match ClientFrame::decode(text.as_str()) {
                    Ok(frame) => router.handle(id, frame),
                    Err(e) => {
                        router.report_error(id, &e.to_string());
                        break CloseReason::Violation;
                    }
                },
                Message::Binary(_) => {
                    router.report_error(id, &ProtocolError::Unsupported("binary").to_string());
                    break CloseReason::Violation;
                }
                Message::Close(_) => break CloseReason::Transport,
                // Pings are answered by the websocket layer.
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            },
        }
    };

    tracing::debug!(%peer, %id, ?reason, "closing connection");
    router.disconnect(id);

    // disconnect() dropped the queue's senders, so the writer finishes
    // once it has flushed whatever was pending. Bounded: never wait on a
    // dead socket forever.
    if tokio::time::timeout(config.close_flush_timeout, &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }
    Ok(())
}

/// Wait for the IDENTIFY frame. Everything else arriving first is
/// dropped, not queued.
async fn await_identify(source: &mut WsSource) -> Handshake {
    while let Some(next) = source.next().await {
        let message = match next {
            Ok(m) => m,
            Err(_) => return Handshake::Closed,
        };
        match message {
            Message::Text(text) => match ClientFrame::decode(text.as_str()) {
                Ok(ClientFrame::Identify { name }) => return Handshake::Identified(name),
                Ok(frame) => {
                    tracing::debug!(?frame, "dropping frame sent before IDENTIFY");
                }
                Err(e) => return Handshake::Violation(e.to_string()),
            },
            Message::Binary(_) => {
                return Handshake::Violation(ProtocolError::Unsupported("binary").to_string());
            }
            Message::Close(_) => return Handshake::Closed,
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
    }
    Handshake::Closed
}

fn frame_message(frame: &ServerFrame) -> Result<Message, serde_json::Error> {
    Ok(Message::text(frame.encode()?))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                // Fall through to let ctrl_c handle shutdown
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
