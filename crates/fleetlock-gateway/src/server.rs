//! [`GatewayServer`] – HTTP + WebSocket listener in front of the [`Gateway`].
//!
//! Listens on `0.0.0.0:7070` (configurable via [`GatewayServer::with_port`]).
//!
//! * Regular HTTP requests → 200 OK with a JSON health summary.
//! * WebSocket upgrades → a session speaking the frames in
//!   [`protocol`](crate::protocol).

use std::net::SocketAddr;
use std::sync::Arc;

use fleetlock_types::{FleetError, FleetResult};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::gateway::{Gateway, OUTBOUND_CAPACITY, Session};
use crate::protocol::ServerFrame;

/// Default TCP port for agents and operator tooling.
pub const DEFAULT_PORT: u16 = 7070;

// ---------------------------------------------------------------------------
// GatewayServer
// ---------------------------------------------------------------------------

/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use fleetlock_gateway::{Gateway, GatewayServer};
/// use fleetlock_runtime::ControlPlane;
///
/// #[tokio::main]
/// async fn main() {
///     let plane = Arc::new(ControlPlane::in_memory().expect("ledger"));
///     GatewayServer::new(Arc::new(Gateway::new(plane)))
///         .with_port(7070)
///         .run()
///         .await
///         .expect("gateway failed");
/// }
/// ```
pub struct GatewayServer {
    gateway: Arc<Gateway>,
    port: u16,
}

impl GatewayServer {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self {
            gateway,
            port: DEFAULT_PORT,
        }
    }

    /// Override the listening port (builder-style).
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Accept connections until the task is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::Transport`] if the listener cannot bind.
    pub async fn run(self) -> FleetResult<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| FleetError::Transport(format!("bind error on {addr}: {e}")))?;

        info!(%addr, "gateway listening");

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let gateway = Arc::clone(&self.gateway);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, gateway).await {
                            warn!(%peer, error = %e, "connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "accept error");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Per-connection handler
// ---------------------------------------------------------------------------

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    gateway: Arc<Gateway>,
) -> FleetResult<()> {
    // `peek` leaves the request in place for the WebSocket handshake.
    let mut buf = [0u8; 1024];
    let n = stream
        .peek(&mut buf)
        .await
        .map_err(|e| FleetError::Transport(format!("peek error from {peer}: {e}")))?;

    if is_ws_upgrade(&String::from_utf8_lossy(&buf[..n])) {
        handle_ws(stream, peer, gateway).await
    } else {
        serve_health(stream, &gateway).await
    }
}

fn is_ws_upgrade(head: &str) -> bool {
    head.lines().any(|line| {
        let line = line.to_ascii_lowercase();
        line.starts_with("upgrade:") && line.contains("websocket")
    })
}

// ---------------------------------------------------------------------------
// Plain HTTP: health summary
// ---------------------------------------------------------------------------

/// Longest request head read before answering.
const MAX_HEAD: usize = 8 * 1024;

/// Read the request head off the socket.  Bytes left unread when the socket
/// closes make the kernel reset the connection instead of ending it.
async fn read_head(stream: &mut TcpStream) -> FleetResult<()> {
    let mut head = Vec::with_capacity(1024);
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") && head.len() < MAX_HEAD {
        let n = stream
            .read(&mut buf)
            .await
            .map_err(|e| FleetError::Transport(format!("HTTP read error: {e}")))?;
        if n == 0 {
            break;
        }
        head.extend_from_slice(&buf[..n]);
    }
    Ok(())
}

async fn serve_health(mut stream: TcpStream, gateway: &Gateway) -> FleetResult<()> {
    read_head(&mut stream).await?;
    let body = json!({
        "service": "fleetlockd",
        "status": "ok",
        "connected_agents": gateway.sessions().connected(),
        "fleet": gateway.plane().stats(),
    })
    .to_string();
    let response = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        body.len(),
        body
    );
    stream
        .write_all(response.as_bytes())
        .await
        .map_err(|e| FleetError::Transport(format!("HTTP write error: {e}")))?;
    stream
        .shutdown()
        .await
        .map_err(|e| FleetError::Transport(format!("HTTP shutdown error: {e}")))
}

// ---------------------------------------------------------------------------
// WebSocket session
// ---------------------------------------------------------------------------

async fn handle_ws(stream: TcpStream, peer: SocketAddr, gateway: Arc<Gateway>) -> FleetResult<()> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| FleetError::Transport(format!("WS handshake from {peer}: {e}")))?;

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerFrame>(OUTBOUND_CAPACITY);
    let mut session = Session::new(out_tx);
    debug!(%peer, conn = %session.conn(), "session opened");

    loop {
        let frame = tokio::select! {
            // ── Pushed: commands and subscribed events ─────────────────────
            Some(frame) = out_rx.recv() => frame,
            // ── Requests ───────────────────────────────────────────────────
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => gateway.handle_text(&mut session, text.as_str()).await,
                Some(Ok(Message::Binary(_))) => ServerFrame::malformed("binary frames are not supported"),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(%peer, error = %e, "socket error");
                    break;
                }
                _ => continue,
            },
        };

        match serde_json::to_string(&frame) {
            Ok(json) => {
                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            Err(e) => error!(error = %e, "frame serialization error"),
        }
    }

    gateway.disconnect(&mut session);
    debug!(%peer, "session closed");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
