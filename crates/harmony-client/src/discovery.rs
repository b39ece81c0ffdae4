//! UDP broadcast-based hub discovery.
//!
//! The hub listens on a well-known UDP port for a service-identifier
//! datagram that names a TCP port on the caller's side.  Every hub that
//! hears the broadcast connects back to that port and writes one
//! semicolon-delimited attribute string, then hangs up.
//!
//! ```text
//! client                                hub
//! ──────                                ───
//! bind ephemeral TCP listener
//! UDP broadcast "<service>\n<port>" ──▶
//!                                 ◀──── TCP connect to <port>
//!                                 ◀──── "ip:…;uuid:…;friendlyName:…"
//! parse, dedup by uuid, emit
//! ```
//!
//! Broadcasting runs on a backoff loop (hubs can miss a datagram; the LAN
//! may drop it) while the accept loop emits every distinct hub found, until
//! the caller cancels.  The session orchestrator puts an overall deadline
//! around the whole thing and treats expiry as an unresolved host.

use std::collections::HashSet;

use harmony_core::DiscoveredHub;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Service identifier the hub answers to.
pub const DISCOVERY_SERVICE_NAME: &str = "_logitech-reverse-bonjour._tcp.local.";

/// The hub's fixed discovery port.
pub const DISCOVERY_PORT: u16 = 5224;

/// First broadcast retry delay; doubles up to [`BROADCAST_BACKOFF_CEILING`].
const BROADCAST_BACKOFF_BASE: Duration = Duration::from_millis(500);
const BROADCAST_BACKOFF_CEILING: Duration = Duration::from_secs(8);

/// Error type for discovery start-up.  Errors after start-up are logged and
/// retried rather than surfaced; the caller's deadline decides when to stop.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The callback TCP listener could not be bound.
    #[error("failed to bind discovery listener: {0}")]
    BindFailed(#[source] std::io::Error),

    /// The broadcast UDP socket could not be created.
    #[error("failed to open broadcast socket: {0}")]
    BroadcastSocket(#[source] std::io::Error),
}

/// A running discovery: the stream of hubs found so far.
pub struct Discovery {
    port: u16,
    rx: mpsc::Receiver<DiscoveredHub>,
}

impl Discovery {
    /// The ephemeral TCP port hubs call back on.
    pub fn listener_port(&self) -> u16 {
        self.port
    }

    /// The next distinct hub, or `None` once discovery has shut down.
    pub async fn next(&mut self) -> Option<DiscoveredHub> {
        self.rx.recv().await
    }
}

/// Starts the broadcast and accept loops.
///
/// Both loops stop when `cancel` fires or when the returned [`Discovery`] is
/// dropped.  Hubs are deduplicated by uuid across the whole run.
///
/// # Errors
///
/// Returns [`DiscoveryError`] only when the local sockets cannot be set up.
pub async fn start(cancel: CancellationToken) -> Result<Discovery, DiscoveryError> {
    let listener = TcpListener::bind(("0.0.0.0", 0))
        .await
        .map_err(DiscoveryError::BindFailed)?;
    let port = listener
        .local_addr()
        .map_err(DiscoveryError::BindFailed)?
        .port();

    let udp = UdpSocket::bind(("0.0.0.0", 0))
        .await
        .map_err(DiscoveryError::BroadcastSocket)?;
    udp.set_broadcast(true)
        .map_err(DiscoveryError::BroadcastSocket)?;

    let (tx, rx) = mpsc::channel(16);

    tokio::spawn(broadcast_loop(udp, port, cancel.clone()));
    tokio::spawn(accept_loop(listener, tx, cancel));

    info!("hub discovery listening on TCP {port}");
    Ok(Discovery { port, rx })
}

/// Re-broadcasts the service datagram with exponential backoff.
async fn broadcast_loop(udp: UdpSocket, listener_port: u16, cancel: CancellationToken) {
    let datagram = format!("{DISCOVERY_SERVICE_NAME}\n{listener_port}");
    let mut backoff = BROADCAST_BACKOFF_BASE;
    loop {
        match udp
            .send_to(datagram.as_bytes(), ("255.255.255.255", DISCOVERY_PORT))
            .await
        {
            Ok(_) => debug!("discovery broadcast sent (callback port {listener_port})"),
            // A broadcast-hostile network is not fatal; a hub that heard an
            // earlier datagram can still call back.
            Err(e) => warn!("discovery broadcast failed: {e}"),
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(BROADCAST_BACKOFF_CEILING);
    }
    debug!("discovery broadcast loop stopped");
}

/// Accepts hub callbacks, parses them, and emits each distinct hub.
async fn accept_loop(
    listener: TcpListener,
    tx: mpsc::Sender<DiscoveredHub>,
    cancel: CancellationToken,
) {
    let mut seen: HashSet<String> = HashSet::new();
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (mut stream, remote) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!("discovery accept error: {e}");
                continue;
            }
        };
        let mut text = String::new();
        if let Err(e) = stream.read_to_string(&mut text).await {
            debug!("discarding unreadable discovery callback from {remote}: {e}");
            continue;
        }
        let Some(hub) = DiscoveredHub::parse(&text) else {
            continue;
        };
        if !seen.insert(hub.uuid.clone()) {
            debug!("hub {} answered again; ignoring duplicate", hub.uuid);
            continue;
        }
        info!(
            "discovered hub {} at {} ({})",
            hub.uuid,
            hub.ip,
            hub.friendly_name.as_deref().unwrap_or("unnamed")
        );
        if tx.send(hub).await.is_err() {
            // Receiver dropped: the orchestrator has what it needs.
            break;
        }
    }
    debug!("discovery accept loop stopped");
}

// ── Tests ─────────────────────────────────────────────────────────────────────
