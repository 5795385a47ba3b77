//! UDP transport for local networks.
//!
//! Discovery is beacon based: every node periodically broadcasts a
//! [`LinkFrame::Beacon`] carrying its display name. The first beacon from an
//! unknown name yields [`TransportEvent::PeerConnected`]; a neighbor that
//! stays silent for longer than `peer_timeout` yields
//! [`TransportEvent::PeerDisconnected`]. Payloads travel as unicast
//! [`LinkFrame::Data`] datagrams to the address a neighbor beaconed from.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{PeerId, Transport, TransportError, TransportEvent, TransportType};

/// Largest datagram we are willing to receive.
const MAX_DATAGRAM_SIZE: usize = 65_535;

/// Largest chat text that still fits one IPv4 datagram once the message and
/// link frame headers are added.
pub const MAX_MESSAGE_LEN: usize = 60 * 1024;

/// Configuration for [`UdpTransport`].
#[derive(Debug, Clone)]
pub struct UdpConfig {
    /// Local address to bind.
    pub bind_addr: SocketAddr,
    /// Where beacons are sent (normally the subnet broadcast address).
    pub broadcast_addr: SocketAddr,
    /// How often to send a beacon.
    pub beacon_interval: Duration,
    /// How long a neighbor may stay silent before it is considered gone.
    pub peer_timeout: Duration,
}

impl UdpConfig {
    /// Default UDP port shared by every node on the segment.
    pub const DEFAULT_PORT: u16 = 47_800;
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, Self::DEFAULT_PORT)),
            broadcast_addr: SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::BROADCAST,
                Self::DEFAULT_PORT,
            )),
            beacon_interval: Duration::from_secs(1),
            peer_timeout: Duration::from_millis(3500),
        }
    }
}

/// Link-level datagram.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum LinkFrame {
    /// "I am here."
    Beacon {
        /// Display name of the sender.
        peer_id: PeerId,
    },
    /// Opaque payload for the engine above.
    Data {
        /// Display name of the sender.
        from: PeerId,
        /// Engine bytes.
        payload: Vec<u8>,
    },
}

impl LinkFrame {
    fn encode(&self) -> Result<Vec<u8>, TransportError> {
        postcard::to_allocvec(self).map_err(|e| TransportError::Frame(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, TransportError> {
        postcard::from_bytes(bytes).map_err(|e| TransportError::Frame(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy)]
struct Neighbor {
    addr: SocketAddr,
    last_seen: Instant,
}

type NeighborTable = Arc<Mutex<HashMap<PeerId, Neighbor>>>;

/// Beacon-discovered UDP neighborhood.
///
/// Background tasks (beaconing and receiving) are aborted when the
/// transport is dropped.
#[derive(Debug)]
pub struct UdpTransport {
    local_id: PeerId,
    socket: Arc<UdpSocket>,
    neighbors: NeighborTable,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<TransportEvent>>,
    tasks: Vec<JoinHandle<()>>,
}

impl UdpTransport {
    /// Bind the socket and start beaconing as `local_id`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] if the socket cannot be bound or
    /// broadcast cannot be enabled.
    pub async fn bind(local_id: PeerId, config: UdpConfig) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(config.bind_addr).await?;
        socket.set_broadcast(true)?;
        let socket = Arc::new(socket);
        let neighbors: NeighborTable = Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = mpsc::unbounded_channel();

        tracing::info!(
            peer = %local_id,
            addr = %socket.local_addr()?,
            broadcast = %config.broadcast_addr,
            "udp transport bound"
        );

        let beacon = tokio::spawn(beacon_loop(
            Arc::clone(&socket),
            local_id.clone(),
            config.clone(),
            Arc::clone(&neighbors),
            tx.clone(),
        ));
        let receive = tokio::spawn(receive_loop(
            Arc::clone(&socket),
            local_id.clone(),
            Arc::clone(&neighbors),
            tx,
        ));

        Ok(Self {
            local_id,
            socket,
            neighbors,
            rx: tokio::sync::Mutex::new(rx),
            tasks: vec![beacon, receive],
        })
    }

    /// The address the socket is bound to.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] if the OS cannot report it.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    fn resolve(&self, targets: &[PeerId]) -> Vec<(PeerId, SocketAddr)> {
        let neighbors = self.neighbors.lock();
        targets
            .iter()
            .filter_map(|t| neighbors.get(t).map(|n| (t.clone(), n.addr)))
            .collect()
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Transport for UdpTransport {
    fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.neighbors.lock().keys().cloned().collect();
        peers.sort();
        peers
    }

    async fn send(&self, payload: &[u8], targets: &[PeerId]) -> Result<(), TransportError> {
        let frame = LinkFrame::Data {
            from: self.local_id.clone(),
            payload: payload.to_vec(),
        }
        .encode()?;

        for (peer, addr) in self.resolve(targets) {
            if let Err(e) = self.socket.send_to(&frame, addr).await {
                tracing::debug!(peer = %peer, %addr, error = %e, "udp send failed");
            }
        }
        Ok(())
    }

    async fn next_event(&self) -> Result<TransportEvent, TransportError> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(TransportError::ConnectionClosed)
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Udp
    }
}

/// Background task: announce ourselves and expire silent neighbors.
async fn beacon_loop(
    socket: Arc<UdpSocket>,
    local_id: PeerId,
    config: UdpConfig,
    neighbors: NeighborTable,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let frame = LinkFrame::Beacon { peer_id: local_id };
    let beacon = match frame.encode() {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!(error = %e, "cannot encode beacon");
            return;
        }
    };

    let mut ticker = tokio::time::interval(config.beacon_interval);
    loop {
        ticker.tick().await;

        if let Err(e) = socket.send_to(&beacon, config.broadcast_addr).await {
            tracing::debug!(error = %e, "beacon send failed");
        }

        for peer in expire_silent(&neighbors, config.peer_timeout) {
            tracing::info!(peer = %peer, "neighbor timed out");
            if events.send(TransportEvent::PeerDisconnected(peer)).is_err() {
                return;
            }
        }
    }
}

fn expire_silent(neighbors: &NeighborTable, timeout: Duration) -> Vec<PeerId> {
    let now = Instant::now();
    let mut table = neighbors.lock();
    let gone: Vec<PeerId> = table
        .iter()
        .filter(|(_, n)| now.duration_since(n.last_seen) > timeout)
        .map(|(id, _)| id.clone())
        .collect();
    for id in &gone {
        table.remove(id);
    }
    gone
}

/// Background task: turn datagrams into transport events.
async fn receive_loop(
    socket: Arc<UdpSocket>,
    local_id: PeerId,
    neighbors: NeighborTable,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (len, addr) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                tracing::debug!(error = %e, "udp receive failed");
                continue;
            }
        };

        let frame = match LinkFrame::decode(&buf[..len]) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(%addr, error = %e, "ignoring malformed datagram");
                continue;
            }
        };

        let event = match frame {
            LinkFrame::Beacon { peer_id } => {
                if peer_id == local_id {
                    continue;
                }
                if !touch(&neighbors, &peer_id, addr) {
                    continue;
                }
                tracing::info!(peer = %peer_id, %addr, "neighbor discovered");
                TransportEvent::PeerConnected(peer_id)
            }
            LinkFrame::Data { from, payload } => {
                if from == local_id {
                    continue;
                }
                refresh(&neighbors, &from);
                TransportEvent::Received { from, payload }
            }
        };

        if events.send(event).is_err() {
            return;
        }
    }
}

/// Record a beacon. Returns `true` if the neighbor is new.
fn touch(neighbors: &NeighborTable, peer: &PeerId, addr: SocketAddr) -> bool {
    let now = Instant::now();
    let mut table = neighbors.lock();
    let is_new = !table.contains_key(peer);
    table.insert(
        peer.clone(),
        Neighbor {
            addr,
            last_seen: now,
        },
    );
    is_new
}

fn refresh(neighbors: &NeighborTable, peer: &PeerId) {
    if let Some(n) = neighbors.lock().get_mut(peer) {
        n.last_seen = Instant::now();
    }
}
