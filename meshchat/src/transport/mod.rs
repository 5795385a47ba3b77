//! Transport layer abstraction for `MeshChat`.
//!
//! Defines the [`Transport`] trait through which the propagation engine
//! reaches its neighbors. Concrete implementations include:
//! - [`loopback::LoopbackMesh`]: in-process mesh of endpoints for testing
//! - [`udp::UdpTransport`]: LAN discovery and delivery over UDP

pub mod loopback;
pub mod udp;

use std::fmt;

pub use meshchat_proto::message::PeerId;

/// Describes which kind of transport is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    /// UDP beacons and datagrams on the local network.
    Udp,
    /// In-process loopback for testing.
    Loopback,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Udp => write!(f, "UDP"),
            Self::Loopback => write!(f, "Loopback"),
        }
    }
}

/// Something that happened at the transport level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A neighbor became reachable.
    PeerConnected(PeerId),
    /// A neighbor is no longer reachable.
    PeerDisconnected(PeerId),
    /// Opaque bytes arrived from a neighbor.
    Received {
        /// The neighbor that handed us the bytes (not necessarily the
        /// message's original source).
        from: PeerId,
        /// The raw payload.
        payload: Vec<u8>,
    },
}

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The transport has shut down and will produce no more events.
    #[error("connection closed")]
    ConnectionClosed,

    /// A link-level frame could not be encoded or decoded.
    #[error("frame codec error: {0}")]
    Frame(String),

    /// An underlying I/O error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Async transport trait for reaching directly connected peers.
///
/// Implementations carry opaque byte slices between neighbors and report
/// neighbor arrival and departure. They give no delivery guarantee;
/// reliability is rebuilt above them with acknowledgments and timeouts.
pub trait Transport: Send + Sync {
    /// Peers currently reachable in one hop.
    fn connected_peers(&self) -> Vec<PeerId>;

    /// Send a payload to each of `targets`.
    ///
    /// Returns `Ok(())` once the payload has been handed off. Targets that
    /// are not reachable are skipped silently.
    fn send(
        &self,
        payload: &[u8],
        targets: &[PeerId],
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;

    /// Wait for the next connect, disconnect, or receive event.
    fn next_event(
        &self,
    ) -> impl std::future::Future<Output = Result<TransportEvent, TransportError>> + Send;

    /// Return the type of this transport.
    fn transport_type(&self) -> TransportType;
}
