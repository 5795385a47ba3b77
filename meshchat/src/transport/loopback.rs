//! Loopback transport for testing.
//!
//! A [`LoopbackMesh`] is an in-process neighborhood. Every participant gets a
//! [`LoopbackTransport`] endpoint from [`LoopbackMesh::endpoint`]; links are
//! added and removed explicitly with [`connect`](LoopbackMesh::connect) and
//! [`disconnect`](LoopbackMesh::disconnect), which also emit the matching
//! connect/disconnect events on both endpoints. Sending to a peer that is not
//! linked drops the payload, like a radio that is out of range.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{PeerId, Transport, TransportError, TransportEvent, TransportType};

/// Shared link table of a mesh.
#[derive(Debug, Default)]
struct MeshState {
    /// Event queue of every registered endpoint.
    endpoints: HashMap<PeerId, mpsc::UnboundedSender<TransportEvent>>,
    /// Undirected links in the order they were made.
    links: Vec<(PeerId, PeerId)>,
}

impl MeshState {
    fn linked(&self, a: &PeerId, b: &PeerId) -> bool {
        self.links
            .iter()
            .any(|(x, y)| (x == a && y == b) || (x == b && y == a))
    }

    fn neighbors_of(&self, id: &PeerId) -> Vec<PeerId> {
        self.links
            .iter()
            .filter_map(|(x, y)| {
                if x == id {
                    Some(y.clone())
                } else if y == id {
                    Some(x.clone())
                } else {
                    None
                }
            })
            .collect()
    }

    fn push(&self, to: &PeerId, event: TransportEvent) {
        if let Some(tx) = self.endpoints.get(to) {
            // A dropped endpoint simply stops listening.
            let _ = tx.send(event);
        }
    }
}

/// An in-process neighborhood of loopback endpoints.
#[derive(Debug, Clone, Default)]
pub struct LoopbackMesh {
    state: Arc<Mutex<MeshState>>,
}

impl LoopbackMesh {
    /// Creates an empty mesh.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` and return its endpoint.
    ///
    /// Registering the same identity twice replaces the previous endpoint's
    /// event queue.
    #[must_use]
    pub fn endpoint(&self, id: PeerId) -> LoopbackTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().endpoints.insert(id.clone(), tx);
        LoopbackTransport {
            local_id: id,
            state: Arc::clone(&self.state),
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Link `a` and `b`; both endpoints observe a connect event.
    ///
    /// Linking an already linked pair does nothing.
    pub fn connect(&self, a: &PeerId, b: &PeerId) {
        let mut state = self.state.lock();
        if a == b || state.linked(a, b) {
            return;
        }
        state.links.push((a.clone(), b.clone()));
        state.push(a, TransportEvent::PeerConnected(b.clone()));
        state.push(b, TransportEvent::PeerConnected(a.clone()));
    }

    /// Remove the link between `a` and `b`; both endpoints observe a
    /// disconnect event.
    pub fn disconnect(&self, a: &PeerId, b: &PeerId) {
        let mut state = self.state.lock();
        if !state.linked(a, b) {
            return;
        }
        state
            .links
            .retain(|(x, y)| !((x == a && y == b) || (x == b && y == a)));
        state.push(a, TransportEvent::PeerDisconnected(b.clone()));
        state.push(b, TransportEvent::PeerDisconnected(a.clone()));
    }
}

/// One participant's view of a [`LoopbackMesh`].
#[derive(Debug)]
pub struct LoopbackTransport {
    /// Identity of the local side.
    local_id: PeerId,
    /// The mesh this endpoint belongs to.
    state: Arc<Mutex<MeshState>>,
    /// Events addressed to this endpoint.
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<TransportEvent>>,
}

impl LoopbackTransport {
    /// Identity of this endpoint.
    #[must_use]
    pub const fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Take every event already queued for this endpoint without waiting.
    ///
    /// Returns an empty vector if another task is currently waiting in
    /// [`Transport::next_event`].
    pub fn drain(&self) -> Vec<TransportEvent> {
        let Ok(mut rx) = self.rx.try_lock() else {
            return Vec::new();
        };
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }
}

impl Transport for LoopbackTransport {
    fn connected_peers(&self) -> Vec<PeerId> {
        self.state.lock().neighbors_of(&self.local_id)
    }

    async fn send(&self, payload: &[u8], targets: &[PeerId]) -> Result<(), TransportError> {
        let state = self.state.lock();
        for target in targets {
            if !state.linked(&self.local_id, target) {
                tracing::trace!(from = %self.local_id, to = %target, "not linked, dropping payload");
                continue;
            }
            state.push(
                target,
                TransportEvent::Received {
                    from: self.local_id.clone(),
                    payload: payload.to_vec(),
                },
            );
        }
        Ok(())
    }

    async fn next_event(&self) -> Result<TransportEvent, TransportError> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(TransportError::ConnectionClosed)
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Loopback
    }
}
