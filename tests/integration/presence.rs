//! Integration tests for directory maintenance and presence announcements.
//!
//! Verifies:
//! 1. Direct links show up in both directories.
//! 2. A peer learns about its neighbor's new neighbor through one announcement.
//! 3. Announcements are not re-flooded beyond the first hop.
//! 4. Disconnects only shrink the directories of the two linked peers.

use std::sync::Arc;

use meshchat::engine::{EngineChannels, EngineConfig, EngineEvent, PropagationEngine};
use meshchat::transport::TransportEvent;
use meshchat::transport::loopback::{LoopbackMesh, LoopbackTransport};

use meshchat_proto::message::PeerId;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn peer(name: &str) -> PeerId {
    PeerId::new(name)
}

fn peers(names: &[&str]) -> Vec<PeerId> {
    names.iter().map(|n| peer(n)).collect()
}

struct Node {
    engine: PropagationEngine<LoopbackTransport>,
    channels: EngineChannels,
}

impl Node {
    fn new(mesh: &LoopbackMesh, name: &str) -> Self {
        let transport = Arc::new(mesh.endpoint(peer(name)));
        let (engine, channels) =
            PropagationEngine::new(peer(name), transport, EngineConfig::default());
        Self { engine, channels }
    }

    fn directory(&self) -> Vec<PeerId> {
        self.engine.directory().snapshot().to_vec()
    }

    /// Every `PeerSetChanged` payload emitted since the last call.
    fn peer_sets(&mut self) -> Vec<Vec<PeerId>> {
        let mut sets = Vec::new();
        while let Ok(event) = self.channels.events.try_recv() {
            if let EngineEvent::PeerSetChanged(set) = event {
                sets.push(set);
            }
        }
        sets
    }
}

fn nodes(mesh: &LoopbackMesh, names: &[&str]) -> Vec<Node> {
    names.iter().map(|name| Node::new(mesh, name)).collect()
}

/// Deliver queued transport events to their engines until nothing moves.
async fn pump(nodes: &mut [Node]) {
    loop {
        let mut progressed = false;
        for node in nodes.iter_mut() {
            for event in node.engine.transport().drain() {
                progressed = true;
                match event {
                    TransportEvent::PeerConnected(p) => {
                        node.engine.on_peer_connected(p).await.unwrap();
                    }
                    TransportEvent::PeerDisconnected(p) => node.engine.on_peer_disconnected(&p),
                    TransportEvent::Received { from, payload } => {
                        node.engine.on_bytes_received(&from, &payload).await.unwrap();
                    }
                }
            }
        }
        if !progressed {
            break;
        }
    }
}

// ===========================================================================
// Joining
// ===========================================================================

/// Two peers linking up see each other, with one change event each.
#[tokio::test]
async fn pair_directories_converge() {
    let mesh = LoopbackMesh::new();
    let mut net = nodes(&mesh, &["alice", "bob"]);

    mesh.connect(&peer("alice"), &peer("bob"));
    pump(&mut net).await;

    assert_eq!(net[0].directory(), peers(&["bob"]));
    assert_eq!(net[1].directory(), peers(&["alice"]));
    assert_eq!(net[0].peer_sets(), vec![peers(&["bob"])]);
    assert_eq!(net[1].peer_sets(), vec![peers(&["alice"])]);
}

/// Bob announces Carol to Alice when Carol links to Bob.
#[tokio::test]
async fn neighbor_announces_newcomer() {
    let mesh = LoopbackMesh::new();
    let mut net = nodes(&mesh, &["alice", "bob", "carol"]);

    mesh.connect(&peer("alice"), &peer("bob"));
    pump(&mut net).await;
    for node in &mut net {
        node.peer_sets();
    }

    mesh.connect(&peer("bob"), &peer("carol"));
    pump(&mut net).await;

    assert_eq!(net[0].directory(), peers(&["bob", "carol"]));
    assert_eq!(net[1].directory(), peers(&["alice", "carol"]));
    assert_eq!(net[0].peer_sets(), vec![peers(&["bob", "carol"])]);

    // Alice's existence was announced before Carol was around, and
    // announcements are never forwarded, so Carol only knows Bob.
    assert_eq!(net[2].directory(), peers(&["bob"]));
}

/// Announcements stop after one hop in a longer line.
#[tokio::test]
async fn announcements_are_not_reflooded() {
    let mesh = LoopbackMesh::new();
    let mut net = nodes(&mesh, &["alice", "bob", "carol", "dave"]);

    mesh.connect(&peer("alice"), &peer("bob"));
    mesh.connect(&peer("bob"), &peer("carol"));
    pump(&mut net).await;

    // Dave joins at the far end; only Carol's neighbors hear about it.
    mesh.connect(&peer("carol"), &peer("dave"));
    pump(&mut net).await;

    assert!(net[1].engine.directory().contains(&peer("dave")));
    assert!(!net[0].engine.directory().contains(&peer("dave")));
}

/// A repeated connect for a known peer changes nothing and sends nothing.
#[tokio::test]
async fn reconnecting_known_peer_is_quiet() {
    let mesh = LoopbackMesh::new();
    let mut net = nodes(&mesh, &["alice"]);
    let _bob = mesh.endpoint(peer("bob"));

    net[0].engine.on_peer_connected(peer("bob")).await.unwrap();
    let next = net[0].engine.next_sequence_number();
    net[0].peer_sets();

    net[0].engine.on_peer_connected(peer("bob")).await.unwrap();

    assert_eq!(net[0].directory(), peers(&["bob"]));
    assert!(net[0].peer_sets().is_empty());
    assert_eq!(net[0].engine.next_sequence_number(), next);
}

/// Each announcement consumes a sequence number from the same counter as
/// chat messages.
#[tokio::test]
async fn announcements_share_the_sequence_counter() {
    let mesh = LoopbackMesh::new();
    let mut net = nodes(&mesh, &["alice", "bob", "carol"]);

    mesh.connect(&peer("alice"), &peer("bob"));
    mesh.connect(&peer("alice"), &peer("carol"));
    pump(&mut net).await;

    assert_eq!(net[0].engine.next_sequence_number(), 2);
    let seq = net[0].engine.send_chat("after announcements").await.unwrap();
    assert_eq!(seq, 2);
}

// ===========================================================================
// Leaving
// ===========================================================================

/// Unlinking removes each side from the other's directory.
#[tokio::test]
async fn disconnect_shrinks_both_sides() {
    let mesh = LoopbackMesh::new();
    let mut net = nodes(&mesh, &["alice", "bob", "carol"]);
    mesh.connect(&peer("alice"), &peer("bob"));
    mesh.connect(&peer("alice"), &peer("carol"));
    pump(&mut net).await;
    for node in &mut net {
        node.peer_sets();
    }

    mesh.disconnect(&peer("alice"), &peer("bob"));
    pump(&mut net).await;

    assert_eq!(net[0].directory(), peers(&["carol"]));
    assert_eq!(net[0].peer_sets(), vec![peers(&["carol"])]);
    assert!(!net[1].engine.directory().contains(&peer("alice")));
}

/// Peers learned by announcement stay until we observe them leave ourselves.
#[tokio::test]
async fn announced_peers_survive_remote_disconnect() {
    let mesh = LoopbackMesh::new();
    let mut net = nodes(&mesh, &["alice", "bob", "carol"]);
    mesh.connect(&peer("alice"), &peer("bob"));
    pump(&mut net).await;
    mesh.connect(&peer("bob"), &peer("carol"));
    pump(&mut net).await;
    assert!(net[0].engine.directory().contains(&peer("carol")));

    mesh.disconnect(&peer("bob"), &peer("carol"));
    pump(&mut net).await;

    // Disconnects are never announced.
    assert!(net[0].engine.directory().contains(&peer("carol")));
    assert!(!net[1].engine.directory().contains(&peer("carol")));
}

/// Disconnect for a peer we never knew is ignored.
#[tokio::test]
async fn unknown_disconnect_is_ignored() {
    let mesh = LoopbackMesh::new();
    let mut net = nodes(&mesh, &["alice"]);

    net[0].engine.on_peer_disconnected(&peer("ghost"));

    assert!(net[0].directory().is_empty());
    assert!(net[0].peer_sets().is_empty());
}
