//! Integration tests for the node owner task.
//!
//! Unlike the propagation tests, nothing is pumped by hand here: every peer
//! runs inside [`spawn_node`] and reacts to its transport and timers on its
//! own, the way the binary runs it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use meshchat::engine::{EngineConfig, EngineEvent, FailureReason};
use meshchat::node::{NodeError, NodeHandle, spawn_node};
use meshchat::transport::loopback::LoopbackMesh;

use meshchat_proto::message::PeerId;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn peer(name: &str) -> PeerId {
    PeerId::new(name)
}

fn start(mesh: &LoopbackMesh, name: &str) -> (NodeHandle, mpsc::UnboundedReceiver<EngineEvent>) {
    let transport = Arc::new(mesh.endpoint(peer(name)));
    spawn_node(peer(name), transport, EngineConfig::default(), 16)
}

/// Wait for the first event matching `pred`, skipping others.
async fn wait_for<F>(rx: &mut mpsc::UnboundedReceiver<EngineEvent>, pred: F) -> EngineEvent
where
    F: Fn(&EngineEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

// ===========================================================================
// End to end
// ===========================================================================

/// Two running nodes find each other and exchange a chat with an ack.
#[tokio::test(start_paused = true)]
async fn two_nodes_chat() {
    let mesh = LoopbackMesh::new();
    let (alice, mut alice_events) = start(&mesh, "alice");
    let (bob, mut bob_events) = start(&mesh, "bob");

    mesh.connect(&peer("alice"), &peer("bob"));
    wait_for(&mut alice_events, |e| matches!(e, EngineEvent::PeerSetChanged(_))).await;
    wait_for(&mut bob_events, |e| matches!(e, EngineEvent::PeerSetChanged(_))).await;
    assert_eq!(alice.peers().await.unwrap(), vec![peer("bob")]);
    assert_eq!(bob.peers().await.unwrap(), vec![peer("alice")]);

    let seq = alice.send_chat("hi bob").await.unwrap();

    let delivered = wait_for(&mut bob_events, |e| {
        matches!(e, EngineEvent::MessageDelivered(_))
    })
    .await;
    let EngineEvent::MessageDelivered(message) = delivered else {
        unreachable!()
    };
    assert_eq!(message.source, peer("alice"));
    assert_eq!(message.payload, "hi bob");

    let acked = wait_for(&mut alice_events, |e| {
        matches!(e, EngineEvent::MessageAcknowledged { .. })
    })
    .await;
    assert_eq!(
        acked,
        EngineEvent::MessageAcknowledged {
            sequence_number: seq,
            by: peer("bob"),
        }
    );

    let history = bob.history().await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].payload, "hi bob");

    alice.shutdown().await;
    bob.shutdown().await;
}

/// A three-node line relays through the middle node.
#[tokio::test(start_paused = true)]
async fn line_of_three_relays() {
    let mesh = LoopbackMesh::new();
    let (alice, mut alice_events) = start(&mesh, "alice");
    let (bob, _bob_events) = start(&mesh, "bob");
    let (carol, mut carol_events) = start(&mesh, "carol");

    mesh.connect(&peer("alice"), &peer("bob"));
    mesh.connect(&peer("bob"), &peer("carol"));
    wait_for(&mut carol_events, |e| matches!(e, EngineEvent::PeerSetChanged(_))).await;

    let seq = alice.send_chat("pass it on").await.unwrap();

    let delivered = wait_for(&mut carol_events, |e| {
        matches!(e, EngineEvent::MessageDelivered(_))
    })
    .await;
    assert!(matches!(
        delivered,
        EngineEvent::MessageDelivered(ref m) if m.source == peer("alice") && m.sequence_number == seq
    ));
    wait_for(&mut alice_events, |e| {
        matches!(e, EngineEvent::MessageAcknowledged { sequence_number, .. } if *sequence_number == seq)
    })
    .await;

    alice.shutdown().await;
    bob.shutdown().await;
    carol.shutdown().await;
}

// ===========================================================================
// Failures
// ===========================================================================

/// Sending alone reports the failure right away.
#[tokio::test(start_paused = true)]
async fn lonely_send_fails() {
    let mesh = LoopbackMesh::new();
    let (alice, mut events) = start(&mesh, "alice");

    let seq = alice.send_chat("echo?").await.unwrap();

    let failed = wait_for(&mut events, |e| {
        matches!(e, EngineEvent::MessageDeliveryFailed { .. })
    })
    .await;
    assert!(matches!(
        failed,
        EngineEvent::MessageDeliveryFailed { ref message, reason: FailureReason::NoConnectedPeers }
            if message.sequence_number == seq
    ));

    alice.shutdown().await;
}

/// A neighbor that never answers produces one timeout failure.
#[tokio::test(start_paused = true)]
async fn unanswered_send_times_out() {
    let mesh = LoopbackMesh::new();
    let (alice, mut events) = start(&mesh, "alice");
    let _mute = mesh.endpoint(peer("mute"));
    mesh.connect(&peer("alice"), &peer("mute"));
    wait_for(&mut events, |e| matches!(e, EngineEvent::PeerSetChanged(_))).await;

    let started = tokio::time::Instant::now();
    let seq = alice.send_chat("anyone?").await.unwrap();

    let failed = wait_for(&mut events, |e| {
        matches!(e, EngineEvent::MessageDeliveryFailed { .. })
    })
    .await;
    assert!(started.elapsed() >= Duration::from_millis(1500));
    assert!(matches!(
        failed,
        EngineEvent::MessageDeliveryFailed { ref message, reason: FailureReason::AckTimeout }
            if message.sequence_number == seq
    ));

    // Exactly once.
    let again = tokio::time::timeout(Duration::from_secs(10), events.recv()).await;
    assert!(again.is_err());

    alice.shutdown().await;
}

/// Invalid text is rejected through the handle.
#[tokio::test(start_paused = true)]
async fn empty_text_is_rejected() {
    let mesh = LoopbackMesh::new();
    let (alice, _events) = start(&mesh, "alice");

    let result = alice.send_chat("").await;
    assert!(matches!(result, Err(NodeError::Rejected(_))));
    assert!(alice.history().await.unwrap().is_empty());

    alice.shutdown().await;
}

// ===========================================================================
// Lifecycle
// ===========================================================================

/// Shutting down closes the event stream.
#[tokio::test(start_paused = true)]
async fn shutdown_closes_events() {
    let mesh = LoopbackMesh::new();
    let (alice, mut events) = start(&mesh, "alice");

    alice.shutdown().await;

    assert!(events.recv().await.is_none());
}
