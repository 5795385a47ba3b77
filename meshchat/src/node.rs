//! Owner task wiring a [`PropagationEngine`] to its inputs.
//!
//! The engine's state is not shared: one background task owns it and
//! serializes every input onto itself with `tokio::select!`.
//!
//! ```text
//! presentation ─── NodeCommand ──→ ┌────────────┐ ←── TransportEvent ── transport
//!                                  │ owner task │ ←── AckExpiry ─────── timers
//! presentation ←── EngineEvent ─── └────────────┘
//! ```

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use meshchat_proto::message::{Message, PeerId};

use crate::engine::pending::AckExpiry;
use crate::engine::{EngineConfig, EngineEvent, PropagationEngine};
use crate::transport::{Transport, TransportEvent};

/// Default channel capacity for node commands.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Commands sent from the presentation layer to the owner task.
#[derive(Debug)]
pub enum NodeCommand {
    /// Send a chat message to the neighborhood.
    SendChat {
        /// The message text to send.
        text: String,
        /// Receives the allocated sequence number, or the rejection reason.
        reply: oneshot::Sender<Result<u64, String>>,
    },
    /// Ask for the current directory snapshot.
    Peers {
        /// Receives the snapshot.
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    /// Ask for every message recorded so far.
    History {
        /// Receives the history in arrival order.
        reply: oneshot::Sender<Vec<Message>>,
    },
    /// Stop the owner task.
    Shutdown,
}

/// Errors returned by [`NodeHandle`] methods.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// The owner task has stopped.
    #[error("node has shut down")]
    Closed,

    /// The engine rejected the request.
    #[error("request rejected: {0}")]
    Rejected(String),
}

/// Handle to a running node.
#[derive(Debug)]
pub struct NodeHandle {
    commands: mpsc::Sender<NodeCommand>,
    task: JoinHandle<()>,
}

impl NodeHandle {
    /// Send a chat message and wait for its sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Rejected`] if the text failed validation, or
    /// [`NodeError::Closed`] if the node is gone.
    pub async fn send_chat(&self, text: impl Into<String>) -> Result<u64, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(NodeCommand::SendChat {
                text: text.into(),
                reply,
            })
            .await
            .map_err(|_| NodeError::Closed)?;
        rx.await
            .map_err(|_| NodeError::Closed)?
            .map_err(NodeError::Rejected)
    }

    /// Current directory snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Closed`] if the node is gone.
    pub async fn peers(&self) -> Result<Vec<PeerId>, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(NodeCommand::Peers { reply })
            .await
            .map_err(|_| NodeError::Closed)?;
        rx.await.map_err(|_| NodeError::Closed)
    }

    /// Every message recorded so far.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Closed`] if the node is gone.
    pub async fn history(&self) -> Result<Vec<Message>, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(NodeCommand::History { reply })
            .await
            .map_err(|_| NodeError::Closed)?;
        rx.await.map_err(|_| NodeError::Closed)
    }

    /// Stop the owner task and wait for it to finish.
    pub async fn shutdown(self) {
        let _ = self.commands.send(NodeCommand::Shutdown).await;
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "node task ended abnormally");
        }
    }
}

/// Spawn the owner task for `local_id` on `transport`.
///
/// Returns the handle and the receiver of presentation-facing events.
pub fn spawn_node<T>(
    local_id: PeerId,
    transport: Arc<T>,
    config: EngineConfig,
    channel_capacity: usize,
) -> (NodeHandle, mpsc::UnboundedReceiver<EngineEvent>)
where
    T: Transport + 'static,
{
    let (engine, channels) = PropagationEngine::new(local_id, Arc::clone(&transport), config);
    let (cmd_tx, cmd_rx) = mpsc::channel(channel_capacity.max(1));

    tracing::info!(
        peer = %engine.local_id(),
        transport = %transport.transport_type(),
        "node starting"
    );
    let task = tokio::spawn(run(engine, transport, cmd_rx, channels.expiries));

    let handle = NodeHandle {
        commands: cmd_tx,
        task,
    };
    (handle, channels.events)
}

/// The owner loop. Returns on shutdown or when the transport closes.
async fn run<T: Transport>(
    mut engine: PropagationEngine<T>,
    transport: Arc<T>,
    mut commands: mpsc::Receiver<NodeCommand>,
    mut expiries: mpsc::UnboundedReceiver<AckExpiry>,
) {
    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                if !handle_command(&mut engine, command).await {
                    break;
                }
            }
            event = transport.next_event() => {
                match event {
                    Ok(event) => handle_transport_event(&mut engine, event).await,
                    Err(e) => {
                        tracing::warn!(error = %e, "transport closed, stopping node");
                        break;
                    }
                }
            }
            Some(expiry) = expiries.recv() => {
                engine.on_ack_timeout(expiry).await;
            }
        }
    }
    tracing::info!(peer = %engine.local_id(), "node stopped");
}

/// Apply one command. Returns `false` on shutdown.
async fn handle_command<T: Transport>(engine: &mut PropagationEngine<T>, command: NodeCommand) -> bool {
    match command {
        NodeCommand::SendChat { text, reply } => {
            let result = engine.send_chat(&text).await.map_err(|e| {
                tracing::debug!(error = %e, "send rejected");
                e.to_string()
            });
            let _ = reply.send(result);
        }
        NodeCommand::Peers { reply } => {
            let _ = reply.send(engine.directory().snapshot().to_vec());
        }
        NodeCommand::History { reply } => {
            let _ = reply.send(engine.log().all().cloned().collect());
        }
        NodeCommand::Shutdown => return false,
    }
    true
}

async fn handle_transport_event<T: Transport>(engine: &mut PropagationEngine<T>, event: TransportEvent) {
    match event {
        TransportEvent::PeerConnected(peer) => {
            if let Err(e) = engine.on_peer_connected(peer).await {
                tracing::warn!(error = %e, "failed to announce peer");
            }
        }
        TransportEvent::PeerDisconnected(peer) => engine.on_peer_disconnected(&peer),
        TransportEvent::Received { from, payload } => {
            // Malformed input is already logged by the engine.
            let _ = engine.on_bytes_received(&from, &payload).await;
        }
    }
}
