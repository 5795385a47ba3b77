//! Message propagation and reliability protocol.
//!
//! Contains the [`PropagationEngine`], which owns the local peer's
//! [`UserDirectory`], [`MessageLog`], and [`PendingAckTable`] and reacts to
//! three inputs: local send requests, transport events, and ack timer
//! expiries. All three must be delivered from a single owner task (see
//! [`crate::node`]); the engine itself does no locking.
//!
//! Propagation is flood-with-dedup. A chat message is sent to every
//! neighbor; each receiver acknowledges it to the source, relays it to its
//! own neighbors, and suppresses any later copy it sees. A message counts as
//! delivered as soon as any one peer acknowledges it.

pub mod directory;
pub mod history;
pub mod pending;

use std::sync::Arc;

use tokio::sync::mpsc;

use meshchat_proto::codec::{self, CodecError};
use meshchat_proto::message::{
    MAX_PAYLOAD_SIZE, Message, MessageKind, PeerId, ValidationError, validate_text,
};

use crate::transport::Transport;

use directory::UserDirectory;
use history::MessageLog;
use pending::{AckExpiry, PendingAckTable, RetryPolicy};

/// Default upper bound for locally typed chat text.
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 4096;

/// Errors returned by engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Local chat text was rejected before sending.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Serialization or deserialization failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Why a locally sent chat message is considered undelivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// Nobody was connected when the message was sent.
    NoConnectedPeers,
    /// No acknowledgment arrived in time.
    AckTimeout,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoConnectedPeers => write!(f, "no connected peers"),
            Self::AckTimeout => write!(f, "no acknowledgment received"),
        }
    }
}

/// Events emitted by the [`PropagationEngine`] for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The directory changed; carries the full ordered membership.
    PeerSetChanged(Vec<PeerId>),
    /// A chat message from another peer arrived for the first time.
    MessageDelivered(Message),
    /// A locally sent chat message was acknowledged by some peer.
    MessageAcknowledged {
        /// Sequence number of the acknowledged message.
        sequence_number: u64,
        /// The peer whose ack arrived first.
        by: PeerId,
    },
    /// A locally sent chat message could not be delivered.
    MessageDeliveryFailed {
        /// The undelivered message.
        message: Message,
        /// What went wrong.
        reason: FailureReason,
    },
}

/// Engine tuning knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Ack timeout and resend policy.
    pub retry: RetryPolicy,
    /// Maximum length of locally typed chat text, in bytes. Never exceeds
    /// [`MAX_PAYLOAD_SIZE`], whatever is configured.
    pub max_message_len: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
        }
    }
}

/// Receivers handed out alongside a new engine.
#[derive(Debug)]
pub struct EngineChannels {
    /// Presentation-facing events.
    pub events: mpsc::UnboundedReceiver<EngineEvent>,
    /// Ack timer expiries; feed each one back into
    /// [`PropagationEngine::on_ack_timeout`].
    pub expiries: mpsc::UnboundedReceiver<AckExpiry>,
}

/// The protocol core for one peer.
pub struct PropagationEngine<T: Transport> {
    /// Our own identity.
    local_id: PeerId,
    /// The neighborhood we send through.
    transport: Arc<T>,
    /// Timeouts and limits.
    config: EngineConfig,
    /// Who we believe is reachable.
    directory: UserDirectory,
    /// Every chat message seen; also the dedup index.
    log: MessageLog,
    /// Locally sent chats awaiting an ack.
    pending: PendingAckTable,
    /// Next sequence number to hand out.
    next_seq: u64,
    /// Presentation-facing event sink.
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl<T: Transport> std::fmt::Debug for PropagationEngine<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropagationEngine")
            .field("local_id", &self.local_id)
            .field("transport", &self.transport.transport_type())
            .field("directory", &self.directory)
            .field("pending", &self.pending.len())
            .field("next_seq", &self.next_seq)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> PropagationEngine<T> {
    /// Creates an engine for `local_id` sending through `transport`.
    ///
    /// Returns the engine and the receivers for its events and ack timer
    /// expiries.
    pub fn new(local_id: PeerId, transport: Arc<T>, config: EngineConfig) -> (Self, EngineChannels) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (pending, expiries) = PendingAckTable::new();
        let engine = Self {
            local_id,
            transport,
            config,
            directory: UserDirectory::new(),
            log: MessageLog::new(),
            pending,
            next_seq: 0,
            events: events_tx,
        };
        let channels = EngineChannels {
            events: events_rx,
            expiries,
        };
        (engine, channels)
    }

    /// Send a chat message to every connected peer.
    ///
    /// Allocates the next sequence number, records the message in the log,
    /// and hands it to the transport. With no connected peers a
    /// [`EngineEvent::MessageDeliveryFailed`] is emitted immediately and no
    /// timer is armed; otherwise an ack timer starts.
    ///
    /// Returns the allocated sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] for empty or oversized text (no
    /// sequence number is consumed), or [`EngineError::Codec`] if the
    /// message cannot be encoded.
    pub async fn send_chat(&mut self, text: &str) -> Result<u64, EngineError> {
        validate_text(text, self.config.max_message_len.min(MAX_PAYLOAD_SIZE))?;

        let seq = self.allocate_sequence();
        let message = Message::chat(self.local_id.clone(), seq, text);
        let bytes = codec::encode(&message)?;
        self.log.record(message.clone());

        let peers = self.transport.connected_peers();
        if peers.is_empty() {
            tracing::info!(seq, "no connected peers, message not sent");
            self.emit(EngineEvent::MessageDeliveryFailed {
                message,
                reason: FailureReason::NoConnectedPeers,
            });
            return Ok(seq);
        }

        tracing::debug!(seq, peers = peers.len(), "sending chat");
        self.send_bytes(&bytes, &peers).await;
        self.pending
            .arm(message, 0, self.config.retry.timeout_for(0));
        Ok(seq)
    }

    /// A neighbor became reachable.
    ///
    /// Unknown peers are added to the directory and announced to every
    /// connected peer so that our other neighbors learn about them too.
    /// Announcements are never re-flooded by receivers.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Codec`] if the announcement cannot be encoded.
    pub async fn on_peer_connected(&mut self, peer: PeerId) -> Result<(), EngineError> {
        if !self.directory.add_user(&peer) {
            tracing::trace!(peer = %peer, "already known, no announcement");
            return Ok(());
        }
        tracing::info!(peer = %peer, "peer connected");
        self.emit_peer_set();

        let seq = self.allocate_sequence();
        let announce = Message::presence(self.local_id.clone(), seq, &peer);
        let bytes = codec::encode(&announce)?;
        let targets = self.transport.connected_peers();
        self.send_bytes(&bytes, &targets).await;
        Ok(())
    }

    /// A neighbor is no longer reachable.
    ///
    /// Removes it from the directory. Nothing is sent: every peer observes
    /// its own disconnects.
    pub fn on_peer_disconnected(&mut self, peer: &PeerId) {
        if self.directory.remove_user(peer) {
            tracing::info!(peer = %peer, "peer disconnected");
            self.emit_peer_set();
        }
    }

    /// Handle raw bytes handed up by the transport.
    ///
    /// Handles the following cases:
    /// - **Chat**: duplicates are dropped silently. New messages are
    ///   recorded, acknowledged to their source, relayed to every other
    ///   neighbor, and delivered as [`EngineEvent::MessageDelivered`].
    /// - **Ack**: if addressed to us, cancels the pending timer for the
    ///   sequence number. Late acks are ignored.
    /// - **`PresenceAnnounce`**: adds the announced identity to the directory.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Codec`] if the bytes are not a valid message.
    /// The engine state is unchanged in that case.
    pub async fn on_bytes_received(&mut self, from: &PeerId, bytes: &[u8]) -> Result<(), EngineError> {
        let message = match codec::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(peer = %from, error = %e, "discarding malformed message");
                return Err(e.into());
            }
        };

        match message.kind {
            MessageKind::Chat => self.handle_chat(from, message, bytes).await,
            MessageKind::Ack => self.handle_ack(&message),
            MessageKind::PresenceAnnounce => self.handle_presence(&message),
        }
        Ok(())
    }

    /// An ack timer fired.
    ///
    /// If the entry is still pending it is either resent (when the retry
    /// policy allows and someone is connected) or reported as failed. Expiries
    /// for entries that were already acknowledged are ignored.
    pub async fn on_ack_timeout(&mut self, expiry: AckExpiry) {
        let Some((message, attempt)) = self.pending.expire(expiry) else {
            tracing::trace!(seq = expiry.sequence_number, "stale ack expiry ignored");
            return;
        };

        if self.config.retry.may_retry(attempt) {
            let peers = self.transport.connected_peers();
            if peers.is_empty() {
                tracing::debug!(seq = message.sequence_number, "no peers left to retry with");
            } else {
                match codec::encode(&message) {
                    Ok(bytes) => {
                        let next = attempt + 1;
                        tracing::debug!(
                            seq = message.sequence_number,
                            attempt = next,
                            max_retries = self.config.retry.max_retries,
                            "ack timeout expired, resending"
                        );
                        self.send_bytes(&bytes, &peers).await;
                        self.pending
                            .arm(message, next, self.config.retry.timeout_for(next));
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(seq = message.sequence_number, error = %e, "cannot re-encode for retry");
                    }
                }
            }
        }

        tracing::info!(
            seq = message.sequence_number,
            attempts = attempt + 1,
            "no acknowledgment received, delivery failed"
        );
        self.emit(EngineEvent::MessageDeliveryFailed {
            message,
            reason: FailureReason::AckTimeout,
        });
    }

    /// Our own identity.
    #[must_use]
    pub const fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// The current directory.
    #[must_use]
    pub const fn directory(&self) -> &UserDirectory {
        &self.directory
    }

    /// The message history.
    #[must_use]
    pub const fn log(&self) -> &MessageLog {
        &self.log
    }

    /// Number of chat messages awaiting an ack.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Returns `true` if `sequence_number` is awaiting an ack.
    #[must_use]
    pub fn is_pending(&self, sequence_number: u64) -> bool {
        self.pending.contains(sequence_number)
    }

    /// The sequence number the next outgoing message will get.
    #[must_use]
    pub const fn next_sequence_number(&self) -> u64 {
        self.next_seq
    }

    /// Returns a reference to the underlying transport.
    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    async fn handle_chat(&mut self, from: &PeerId, message: Message, bytes: &[u8]) {
        if self.log.contains(&message) {
            tracing::debug!(
                source = %message.source,
                seq = message.sequence_number,
                via = %from,
                "duplicate message suppressed"
            );
            return;
        }
        self.log.record(message.clone());

        // Ack goes straight to the source; an unreachable source simply
        // never hears back and times out.
        match codec::encode(&message.ack_for(self.local_id.clone())) {
            Ok(ack) => {
                self.send_bytes(&ack, std::slice::from_ref(&message.source))
                    .await;
            }
            Err(e) => tracing::warn!(error = %e, "cannot encode ack"),
        }

        let relay_targets: Vec<PeerId> = self
            .transport
            .connected_peers()
            .into_iter()
            .filter(|p| p != from && *p != message.source)
            .collect();
        if !relay_targets.is_empty() {
            tracing::debug!(
                source = %message.source,
                seq = message.sequence_number,
                targets = relay_targets.len(),
                "relaying chat"
            );
            self.send_bytes(bytes, &relay_targets).await;
        }

        if message.is_addressed_to(&self.local_id) {
            self.emit(EngineEvent::MessageDelivered(message));
        }
    }

    fn handle_ack(&mut self, ack: &Message) {
        if ack.destination != self.local_id {
            tracing::trace!(destination = %ack.destination, "ack for another peer ignored");
            return;
        }
        if self.pending.cancel(ack.sequence_number).is_some() {
            tracing::debug!(seq = ack.sequence_number, by = %ack.source, "message acknowledged");
            self.emit(EngineEvent::MessageAcknowledged {
                sequence_number: ack.sequence_number,
                by: ack.source.clone(),
            });
        } else {
            tracing::trace!(seq = ack.sequence_number, by = %ack.source, "late ack ignored");
        }
    }

    fn handle_presence(&mut self, announce: &Message) {
        let announced = PeerId::new(announce.payload.as_str());
        if announced.as_str().is_empty() || announced.is_broadcast() {
            tracing::debug!(via = %announce.source, "ignoring announcement without a peer identity");
            return;
        }
        if announced == self.local_id {
            return;
        }
        if self.directory.add_user(&announced) {
            tracing::info!(peer = %announced, via = %announce.source, "peer announced");
            self.emit_peer_set();
        }
    }

    fn allocate_sequence(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Hand bytes to the transport. Failures only surface through the ack
    /// timeout path.
    async fn send_bytes(&self, bytes: &[u8], targets: &[PeerId]) {
        if targets.is_empty() {
            return;
        }
        if let Err(e) = self.transport.send(bytes, targets).await {
            tracing::warn!(error = %e, "transport send failed");
        }
    }

    fn emit_peer_set(&self) {
        self.emit(EngineEvent::PeerSetChanged(self.directory.snapshot().to_vec()));
    }

    fn emit(&self, event: EngineEvent) {
        // The presentation layer may have gone away; the protocol keeps going.
        let _ = self.events.send(event);
    }
}
