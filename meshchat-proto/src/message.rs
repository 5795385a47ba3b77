//! Wire format message types for the `MeshChat` protocol.
//!
//! Every datagram the propagation engine hands to a transport is one
//! serialized [`Message`]. The same shape carries chat text, delivery
//! acknowledgments, and presence announcements; [`MessageKind`] tells
//! them apart.

use serde::{Deserialize, Serialize};

/// Maximum allowed payload size in bytes (64 KB).
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// Destination sentinel addressing every peer in the neighborhood.
pub const BROADCAST: &str = "all";

/// Display name identifying a peer within the session.
///
/// Peer identities are opaque strings. They carry no ownership and are only
/// used as lookup keys (directory entries, transport targets, ack routing).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    /// Create a new peer identifier from a string representation.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The broadcast destination (`"all"`).
    #[must_use]
    pub fn broadcast() -> Self {
        Self(BROADCAST.to_string())
    }

    /// Returns `true` if this identity is the broadcast sentinel.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.0 == BROADCAST
    }

    /// Return the string representation of this peer ID.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Discriminates the three kinds of protocol traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// User-visible chat text, flooded to every peer.
    Chat,
    /// Acknowledgment of a chat message, sent back to its source.
    Ack,
    /// Announcement that the identity in the payload joined the neighborhood.
    PresenceAnnounce,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Chat => write!(f, "chat"),
            Self::Ack => write!(f, "ack"),
            Self::PresenceAnnounce => write!(f, "presence"),
        }
    }
}

/// A single protocol message.
///
/// Messages are immutable once built: the sequence number is assigned by the
/// originating peer at creation and relays forward the value untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Peer that created the message.
    pub source: PeerId,
    /// Target peer, or [`BROADCAST`].
    pub destination: PeerId,
    /// Per-source, strictly increasing counter.
    pub sequence_number: u64,
    /// What kind of traffic this is.
    pub kind: MessageKind,
    /// Chat text, acknowledged text, or announced identity.
    pub payload: String,
}

/// Composite identity used to recognize a message seen before.
///
/// Two messages are "the same" for deduplication when source, sequence
/// number, and payload all match, regardless of destination or kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    source: PeerId,
    sequence_number: u64,
    payload: String,
}

impl Message {
    /// Build a broadcast chat message.
    #[must_use]
    pub fn chat(source: PeerId, sequence_number: u64, text: impl Into<String>) -> Self {
        Self {
            source,
            destination: PeerId::broadcast(),
            sequence_number,
            kind: MessageKind::Chat,
            payload: text.into(),
        }
    }

    /// Build the acknowledgment `local` sends back for `self`.
    ///
    /// The ack keeps the original sequence number and payload so the source
    /// can match it against its pending table.
    #[must_use]
    pub fn ack_for(&self, local: PeerId) -> Self {
        Self {
            source: local,
            destination: self.source.clone(),
            sequence_number: self.sequence_number,
            kind: MessageKind::Ack,
            payload: self.payload.clone(),
        }
    }

    /// Build a broadcast presence announcement for `announced`.
    #[must_use]
    pub fn presence(source: PeerId, sequence_number: u64, announced: &PeerId) -> Self {
        Self {
            source,
            destination: PeerId::broadcast(),
            sequence_number,
            kind: MessageKind::PresenceAnnounce,
            payload: announced.as_str().to_string(),
        }
    }

    /// The deduplication key of this message.
    #[must_use]
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            source: self.source.clone(),
            sequence_number: self.sequence_number,
            payload: self.payload.clone(),
        }
    }

    /// Returns `true` if `peer` should consume this message.
    #[must_use]
    pub fn is_addressed_to(&self, peer: &PeerId) -> bool {
        self.destination.is_broadcast() || self.destination == *peer
    }

    /// Validates a message received from the wire.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::MissingSource`] if the source identity is
    /// empty, or [`ValidationError::TooLarge`] if the payload exceeds
    /// [`MAX_PAYLOAD_SIZE`].
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.source.as_str().is_empty() {
            return Err(ValidationError::MissingSource);
        }
        check_size(&self.payload, MAX_PAYLOAD_SIZE)
    }
}

/// Checks a chat text typed by the local user.
///
/// # Errors
///
/// Returns [`ValidationError::Empty`] for an empty text, or
/// [`ValidationError::TooLarge`] if it is longer than `max` bytes.
pub const fn validate_text(text: &str, max: usize) -> Result<(), ValidationError> {
    if text.is_empty() {
        return Err(ValidationError::Empty);
    }
    check_size(text, max)
}

const fn check_size(text: &str, max: usize) -> Result<(), ValidationError> {
    let size = text.len();
    if size > max {
        return Err(ValidationError::TooLarge { size, max });
    }
    Ok(())
}

/// Error returned when a message fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Message content is empty.
    #[error("message content is empty")]
    Empty,
    /// Message content exceeds the maximum allowed size.
    #[error("message too large ({size} bytes, max {max} bytes)")]
    TooLarge {
        /// Actual size of the content in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
    /// The message does not name its source peer.
    #[error("message has no source identity")]
    MissingSource,
}
