//! Property-based serialization tests for the wire codec.
//!
//! Uses proptest to verify:
//! 1. Any valid `Message` survives encode → decode round-trip.
//! 2. Random bytes never cause a panic in `decode` (returns `Err` gracefully).
//! 3. Dedup keys depend only on source, sequence number, and payload.

use meshchat_proto::codec;
use meshchat_proto::message::{MAX_PAYLOAD_SIZE, Message, MessageKind, PeerId};
use proptest::prelude::*;

/// Strategy for generating non-empty peer identities.
fn arb_peer_id() -> impl Strategy<Value = PeerId> {
    "[a-zA-Z0-9 _-]{1,32}".prop_map(PeerId::new)
}

/// Strategy for generating arbitrary `MessageKind` values.
fn arb_kind() -> impl Strategy<Value = MessageKind> {
    prop_oneof![
        Just(MessageKind::Chat),
        Just(MessageKind::Ack),
        Just(MessageKind::PresenceAnnounce),
    ]
}

/// Strategy for generating arbitrary valid `Message` values.
fn arb_message() -> impl Strategy<Value = Message> {
    (
        arb_peer_id(),
        prop_oneof![Just(PeerId::broadcast()), arb_peer_id()],
        any::<u64>(),
        arb_kind(),
        ".{0,512}",
    )
        .prop_map(
            |(source, destination, sequence_number, kind, payload)| Message {
                source,
                destination,
                sequence_number,
                kind,
                payload,
            },
        )
}

proptest! {
    /// Any valid Message survives an encode → decode round-trip.
    #[test]
    fn message_round_trip(msg in arb_message()) {
        let bytes = codec::encode(&msg).expect("encode should succeed");
        let decoded = codec::decode(&bytes).expect("decode should succeed");
        prop_assert_eq!(msg, decoded);
    }

    /// Random bytes never cause a panic when decoded; they return Err gracefully.
    #[test]
    fn random_bytes_decode_no_panic(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = codec::decode(&bytes);
    }

    /// Whatever decodes successfully is a valid message.
    #[test]
    fn decoded_messages_are_valid(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        if let Ok(msg) = codec::decode(&bytes) {
            prop_assert!(!msg.source.as_str().is_empty());
            prop_assert!(msg.payload.len() <= MAX_PAYLOAD_SIZE);
        }
    }

    /// Relaying to a different destination never changes the dedup key.
    #[test]
    fn dedup_key_survives_readdressing(msg in arb_message(), dest in arb_peer_id()) {
        let mut readdressed = msg.clone();
        readdressed.destination = dest;
        prop_assert_eq!(msg.dedup_key(), readdressed.dedup_key());
    }
}
