//! Pending acknowledgment table and retry policy.
//!
//! Every chat message sent to at least one neighbor gets an entry keyed by
//! its sequence number, together with a timer task. The timer never touches
//! the table itself: on expiry it posts an [`AckExpiry`] to the engine's
//! owner task, which calls [`PendingAckTable::expire`]. Whoever removes the
//! entry first (an arriving ack or the expiry) wins; the other finds nothing
//! and does nothing.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use meshchat_proto::message::Message;

/// Configuration for ack timeout and resend behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// How long to wait for the first acknowledgment.
    pub ack_timeout: Duration,
    /// Number of resends after the first timeout. Zero means one attempt.
    pub max_retries: u32,
    /// Timeout multiplier applied per resend.
    pub backoff_factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_millis(1500),
            max_retries: 0,
            backoff_factor: 2,
        }
    }
}

impl RetryPolicy {
    /// Timeout for the given attempt (0 is the first send).
    #[must_use]
    pub fn timeout_for(&self, attempt: u32) -> Duration {
        self.ack_timeout
            .saturating_mul(self.backoff_factor.max(1).saturating_pow(attempt))
    }

    /// Returns `true` if a message on `attempt` may be sent again.
    #[must_use]
    pub const fn may_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Posted by a timer task when its deadline passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckExpiry {
    /// Sequence number of the message the timer guards.
    pub sequence_number: u64,
    /// Which send attempt the timer belonged to.
    pub attempt: u32,
}

#[derive(Debug)]
struct PendingAck {
    message: Message,
    attempt: u32,
    timer: AbortHandle,
}

/// Sequence number → armed timeout, for locally originated chat messages.
#[derive(Debug)]
pub struct PendingAckTable {
    entries: HashMap<u64, PendingAck>,
    expiry_tx: mpsc::UnboundedSender<AckExpiry>,
}

impl PendingAckTable {
    /// Creates an empty table and the receiver its timers post to.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AckExpiry>) {
        let (expiry_tx, expiry_rx) = mpsc::unbounded_channel();
        let table = Self {
            entries: HashMap::new(),
            expiry_tx,
        };
        (table, expiry_rx)
    }

    /// Start waiting for an ack of `message`.
    ///
    /// Must be called from within a tokio runtime. Re-arming a sequence
    /// number replaces (and aborts) the previous timer, so there is never more
    /// than one live timer per entry.
    pub fn arm(&mut self, message: Message, attempt: u32, timeout: Duration) {
        let sequence_number = message.sequence_number;
        let tx = self.expiry_tx.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            // The owner may already be gone at shutdown.
            let _ = tx.send(AckExpiry {
                sequence_number,
                attempt,
            });
        })
        .abort_handle();

        tracing::trace!(seq = sequence_number, attempt, ?timeout, "ack timer armed");
        if let Some(previous) = self.entries.insert(
            sequence_number,
            PendingAck {
                message,
                attempt,
                timer,
            },
        ) {
            previous.timer.abort();
        }
    }

    /// Remove the entry because an ack arrived.
    ///
    /// Returns the acknowledged message, or `None` if nothing was pending
    /// (already acknowledged or already expired).
    pub fn cancel(&mut self, sequence_number: u64) -> Option<Message> {
        let entry = self.entries.remove(&sequence_number)?;
        entry.timer.abort();
        Some(entry.message)
    }

    /// Remove the entry because its timer fired.
    ///
    /// Stale expiries (entry gone, or re-armed for a later attempt) return
    /// `None` and leave the table untouched.
    pub fn expire(&mut self, expiry: AckExpiry) -> Option<(Message, u32)> {
        let current = self.entries.get(&expiry.sequence_number)?;
        if current.attempt != expiry.attempt {
            return None;
        }
        let entry = self.entries.remove(&expiry.sequence_number)?;
        Some((entry.message, entry.attempt))
    }

    /// Returns `true` if `sequence_number` is awaiting an ack.
    #[must_use]
    pub fn contains(&self, sequence_number: u64) -> bool {
        self.entries.contains_key(&sequence_number)
    }

    /// Number of pending entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Drop for PendingAckTable {
    fn drop(&mut self) {
        for entry in self.entries.values() {
            entry.timer.abort();
        }
    }
}
