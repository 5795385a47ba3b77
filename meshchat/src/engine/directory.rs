//! Ordered set of peers currently believed reachable.

use meshchat_proto::message::PeerId;

/// The local view of who is in the neighborhood.
///
/// Entries keep the order in which they were discovered so the presentation
/// layer can render a stable list. Membership only changes through transport
/// connect/disconnect events and received presence announcements.
#[derive(Debug, Default, Clone)]
pub struct UserDirectory {
    users: Vec<PeerId>,
}

impl UserDirectory {
    /// Creates an empty directory.
    #[must_use]
    pub const fn new() -> Self {
        Self { users: Vec::new() }
    }

    /// Appends `id` unless it is already present.
    ///
    /// Returns `true` if the directory changed.
    pub fn add_user(&mut self, id: &PeerId) -> bool {
        if self.contains(id) {
            return false;
        }
        tracing::debug!(peer = %id, "user added to directory");
        self.users.push(id.clone());
        true
    }

    /// Removes `id` if present.
    ///
    /// Returns `true` if the directory changed.
    pub fn remove_user(&mut self, id: &PeerId) -> bool {
        let Some(index) = self.users.iter().position(|u| u == id) else {
            return false;
        };
        tracing::debug!(peer = %id, "user removed from directory");
        self.users.remove(index);
        true
    }

    /// Membership test.
    #[must_use]
    pub fn contains(&self, id: &PeerId) -> bool {
        self.users.iter().any(|u| u == id)
    }

    /// Current members in discovery order.
    #[must_use]
    pub fn snapshot(&self) -> &[PeerId] {
        &self.users
    }

    /// Number of known peers.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.users.len()
    }

    /// Returns `true` if no peers are known.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}
