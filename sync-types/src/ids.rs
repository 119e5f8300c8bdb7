//! Peer identity types for cardsync.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A transport-level identifier for a peer.
///
/// UUID v4, generated once per process and stable for its lifetime.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(uuid::Uuid);

impl PeerId {
    /// Create a new random PeerId.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(uuid: uuid::Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", &self.0.simple().to_string()[..8])
    }
}

/// A discoverable peer: stable transport id plus a human-readable name.
///
/// Equality and hashing use both fields, but bookkeeping everywhere is keyed
/// by [`PeerId`]; two devices may share a display name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerIdentity {
    /// Transport-level identifier.
    pub id: PeerId,
    /// Name shown in the UI ("Alice's iPhone").
    pub display_name: String,
}

impl PeerIdentity {
    /// Create a new identity with a fresh id.
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            id: PeerId::new(),
            display_name: display_name.into(),
        }
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_name)
    }
}
