//! Peer acceptance policy.
//!
//! A process only pairs with peers of the complementary [`Role`]. The role
//! is read structurally from discovery metadata; the display-name heuristic
//! is a fallback for legacy peers that advertise no role.

use serde::{Deserialize, Serialize};
use cardsync_types::{DiscoveryInfo, PeerIdentity, Role};

/// Display-name fragments that identify a legacy peer's role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameHints {
    /// Fragments marking a server (e.g. "Mac").
    pub server: Vec<String>,
    /// Fragments marking a client (e.g. "iPhone").
    pub client: Vec<String>,
}

impl Default for NameHints {
    fn default() -> Self {
        Self {
            server: vec!["Mac".to_string()],
            client: vec!["iPhone".to_string(), "iPad".to_string()],
        }
    }
}

impl NameHints {
    /// Guess a role from a display name. Ambiguous names yield `None`.
    pub fn role_for(&self, display_name: &str) -> Option<Role> {
        let name = display_name.to_lowercase();
        let matches = |hints: &[String]| {
            hints
                .iter()
                .any(|hint| !hint.is_empty() && name.contains(&hint.to_lowercase()))
        };
        match (matches(&self.server), matches(&self.client)) {
            (true, false) => Some(Role::Server),
            (false, true) => Some(Role::Client),
            _ => None,
        }
    }
}

/// Decides which peers this process pairs with.
#[derive(Debug, Clone)]
pub struct AcceptancePolicy {
    local_role: Role,
    hints: NameHints,
}

impl AcceptancePolicy {
    /// Create a policy for a process playing `local_role`.
    pub fn new(local_role: Role, hints: NameHints) -> Self {
        Self { local_role, hints }
    }

    /// The role of this process.
    pub fn local_role(&self) -> Role {
        self.local_role
    }

    /// Best knowledge of a peer's role.
    pub fn peer_role(&self, peer: &PeerIdentity, info: Option<&DiscoveryInfo>) -> Option<Role> {
        info.and_then(|info| info.role)
            .or_else(|| self.hints.role_for(&peer.display_name))
    }

    /// Whether to advertise to, invite, or accept `peer`.
    pub fn should_accept(&self, peer: &PeerIdentity, info: Option<&DiscoveryInfo>) -> bool {
        if info.is_some_and(|info| !info.is_compatible()) {
            return false;
        }
        self.peer_role(peer, info) == Some(self.local_role.complement())
    }
}
