//! Peer directory: who we know about and where each invitation stands.
//!
//! The directory owns peer lifetimes from discovery to loss. It applies the
//! [`AcceptancePolicy`] and makes invitation handling idempotent: a peer
//! already being invited, connecting, or connected is never invited twice.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use cardsync_types::{DiscoveryInfo, PeerId, PeerIdentity};

use crate::policy::AcceptancePolicy;

/// Default invitation timeout.
pub const DEFAULT_INVITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Where a known peer stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    /// Seen, nothing sent yet.
    Discovered,
    /// We invited it; the invitation lapses at `expires_at`.
    Inviting {
        /// Invitation deadline.
        expires_at: Instant,
    },
    /// Transport handshake in progress.
    Connecting,
    /// Fully connected.
    Connected,
    /// Failed the acceptance policy.
    Rejected,
}

/// A known peer.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    /// Who it is.
    pub identity: PeerIdentity,
    /// Latest discovery metadata, if any was seen.
    pub info: Option<DiscoveryInfo>,
    /// Current status.
    pub status: PeerStatus,
}

/// Result of a discovery event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoundOutcome {
    /// Already invited or connected: nothing to do.
    AlreadyKnown,
    /// Failed the acceptance policy.
    Rejected,
    /// Send an invitation with this timeout.
    Invite {
        /// How long the invitation stays open.
        timeout: Duration,
    },
}

/// Tracks discovered peers and outstanding invitations.
#[derive(Debug)]
pub struct PeerDirectory {
    policy: AcceptancePolicy,
    invite_timeout: Duration,
    peers: HashMap<PeerId, PeerEntry>,
}

impl PeerDirectory {
    /// Create an empty directory.
    pub fn new(policy: AcceptancePolicy, invite_timeout: Duration) -> Self {
        Self {
            policy,
            invite_timeout,
            peers: HashMap::new(),
        }
    }

    /// The policy in force.
    pub fn policy(&self) -> &AcceptancePolicy {
        &self.policy
    }

    /// A peer was found while browsing.
    pub fn on_peer_found(
        &mut self,
        peer: &PeerIdentity,
        info: Option<DiscoveryInfo>,
        now: Instant,
    ) -> FoundOutcome {
        if let Some(entry) = self.peers.get(&peer.id) {
            let busy = match entry.status {
                PeerStatus::Inviting { expires_at } => expires_at > now,
                PeerStatus::Connecting | PeerStatus::Connected => true,
                PeerStatus::Discovered | PeerStatus::Rejected => false,
            };
            if busy {
                return FoundOutcome::AlreadyKnown;
            }
        }

        let accepted = self.policy.should_accept(peer, info.as_ref());
        let status = if accepted {
            PeerStatus::Inviting {
                expires_at: now + self.invite_timeout,
            }
        } else {
            PeerStatus::Rejected
        };
        self.peers.insert(
            peer.id,
            PeerEntry {
                identity: peer.clone(),
                info,
                status,
            },
        );

        if accepted {
            FoundOutcome::Invite {
                timeout: self.invite_timeout,
            }
        } else {
            FoundOutcome::Rejected
        }
    }

    /// An invitation arrived. Returns whether to accept it.
    ///
    /// Accepted invitations are answered without user interaction.
    pub fn on_invitation_received(
        &mut self,
        peer: &PeerIdentity,
        info: Option<DiscoveryInfo>,
    ) -> bool {
        let accepted = self.policy.should_accept(peer, info.as_ref());
        let entry = self.peers.entry(peer.id).or_insert_with(|| PeerEntry {
            identity: peer.clone(),
            info: None,
            status: PeerStatus::Discovered,
        });
        if info.is_some() {
            entry.info = info;
        }
        if entry.status != PeerStatus::Connected {
            entry.status = if accepted {
                PeerStatus::Connecting
            } else {
                PeerStatus::Rejected
            };
        }
        accepted
    }

    /// Record a transport-level status change for a known peer.
    pub fn set_status(&mut self, peer: &PeerIdentity, status: PeerStatus) {
        self.peers
            .entry(peer.id)
            .and_modify(|entry| entry.status = status)
            .or_insert_with(|| PeerEntry {
                identity: peer.clone(),
                info: None,
                status,
            });
    }

    /// The peer stopped advertising. Connected peers are kept; the session
    /// reports their loss separately.
    pub fn on_peer_lost(&mut self, peer: &PeerId) {
        if let Some(entry) = self.peers.get(peer) {
            if entry.status != PeerStatus::Connected {
                self.peers.remove(peer);
            }
        }
    }

    /// The peer disconnected; it may be rediscovered and invited again.
    pub fn on_disconnected(&mut self, peer: &PeerId) {
        if let Some(entry) = self.peers.get_mut(peer) {
            entry.status = PeerStatus::Discovered;
        }
    }

    /// Drop invitations past their deadline. Returns the expired peers.
    pub fn expire_invitations(&mut self, now: Instant) -> Vec<PeerId> {
        let mut expired = Vec::new();
        for (id, entry) in self.peers.iter_mut() {
            if let PeerStatus::Inviting { expires_at } = entry.status {
                if expires_at <= now {
                    entry.status = PeerStatus::Discovered;
                    expired.push(*id);
                }
            }
        }
        expired
    }

    /// Apply the policy using whatever metadata we hold for the peer.
    pub fn should_accept(&self, peer: &PeerIdentity) -> bool {
        let info = self.peers.get(&peer.id).and_then(|entry| entry.info.as_ref());
        self.policy.should_accept(peer, info)
    }

    /// Look up a peer.
    pub fn get(&self, peer: &PeerId) -> Option<&PeerEntry> {
        self.peers.get(peer)
    }

    /// Number of known peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether no peers are known.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Forget everything, cancelling outstanding invitations.
    pub fn clear(&mut self) {
        self.peers.clear();
    }
}
