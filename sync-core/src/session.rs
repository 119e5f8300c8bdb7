//! Session state machines for cardsync.
//!
//! Two pure machines live here. [`SessionPhase`] is the coarse,
//! process-wide phase of the single transport session. [`PeerBook`] is the
//! per-peer bookkeeping fed by transport state changes.
//!
//! Neither performs I/O. The async session manager in `cardsync-peer`
//! feeds events in and executes the returned actions, which keeps every
//! transition testable without a transport.

use std::collections::{BTreeMap, BTreeSet};

use cardsync_types::{PeerId, PeerIdentity, Role};

/// Process-wide session phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    /// No transport session exists.
    #[default]
    NoSession,
    /// Server role: session open and advertising.
    Advertising,
    /// Client role: session open and browsing.
    Browsing,
    /// The last peer left and the transport holds no connections.
    Stalled {
        /// Role to resume with.
        role: Role,
    },
    /// The session is being torn down and rebuilt.
    Resetting {
        /// Role to resume with.
        role: Role,
    },
}

impl SessionPhase {
    /// Create a machine with no session.
    pub fn new() -> Self {
        Self::NoSession
    }

    /// Process an event and return the new phase plus actions to execute.
    ///
    /// Resets are only accepted from [`SessionPhase::Stalled`]. A second
    /// reset request arriving while one is in flight, or after it completed,
    /// is ignored, so concurrent triggers collapse into one rebuild.
    pub fn on_event(self, event: PhaseEvent) -> (Self, Vec<PhaseAction>) {
        match (self, event) {
            // From NoSession
            (Self::NoSession, PhaseEvent::Start(role)) => (
                Self::active(role),
                vec![PhaseAction::OpenSession, PhaseAction::discover(role)],
            ),
            (Self::NoSession, PhaseEvent::Stop) => (Self::NoSession, vec![]),

            // From an active phase
            (Self::Advertising, PhaseEvent::LastPeerLost) => (
                Self::Stalled {
                    role: Role::Server,
                },
                vec![],
            ),
            (Self::Browsing, PhaseEvent::LastPeerLost) => (
                Self::Stalled {
                    role: Role::Client,
                },
                vec![],
            ),
            (Self::Advertising, PhaseEvent::DiscoveryFailed) => (
                Self::Stalled {
                    role: Role::Server,
                },
                vec![],
            ),
            (Self::Browsing, PhaseEvent::DiscoveryFailed) => (
                Self::Stalled {
                    role: Role::Client,
                },
                vec![],
            ),

            // From Stalled
            (Self::Stalled { role }, PhaseEvent::ResetRequested) => (
                Self::Resetting { role },
                vec![PhaseAction::TearDown, PhaseAction::OpenSession],
            ),
            (Self::Stalled { role }, PhaseEvent::PeerConnected) => (Self::active(role), vec![]),

            // From Resetting
            (Self::Resetting { role }, PhaseEvent::ResetCompleted) => {
                (Self::active(role), vec![PhaseAction::discover(role)])
            }
            (Self::Resetting { role }, PhaseEvent::ResetFailed) => (Self::Stalled { role }, vec![]),

            // Stop is safe from anywhere
            (_, PhaseEvent::Stop) => (Self::NoSession, vec![PhaseAction::TearDown]),

            // Invalid transitions (including a repeated Start) - stay put
            (phase, _) => (phase, vec![]),
        }
    }

    fn active(role: Role) -> Self {
        match role {
            Role::Server => Self::Advertising,
            Role::Client => Self::Browsing,
        }
    }

    /// Role of the current or pending session, if any.
    pub fn role(&self) -> Option<Role> {
        match self {
            Self::NoSession => None,
            Self::Advertising => Some(Role::Server),
            Self::Browsing => Some(Role::Client),
            Self::Stalled { role } | Self::Resetting { role } => Some(*role),
        }
    }

    /// Whether a session object should exist.
    pub fn has_session(&self) -> bool {
        !matches!(self, Self::NoSession)
    }
}

/// Inputs to [`SessionPhase`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    /// The application started the node with this role.
    Start(Role),
    /// The application stopped the node.
    Stop,
    /// Bookkeeping and transport both report zero peers, after a peer left
    /// or a handshake failed.
    LastPeerLost,
    /// Someone asked for a rebuild.
    ResetRequested,
    /// The rebuilt session is open.
    ResetCompleted,
    /// Opening the rebuilt session failed.
    ResetFailed,
    /// Restarting discovery on the rebuilt session failed.
    DiscoveryFailed,
    /// A peer connected.
    PeerConnected,
}

/// Instructions for the session manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseAction {
    /// Create a new transport session.
    OpenSession,
    /// Begin advertising (server role).
    Advertise,
    /// Begin browsing (client role).
    Browse,
    /// Stop discovery, disconnect, release the session, clear bookkeeping.
    TearDown,
}

impl PhaseAction {
    fn discover(role: Role) -> Self {
        match role {
            Role::Server => Self::Advertise,
            Role::Client => Self::Browse,
        }
    }
}

/// Per-peer connection state as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    /// Handshake in progress.
    Connecting,
    /// Connected.
    Connected,
    /// Gone.
    NotConnected,
}

/// Side effects requested by [`PeerBook`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookAction {
    /// The peer failed re-validation; disconnect it.
    ForceDisconnect(PeerIdentity),
    /// The peer just transitioned into Connected.
    PeerConnected(PeerIdentity),
    /// The list of connected device names changed.
    DevicesChanged(Vec<String>),
    /// The last peer left, or a handshake failed with nobody connected, and
    /// the transport has no connections either.
    ResetSession,
}

/// Bookkept connected and connecting peers.
#[derive(Debug, Clone, Default)]
pub struct PeerBook {
    connected: BTreeMap<PeerId, PeerIdentity>,
    connecting: BTreeSet<PeerId>,
}

impl PeerBook {
    /// Create an empty book.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a transport state change.
    ///
    /// `accepted` is the acceptance policy's verdict for the peer, and
    /// `transport_has_connections` is whether the transport still reports
    /// any connected peer after this change.
    pub fn on_state_change(
        &mut self,
        peer: &PeerIdentity,
        state: PeerConnectionState,
        accepted: bool,
        transport_has_connections: bool,
    ) -> Vec<BookAction> {
        match state {
            PeerConnectionState::Connecting => {
                self.connecting.insert(peer.id);
                vec![]
            }
            PeerConnectionState::Connected => {
                self.connecting.remove(&peer.id);
                if !accepted {
                    let mut actions = vec![BookAction::ForceDisconnect(peer.clone())];
                    if self.connected.remove(&peer.id).is_some() {
                        actions.push(BookAction::DevicesChanged(self.names()));
                    }
                    return actions;
                }
                if self.connected.insert(peer.id, peer.clone()).is_some() {
                    return vec![];
                }
                vec![
                    BookAction::PeerConnected(peer.clone()),
                    BookAction::DevicesChanged(self.names()),
                ]
            }
            PeerConnectionState::NotConnected => {
                let was_connecting = self.connecting.remove(&peer.id);
                let was_connected = self.connected.remove(&peer.id).is_some();
                let mut actions = Vec::new();
                if was_connected {
                    actions.push(BookAction::DevicesChanged(self.names()));
                } else if !was_connecting {
                    return actions;
                }
                // A failed handshake can leave the session wedged just like
                // losing the last peer.
                if self.connected.is_empty() && !transport_has_connections {
                    actions.push(BookAction::ResetSession);
                }
                actions
            }
        }
    }

    /// Overwrite the connected set. Returns whether it changed.
    pub fn replace_connected(&mut self, peers: &[PeerIdentity]) -> bool {
        let next: BTreeMap<PeerId, PeerIdentity> =
            peers.iter().map(|p| (p.id, p.clone())).collect();
        let changed = next.keys().ne(self.connected.keys());
        for id in next.keys() {
            self.connecting.remove(id);
        }
        self.connected = next;
        changed
    }

    /// Whether `peer` is bookkept as connected.
    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.connected.contains_key(peer)
    }

    /// Whether `peer` is mid-handshake.
    pub fn is_connecting(&self, peer: &PeerId) -> bool {
        self.connecting.contains(peer)
    }

    /// Connected peers, in id order.
    pub fn peers(&self) -> Vec<PeerIdentity> {
        self.connected.values().cloned().collect()
    }

    /// Sorted display names of connected peers.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .connected
            .values()
            .map(|p| p.display_name.clone())
            .collect();
        names.sort();
        names
    }

    /// Number of connected peers.
    pub fn len(&self) -> usize {
        self.connected.len()
    }

    /// Whether no peer is connected.
    pub fn is_empty(&self) -> bool {
        self.connected.is_empty()
    }

    /// Forget every peer.
    pub fn clear(&mut self) {
        self.connected.clear();
        self.connecting.clear();
    }
}
