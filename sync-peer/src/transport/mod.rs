//! Transport abstraction for cardsync.
//!
//! This module provides a pluggable local-network transport that abstracts
//! the underlying discovery and session mechanism (a platform peer-to-peer
//! framework, or the in-process [`MemoryNetwork`] for testing).
//!
//! # Design
//!
//! A [`Transport`] opens [`Session`]s. A session is the single live channel
//! through which a process advertises or browses, invites peers, and sends
//! bytes. Everything the transport observes arrives asynchronously as
//! [`TransportEvent`]s through the [`EventSink`] handed to `open_session`.
//! Each sink is stamped with a generation so that events from a torn-down
//! session can be recognised and dropped.
//!
//! # Example
//!
//! ```ignore
//! let network = MemoryNetwork::new();
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//! let session = network.open_session(&me, "memoread-sync", EventSink::new(1, tx)).await?;
//! session.start_browsing(&DiscoveryInfo::new(Role::Client)).await?;
//! while let Some((generation, event)) = rx.recv().await { /* ... */ }
//! ```

mod memory;

pub use memory::{MemoryNetwork, MemorySession};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cardsync_core::PeerConnectionState;
use cardsync_types::{DiscoveryInfo, PeerId, PeerIdentity};
use thiserror::Error;
use tokio::sync::mpsc;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Opening a session failed.
    #[error("session failed: {0}")]
    SessionFailed(String),

    /// The session was torn down.
    #[error("session closed")]
    SessionClosed,

    /// No session is open.
    #[error("no session")]
    NoSession,

    /// The peer is unknown to the transport.
    #[error("peer {0} not found")]
    PeerNotFound(PeerId),

    /// The peer is not connected.
    #[error("peer {0} not connected")]
    NotConnected(PeerId),

    /// No invitation from this peer is outstanding.
    #[error("no invitation from {0}")]
    NoInvitation(PeerId),

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),
}

/// Something the transport observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A peer advertising our service type appeared.
    PeerFound {
        /// The peer.
        peer: PeerIdentity,
        /// Its discovery metadata, if it published any.
        info: Option<DiscoveryInfo>,
    },
    /// A peer stopped advertising.
    PeerLost {
        /// The peer.
        peer: PeerId,
    },
    /// A peer invited us to connect.
    InvitationReceived {
        /// The inviter.
        peer: PeerIdentity,
        /// Metadata the inviter attached.
        info: Option<DiscoveryInfo>,
    },
    /// A peer's connection state changed.
    StateChanged {
        /// The peer.
        peer: PeerIdentity,
        /// New state.
        state: PeerConnectionState,
    },
    /// Bytes arrived from a peer.
    DataReceived {
        /// Sender.
        peer: PeerIdentity,
        /// Payload.
        data: Vec<u8>,
    },
}

/// Delivery end for one session's events, stamped with its generation.
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
}

impl EventSink {
    /// Create a sink for session `generation`.
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, TransportEvent)>) -> Self {
        Self { generation, tx }
    }

    /// Generation of the session this sink belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Deliver an event. Returns false once the receiver is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx.send((self.generation, event)).is_ok()
    }
}

/// Factory for transport sessions.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a new session for `local` on the given service type.
    ///
    /// Events observed by the session are delivered through `events`.
    async fn open_session(
        &self,
        local: &PeerIdentity,
        service_type: &str,
        events: EventSink,
    ) -> Result<Arc<dyn Session>, TransportError>;
}

/// One live transport session.
///
/// Sends use the transport's reliable mode: per-peer delivery preserves
/// send order.
#[async_trait]
pub trait Session: Send + Sync {
    /// Our identity on this session.
    fn local_peer(&self) -> &PeerIdentity;

    /// Publish ourselves with `info`.
    async fn start_advertising(&self, info: &DiscoveryInfo) -> Result<(), TransportError>;

    /// Stop publishing.
    async fn stop_advertising(&self);

    /// Look for advertising peers.
    async fn start_browsing(&self) -> Result<(), TransportError>;

    /// Stop looking.
    async fn stop_browsing(&self);

    /// Invite `peer`, attaching our own metadata.
    async fn invite(
        &self,
        peer: &PeerId,
        info: &DiscoveryInfo,
        timeout: Duration,
    ) -> Result<(), TransportError>;

    /// Accept or decline an outstanding invitation from `peer`.
    async fn respond_to_invitation(&self, peer: &PeerId, accept: bool)
        -> Result<(), TransportError>;

    /// Send `data` reliably to every peer in `peers`.
    async fn send(&self, data: &[u8], peers: &[PeerId]) -> Result<(), TransportError>;

    /// The transport's authoritative list of connected peers.
    fn connected_peers(&self) -> Vec<PeerIdentity>;

    /// Drop the connection to one peer.
    async fn disconnect_peer(&self, peer: &PeerId);

    /// Drop every connection and release the session.
    async fn disconnect(&self);
}
