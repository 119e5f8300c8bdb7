//! # sync-peer
//!
//! Peer-to-peer card synchronization over the local network.
//!
//! This is the runtime half of cardsync: it drives the pure state machines
//! from `sync-core` against a transport and a card store.
//!
//! ## Features
//!
//! - **Single session**: one transport session per process, rebuilt when
//!   the last peer drops and the transport is idle
//! - **Role-based pairing**: servers advertise, clients browse; same-role
//!   peers never pair
//! - **Health monitor**: periodic reconciliation with the transport's
//!   authoritative peer list
//! - **Offline queue**: changes made while alone are sent when a peer connects
//! - **Transport abstraction**: pluggable transport (in-process for tests)
//!
//! ## Example
//!
//! ```ignore
//! use cardsync_peer::{MemoryNetwork, MemoryStore, NodeConfig, PeerNode};
//!
//! let network = MemoryNetwork::new();
//! let node = PeerNode::new(NodeConfig::default(), Arc::new(network))?;
//! node.set_active_store(Arc::new(MemoryStore::new()));
//! node.start().await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod health;
pub mod node;
pub mod session;
pub mod store;
pub mod transport;

pub use config::{ConfigError, NodeConfig};
pub use coordinator::SyncCoordinator;
pub use error::{NodeError, StoreError};
pub use events::{EventBus, NodeEvent};
pub use health::spawn_health_monitor;
pub use node::PeerNode;
pub use session::{EventReceiver, SessionManager, SessionSignal};
pub use store::{CardStore, MemoryStore};
pub use transport::{
    EventSink, MemoryNetwork, MemorySession, Session, Transport, TransportError, TransportEvent,
};

// Re-exported so applications need only this crate.
pub use cardsync_core::{ChangeType, ConflictPolicy, SessionPhase};
pub use cardsync_types::{CardRecord, CardType, PeerId, PeerIdentity, Role};
