//! # sync-types
//!
//! Wire format types for the cardsync local-network protocol.
//!
//! This crate provides the foundational types used across all cardsync crates:
//! - [`CardRecord`], [`CardType`] - The synchronized unit of user data
//! - [`SyncMessage`], [`MessageType`] - The JSON envelope exchanged between peers
//! - [`PeerId`], [`PeerIdentity`] - Transport-level peer identity
//! - [`DiscoveryInfo`], [`Role`] - Discovery metadata advertised on the local network
//! - [`CodecError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod card;
mod discovery;
mod error;
mod ids;
mod messages;

pub use card::{CardRecord, CardType};
pub use discovery::{DiscoveryInfo, Role, PROTOCOL_VERSION, SERVICE_TYPE};
pub use error::CodecError;
pub use ids::{PeerId, PeerIdentity};
pub use messages::{MessageType, SyncMessage};
