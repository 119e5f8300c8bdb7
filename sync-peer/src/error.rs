//! Error types for cardsync-peer.

use thiserror::Error;
use uuid::Uuid;

use crate::config::ConfigError;
use crate::transport::TransportError;

/// Persistence errors reported by a [`CardStore`](crate::CardStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// No card with this id.
    #[error("card {0} not found")]
    NotFound(Uuid),

    /// Saving staged changes failed.
    #[error("commit failed: {0}")]
    CommitFailed(String),

    /// Backend-specific failure.
    #[error("storage error: {0}")]
    Backend(String),
}

/// Errors returned by [`PeerNode`](crate::PeerNode) operations.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Persistence error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Message encoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] cardsync_types::CodecError),

    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// No persistence handle is installed.
    #[error("no active store")]
    NoActiveStore,
}
