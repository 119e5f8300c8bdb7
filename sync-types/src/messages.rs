//! The sync message envelope and its JSON codec.
//!
//! Every frame exchanged between peers is one [`SyncMessage`]:
//!
//! ```json
//! { "type": "cardCreated", "cardData": { ... } | null, "timestamp": "2025-01-15T08:00:00Z" }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::{CardRecord, CodecError};

/// Message type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    /// A card was created on the sender
    CardCreated,
    /// A card was edited on the sender
    CardUpdated,
    /// A card was deleted on the sender
    CardDeleted,
    /// Ask the receiver to push its pending queue
    SyncRequest,
    /// The receiver finished answering a sync request
    SyncResponse,
}

impl MessageType {
    /// Wire name of this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::CardCreated => "cardCreated",
            MessageType::CardUpdated => "cardUpdated",
            MessageType::CardDeleted => "cardDeleted",
            MessageType::SyncRequest => "syncRequest",
            MessageType::SyncResponse => "syncResponse",
        }
    }

    /// Whether messages of this type carry a card.
    pub fn carries_card(&self) -> bool {
        matches!(
            self,
            MessageType::CardCreated | MessageType::CardUpdated | MessageType::CardDeleted
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The protocol envelope.
///
/// `card_data` is present exactly when [`MessageType::carries_card`] holds;
/// the constructors guarantee it and [`SyncMessage::from_bytes`] checks it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMessage {
    /// What happened.
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// The card, for card changes.
    pub card_data: Option<CardRecord>,
    /// When the sender built the message.
    pub timestamp: DateTime<Utc>,
}

impl SyncMessage {
    fn build(message_type: MessageType, card_data: Option<CardRecord>) -> Self {
        Self {
            message_type,
            card_data,
            timestamp: Utc::now(),
        }
    }

    /// Announce a new card.
    pub fn card_created(card: CardRecord) -> Self {
        Self::build(MessageType::CardCreated, Some(card))
    }

    /// Announce an edited card.
    pub fn card_updated(card: CardRecord) -> Self {
        Self::build(MessageType::CardUpdated, Some(card))
    }

    /// Announce a deleted card. The payload carries the id only.
    pub fn card_deleted(id: Uuid) -> Self {
        Self::build(MessageType::CardDeleted, Some(CardRecord::tombstone(id)))
    }

    /// Ask the peer to push whatever it has pending.
    pub fn sync_request() -> Self {
        Self::build(MessageType::SyncRequest, None)
    }

    /// Signal that a sync request has been served.
    pub fn sync_response() -> Self {
        Self::build(MessageType::SyncResponse, None)
    }

    /// Override the timestamp (replays, tests).
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Check the payload invariant.
    pub fn validate(&self) -> Result<(), CodecError> {
        match (self.message_type.carries_card(), self.card_data.is_some()) {
            (true, false) => Err(CodecError::MissingPayload(self.message_type)),
            (false, true) => Err(CodecError::UnexpectedPayload(self.message_type)),
            _ => Ok(()),
        }
    }

    /// Serialize to JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        self.validate()?;
        serde_json::to_vec(self).map_err(CodecError::Serialization)
    }

    /// Serialize to JSON bytes, refusing inline images above `max_image_bytes`.
    pub fn encode_with_limit(&self, max_image_bytes: Option<usize>) -> Result<Vec<u8>, CodecError> {
        if let (Some(limit), Some(card)) = (max_image_bytes, &self.card_data) {
            let size = card.image_len();
            if size > limit {
                return Err(CodecError::ImageTooLarge { size, limit });
            }
        }
        self.to_bytes()
    }

    /// Deserialize from JSON bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let message: Self = serde_json::from_slice(bytes).map_err(CodecError::Deserialization)?;
        message.validate()?;
        Ok(message)
    }
}
