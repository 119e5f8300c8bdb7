//! Error types for the cardsync wire format.

use thiserror::Error;

use crate::MessageType;

/// Errors that can occur while encoding or decoding protocol messages.
#[derive(Debug, Error)]
pub enum CodecError {
    /// JSON serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] serde_json::Error),

    /// JSON deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] serde_json::Error),

    /// Card type discriminator outside the known range
    #[error("invalid card type: {0}")]
    InvalidCardType(i64),

    /// A card change message arrived without its card
    #[error("{0} message requires card data")]
    MissingPayload(MessageType),

    /// A control message carried a card it must not carry
    #[error("{0} message must not carry card data")]
    UnexpectedPayload(MessageType),

    /// Inline image exceeds the configured ceiling
    #[error("image too large: {size} bytes (limit: {limit} bytes)")]
    ImageTooLarge {
        /// Decoded image size.
        size: usize,
        /// Maximum allowed size.
        limit: usize,
    },

    /// Inline image is not valid base64
    #[error("invalid image data: {0}")]
    InvalidImage(String),
}
