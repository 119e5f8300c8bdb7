//! The card record, the unit of synchronized user data.

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::CodecError;

/// Kind of content a card holds.
///
/// Travels on the wire as its integer discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum CardType {
    /// Free-form text
    #[default]
    Text = 0,
    /// A web link
    Link = 1,
    /// An inline image
    Image = 2,
}

impl TryFrom<i64> for CardType {
    type Error = CodecError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CardType::Text),
            1 => Ok(CardType::Link),
            2 => Ok(CardType::Image),
            _ => Err(CodecError::InvalidCardType(value)),
        }
    }
}

impl From<CardType> for i64 {
    fn from(value: CardType) -> Self {
        value as i64
    }
}

/// Leading bytes of the image formats a card may inline.
const IMAGE_SIGNATURES: &[&[u8]] = &[
    b"\x89PNG\r\n\x1a\n",
    b"\xff\xd8\xff",
    b"GIF87a",
    b"GIF89a",
    b"RIFF",
];

impl CardType {
    /// Classify raw card content the way the editor does on creation.
    pub fn detect(content: &str) -> Self {
        let trimmed = content.trim();
        if is_web_link(trimmed) {
            CardType::Link
        } else if is_inline_image(trimmed) {
            CardType::Image
        } else {
            CardType::Text
        }
    }

    /// Human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            CardType::Text => "Text",
            CardType::Link => "Link",
            CardType::Image => "Image",
        }
    }
}

fn is_web_link(content: &str) -> bool {
    let rest = content
        .strip_prefix("https://")
        .or_else(|| content.strip_prefix("http://"));
    match rest {
        Some(rest) => !rest.is_empty() && !rest.contains(char::is_whitespace),
        None => false,
    }
}

fn is_inline_image(content: &str) -> bool {
    match STANDARD.decode(content) {
        Ok(bytes) => IMAGE_SIGNATURES.iter().any(|sig| bytes.starts_with(sig)),
        Err(_) => false,
    }
}

fn default_synced() -> bool {
    true
}

/// Wire form of a local card.
///
/// `id` is the reconciliation key: records are matched by id, never by
/// content. Optional fields default so that older senders, which predate
/// completion, image, and sync tracking, still decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardRecord {
    /// Stable identifier, preserved across devices and never reused.
    pub id: Uuid,
    /// Card body.
    pub content: String,
    /// Content kind.
    #[serde(rename = "type")]
    pub card_type: CardType,
    /// When the card was first created.
    pub created_at: DateTime<Utc>,
    /// Optional reminder time.
    pub reminder_at: Option<DateTime<Utc>>,
    /// When the card was marked done.
    pub completed_at: Option<DateTime<Utc>>,
    /// Completion flag.
    #[serde(default)]
    pub is_completed: bool,
    /// Inline image, standard base64.
    #[serde(rename = "imageDataBase64", default)]
    pub image_data_base64: Option<String>,
    /// Whether every connected peer has seen the latest local state.
    #[serde(default = "default_synced")]
    pub is_synced: bool,
    /// Timestamp of the last successful exchange.
    #[serde(default)]
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl CardRecord {
    /// Create a fresh local card, not yet synced.
    pub fn new(content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            id: Uuid::new_v4(),
            card_type: CardType::detect(&content),
            content,
            created_at: Utc::now(),
            reminder_at: None,
            completed_at: None,
            is_completed: false,
            image_data_base64: None,
            is_synced: false,
            last_synced_at: None,
        }
    }

    /// Id-only placeholder carried by deletion messages.
    pub fn tombstone(id: Uuid) -> Self {
        Self {
            id,
            ..Self::new("")
        }
    }

    /// Attach an image, encoding it as base64.
    pub fn with_image(mut self, bytes: &[u8]) -> Self {
        self.image_data_base64 = Some(STANDARD.encode(bytes));
        self.card_type = CardType::Image;
        self
    }

    /// Set a reminder.
    pub fn with_reminder(mut self, at: DateTime<Utc>) -> Self {
        self.reminder_at = Some(at);
        self
    }

    /// Decode the inline image, if any.
    pub fn image_bytes(&self) -> Result<Option<Vec<u8>>, CodecError> {
        self.image_data_base64
            .as_deref()
            .map(|encoded| {
                STANDARD
                    .decode(encoded)
                    .map_err(|e| CodecError::InvalidImage(e.to_string()))
            })
            .transpose()
    }

    /// Decoded image size in bytes, computed from the base64 length.
    pub fn image_len(&self) -> usize {
        self.image_data_base64
            .as_deref()
            .map(|encoded| {
                let data = encoded.trim_end_matches('=').len();
                data * 3 / 4
            })
            .unwrap_or(0)
    }

    /// Mark completed (or not), keeping `completed_at` consistent.
    pub fn set_completed(&mut self, completed: bool) {
        self.is_completed = completed;
        self.completed_at = completed.then(Utc::now);
    }

    /// Record a successful exchange at `at`.
    pub fn mark_synced(&mut self, at: DateTime<Utc>) {
        self.is_synced = true;
        self.last_synced_at = Some(at);
    }
}
