//! Conflict resolution for inbound cards.
//!
//! Records are matched by id. An inbound card either inserts a new record
//! (keeping the sender's id) or overwrites every mutable field of the local
//! one. There is no per-field merge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cardsync_types::{CardRecord, SyncMessage};

/// Kind of local mutation being broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    /// A new card.
    Created,
    /// An edited card.
    Updated,
    /// A removed card.
    Deleted,
}

impl ChangeType {
    /// Wrap `card` in the matching message.
    pub fn message(self, card: CardRecord) -> SyncMessage {
        match self {
            Self::Created => SyncMessage::card_created(card),
            Self::Updated => SyncMessage::card_updated(card),
            Self::Deleted => SyncMessage::card_deleted(card.id),
        }
    }
}

/// How conflicting updates to the same card are ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Last applied wins, regardless of when the message was built.
    #[default]
    ArrivalOrder,
    /// Skip an inbound update built before the local copy was last synced.
    NewestMessage,
}

/// What to do with an inbound card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// No local record; insert this one.
    Insert(CardRecord),
    /// Replace the local record with this one.
    Overwrite(CardRecord),
    /// Keep the local record.
    Ignore,
}

/// Resolve an inbound card against the local record with the same id.
///
/// `sent_at` is the message timestamp. It becomes `last_synced_at`, so
/// applying the same message twice yields the same record.
pub fn resolve(
    existing: Option<&CardRecord>,
    inbound: &CardRecord,
    sent_at: DateTime<Utc>,
    policy: ConflictPolicy,
) -> Resolution {
    let mut incoming = inbound.clone();
    incoming.mark_synced(sent_at);

    let Some(local) = existing else {
        return Resolution::Insert(incoming);
    };

    if policy == ConflictPolicy::NewestMessage
        && local.last_synced_at.is_some_and(|synced| synced > sent_at)
    {
        return Resolution::Ignore;
    }

    Resolution::Overwrite(incoming)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cardsync_types::{CardType, MessageType};
    use chrono::{Duration, TimeZone};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn unknown_card_is_inserted_with_its_id() {
        let inbound = CardRecord::new("hello");
        match resolve(None, &inbound, at(0), ConflictPolicy::ArrivalOrder) {
            Resolution::Insert(card) => {
                assert_eq!(card.id, inbound.id);
                assert!(card.is_synced);
                assert_eq!(card.last_synced_at, Some(at(0)));
            }
            other => panic!("expected insert, got {:?}", other),
        }
    }

    #[test]
    fn known_card_is_overwritten() {
        let mut local = CardRecord::new("old");
        local.is_synced = false;
        let mut inbound = local.clone();
        inbound.content = "https://example.com".into();
        inbound.card_type = CardType::Link;
        inbound.set_completed(true);

        match resolve(Some(&local), &inbound, at(5), ConflictPolicy::ArrivalOrder) {
            Resolution::Overwrite(card) => {
                assert_eq!(card.content, "https://example.com");
                assert_eq!(card.card_type, CardType::Link);
                assert!(card.is_completed);
                assert!(card.completed_at.is_some());
                assert!(card.is_synced);
                assert_eq!(card.last_synced_at, Some(at(5)));
            }
            other => panic!("expected overwrite, got {:?}", other),
        }
    }

    #[test]
    fn applying_twice_is_idempotent() {
        let inbound = CardRecord::new("same");
        let first = match resolve(None, &inbound, at(1), ConflictPolicy::ArrivalOrder) {
            Resolution::Insert(card) => card,
            other => panic!("expected insert, got {:?}", other),
        };
        let second = match resolve(Some(&first), &inbound, at(1), ConflictPolicy::ArrivalOrder) {
            Resolution::Overwrite(card) => card,
            other => panic!("expected overwrite, got {:?}", other),
        };
        assert_eq!(first, second);
    }

    #[test]
    fn arrival_order_lets_older_message_win() {
        let mut local = CardRecord::new("newer local");
        local.mark_synced(at(10));
        let mut inbound = local.clone();
        inbound.content = "older remote".into();

        let resolution = resolve(Some(&local), &inbound, at(0), ConflictPolicy::ArrivalOrder);

        assert!(matches!(resolution, Resolution::Overwrite(card) if card.content == "older remote"));
    }

    #[test]
    fn newest_message_skips_stale_update() {
        let mut local = CardRecord::new("newer local");
        local.mark_synced(at(10));
        let mut inbound = local.clone();
        inbound.content = "older remote".into();

        assert_eq!(
            resolve(Some(&local), &inbound, at(0), ConflictPolicy::NewestMessage),
            Resolution::Ignore
        );
        assert!(matches!(
            resolve(Some(&local), &inbound, at(10) + Duration::seconds(1), ConflictPolicy::NewestMessage),
            Resolution::Overwrite(_)
        ));
    }

    #[test]
    fn change_type_builds_matching_message() {
        let card = CardRecord::new("x");
        assert_eq!(
            ChangeType::Created.message(card.clone()).message_type,
            MessageType::CardCreated
        );
        assert_eq!(
            ChangeType::Updated.message(card.clone()).message_type,
            MessageType::CardUpdated
        );
        assert_eq!(
            ChangeType::Deleted.message(card).message_type,
            MessageType::CardDeleted
        );
    }
}
