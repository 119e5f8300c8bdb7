//! Persistence seam for the sync coordinator.
//!
//! The coordinator never owns storage. The application installs a
//! [`CardStore`] handle and the coordinator reads it afresh for every
//! operation, so the handle can be swapped at any time.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use cardsync_types::CardRecord;
use uuid::Uuid;

use crate::error::StoreError;

/// Card persistence used by the coordinator.
///
/// Writes are staged until [`CardStore::commit`]. Reads observe staged
/// writes.
#[async_trait]
pub trait CardStore: Send + Sync {
    /// Cards with `is_synced == false` that are not pending deletion.
    async fn fetch_unsynced(&self) -> Result<Vec<CardRecord>, StoreError>;

    /// Cards flagged for deletion whose removal has not reached a peer.
    async fn fetch_pending_deletions(&self) -> Result<Vec<CardRecord>, StoreError>;

    /// Look up a card by id.
    async fn find(&self, id: Uuid) -> Result<Option<CardRecord>, StoreError>;

    /// Insert or replace a card, keyed by id.
    async fn upsert(&self, card: CardRecord) -> Result<(), StoreError>;

    /// Remove a card. Removing an unknown id is not an error.
    async fn delete(&self, id: Uuid) -> Result<(), StoreError>;

    /// Flag a card for deletion once a peer has been told.
    async fn mark_pending_deletion(&self, id: Uuid) -> Result<(), StoreError>;

    /// Persist staged changes.
    async fn commit(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct StoredCard {
    card: CardRecord,
    pending_deletion: bool,
}

#[derive(Debug, Default)]
struct MemoryStoreInner {
    working: BTreeMap<Uuid, StoredCard>,
    committed: BTreeMap<Uuid, StoredCard>,
    commits: usize,
    fail_next_commit: Option<String>,
}

/// In-memory [`CardStore`] for tests and simulation.
///
/// Clones share state. A failed commit leaves the staged changes in place;
/// they are not rolled back.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryStoreInner>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryStoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed a card as if it had been saved earlier.
    pub fn insert_committed(&self, card: CardRecord) {
        let mut inner = self.lock();
        let stored = StoredCard {
            card,
            pending_deletion: false,
        };
        inner.working.insert(stored.card.id, stored.clone());
        inner.committed.insert(stored.card.id, stored);
    }

    /// Committed cards, pending deletions included.
    pub fn cards(&self) -> Vec<CardRecord> {
        self.lock()
            .committed
            .values()
            .map(|stored| stored.card.clone())
            .collect()
    }

    /// A committed card by id.
    pub fn get(&self, id: Uuid) -> Option<CardRecord> {
        self.lock().committed.get(&id).map(|stored| stored.card.clone())
    }

    /// Whether the committed copy of `id` is flagged for deletion.
    pub fn is_pending_deletion(&self, id: Uuid) -> bool {
        self.lock()
            .committed
            .get(&id)
            .is_some_and(|stored| stored.pending_deletion)
    }

    /// Number of successful commits.
    pub fn commits(&self) -> usize {
        self.lock().commits
    }

    /// Cause the next `commit()` to fail with the given error.
    pub fn fail_next_commit(&self, error: &str) {
        self.lock().fail_next_commit = Some(error.to_string());
    }
}

#[async_trait]
impl CardStore for MemoryStore {
    async fn fetch_unsynced(&self) -> Result<Vec<CardRecord>, StoreError> {
        Ok(self
            .lock()
            .working
            .values()
            .filter(|stored| !stored.card.is_synced && !stored.pending_deletion)
            .map(|stored| stored.card.clone())
            .collect())
    }

    async fn fetch_pending_deletions(&self) -> Result<Vec<CardRecord>, StoreError> {
        Ok(self
            .lock()
            .working
            .values()
            .filter(|stored| stored.pending_deletion)
            .map(|stored| stored.card.clone())
            .collect())
    }

    async fn find(&self, id: Uuid) -> Result<Option<CardRecord>, StoreError> {
        Ok(self.lock().working.get(&id).map(|stored| stored.card.clone()))
    }

    async fn upsert(&self, card: CardRecord) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let pending_deletion = inner
            .working
            .get(&card.id)
            .is_some_and(|stored| stored.pending_deletion);
        inner.working.insert(
            card.id,
            StoredCard {
                card,
                pending_deletion,
            },
        );
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        self.lock().working.remove(&id);
        Ok(())
    }

    async fn mark_pending_deletion(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let stored = inner.working.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        stored.pending_deletion = true;
        Ok(())
    }

    async fn commit(&self) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if let Some(error) = inner.fail_next_commit.take() {
            return Err(StoreError::CommitFailed(error));
        }
        inner.committed = inner.working.clone();
        inner.commits += 1;
        Ok(())
    }
}
