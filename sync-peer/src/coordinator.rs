//! Sync coordinator: local mutations out, peer messages in.
//!
//! Outbound, a card change becomes a [`SyncMessage`] sent to every connected
//! peer; with nobody connected it stays in the pending queue (unsynced cards
//! and cards flagged for deletion). Inbound, messages are applied to the
//! active store by id with last-writer-wins semantics.
//!
//! The store handle is read from the active slot on every call and never
//! kept across calls.

use std::sync::{Arc, PoisonError, RwLock};

use cardsync_core::{resolve, ChangeType, ConflictPolicy, Resolution};
use cardsync_types::{CardRecord, MessageType, PeerIdentity, SyncMessage};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{NodeError, StoreError};
use crate::events::{EventBus, NodeEvent};
use crate::session::{SessionManager, SessionSignal};
use crate::store::CardStore;

/// Turns card changes into messages and messages into card changes.
pub struct SyncCoordinator {
    manager: Arc<SessionManager>,
    bus: EventBus,
    policy: ConflictPolicy,
    max_image_bytes: Option<usize>,
    store: RwLock<Option<Arc<dyn CardStore>>>,
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("policy", &self.policy)
            .field("max_image_bytes", &self.max_image_bytes)
            .finish_non_exhaustive()
    }
}

impl SyncCoordinator {
    /// Create a coordinator sending through `manager`.
    pub fn new(
        manager: Arc<SessionManager>,
        bus: EventBus,
        policy: ConflictPolicy,
        max_image_bytes: Option<usize>,
    ) -> Self {
        Self {
            manager,
            bus,
            policy,
            max_image_bytes,
            store: RwLock::new(None),
        }
    }

    /// Install the persistence handle used from now on.
    pub fn set_active_store(&self, store: Arc<dyn CardStore>) {
        *self.store.write().unwrap_or_else(PoisonError::into_inner) = Some(store);
    }

    /// Remove the persistence handle. Inbound cards are dropped until a new
    /// one is installed.
    pub fn clear_active_store(&self) {
        *self.store.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// The currently installed persistence handle.
    pub fn active_store(&self) -> Option<Arc<dyn CardStore>> {
        self.store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn require_store(&self) -> Result<Arc<dyn CardStore>, NodeError> {
        self.active_store().ok_or(NodeError::NoActiveStore)
    }

    // ===========================================
    // Outbound
    // ===========================================

    /// Send `card` to every connected peer.
    ///
    /// Returns false when nobody is connected or sending failed; the caller
    /// keeps the card in the pending queue. Failures are reported through
    /// the event bus.
    pub async fn broadcast(&self, card: &CardRecord, change: ChangeType) -> bool {
        let message = change.message(card.clone());
        self.send_message(&message).await
    }

    async fn send_message(&self, message: &SyncMessage) -> bool {
        if self.manager.connected_peers().await.is_empty() {
            debug!(kind = %message.message_type, "no connected peers, not sending");
            return false;
        }

        let bytes = match message.encode_with_limit(self.max_image_bytes) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(kind = %message.message_type, error = %e, "could not encode message");
                self.bus.publish(NodeEvent::sync_failed(&e));
                return false;
            }
        };

        match self.manager.send(&bytes).await {
            Ok(0) => false,
            Ok(peers) => {
                debug!(kind = %message.message_type, peers, "message sent");
                true
            }
            Err(e) => {
                warn!(kind = %message.message_type, error = %e, "send failed");
                self.bus.publish(NodeEvent::sync_failed(&e));
                false
            }
        }
    }

    /// Save a local change and try to send it.
    ///
    /// The card is stored unsynced first; if the broadcast succeeds it is
    /// marked synced. Returns whether a peer received it.
    pub async fn save_card(&self, mut card: CardRecord, change: ChangeType) -> Result<bool, NodeError> {
        let store = self.require_store()?;
        card.is_synced = false;
        store.upsert(card.clone()).await?;
        store.commit().await?;

        if !self.broadcast(&card, change).await {
            debug!(card = %card.id, "card queued until a peer connects");
            return Ok(false);
        }
        card.mark_synced(Utc::now());
        store.upsert(card).await?;
        store.commit().await?;
        Ok(true)
    }

    /// Delete a card locally and tell peers.
    ///
    /// With no peer reachable the card is flagged for deletion and removed
    /// once a later broadcast succeeds. Returns whether a peer was told;
    /// deleting an unknown card is a no-op.
    pub async fn delete_card(&self, id: Uuid) -> Result<bool, NodeError> {
        let store = self.require_store()?;
        let Some(card) = store.find(id).await? else {
            return Ok(false);
        };

        let told = self.broadcast(&card, ChangeType::Deleted).await;
        if told {
            store.delete(id).await?;
        } else {
            debug!(card = %id, "deletion queued until a peer connects");
            store.mark_pending_deletion(id).await?;
        }
        store.commit().await?;
        Ok(told)
    }

    /// Broadcast every unsynced card, marking each synced on success.
    ///
    /// Returns how many were delivered; the rest stay queued.
    pub async fn sync_pending_cards(&self, store: &dyn CardStore) -> Result<usize, StoreError> {
        let pending = store.fetch_unsynced().await?;
        if pending.is_empty() {
            return Ok(0);
        }

        let mut synced = 0;
        for mut card in pending {
            if self.broadcast(&card, ChangeType::Created).await {
                card.mark_synced(Utc::now());
                store.upsert(card).await?;
                synced += 1;
            }
        }
        if synced > 0 {
            store.commit().await?;
        }
        info!(synced, "pending cards synced");
        Ok(synced)
    }

    /// Broadcast every pending deletion, deleting locally on success.
    ///
    /// Returns how many were delivered; the rest keep their flag.
    pub async fn sync_pending_deletions(&self, store: &dyn CardStore) -> Result<usize, StoreError> {
        let pending = store.fetch_pending_deletions().await?;
        if pending.is_empty() {
            return Ok(0);
        }

        let mut deleted = 0;
        for card in pending {
            if self.broadcast(&card, ChangeType::Deleted).await {
                store.delete(card.id).await?;
                deleted += 1;
            }
        }
        if deleted > 0 {
            store.commit().await?;
        }
        info!(deleted, "pending deletions synced");
        Ok(deleted)
    }

    async fn drain_pending(&self, store: &dyn CardStore) {
        if let Err(e) = self.sync_pending_cards(store).await {
            warn!(error = %e, "syncing pending cards failed");
            self.bus.publish(NodeEvent::sync_failed(&e));
        }
        if let Err(e) = self.sync_pending_deletions(store).await {
            warn!(error = %e, "syncing pending deletions failed");
            self.bus.publish(NodeEvent::sync_failed(&e));
        }
    }

    /// Catch up a newly connected peer with everything pending.
    pub async fn on_peer_connected(&self, peer: &PeerIdentity) {
        let Some(store) = self.active_store() else {
            debug!(peer = %peer, "no active store, skipping catch-up");
            return;
        };
        debug!(peer = %peer, "catching up peer");
        self.drain_pending(store.as_ref()).await;
    }

    /// Drain the pending queue now. Returns false without an active store.
    pub async fn sync_now(&self) -> bool {
        match self.active_store() {
            Some(store) => {
                self.drain_pending(store.as_ref()).await;
                true
            }
            None => false,
        }
    }

    /// Ask connected peers to push their pending changes.
    pub async fn request_sync(&self) -> bool {
        self.send_message(&SyncMessage::sync_request()).await
    }

    // ===========================================
    // Inbound
    // ===========================================

    /// Apply an inbound card under the configured conflict policy.
    ///
    /// Reports the outcome on the event bus.
    pub async fn apply_inbound(
        &self,
        store: &dyn CardStore,
        card: &CardRecord,
        sent_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let existing = store.find(card.id).await?;
        let applied = match resolve(existing.as_ref(), card, sent_at, self.policy) {
            Resolution::Insert(card) | Resolution::Overwrite(card) => card,
            Resolution::Ignore => {
                debug!(card = %card.id, "ignoring stale update");
                return Ok(());
            }
        };

        store.upsert(applied.clone()).await?;
        store.commit().await?;
        debug!(card = %applied.id, "card applied");
        self.bus.publish(NodeEvent::CardReceived(applied));
        self.bus.publish(NodeEvent::sync_ok());
        Ok(())
    }

    /// Apply an inbound deletion. Unknown ids are a no-op.
    pub async fn apply_deletion(&self, store: &dyn CardStore, id: Uuid) -> Result<(), StoreError> {
        if store.find(id).await?.is_none() {
            debug!(card = %id, "deletion for unknown card");
            return Ok(());
        }
        store.delete(id).await?;
        store.commit().await?;
        debug!(card = %id, "card deleted by peer");
        self.bus.publish(NodeEvent::CardDeleted(id));
        Ok(())
    }

    /// Decode and apply a message from `from`.
    ///
    /// Malformed messages are logged and dropped.
    pub async fn handle_message(&self, from: &PeerIdentity, data: &[u8]) {
        let message = match SyncMessage::from_bytes(data) {
            Ok(message) => message,
            Err(e) => {
                warn!(peer = %from, error = %e, "dropping malformed message");
                return;
            }
        };
        debug!(peer = %from, kind = %message.message_type, "message received");

        match message.message_type {
            MessageType::CardCreated | MessageType::CardUpdated | MessageType::CardDeleted => {
                let Some(card) = message.card_data.as_ref() else {
                    return;
                };
                let Some(store) = self.active_store() else {
                    warn!(peer = %from, card = %card.id, "no active store, dropping card");
                    return;
                };
                let result = if message.message_type == MessageType::CardDeleted {
                    self.apply_deletion(store.as_ref(), card.id).await
                } else {
                    self.apply_inbound(store.as_ref(), card, message.timestamp)
                        .await
                };
                if let Err(e) = result {
                    warn!(peer = %from, card = %card.id, error = %e, "applying card failed");
                    self.bus.publish(NodeEvent::sync_failed(&e));
                }
            }
            MessageType::SyncRequest => {
                if let Some(store) = self.active_store() {
                    self.drain_pending(store.as_ref()).await;
                }
                let reply = SyncMessage::sync_response();
                let sent = match reply.to_bytes() {
                    Ok(bytes) => self.manager.send_to(&from.id, &bytes).await,
                    Err(e) => {
                        warn!(error = %e, "could not encode sync response");
                        return;
                    }
                };
                if let Err(e) = sent {
                    warn!(peer = %from, error = %e, "could not answer sync request");
                    self.bus.publish(NodeEvent::sync_failed(&e));
                }
            }
            MessageType::SyncResponse => {
                info!(peer = %from, "peer finished sync");
                self.bus.publish(NodeEvent::sync_ok());
            }
        }
    }

    /// Act on signals produced by the session manager.
    pub async fn handle_signals(&self, signals: Vec<SessionSignal>) {
        for signal in signals {
            match signal {
                SessionSignal::PeerConnected(peer) => self.on_peer_connected(&peer).await,
                SessionSignal::Message { from, data } => self.handle_message(&from, &data).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::store::MemoryStore;
    use crate::transport::MemoryNetwork;
    use cardsync_types::Role;
    use chrono::TimeZone;

    struct Fixture {
        network: MemoryNetwork,
        coordinator: SyncCoordinator,
        store: MemoryStore,
        events: tokio::sync::broadcast::Receiver<NodeEvent>,
        peer: PeerIdentity,
    }

    /// A client coordinator whose manager is connected to one server peer
    /// without going through discovery.
    async fn connected_fixture(policy: ConflictPolicy) -> Fixture {
        let network = MemoryNetwork::new();
        let bus = EventBus::new(64);
        let config = NodeConfig::default()
            .with_device_name("phone")
            .with_role(Role::Client);
        let (manager, _rx) = SessionManager::new(
            &config,
            PeerIdentity::new("phone"),
            Arc::new(network.clone()),
            bus.clone(),
        );
        let manager = Arc::new(manager);
        manager.start().await.unwrap();

        // The remote side only needs a live session to receive bytes.
        let peer = PeerIdentity::new("Studio Mac");
        let (tx, _remote_rx) = tokio::sync::mpsc::unbounded_channel();
        let _remote = crate::transport::Transport::open_session(
            &network,
            &peer,
            "memoread-sync",
            crate::transport::EventSink::new(1, tx),
        )
        .await
        .unwrap();
        network.force_connect(&manager.identity().id, &peer.id, false);
        manager.reconcile_health().await;

        let events = bus.subscribe();
        let coordinator = SyncCoordinator::new(manager, bus, policy, Some(1024));
        let store = MemoryStore::new();
        coordinator.set_active_store(Arc::new(store.clone()));
        Fixture {
            network,
            coordinator,
            store,
            events,
            peer,
        }
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<NodeEvent>) -> Vec<NodeEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn broadcast_without_peers_returns_false() {
        let network = MemoryNetwork::new();
        let bus = EventBus::new(8);
        let (manager, _rx) = SessionManager::new(
            &NodeConfig::default(),
            PeerIdentity::new("phone"),
            Arc::new(network),
            bus.clone(),
        );
        let coordinator = SyncCoordinator::new(Arc::new(manager), bus, ConflictPolicy::default(), None);

        assert!(!coordinator.broadcast(&CardRecord::new("x"), ChangeType::Created).await);
    }

    #[tokio::test]
    async fn broadcast_reaches_connected_peer() {
        let f = connected_fixture(ConflictPolicy::default()).await;
        let card = CardRecord::new("hello");

        assert!(f.coordinator.broadcast(&card, ChangeType::Created).await);

        let sent = f.network.sent_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, f.peer.id);
        let message = SyncMessage::from_bytes(&sent[0].2).unwrap();
        assert_eq!(message.message_type, MessageType::CardCreated);
        assert_eq!(message.card_data.unwrap().id, card.id);
    }

    #[tokio::test]
    async fn send_failure_is_reported() {
        let mut f = connected_fixture(ConflictPolicy::default()).await;
        f.network.fail_next_send("radio off");
        drain(&mut f.events);

        assert!(!f.coordinator.broadcast(&CardRecord::new("x"), ChangeType::Created).await);
        assert!(matches!(
            drain(&mut f.events).as_slice(),
            [NodeEvent::SyncCompleted { success: false, error: Some(_) }]
        ));
    }

    #[tokio::test]
    async fn oversized_image_is_rejected() {
        let mut f = connected_fixture(ConflictPolicy::default()).await;
        drain(&mut f.events);
        let card = CardRecord::new("photo").with_image(&[7u8; 4096]);

        assert!(!f.coordinator.broadcast(&card, ChangeType::Created).await);
        assert!(f.network.sent_messages().is_empty());
        assert!(matches!(
            drain(&mut f.events).as_slice(),
            [NodeEvent::SyncCompleted { success: false, .. }]
        ));
    }

    #[tokio::test]
    async fn save_card_marks_synced_when_delivered() {
        let f = connected_fixture(ConflictPolicy::default()).await;
        let card = CardRecord::new("hello");

        assert!(f.coordinator.save_card(card.clone(), ChangeType::Created).await.unwrap());

        let stored = f.store.get(card.id).unwrap();
        assert!(stored.is_synced);
        assert!(stored.last_synced_at.is_some());
    }

    #[tokio::test]
    async fn pending_queue_drains() {
        let f = connected_fixture(ConflictPolicy::default()).await;
        let cards: Vec<CardRecord> = (0..3).map(|i| CardRecord::new(format!("card {i}"))).collect();
        for card in &cards {
            f.store.insert_committed(card.clone());
        }

        let synced = f.coordinator.sync_pending_cards(&f.store).await.unwrap();

        assert_eq!(synced, 3);
        for card in &cards {
            let stored = f.store.get(card.id).unwrap();
            assert!(stored.is_synced);
            assert!(stored.last_synced_at.is_some());
        }
    }

    #[tokio::test]
    async fn failed_send_leaves_card_queued() {
        let f = connected_fixture(ConflictPolicy::default()).await;
        let first = CardRecord::new("first");
        f.store.insert_committed(first.clone());
        f.network.fail_next_send("radio off");

        let synced = f.coordinator.sync_pending_cards(&f.store).await.unwrap();

        assert_eq!(synced, 0);
        assert!(!f.store.get(first.id).unwrap().is_synced);
    }

    #[tokio::test]
    async fn pending_deletions_drain() {
        let f = connected_fixture(ConflictPolicy::default()).await;
        let card = CardRecord::new("bye");
        f.store.insert_committed(card.clone());
        f.store.mark_pending_deletion(card.id).await.unwrap();
        f.store.commit().await.unwrap();

        let deleted = f.coordinator.sync_pending_deletions(&f.store).await.unwrap();

        assert_eq!(deleted, 1);
        assert!(f.store.get(card.id).is_none());
    }

    #[tokio::test]
    async fn card_with_oversized_image_can_be_deleted() {
        let f = connected_fixture(ConflictPolicy::default()).await;
        let card = CardRecord::new("photo").with_image(&[7u8; 4096]);
        f.store.insert_committed(card.clone());

        assert!(f.coordinator.delete_card(card.id).await.unwrap());

        assert!(f.store.get(card.id).is_none());
        let sent = f.network.sent_messages();
        assert_eq!(sent.len(), 1);
        let message = SyncMessage::from_bytes(&sent[0].2).unwrap();
        assert_eq!(message.message_type, MessageType::CardDeleted);
        let payload = message.card_data.unwrap();
        assert_eq!(payload.id, card.id);
        assert!(payload.image_data_base64.is_none());
    }

    #[tokio::test]
    async fn queued_deletion_of_oversized_card_drains() {
        let f = connected_fixture(ConflictPolicy::default()).await;
        let card = CardRecord::new("photo").with_image(&[7u8; 4096]);
        f.store.insert_committed(card.clone());
        f.store.mark_pending_deletion(card.id).await.unwrap();
        f.store.commit().await.unwrap();

        let deleted = f.coordinator.sync_pending_deletions(&f.store).await.unwrap();

        assert_eq!(deleted, 1);
        assert!(f.store.get(card.id).is_none());
    }

    #[tokio::test]
    async fn apply_inbound_twice_is_idempotent() {
        let f = connected_fixture(ConflictPolicy::default()).await;
        let card = CardRecord::new("remote");

        f.coordinator.apply_inbound(&f.store, &card, at(1)).await.unwrap();
        let once = f.store.get(card.id).unwrap();
        f.coordinator.apply_inbound(&f.store, &card, at(1)).await.unwrap();
        let twice = f.store.get(card.id).unwrap();

        assert_eq!(once, twice);
        assert!(once.is_synced);
        assert_eq!(once.last_synced_at, Some(at(1)));
    }

    #[tokio::test]
    async fn apply_deletion_of_unknown_card_is_noop() {
        let mut f = connected_fixture(ConflictPolicy::default()).await;
        drain(&mut f.events);

        f.coordinator
            .apply_deletion(&f.store, Uuid::new_v4())
            .await
            .unwrap();

        assert!(drain(&mut f.events).is_empty());
        assert_eq!(f.store.commits(), 0);
    }

    #[tokio::test]
    async fn commit_failure_is_reported() {
        let mut f = connected_fixture(ConflictPolicy::default()).await;
        drain(&mut f.events);
        f.store.fail_next_commit("disk full");

        let bytes = SyncMessage::card_created(CardRecord::new("remote")).to_bytes().unwrap();
        f.coordinator.handle_message(&f.peer, &bytes).await;

        assert_eq!(
            drain(&mut f.events),
            vec![NodeEvent::sync_failed("commit failed: disk full")]
        );
    }

    #[tokio::test]
    async fn malformed_message_is_dropped() {
        let mut f = connected_fixture(ConflictPolicy::default()).await;
        drain(&mut f.events);

        f.coordinator.handle_message(&f.peer, b"{not json").await;

        assert!(drain(&mut f.events).is_empty());
        assert!(f.store.cards().is_empty());
    }

    #[tokio::test]
    async fn newest_message_policy_ignores_stale_update() {
        let f = connected_fixture(ConflictPolicy::NewestMessage).await;
        let card = CardRecord::new("v2");
        f.coordinator.apply_inbound(&f.store, &card, at(10)).await.unwrap();

        let mut older = card.clone();
        older.content = "v1".into();
        f.coordinator.apply_inbound(&f.store, &older, at(5)).await.unwrap();

        assert_eq!(f.store.get(card.id).unwrap().content, "v2");
    }

    #[tokio::test]
    async fn sync_request_is_answered_to_requester() {
        let f = connected_fixture(ConflictPolicy::default()).await;
        let pending = CardRecord::new("queued");
        f.store.insert_committed(pending.clone());

        let bytes = SyncMessage::sync_request().to_bytes().unwrap();
        f.coordinator.handle_message(&f.peer, &bytes).await;

        let kinds: Vec<MessageType> = f
            .network
            .sent_messages()
            .iter()
            .map(|(_, to, data)| {
                assert_eq!(*to, f.peer.id);
                SyncMessage::from_bytes(data).unwrap().message_type
            })
            .collect();
        assert_eq!(kinds, vec![MessageType::CardCreated, MessageType::SyncResponse]);
        assert!(f.store.get(pending.id).unwrap().is_synced);
    }

    #[tokio::test]
    async fn operations_need_a_store() {
        let f = connected_fixture(ConflictPolicy::default()).await;
        f.coordinator.clear_active_store();

        assert!(matches!(
            f.coordinator.save_card(CardRecord::new("x"), ChangeType::Created).await,
            Err(NodeError::NoActiveStore)
        ));
        assert!(!f.coordinator.sync_now().await);
    }
}
