//! PeerNode - the composition root.
//!
//! A [`PeerNode`] owns one [`SessionManager`] and one [`SyncCoordinator`]
//! and runs the two background tasks that drive them: the event pump, which
//! feeds transport events through the session manager into the coordinator,
//! and the health monitor.
//!
//! # Example
//!
//! ```ignore
//! let network = MemoryNetwork::new();
//! let node = PeerNode::new(NodeConfig::default().with_role(Role::Client), Arc::new(network))?;
//! node.set_active_store(Arc::new(MemoryStore::new()));
//! let mut events = node.subscribe();
//! node.start().await?;
//! node.save_card(CardRecord::new("hello"), ChangeType::Created).await?;
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cardsync_core::{ChangeType, SessionPhase};
use cardsync_types::{CardRecord, PeerIdentity};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use crate::config::NodeConfig;
use crate::coordinator::SyncCoordinator;
use crate::error::NodeError;
use crate::events::{EventBus, NodeEvent};
use crate::health::spawn_health_monitor;
use crate::session::{EventReceiver, SessionManager};
use crate::store::CardStore;
use crate::transport::Transport;

/// One device participating in card sync.
pub struct PeerNode {
    config: NodeConfig,
    bus: EventBus,
    manager: Arc<SessionManager>,
    coordinator: Arc<SyncCoordinator>,
    events: Arc<tokio::sync::Mutex<EventReceiver>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for PeerNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerNode")
            .field("identity", self.manager.identity())
            .field("role", &self.config.role)
            .finish_non_exhaustive()
    }
}

impl PeerNode {
    /// Build a node from validated configuration.
    pub fn new(config: NodeConfig, transport: Arc<dyn Transport>) -> Result<Self, NodeError> {
        config.validate()?;
        let bus = EventBus::new(config.event_capacity);
        let identity = PeerIdentity::new(config.device_name.clone());
        let (manager, events) = SessionManager::new(&config, identity, transport, bus.clone());
        let manager = Arc::new(manager);
        let coordinator = Arc::new(SyncCoordinator::new(
            manager.clone(),
            bus.clone(),
            config.conflict_policy,
            config.image_limit(),
        ));
        Ok(Self {
            config,
            bus,
            manager,
            coordinator,
            events: Arc::new(tokio::sync::Mutex::new(events)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Our identity on the network.
    pub fn identity(&self) -> &PeerIdentity {
        self.manager.identity()
    }

    /// Effective configuration.
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Whether background tasks are running.
    pub fn is_running(&self) -> bool {
        !self.tasks().is_empty()
    }

    /// Start advertising or browsing and spawn the background tasks.
    ///
    /// Calling this on a running node is a no-op.
    pub async fn start(&self) -> Result<(), NodeError> {
        if self.is_running() {
            return Ok(());
        }
        self.manager.start().await?;

        let pump = spawn_event_pump(
            self.manager.clone(),
            self.coordinator.clone(),
            self.events.clone(),
        );
        let health = spawn_health_monitor(
            self.manager.clone(),
            self.coordinator.clone(),
            self.config.health_interval(),
        );
        let mut tasks = self.tasks();
        if !tasks.is_empty() {
            // Lost a race with a concurrent start.
            pump.abort();
            health.abort();
            return Ok(());
        }
        tasks.push(pump);
        tasks.push(health);
        info!(device = %self.identity(), role = %self.config.role, "node started");
        Ok(())
    }

    /// Cancel background tasks and release the session. Safe to call in
    /// any state.
    pub async fn stop(&self) {
        let tasks: Vec<JoinHandle<()>> = self.tasks().drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        self.manager.stop().await;
        if !tasks.is_empty() {
            info!(device = %self.identity(), "node stopped");
        }
    }

    /// Rebuild the session if it is stalled. Returns whether it did.
    pub async fn reset_session(&self) -> Result<bool, NodeError> {
        Ok(self.manager.reset_session().await?)
    }

    /// Current session phase.
    pub async fn phase(&self) -> SessionPhase {
        self.manager.phase().await
    }

    /// Install the persistence handle for subsequent operations.
    pub fn set_active_store(&self, store: Arc<dyn CardStore>) {
        self.coordinator.set_active_store(store);
    }

    /// Remove the persistence handle.
    pub fn clear_active_store(&self) {
        self.coordinator.clear_active_store();
    }

    /// Save a local change and send it if a peer is connected.
    ///
    /// Returns whether a peer received it; otherwise the card waits in the
    /// pending queue.
    pub async fn save_card(&self, card: CardRecord, change: ChangeType) -> Result<bool, NodeError> {
        self.coordinator.save_card(card, change).await
    }

    /// Delete a card and tell peers, queueing the deletion if nobody is
    /// connected.
    pub async fn delete_card(&self, id: Uuid) -> Result<bool, NodeError> {
        self.coordinator.delete_card(id).await
    }

    /// Push everything pending now. Returns false without an active store.
    pub async fn sync_now(&self) -> bool {
        self.coordinator.sync_now().await
    }

    /// Ask connected peers to push what they have pending.
    pub async fn request_sync(&self) -> bool {
        self.coordinator.request_sync().await
    }

    /// Sorted names of connected devices.
    pub async fn connected_devices(&self) -> Vec<String> {
        self.manager.connected_names().await
    }

    /// Subscribe to UI events.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.bus.subscribe()
    }
}

impl Drop for PeerNode {
    fn drop(&mut self) {
        for task in self.tasks().drain(..) {
            task.abort();
        }
    }
}

/// Feed transport events through the session manager into the coordinator.
fn spawn_event_pump(
    manager: Arc<SessionManager>,
    coordinator: Arc<SyncCoordinator>,
    events: Arc<tokio::sync::Mutex<EventReceiver>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut events = events.lock().await;
        while let Some((generation, event)) = events.recv().await {
            let signals = manager.handle_event(generation, event).await;
            coordinator.handle_signals(signals).await;
        }
    })
}
