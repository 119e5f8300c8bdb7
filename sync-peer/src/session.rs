//! Session manager: owner of the single transport session.
//!
//! All session, directory, and bookkeeping state sits behind one
//! `tokio::sync::Mutex`, so transport events, health passes, resets, and
//! sends are serialized. The pure machines from `cardsync-core` decide what
//! happens; this module executes their actions against the transport.

use std::sync::Arc;
use std::time::Instant;

use cardsync_core::{
    reconcile_health, AcceptancePolicy, BookAction, FoundOutcome, PeerBook, PeerConnectionState,
    PeerDirectory, PeerStatus, PhaseAction, PhaseEvent, SessionPhase,
};
use cardsync_types::{DiscoveryInfo, PeerId, PeerIdentity, Role};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::events::{EventBus, NodeEvent};
use crate::transport::{EventSink, Session, Transport, TransportError, TransportEvent};

/// Receiving end for transport events, tagged with session generation.
pub type EventReceiver = mpsc::UnboundedReceiver<(u64, TransportEvent)>;

/// Work for the sync layer produced while handling session events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSignal {
    /// A peer transitioned into Connected.
    PeerConnected(PeerIdentity),
    /// Bytes arrived from a connected peer.
    Message {
        /// Sender.
        from: PeerIdentity,
        /// Payload.
        data: Vec<u8>,
    },
}

struct SessionState {
    phase: SessionPhase,
    generation: u64,
    session: Option<Arc<dyn Session>>,
    directory: PeerDirectory,
    book: PeerBook,
}

/// Owns the transport session and the peer sets.
pub struct SessionManager {
    transport: Arc<dyn Transport>,
    identity: PeerIdentity,
    role: Role,
    service_type: String,
    events_tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
    bus: EventBus,
    state: Mutex<SessionState>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("identity", &self.identity)
            .field("role", &self.role)
            .field("service_type", &self.service_type)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Create a manager. Transport events must be pumped from the returned
    /// receiver into [`SessionManager::handle_event`].
    pub fn new(
        config: &NodeConfig,
        identity: PeerIdentity,
        transport: Arc<dyn Transport>,
        bus: EventBus,
    ) -> (Self, EventReceiver) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let policy = AcceptancePolicy::new(config.role, config.name_hints());
        let manager = Self {
            transport,
            identity,
            role: config.role,
            service_type: config.service_type.clone(),
            events_tx,
            bus,
            state: Mutex::new(SessionState {
                phase: SessionPhase::new(),
                generation: 0,
                session: None,
                directory: PeerDirectory::new(policy, config.invite_timeout()),
                book: PeerBook::new(),
            }),
        };
        (manager, events_rx)
    }

    /// Our identity.
    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    /// Our role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current phase.
    pub async fn phase(&self) -> SessionPhase {
        self.state.lock().await.phase
    }

    /// Open a session and begin advertising or browsing. Idempotent.
    pub async fn start(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        let actions = transition(&mut state, PhaseEvent::Start(self.role));
        if actions.is_empty() {
            debug!("session already active");
            return Ok(());
        }
        info!(role = %self.role, device = %self.identity, "starting session");
        if let Err(e) = self.run_actions(&mut state, actions).await {
            // Leave no half-open session behind.
            let actions = transition(&mut state, PhaseEvent::Stop);
            let _ = self.run_actions(&mut state, actions).await;
            return Err(e);
        }
        Ok(())
    }

    /// Stop discovery, disconnect, and forget every peer. Safe in any phase.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        let actions = transition(&mut state, PhaseEvent::Stop);
        if actions.is_empty() {
            return;
        }
        info!(device = %self.identity, "stopping session");
        if let Err(e) = self.run_actions(&mut state, actions).await {
            warn!(error = %e, "error while stopping session");
        }
    }

    /// Tear down and rebuild the session.
    ///
    /// Only takes effect once the last peer is gone and the transport holds
    /// no connections. Returns whether a rebuild happened; concurrent calls
    /// collapse into one.
    pub async fn reset_session(&self) -> Result<bool, TransportError> {
        let mut state = self.state.lock().await;
        self.reset_locked(&mut state).await
    }

    async fn reset_locked(&self, state: &mut SessionState) -> Result<bool, TransportError> {
        let actions = transition(state, PhaseEvent::ResetRequested);
        if actions.is_empty() {
            debug!(phase = ?state.phase, "reset not applicable");
            return Ok(false);
        }

        info!(device = %self.identity, "resetting session");
        if let Err(e) = self.run_actions(state, actions).await {
            warn!(error = %e, "session reset failed");
            transition(state, PhaseEvent::ResetFailed);
            return Err(e);
        }
        let actions = transition(state, PhaseEvent::ResetCompleted);
        if let Err(e) = self.run_actions(state, actions).await {
            warn!(error = %e, "restarting discovery after reset failed");
            transition(state, PhaseEvent::DiscoveryFailed);
            return Err(e);
        }
        Ok(true)
    }

    async fn run_actions(
        &self,
        state: &mut SessionState,
        actions: Vec<PhaseAction>,
    ) -> Result<(), TransportError> {
        for action in actions {
            match action {
                PhaseAction::OpenSession => {
                    state.generation += 1;
                    let sink = EventSink::new(state.generation, self.events_tx.clone());
                    let session = self
                        .transport
                        .open_session(&self.identity, &self.service_type, sink)
                        .await?;
                    debug!(generation = state.generation, "session opened");
                    state.session = Some(session);
                }
                PhaseAction::Advertise => {
                    let session = state.session.as_ref().ok_or(TransportError::NoSession)?;
                    session
                        .start_advertising(&DiscoveryInfo::new(self.role))
                        .await?;
                    debug!("advertising");
                }
                PhaseAction::Browse => {
                    let session = state.session.as_ref().ok_or(TransportError::NoSession)?;
                    session.start_browsing().await?;
                    debug!("browsing");
                }
                PhaseAction::TearDown => {
                    // Events still queued for the old session are now stale.
                    state.generation += 1;
                    if let Some(session) = state.session.take() {
                        session.stop_advertising().await;
                        session.stop_browsing().await;
                        session.disconnect().await;
                    }
                    state.directory.clear();
                    let had_peers = !state.book.is_empty();
                    state.book.clear();
                    if had_peers {
                        self.bus.publish(NodeEvent::ConnectedDevicesChanged(Vec::new()));
                    }
                }
            }
        }
        Ok(())
    }

    /// Apply one transport event.
    ///
    /// Events tagged with an older generation belong to a torn-down session
    /// and are dropped.
    pub async fn handle_event(&self, generation: u64, event: TransportEvent) -> Vec<SessionSignal> {
        let mut state = self.state.lock().await;
        if generation != state.generation {
            debug!(generation, current = state.generation, "dropping stale event");
            return Vec::new();
        }
        let Some(session) = state.session.clone() else {
            return Vec::new();
        };

        match event {
            TransportEvent::PeerFound { peer, info } => {
                if peer.id == self.identity.id {
                    return Vec::new();
                }
                match state.directory.on_peer_found(&peer, info, Instant::now()) {
                    FoundOutcome::Invite { timeout } => {
                        info!(peer = %peer, "inviting peer");
                        let ours = DiscoveryInfo::new(self.role);
                        if let Err(e) = session.invite(&peer.id, &ours, timeout).await {
                            warn!(peer = %peer, error = %e, "invitation failed");
                            state.directory.on_disconnected(&peer.id);
                        }
                    }
                    FoundOutcome::Rejected => debug!(peer = %peer, "ignoring peer of same role"),
                    FoundOutcome::AlreadyKnown => debug!(peer = %peer, "peer already invited"),
                }
                Vec::new()
            }
            TransportEvent::PeerLost { peer } => {
                debug!(peer = ?peer, "peer lost");
                state.directory.on_peer_lost(&peer);
                Vec::new()
            }
            TransportEvent::InvitationReceived { peer, info } => {
                let accept = state.directory.on_invitation_received(&peer, info);
                info!(peer = %peer, accept, "invitation received");
                if let Err(e) = session.respond_to_invitation(&peer.id, accept).await {
                    warn!(peer = %peer, error = %e, "could not answer invitation");
                }
                Vec::new()
            }
            TransportEvent::StateChanged { peer, state: peer_state } => {
                self.on_state_changed(&mut state, session.as_ref(), peer, peer_state)
                    .await
            }
            TransportEvent::DataReceived { peer, data } => {
                if state.book.is_connected(&peer.id) {
                    vec![SessionSignal::Message { from: peer, data }]
                } else {
                    debug!(peer = %peer, "dropping data from unconnected peer");
                    Vec::new()
                }
            }
        }
    }

    async fn on_state_changed(
        &self,
        state: &mut SessionState,
        session: &dyn Session,
        peer: PeerIdentity,
        peer_state: PeerConnectionState,
    ) -> Vec<SessionSignal> {
        match peer_state {
            PeerConnectionState::Connecting => {
                state.directory.set_status(&peer, PeerStatus::Connecting)
            }
            PeerConnectionState::Connected => {
                state.directory.set_status(&peer, PeerStatus::Connected)
            }
            PeerConnectionState::NotConnected => state.directory.on_disconnected(&peer.id),
        }

        let accepted = state.directory.should_accept(&peer);
        let transport_has_connections = !session.connected_peers().is_empty();
        let actions =
            state
                .book
                .on_state_change(&peer, peer_state, accepted, transport_has_connections);

        let mut signals = Vec::new();
        for action in actions {
            match action {
                BookAction::ForceDisconnect(peer) => {
                    warn!(peer = %peer, "disconnecting peer rejected by policy");
                    session.disconnect_peer(&peer.id).await;
                }
                BookAction::PeerConnected(peer) => {
                    info!(peer = %peer, "peer connected");
                    transition(state, PhaseEvent::PeerConnected);
                    self.bus.publish(NodeEvent::PeerConnected(peer.clone()));
                    signals.push(SessionSignal::PeerConnected(peer));
                }
                BookAction::DevicesChanged(names) => {
                    self.bus.publish(NodeEvent::ConnectedDevicesChanged(names));
                }
                BookAction::ResetSession => {
                    info!("last peer gone, resetting session");
                    transition(state, PhaseEvent::LastPeerLost);
                    if let Err(e) = self.reset_locked(state).await {
                        warn!(error = %e, "automatic reset failed");
                    }
                }
            }
        }
        signals
    }

    /// Reconcile bookkeeping with the transport's connected peers.
    ///
    /// Also expires lapsed invitations so their peers can be retried, and
    /// retries a session rebuild that failed earlier.
    pub async fn reconcile_health(&self) -> Vec<SessionSignal> {
        let mut state = self.state.lock().await;
        if let SessionPhase::Stalled { .. } = state.phase {
            // Only a failed rebuild leaves the phase stalled outside the lock.
            let idle = state
                .session
                .as_ref()
                .map_or(true, |session| session.connected_peers().is_empty());
            if idle {
                info!("retrying stalled session");
                if let Err(e) = self.reset_locked(&mut state).await {
                    warn!(error = %e, "retrying stalled session failed");
                }
                return Vec::new();
            }
        }
        let Some(session) = state.session.clone() else {
            return Vec::new();
        };

        for peer in state.directory.expire_invitations(Instant::now()) {
            debug!(peer = ?peer, "invitation expired");
        }

        let transport_peers = session.connected_peers();
        let report = {
            let directory = &state.directory;
            reconcile_health(&transport_peers, &state.book, |peer| {
                directory.should_accept(peer)
            })
        };
        if report.is_clean() {
            return Vec::new();
        }

        for peer in &report.disallowed {
            warn!(peer = %peer, "health check disconnecting disallowed peer");
            session.disconnect_peer(&peer.id).await;
        }
        state.book.replace_connected(&report.corrected);

        let mut signals = Vec::new();
        for peer in &report.added {
            info!(peer = %peer, "health check found connected peer");
            state.directory.set_status(peer, PeerStatus::Connected);
            transition(&mut state, PhaseEvent::PeerConnected);
            self.bus.publish(NodeEvent::PeerConnected(peer.clone()));
            signals.push(SessionSignal::PeerConnected(peer.clone()));
        }
        for peer in &report.removed {
            debug!(peer = %peer, "health check dropped stale peer");
            state.directory.on_disconnected(&peer.id);
        }
        if !report.added.is_empty() || !report.removed.is_empty() {
            self.bus
                .publish(NodeEvent::ConnectedDevicesChanged(state.book.names()));
        }

        if report.lost_all() && session.connected_peers().is_empty() {
            transition(&mut state, PhaseEvent::LastPeerLost);
            if let Err(e) = self.reset_locked(&mut state).await {
                warn!(error = %e, "reset after health check failed");
            }
        }
        signals
    }

    /// Send `data` to every connected peer. Returns how many were addressed.
    pub async fn send(&self, data: &[u8]) -> Result<usize, TransportError> {
        let state = self.state.lock().await;
        let session = state.session.as_ref().ok_or(TransportError::NoSession)?;
        let peers: Vec<PeerId> = state.book.peers().iter().map(|p| p.id).collect();
        if peers.is_empty() {
            return Ok(0);
        }
        session.send(data, &peers).await?;
        Ok(peers.len())
    }

    /// Send `data` to one connected peer.
    pub async fn send_to(&self, peer: &PeerId, data: &[u8]) -> Result<(), TransportError> {
        let state = self.state.lock().await;
        let session = state.session.as_ref().ok_or(TransportError::NoSession)?;
        if !state.book.is_connected(peer) {
            return Err(TransportError::NotConnected(*peer));
        }
        session.send(data, &[*peer]).await
    }

    /// Bookkept connected peers.
    pub async fn connected_peers(&self) -> Vec<PeerIdentity> {
        self.state.lock().await.book.peers()
    }

    /// Sorted names of connected peers.
    pub async fn connected_names(&self) -> Vec<String> {
        self.state.lock().await.book.names()
    }
}

fn transition(state: &mut SessionState, event: PhaseEvent) -> Vec<PhaseAction> {
    let (phase, actions) = state.phase.on_event(event);
    state.phase = phase;
    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryNetwork;

    struct Harness {
        network: MemoryNetwork,
        manager: SessionManager,
        rx: EventReceiver,
        bus: EventBus,
    }

    fn harness(network: &MemoryNetwork, name: &str, role: Role) -> Harness {
        let config = NodeConfig::default().with_device_name(name).with_role(role);
        let bus = EventBus::new(64);
        let (manager, rx) = SessionManager::new(
            &config,
            PeerIdentity::new(name),
            Arc::new(network.clone()),
            bus.clone(),
        );
        Harness {
            network: network.clone(),
            manager,
            rx,
            bus,
        }
    }

    /// Deliver queued events until both sides go quiet.
    async fn pump(peers: &mut [&mut Harness]) -> Vec<SessionSignal> {
        let mut signals = Vec::new();
        loop {
            let mut progressed = false;
            for h in peers.iter_mut() {
                while let Ok((generation, event)) = h.rx.try_recv() {
                    progressed = true;
                    signals.extend(h.manager.handle_event(generation, event).await);
                }
            }
            if !progressed {
                return signals;
            }
        }
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let network = MemoryNetwork::new();
        let h = harness(&network, "desk", Role::Server);

        h.manager.start().await.unwrap();
        h.manager.start().await.unwrap();

        assert_eq!(h.network.sessions_opened(&h.manager.identity().id), 1);
        assert!(h.network.is_advertising(&h.manager.identity().id));
        assert_eq!(h.manager.phase().await, SessionPhase::Advertising);
    }

    #[tokio::test]
    async fn failed_start_leaves_no_session() {
        let network = MemoryNetwork::new();
        let h = harness(&network, "desk", Role::Server);
        network.fail_next_open("no radio");

        assert!(h.manager.start().await.is_err());
        assert_eq!(h.manager.phase().await, SessionPhase::NoSession);

        h.manager.start().await.unwrap();
        assert_eq!(h.manager.phase().await, SessionPhase::Advertising);
    }

    #[tokio::test]
    async fn server_and_client_connect() {
        let network = MemoryNetwork::new();
        let mut server = harness(&network, "desk", Role::Server);
        let mut client = harness(&network, "phone", Role::Client);
        let mut server_events = server.bus.subscribe();

        server.manager.start().await.unwrap();
        client.manager.start().await.unwrap();
        let signals = pump(&mut [&mut server, &mut client]).await;

        assert_eq!(client.manager.connected_names().await, vec!["desk".to_string()]);
        assert_eq!(server.manager.connected_names().await, vec!["phone".to_string()]);
        let connected = signals
            .iter()
            .filter(|s| matches!(s, SessionSignal::PeerConnected(_)))
            .count();
        assert_eq!(connected, 2);

        let mut seen = Vec::new();
        while let Ok(event) = server_events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&NodeEvent::PeerConnected(client.manager.identity().clone())));
        assert!(seen.contains(&NodeEvent::ConnectedDevicesChanged(vec!["phone".into()])));
    }

    #[tokio::test]
    async fn same_role_peers_never_pair() {
        let network = MemoryNetwork::new();
        let mut a = harness(&network, "phone a", Role::Client);
        let mut b = harness(&network, "phone b", Role::Client);

        a.manager.start().await.unwrap();
        b.manager.start().await.unwrap();
        pump(&mut [&mut a, &mut b]).await;

        assert!(a.manager.connected_peers().await.is_empty());
        assert!(b.manager.connected_peers().await.is_empty());
    }

    #[tokio::test]
    async fn wrong_role_connection_is_forced_off() {
        let network = MemoryNetwork::new();
        let mut a = harness(&network, "desk a", Role::Server);
        let mut b = harness(&network, "desk b", Role::Server);
        a.manager.start().await.unwrap();
        b.manager.start().await.unwrap();
        pump(&mut [&mut a, &mut b]).await;

        let a_id = a.manager.identity().id;
        let b_id = b.manager.identity().id;
        network.force_connect(&a_id, &b_id, true);
        pump(&mut [&mut a, &mut b]).await;

        assert!(!network.is_linked(&a_id, &b_id));
        assert!(a.manager.connected_peers().await.is_empty());
    }

    #[tokio::test]
    async fn stale_generation_is_dropped() {
        let network = MemoryNetwork::new();
        let h = harness(&network, "phone", Role::Client);
        h.manager.start().await.unwrap();

        let stranger = PeerIdentity::new("desk");
        let signals = h
            .manager
            .handle_event(
                0,
                TransportEvent::StateChanged {
                    peer: stranger,
                    state: PeerConnectionState::Connected,
                },
            )
            .await;

        assert!(signals.is_empty());
        assert!(h.manager.connected_peers().await.is_empty());
    }

    #[tokio::test]
    async fn unexpected_disconnect_resets_and_reconnects() {
        let network = MemoryNetwork::new();
        let mut server = harness(&network, "desk", Role::Server);
        let mut client = harness(&network, "phone", Role::Client);
        server.manager.start().await.unwrap();
        client.manager.start().await.unwrap();
        pump(&mut [&mut server, &mut client]).await;

        let server_id = server.manager.identity().id;
        let client_id = client.manager.identity().id;
        network.drop_link(&server_id, &client_id, true);
        pump(&mut [&mut server, &mut client]).await;

        assert_eq!(network.sessions_opened(&client_id), 2);
        assert_eq!(client.manager.phase().await, SessionPhase::Browsing);
        assert!(network.is_linked(&server_id, &client_id));
        assert_eq!(client.manager.connected_names().await, vec!["desk".to_string()]);
    }

    #[tokio::test]
    async fn failed_handshake_resets_session() {
        let network = MemoryNetwork::new();
        let server = harness(&network, "desk", Role::Server);
        let mut client = harness(&network, "phone", Role::Client);
        server.manager.start().await.unwrap();
        client.manager.start().await.unwrap();

        // The client invites; the server vanishes before answering.
        pump(&mut [&mut client]).await;
        let client_id = client.manager.identity().id;
        assert_eq!(network.sessions_opened(&client_id), 1);
        server.manager.stop().await;
        pump(&mut [&mut client]).await;

        assert_eq!(network.sessions_opened(&client_id), 2);
        assert_eq!(client.manager.phase().await, SessionPhase::Browsing);
        assert!(network.is_browsing(&client_id));
    }

    #[tokio::test]
    async fn failed_discovery_after_reset_is_retried() {
        let network = MemoryNetwork::new();
        let mut server = harness(&network, "desk", Role::Server);
        let mut client = harness(&network, "phone", Role::Client);
        server.manager.start().await.unwrap();
        client.manager.start().await.unwrap();
        pump(&mut [&mut server, &mut client]).await;

        let client_id = client.manager.identity().id;
        network.fail_next_discovery("radio busy");
        network.drop_link(&server.manager.identity().id, &client_id, true);
        pump(&mut [&mut client]).await;

        assert_eq!(network.sessions_opened(&client_id), 2);
        assert_eq!(client.manager.phase().await, SessionPhase::Stalled { role: Role::Client });
        assert!(!network.is_browsing(&client_id));

        client.manager.reconcile_health().await;

        assert_eq!(network.sessions_opened(&client_id), 3);
        assert_eq!(client.manager.phase().await, SessionPhase::Browsing);
        assert!(network.is_browsing(&client_id));
    }

    #[tokio::test]
    async fn failed_reopen_is_retried() {
        let network = MemoryNetwork::new();
        let mut server = harness(&network, "desk", Role::Server);
        let mut client = harness(&network, "phone", Role::Client);
        server.manager.start().await.unwrap();
        client.manager.start().await.unwrap();
        pump(&mut [&mut server, &mut client]).await;

        let client_id = client.manager.identity().id;
        network.fail_next_open("no radio");
        network.drop_link(&server.manager.identity().id, &client_id, true);
        pump(&mut [&mut client]).await;

        assert_eq!(client.manager.phase().await, SessionPhase::Stalled { role: Role::Client });

        client.manager.reconcile_health().await;

        assert_eq!(network.sessions_opened(&client_id), 2);
        assert_eq!(client.manager.phase().await, SessionPhase::Browsing);
    }

    #[tokio::test]
    async fn health_check_adopts_missed_connection() {
        let network = MemoryNetwork::new();
        // No discovery info has been seen; the name alone identifies the server.
        let server = harness(&network, "Studio Mac", Role::Server);
        let client = harness(&network, "phone", Role::Client);
        server.manager.start().await.unwrap();
        client.manager.start().await.unwrap();

        network.force_connect(&server.manager.identity().id, &client.manager.identity().id, false);
        let signals = client.manager.reconcile_health().await;

        assert_eq!(
            signals,
            vec![SessionSignal::PeerConnected(server.manager.identity().clone())]
        );
        assert_eq!(client.manager.connected_names().await, vec!["Studio Mac".to_string()]);
        assert!(client.manager.reconcile_health().await.is_empty());
    }

    #[tokio::test]
    async fn stop_is_safe_and_clears_peers() {
        let network = MemoryNetwork::new();
        let mut server = harness(&network, "desk", Role::Server);
        let mut client = harness(&network, "phone", Role::Client);

        client.manager.stop().await;

        server.manager.start().await.unwrap();
        client.manager.start().await.unwrap();
        pump(&mut [&mut server, &mut client]).await;

        client.manager.stop().await;
        client.manager.stop().await;

        assert_eq!(client.manager.phase().await, SessionPhase::NoSession);
        assert!(client.manager.connected_peers().await.is_empty());
        assert!(!network.is_browsing(&client.manager.identity().id));
        assert!(matches!(
            client.manager.send(b"x").await,
            Err(TransportError::NoSession)
        ));
    }

    #[tokio::test]
    async fn send_without_peers_addresses_nobody() {
        let network = MemoryNetwork::new();
        let h = harness(&network, "phone", Role::Client);
        h.manager.start().await.unwrap();

        assert_eq!(h.manager.send(b"x").await.unwrap(), 0);
    }
}
