//! In-process transport for testing and simulation.
//!
//! A [`MemoryNetwork`] stands in for the local network: every session
//! opened on it can discover, invite, and message every other session with
//! the same service type. Sessions
//! cloned from the same network share state. Test hooks inject failures
//! and simulate the transport misbehaving (links dropping, connections
//! appearing without callbacks).

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use cardsync_core::PeerConnectionState;
use cardsync_types::{DiscoveryInfo, PeerId, PeerIdentity};

use super::{EventSink, Session, Transport, TransportError, TransportEvent};

/// Shared in-process network.
#[derive(Debug, Default, Clone)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

#[derive(Debug, Default)]
struct NetworkInner {
    next_serial: u64,
    endpoints: HashMap<PeerId, Endpoint>,
    links: BTreeSet<(PeerId, PeerId)>,
    // (inviter, invitee)
    invitations: BTreeSet<(PeerId, PeerId)>,
    sessions_opened: HashMap<PeerId, usize>,
    sent: Vec<(PeerId, PeerId, Vec<u8>)>,
    fail_next_open: Option<String>,
    fail_next_discovery: Option<String>,
    fail_next_send: Option<String>,
}

#[derive(Debug)]
struct Endpoint {
    serial: u64,
    identity: PeerIdentity,
    service_type: String,
    sink: EventSink,
    advertising: Option<DiscoveryInfo>,
    browsing: bool,
}

fn link_key(a: PeerId, b: PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

impl NetworkInner {
    fn is_live(&self, id: &PeerId, serial: u64) -> bool {
        self.endpoints.get(id).is_some_and(|ep| ep.serial == serial)
    }

    fn check_live(&self, id: &PeerId, serial: u64) -> Result<(), TransportError> {
        if self.is_live(id, serial) {
            Ok(())
        } else {
            Err(TransportError::SessionClosed)
        }
    }

    fn service_type(&self, id: &PeerId) -> Option<&str> {
        self.endpoints.get(id).map(|ep| ep.service_type.as_str())
    }

    /// Live endpoints sharing `id`'s service type, `id` excluded.
    fn same_service<'a>(&'a self, id: &'a PeerId) -> impl Iterator<Item = &'a Endpoint> + 'a {
        let service = self.service_type(id);
        self.endpoints.values().filter(move |ep| {
            ep.identity.id != *id && Some(ep.service_type.as_str()) == service
        })
    }

    fn identity(&self, id: &PeerId) -> Option<PeerIdentity> {
        self.endpoints.get(id).map(|ep| ep.identity.clone())
    }

    fn emit(&self, to: &PeerId, event: TransportEvent) {
        if let Some(ep) = self.endpoints.get(to) {
            ep.sink.emit(event);
        }
    }

    fn linked(&self, id: &PeerId) -> Vec<PeerId> {
        self.links
            .iter()
            .filter_map(|(a, b)| {
                if a == id {
                    Some(*b)
                } else if b == id {
                    Some(*a)
                } else {
                    None
                }
            })
            .collect()
    }

    fn notify_state(&self, to: &PeerId, about: &PeerId, state: PeerConnectionState) {
        if let Some(peer) = self.identity(about) {
            self.emit(to, TransportEvent::StateChanged { peer, state });
        }
    }

    fn connect(&mut self, a: PeerId, b: PeerId, notify: bool) {
        if self.links.insert(link_key(a, b)) && notify {
            self.notify_state(&a, &b, PeerConnectionState::Connected);
            self.notify_state(&b, &a, PeerConnectionState::Connected);
        }
    }

    fn sever(&mut self, a: PeerId, b: PeerId, notify: bool) {
        if self.links.remove(&link_key(a, b)) && notify {
            self.notify_state(&a, &b, PeerConnectionState::NotConnected);
            self.notify_state(&b, &a, PeerConnectionState::NotConnected);
        }
    }

    fn stop_advertising(&mut self, id: &PeerId) {
        let was_advertising = self
            .endpoints
            .get_mut(id)
            .and_then(|ep| ep.advertising.take())
            .is_some();
        if !was_advertising {
            return;
        }
        let browsers: Vec<PeerId> = self
            .same_service(id)
            .filter(|ep| ep.browsing)
            .map(|ep| ep.identity.id)
            .collect();
        for browser in browsers {
            self.emit(&browser, TransportEvent::PeerLost { peer: *id });
        }
    }

    fn remove_endpoint(&mut self, id: PeerId) {
        for peer in self.linked(&id) {
            self.sever(id, peer, true);
        }
        self.stop_advertising(&id);

        let pending: Vec<(PeerId, PeerId)> = self
            .invitations
            .iter()
            .filter(|(inviter, invitee)| *inviter == id || *invitee == id)
            .copied()
            .collect();
        for (inviter, invitee) in pending {
            self.invitations.remove(&(inviter, invitee));
            if invitee == id {
                self.notify_state(&inviter, &id, PeerConnectionState::NotConnected);
            }
        }

        self.endpoints.remove(&id);
    }
}

impl MemoryNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// How many sessions `peer` has opened so far.
    pub fn sessions_opened(&self, peer: &PeerId) -> usize {
        self.lock().sessions_opened.get(peer).copied().unwrap_or(0)
    }

    /// Number of live sessions on the network.
    pub fn live_sessions(&self) -> usize {
        self.lock().endpoints.len()
    }

    /// Whether `peer` currently advertises.
    pub fn is_advertising(&self, peer: &PeerId) -> bool {
        self.lock()
            .endpoints
            .get(peer)
            .is_some_and(|ep| ep.advertising.is_some())
    }

    /// Whether `peer` currently browses.
    pub fn is_browsing(&self, peer: &PeerId) -> bool {
        self.lock().endpoints.get(peer).is_some_and(|ep| ep.browsing)
    }

    /// Whether `a` and `b` are connected.
    pub fn is_linked(&self, a: &PeerId, b: &PeerId) -> bool {
        self.lock().links.contains(&link_key(*a, *b))
    }

    /// Connect two live sessions directly, bypassing discovery and policy.
    ///
    /// With `notify == false` neither side receives a state change, as if
    /// the callback had been lost.
    pub fn force_connect(&self, a: &PeerId, b: &PeerId, notify: bool) {
        let mut inner = self.lock();
        if inner.endpoints.contains_key(a) && inner.endpoints.contains_key(b) {
            inner.connect(*a, *b, notify);
        }
    }

    /// Drop the link between two sessions, as if the radio went away.
    pub fn drop_link(&self, a: &PeerId, b: &PeerId, notify: bool) {
        self.lock().sever(*a, *b, notify);
    }

    /// Cause the next `open_session()` to fail.
    pub fn fail_next_open(&self, error: &str) {
        self.lock().fail_next_open = Some(error.to_string());
    }

    /// Cause the next `start_advertising()` or `start_browsing()` to fail.
    pub fn fail_next_discovery(&self, error: &str) {
        self.lock().fail_next_discovery = Some(error.to_string());
    }

    /// Cause the next `send()` to fail.
    pub fn fail_next_send(&self, error: &str) {
        self.lock().fail_next_send = Some(error.to_string());
    }

    /// Every delivered payload as `(from, to, bytes)`.
    pub fn sent_messages(&self) -> Vec<(PeerId, PeerId, Vec<u8>)> {
        self.lock().sent.clone()
    }
}

#[async_trait]
impl Transport for MemoryNetwork {
    async fn open_session(
        &self,
        local: &PeerIdentity,
        service_type: &str,
        events: EventSink,
    ) -> Result<Arc<dyn Session>, TransportError> {
        let mut inner = self.lock();

        if let Some(error) = inner.fail_next_open.take() {
            return Err(TransportError::SessionFailed(error));
        }

        // A peer holds at most one session; a new one replaces the old.
        if inner.endpoints.contains_key(&local.id) {
            inner.remove_endpoint(local.id);
        }

        inner.next_serial += 1;
        let serial = inner.next_serial;
        inner.endpoints.insert(
            local.id,
            Endpoint {
                serial,
                identity: local.clone(),
                service_type: service_type.to_string(),
                sink: events,
                advertising: None,
                browsing: false,
            },
        );
        *inner.sessions_opened.entry(local.id).or_insert(0) += 1;

        Ok(Arc::new(MemorySession {
            network: self.clone(),
            local: local.clone(),
            serial,
        }))
    }
}

/// A session on a [`MemoryNetwork`].
#[derive(Debug)]
pub struct MemorySession {
    network: MemoryNetwork,
    local: PeerIdentity,
    serial: u64,
}

impl MemorySession {
    fn id(&self) -> PeerId {
        self.local.id
    }
}

#[async_trait]
impl Session for MemorySession {
    fn local_peer(&self) -> &PeerIdentity {
        &self.local
    }

    async fn start_advertising(&self, info: &DiscoveryInfo) -> Result<(), TransportError> {
        let mut inner = self.network.lock();
        inner.check_live(&self.id(), self.serial)?;
        if let Some(error) = inner.fail_next_discovery.take() {
            return Err(TransportError::SessionFailed(error));
        }

        if let Some(ep) = inner.endpoints.get_mut(&self.id()) {
            ep.advertising = Some(info.clone());
        }
        let id = self.id();
        let browsers: Vec<PeerId> = inner
            .same_service(&id)
            .filter(|ep| ep.browsing)
            .map(|ep| ep.identity.id)
            .collect();
        for browser in browsers {
            inner.emit(
                &browser,
                TransportEvent::PeerFound {
                    peer: self.local.clone(),
                    info: Some(info.clone()),
                },
            );
        }
        Ok(())
    }

    async fn stop_advertising(&self) {
        let mut inner = self.network.lock();
        if inner.is_live(&self.id(), self.serial) {
            inner.stop_advertising(&self.id());
        }
    }

    async fn start_browsing(&self) -> Result<(), TransportError> {
        let mut inner = self.network.lock();
        inner.check_live(&self.id(), self.serial)?;
        if let Some(error) = inner.fail_next_discovery.take() {
            return Err(TransportError::SessionFailed(error));
        }

        if let Some(ep) = inner.endpoints.get_mut(&self.id()) {
            ep.browsing = true;
        }
        let id = self.id();
        let found: Vec<TransportEvent> = inner
            .same_service(&id)
            .filter_map(|ep| {
                ep.advertising.as_ref().map(|info| TransportEvent::PeerFound {
                    peer: ep.identity.clone(),
                    info: Some(info.clone()),
                })
            })
            .collect();
        for event in found {
            inner.emit(&self.id(), event);
        }
        Ok(())
    }

    async fn stop_browsing(&self) {
        let mut inner = self.network.lock();
        if inner.is_live(&self.id(), self.serial) {
            if let Some(ep) = inner.endpoints.get_mut(&self.id()) {
                ep.browsing = false;
            }
        }
    }

    async fn invite(
        &self,
        peer: &PeerId,
        info: &DiscoveryInfo,
        _timeout: Duration,
    ) -> Result<(), TransportError> {
        let mut inner = self.network.lock();
        inner.check_live(&self.id(), self.serial)?;
        if inner.service_type(peer) != inner.service_type(&self.id()) {
            return Err(TransportError::PeerNotFound(*peer));
        }

        inner.invitations.insert((self.id(), *peer));
        inner.emit(
            peer,
            TransportEvent::InvitationReceived {
                peer: self.local.clone(),
                info: Some(info.clone()),
            },
        );
        inner.notify_state(&self.id(), peer, PeerConnectionState::Connecting);
        Ok(())
    }

    async fn respond_to_invitation(
        &self,
        peer: &PeerId,
        accept: bool,
    ) -> Result<(), TransportError> {
        let mut inner = self.network.lock();
        inner.check_live(&self.id(), self.serial)?;
        if !inner.invitations.remove(&(*peer, self.id())) {
            return Err(TransportError::NoInvitation(*peer));
        }
        if !inner.endpoints.contains_key(peer) {
            return Err(TransportError::PeerNotFound(*peer));
        }

        if accept {
            inner.connect(self.id(), *peer, true);
        } else {
            inner.notify_state(peer, &self.id(), PeerConnectionState::NotConnected);
        }
        Ok(())
    }

    async fn send(&self, data: &[u8], peers: &[PeerId]) -> Result<(), TransportError> {
        let mut inner = self.network.lock();
        inner.check_live(&self.id(), self.serial)?;

        if let Some(error) = inner.fail_next_send.take() {
            return Err(TransportError::SendFailed(error));
        }
        if let Some(missing) = peers
            .iter()
            .find(|peer| !inner.links.contains(&link_key(self.id(), **peer)))
        {
            return Err(TransportError::NotConnected(*missing));
        }

        for peer in peers {
            inner.emit(
                peer,
                TransportEvent::DataReceived {
                    peer: self.local.clone(),
                    data: data.to_vec(),
                },
            );
            inner.sent.push((self.id(), *peer, data.to_vec()));
        }
        Ok(())
    }

    fn connected_peers(&self) -> Vec<PeerIdentity> {
        let inner = self.network.lock();
        if !inner.is_live(&self.id(), self.serial) {
            return Vec::new();
        }
        inner
            .linked(&self.id())
            .iter()
            .filter_map(|id| inner.identity(id))
            .collect()
    }

    async fn disconnect_peer(&self, peer: &PeerId) {
        let mut inner = self.network.lock();
        if inner.is_live(&self.id(), self.serial) {
            inner.sever(self.id(), *peer, true);
        }
    }

    async fn disconnect(&self) {
        let mut inner = self.network.lock();
        if inner.is_live(&self.id(), self.serial) {
            inner.remove_endpoint(self.id());
        }
    }
}
