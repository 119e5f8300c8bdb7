//! Notifications for the UI layer.
//!
//! The node publishes [`NodeEvent`]s on a broadcast channel. Every
//! subscriber sees every event published after it subscribed; a slow
//! subscriber that falls more than the channel capacity behind observes
//! `RecvError::Lagged` and skips ahead.

use cardsync_types::{CardRecord, PeerIdentity};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Something the UI may want to show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// The set of connected device names changed (sorted).
    ConnectedDevicesChanged(Vec<String>),
    /// A peer transitioned into Connected. Fires once per transition.
    PeerConnected(PeerIdentity),
    /// Outcome of a sync step.
    SyncCompleted {
        /// Whether it worked.
        success: bool,
        /// One-line reason on failure.
        error: Option<String>,
    },
    /// A card arrived from a peer and was saved.
    CardReceived(CardRecord),
    /// A peer deleted a card that existed locally.
    CardDeleted(Uuid),
}

impl NodeEvent {
    /// A successful sync step.
    pub fn sync_ok() -> Self {
        Self::SyncCompleted {
            success: true,
            error: None,
        }
    }

    /// A failed sync step.
    pub fn sync_failed(error: impl ToString) -> Self {
        Self::SyncCompleted {
            success: false,
            error: Some(error.to_string()),
        }
    }
}

/// Event bus for broadcasting [`NodeEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<NodeEvent>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event. Having no subscribers is fine.
    pub fn publish(&self, event: NodeEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.publish(NodeEvent::ConnectedDevicesChanged(vec!["desk".into()]));
        bus.publish(NodeEvent::sync_ok());

        assert_eq!(
            rx.recv().await.unwrap(),
            NodeEvent::ConnectedDevicesChanged(vec!["desk".into()])
        );
        assert_eq!(rx.recv().await.unwrap(), NodeEvent::sync_ok());
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.publish(NodeEvent::sync_failed("nobody listening"));
    }

    #[test]
    fn sync_failed_carries_message() {
        assert_eq!(
            NodeEvent::sync_failed("disk full"),
            NodeEvent::SyncCompleted {
                success: false,
                error: Some("disk full".to_string()),
            }
        );
    }
}
