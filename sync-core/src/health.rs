//! Health reconciliation between the transport and bookkeeping.
//!
//! The transport's connected-peer list is authoritative. Callbacks can be
//! missed or delayed, and the transport can admit peers the policy would
//! refuse, so a periodic diff corrects the book.

use std::collections::BTreeSet;

use cardsync_types::{PeerId, PeerIdentity};

use crate::session::PeerBook;

/// Result of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    /// Transport peers failing the policy; disconnect them.
    pub disallowed: Vec<PeerIdentity>,
    /// Accepted transport peers missing from the book.
    pub added: Vec<PeerIdentity>,
    /// Book peers the transport no longer reports.
    pub removed: Vec<PeerIdentity>,
    /// The corrected connected set.
    pub corrected: Vec<PeerIdentity>,
}

impl HealthReport {
    /// Whether the book already matched the transport.
    pub fn is_clean(&self) -> bool {
        self.disallowed.is_empty() && self.added.is_empty() && self.removed.is_empty()
    }

    /// Whether reconciliation dropped the last bookkept peer.
    pub fn lost_all(&self) -> bool {
        self.corrected.is_empty() && !self.removed.is_empty()
    }
}

/// Diff the transport's peers against the book.
pub fn reconcile(
    transport_peers: &[PeerIdentity],
    book: &PeerBook,
    accept: impl Fn(&PeerIdentity) -> bool,
) -> HealthReport {
    let mut report = HealthReport::default();

    for peer in transport_peers {
        if !accept(peer) {
            report.disallowed.push(peer.clone());
            continue;
        }
        if !book.is_connected(&peer.id) {
            report.added.push(peer.clone());
        }
        report.corrected.push(peer.clone());
    }

    let kept: BTreeSet<PeerId> = report.corrected.iter().map(|p| p.id).collect();
    report.removed = book
        .peers()
        .into_iter()
        .filter(|p| !kept.contains(&p.id))
        .collect();

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::PeerConnectionState;

    fn book_with(peers: &[&PeerIdentity]) -> PeerBook {
        let mut book = PeerBook::new();
        for peer in peers {
            book.on_state_change(peer, PeerConnectionState::Connected, true, true);
        }
        book
    }

    #[test]
    fn matching_sets_are_clean() {
        let a = PeerIdentity::new("phone");
        let book = book_with(&[&a]);

        let report = reconcile(&[a.clone()], &book, |_| true);

        assert!(report.is_clean());
        assert_eq!(report.corrected, vec![a]);
    }

    #[test]
    fn missed_connect_is_added() {
        let a = PeerIdentity::new("phone");
        let book = PeerBook::new();

        let report = reconcile(&[a.clone()], &book, |_| true);

        assert_eq!(report.added, vec![a.clone()]);
        assert_eq!(report.corrected, vec![a]);
    }

    #[test]
    fn missed_disconnect_is_removed() {
        let a = PeerIdentity::new("phone");
        let book = book_with(&[&a]);

        let report = reconcile(&[], &book, |_| true);

        assert_eq!(report.removed, vec![a]);
        assert!(report.lost_all());
    }

    #[test]
    fn disallowed_peer_is_excluded() {
        let good = PeerIdentity::new("phone");
        let bad = PeerIdentity::new("other desk");
        let book = book_with(&[&good, &bad]);

        let report = reconcile(&[good.clone(), bad.clone()], &book, |p| p.id == good.id);

        assert_eq!(report.disallowed, vec![bad.clone()]);
        assert_eq!(report.removed, vec![bad]);
        assert_eq!(report.corrected, vec![good]);
        assert!(!report.lost_all());
    }
}
