use crate::protocol::PeerId;
use std::collections::BTreeSet;

/// How the local peer entered the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinMode {
    /// Created the session; its local copy is already authoritative enough.
    Create,
    /// Joined an existing session and asks the first peers it reaches for a snapshot.
    Join,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncRequestAction {
    None,
    /// First connection: ask every open channel.
    Broadcast,
    /// Still waiting: ask the peer that just connected.
    Ask(PeerId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotRoute {
    /// First answer to our sync request. Adopt it regardless of timestamps.
    Bootstrap,
    /// A later answer to our request. Already have a snapshot, drop it.
    DuplicateReply,
    /// Ordinary update; the reconciler decides.
    Regular,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Disabled,
    Idle,
    Awaiting { asked: BTreeSet<PeerId> },
    Complete,
}

/// Tracks the one-shot "ask for the current session" handshake a joiner
/// performs when its first channel opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bootstrap {
    phase: Phase,
}

impl Bootstrap {
    pub fn new(mode: JoinMode) -> Self {
        let phase = match mode {
            JoinMode::Create => Phase::Disabled,
            JoinMode::Join => Phase::Idle,
        };
        Self { phase }
    }

    pub fn is_awaiting(&self) -> bool {
        matches!(self.phase, Phase::Awaiting { .. })
    }

    /// A peer waiting for its own snapshot has nothing trustworthy to hand out.
    pub fn can_answer(&self) -> bool {
        !self.is_awaiting()
    }

    pub fn on_peer_connected(&mut self, peer: &PeerId, connected: &[PeerId]) -> SyncRequestAction {
        match &mut self.phase {
            Phase::Idle => {
                let mut asked: BTreeSet<PeerId> = connected.iter().cloned().collect();
                asked.insert(peer.clone());
                self.phase = Phase::Awaiting { asked };
                SyncRequestAction::Broadcast
            }
            Phase::Awaiting { asked } => {
                if asked.insert(peer.clone()) {
                    SyncRequestAction::Ask(peer.clone())
                } else {
                    SyncRequestAction::None
                }
            }
            Phase::Disabled | Phase::Complete => SyncRequestAction::None,
        }
    }

    /// Classifies an incoming snapshot. `reply_to` is set only on snapshots
    /// unicast in answer to our own sync request; plain broadcasts from a peer
    /// we asked always reach the reconciler.
    pub fn route_snapshot(&mut self, from: &PeerId, reply_to: Option<i64>) -> SnapshotRoute {
        match self.phase {
            Phase::Awaiting { .. } => {
                tracing::debug!(target = "sync", peer = %from, "initial snapshot received");
                self.phase = Phase::Complete;
                SnapshotRoute::Bootstrap
            }
            Phase::Complete if reply_to.is_some() => SnapshotRoute::DuplicateReply,
            Phase::Complete | Phase::Disabled | Phase::Idle => SnapshotRoute::Regular,
        }
    }

    pub fn on_peer_disconnected(&mut self, peer: &PeerId) {
        if let Phase::Awaiting { asked } = &mut self.phase {
            asked.remove(peer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str) -> PeerId {
        PeerId::from(id)
    }

    #[test]
    fn creator_never_requests() {
        let mut bootstrap = Bootstrap::new(JoinMode::Create);
        assert_eq!(
            bootstrap.on_peer_connected(&peer("bob"), &[peer("bob")]),
            SyncRequestAction::None
        );
        assert!(bootstrap.can_answer());
        assert_eq!(bootstrap.route_snapshot(&peer("bob"), None), SnapshotRoute::Regular);
    }

    #[test]
    fn joiner_requests_once_and_adopts_first_reply() {
        let mut bootstrap = Bootstrap::new(JoinMode::Join);
        assert!(bootstrap.can_answer());
        assert_eq!(
            bootstrap.on_peer_connected(&peer("alice"), &[peer("alice")]),
            SyncRequestAction::Broadcast
        );
        assert!(!bootstrap.can_answer());
        assert_eq!(
            bootstrap.on_peer_connected(&peer("carol"), &[peer("alice"), peer("carol")]),
            SyncRequestAction::Ask(peer("carol"))
        );

        assert_eq!(bootstrap.route_snapshot(&peer("carol"), Some(10)), SnapshotRoute::Bootstrap);
        assert!(bootstrap.can_answer());
        assert_eq!(
            bootstrap.route_snapshot(&peer("alice"), Some(10)),
            SnapshotRoute::DuplicateReply
        );
        assert_eq!(bootstrap.route_snapshot(&peer("alice"), None), SnapshotRoute::Regular);
        assert_eq!(
            bootstrap.on_peer_connected(&peer("dave"), &[peer("dave")]),
            SyncRequestAction::None
        );
    }

    #[test]
    fn asked_peer_that_never_replied_still_gets_through() {
        let mut bootstrap = Bootstrap::new(JoinMode::Join);
        bootstrap.on_peer_connected(&peer("carol"), &[peer("carol")]);
        bootstrap.on_peer_connected(&peer("alice"), &[peer("carol"), peer("alice")]);
        assert_eq!(bootstrap.route_snapshot(&peer("alice"), Some(7)), SnapshotRoute::Bootstrap);

        // carol was asked while bootstrapping herself and never answered
        assert_eq!(bootstrap.route_snapshot(&peer("carol"), None), SnapshotRoute::Regular);
        assert_eq!(bootstrap.route_snapshot(&peer("carol"), None), SnapshotRoute::Regular);
    }

    #[test]
    fn departed_peer_is_asked_again_when_it_returns() {
        let mut bootstrap = Bootstrap::new(JoinMode::Join);
        bootstrap.on_peer_connected(&peer("alice"), &[peer("alice"), peer("bob")]);
        bootstrap.on_peer_disconnected(&peer("bob"));
        assert_eq!(
            bootstrap.on_peer_connected(&peer("bob"), &[peer("alice"), peer("bob")]),
            SyncRequestAction::Ask(peer("bob"))
        );
    }
}
