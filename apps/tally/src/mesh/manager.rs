use crate::error::SyncError;
use crate::protocol::PeerId;
use crate::protocol::signaling::{
    IceCandidate, Negotiation, NegotiationKind, SdpKind, SessionDescription,
};
use crate::transport::{
    LinkEvent, LinkEventSink, PeerConnector, PeerLink, SignalRelay, SignalingEvent,
};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Everything the manager reacts to besides signaling: link callbacks and its
/// own negotiation deadlines. Both are tagged with the connection generation
/// so events from a replaced attempt are recognised and dropped.
#[derive(Debug, Clone, PartialEq)]
pub enum MeshInput {
    Link {
        peer: PeerId,
        generation: u64,
        event: LinkEvent,
    },
    NegotiationDeadline {
        peer: PeerId,
        generation: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    NegotiatingOutbound,
    NegotiatingInbound,
    Connected,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    Connected(PeerId),
    Disconnected(PeerId),
    Message { from: PeerId, text: String },
    NegotiationFailed { peer: PeerId, reason: String },
}

#[derive(Debug, Clone)]
pub struct MeshSettings {
    pub negotiation_timeout: Duration,
    pub candidate_window: Duration,
    pub candidate_limit: usize,
}

impl Default for MeshSettings {
    fn default() -> Self {
        Self {
            negotiation_timeout: Duration::from_secs(15),
            candidate_window: Duration::from_secs(10),
            candidate_limit: 64,
        }
    }
}

struct Connection {
    state: ConnectionState,
    generation: u64,
    link: Box<dyn PeerLink>,
    deadline: Option<JoinHandle<()>>,
    /// Outbound only: the remote answer has been applied.
    answered: bool,
}

struct PendingCandidate {
    received: Instant,
    candidate: IceCandidate,
}

/// Owns every direct connection of the local peer, keyed by peer id. At most
/// one connection exists per peer; a newer attempt always replaces the entry.
pub struct PeerManager {
    self_id: PeerId,
    settings: MeshSettings,
    connector: Arc<dyn PeerConnector>,
    relay: Option<Arc<dyn SignalRelay>>,
    connections: HashMap<PeerId, Connection>,
    pending_candidates: HashMap<PeerId, VecDeque<PendingCandidate>>,
    next_generation: u64,
    inbound_tx: mpsc::UnboundedSender<MeshInput>,
    shut_down: bool,
}

impl PeerManager {
    pub fn new(
        self_id: PeerId,
        settings: MeshSettings,
        connector: Arc<dyn PeerConnector>,
    ) -> (Self, mpsc::UnboundedReceiver<MeshInput>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let manager = Self {
            self_id,
            settings,
            connector,
            relay: None,
            connections: HashMap::new(),
            pending_candidates: HashMap::new(),
            next_generation: 0,
            inbound_tx,
            shut_down: false,
        };
        (manager, inbound_rx)
    }

    pub fn self_id(&self) -> &PeerId {
        &self.self_id
    }

    pub fn set_relay(&mut self, relay: Option<Arc<dyn SignalRelay>>) {
        self.relay = relay;
    }

    /// Every peer reads as `Closed` once the manager has shut down.
    pub fn state_of(&self, peer: &PeerId) -> ConnectionState {
        if self.shut_down {
            return ConnectionState::Closed;
        }
        self.connections
            .get(peer)
            .map(|conn| conn.state)
            .unwrap_or(ConnectionState::Idle)
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.state == ConnectionState::Connected)
            .map(|(peer, _)| peer.clone())
            .collect();
        peers.sort();
        peers
    }

    pub fn pending_candidate_count(&self, peer: &PeerId) -> usize {
        self.pending_candidates.get(peer).map_or(0, VecDeque::len)
    }

    pub async fn handle_signal(&mut self, event: SignalingEvent) -> Vec<PeerEvent> {
        match event {
            SignalingEvent::PeerJoined(peer) => self.on_peer_joined(peer).await,
            SignalingEvent::PeerLeft(peer) => {
                tracing::debug!(target = "mesh", peer = %peer, "peer left signaling room");
                self.pending_candidates.remove(&peer);
                self.teardown(&peer).await
            }
            SignalingEvent::Negotiation {
                kind,
                payload,
                from,
                to,
            } => {
                if to != self.self_id || from == self.self_id {
                    tracing::trace!(target = "mesh", peer = %from, "ignoring negotiation not addressed to us");
                    return Vec::new();
                }
                self.on_negotiation(kind, payload, from).await
            }
        }
    }

    pub async fn handle_input(&mut self, input: MeshInput) -> Vec<PeerEvent> {
        match input {
            MeshInput::Link {
                peer,
                generation,
                event,
            } => self.on_link_event(peer, generation, event).await,
            MeshInput::NegotiationDeadline { peer, generation } => {
                let expired = self.connections.get(&peer).is_some_and(|conn| {
                    conn.generation == generation && conn.state != ConnectionState::Connected
                });
                if !expired {
                    return Vec::new();
                }
                let err = SyncError::NegotiationTimeout { peer: peer.clone() };
                tracing::warn!(target = "mesh", peer = %peer, error = %err, "discarding negotiation attempt");
                let mut events = self.teardown(&peer).await;
                events.push(PeerEvent::NegotiationFailed {
                    peer,
                    reason: err.to_string(),
                });
                events
            }
        }
    }

    /// Returns whether an open channel existed and a send was attempted.
    pub fn send(&self, peer: &PeerId, text: &str) -> bool {
        let Some(conn) = self
            .connections
            .get(peer)
            .filter(|conn| conn.state == ConnectionState::Connected)
        else {
            return false;
        };
        if let Err(err) = conn.link.send(text) {
            tracing::debug!(target = "mesh", peer = %peer, error = %err, "send on open channel failed");
        }
        true
    }

    /// Sends to every open channel and returns how many were attempted.
    pub fn broadcast(&self, text: &str) -> usize {
        self.fan_out(None, text)
    }

    /// Like [`broadcast`](Self::broadcast) but skips `skip`.
    pub fn broadcast_except(&self, skip: &PeerId, text: &str) -> usize {
        self.fan_out(Some(skip), text)
    }

    fn fan_out(&self, skip: Option<&PeerId>, text: &str) -> usize {
        self.connections
            .iter()
            .filter(|(peer, conn)| {
                conn.state == ConnectionState::Connected && Some(*peer) != skip
            })
            .map(|(peer, conn)| {
                if let Err(err) = conn.link.send(text) {
                    tracing::debug!(target = "mesh", peer = %peer, error = %err, "broadcast send failed");
                }
            })
            .count()
    }

    /// Drops buffered candidates older than the candidate window.
    pub fn sweep_candidates(&mut self) {
        let window = self.settings.candidate_window;
        self.pending_candidates.retain(|_, queue| {
            queue.retain(|pending| pending.received.elapsed() <= window);
            !queue.is_empty()
        });
    }

    /// Closes every link and forgets every peer, including half-negotiated ones.
    pub async fn shutdown(&mut self) {
        let peers: Vec<PeerId> = self.connections.keys().cloned().collect();
        for peer in peers {
            self.teardown(&peer).await;
        }
        self.pending_candidates.clear();
        self.relay = None;
        self.shut_down = true;
        tracing::debug!(target = "mesh", "peer manager shut down");
    }

    async fn on_peer_joined(&mut self, peer: PeerId) -> Vec<PeerEvent> {
        if peer == self.self_id {
            return Vec::new();
        }
        // A join notice for a known peer means it reconnected to signaling,
        // possibly as a new process. The old attempt or link is replaced.
        if let Some(existing) = self.connections.get(&peer) {
            tracing::debug!(target = "mesh", peer = %peer, state = ?existing.state, "peer joined again; renegotiating");
        }
        let mut events = self.teardown(&peer).await;
        self.pending_candidates.remove(&peer);

        let generation = self.bump_generation();
        let sink = self.sink(&peer, generation);
        match self.connector.create_offer(&peer, sink).await {
            Ok((link, offer)) => {
                let deadline = self.arm_deadline(&peer, generation);
                self.connections.insert(
                    peer.clone(),
                    Connection {
                        state: ConnectionState::NegotiatingOutbound,
                        generation,
                        link,
                        deadline: Some(deadline),
                        answered: false,
                    },
                );
                tracing::debug!(target = "mesh", peer = %peer, generation, "sending offer");
                self.relay_to(&peer, Negotiation::Offer(offer));
            }
            Err(err) => {
                tracing::warn!(target = "mesh", peer = %peer, error = %err, "failed to create offer");
                events.push(PeerEvent::NegotiationFailed {
                    peer,
                    reason: err.to_string(),
                });
            }
        }
        events
    }

    async fn on_negotiation(&mut self, kind: NegotiationKind, payload: Value, from: PeerId) -> Vec<PeerEvent> {
        match kind {
            NegotiationKind::Offer => match parse_description(payload, SdpKind::Offer) {
                Ok(offer) => self.on_offer(from, offer).await,
                Err(err) => {
                    tracing::warn!(target = "mesh", peer = %from, error = %err, "dropping offer");
                    Vec::new()
                }
            },
            NegotiationKind::Answer => match parse_description(payload, SdpKind::Answer) {
                Ok(answer) => self.on_answer(from, answer).await,
                Err(err) => {
                    tracing::warn!(target = "mesh", peer = %from, error = %err, "dropping answer");
                    Vec::new()
                }
            },
            NegotiationKind::Candidate => match serde_json::from_value::<IceCandidate>(payload) {
                Ok(candidate) => {
                    self.on_candidate(from, candidate).await;
                    Vec::new()
                }
                Err(err) => {
                    let err = SyncError::MalformedMessage(format!("ice candidate: {err}"));
                    tracing::warn!(target = "mesh", peer = %from, error = %err, "dropping candidate");
                    Vec::new()
                }
            },
        }
    }

    async fn on_offer(&mut self, peer: PeerId, offer: SessionDescription) -> Vec<PeerEvent> {
        if let Some(existing) = self.connections.get(&peer) {
            match existing.state {
                ConnectionState::NegotiatingOutbound if !existing.answered && self.self_id < peer => {
                    tracing::debug!(target = "mesh", peer = %peer, "simultaneous offers; keeping ours");
                    return Vec::new();
                }
                ConnectionState::NegotiatingOutbound => {
                    tracing::debug!(target = "mesh", peer = %peer, "simultaneous offers; yielding to theirs");
                }
                state => {
                    tracing::debug!(target = "mesh", peer = %peer, ?state, "fresh offer replaces existing connection");
                }
            }
        }
        let mut events = self.teardown(&peer).await;

        let generation = self.bump_generation();
        let sink = self.sink(&peer, generation);
        match self.connector.accept_offer(&peer, offer, sink).await {
            Ok((link, answer)) => {
                let deadline = self.arm_deadline(&peer, generation);
                self.relay_to(&peer, Negotiation::Answer(answer));
                self.flush_candidates(&peer, link.as_ref()).await;
                self.connections.insert(
                    peer.clone(),
                    Connection {
                        state: ConnectionState::NegotiatingInbound,
                        generation,
                        link,
                        deadline: Some(deadline),
                        answered: false,
                    },
                );
                tracing::debug!(target = "mesh", peer = %peer, generation, "answered offer");
            }
            Err(err) => {
                tracing::warn!(target = "mesh", peer = %peer, error = %err, "failed to accept offer");
                events.push(PeerEvent::NegotiationFailed {
                    peer,
                    reason: err.to_string(),
                });
            }
        }
        events
    }

    async fn on_answer(&mut self, peer: PeerId, answer: SessionDescription) -> Vec<PeerEvent> {
        let Some(conn) = self
            .connections
            .get_mut(&peer)
            .filter(|conn| conn.state == ConnectionState::NegotiatingOutbound && !conn.answered)
        else {
            tracing::debug!(target = "mesh", peer = %peer, "answer without an outstanding offer");
            return Vec::new();
        };
        let applied = conn.link.apply_answer(answer).await;
        match applied {
            Ok(()) => {
                conn.answered = true;
                Vec::new()
            }
            Err(err) => {
                // the answering side is gone
                tracing::warn!(target = "mesh", peer = %peer, error = %err, "failed to apply answer");
                let mut events = self.teardown(&peer).await;
                events.push(PeerEvent::NegotiationFailed {
                    peer,
                    reason: err.to_string(),
                });
                events
            }
        }
    }

    async fn on_candidate(&mut self, peer: PeerId, candidate: IceCandidate) {
        if let Some(conn) = self.connections.get(&peer) {
            if let Err(err) = conn.link.add_candidate(candidate).await {
                tracing::debug!(target = "mesh", peer = %peer, error = %err, "candidate rejected");
            }
            return;
        }
        let window = self.settings.candidate_window;
        let limit = self.settings.candidate_limit;
        let queue = self.pending_candidates.entry(peer).or_default();
        queue.retain(|pending| pending.received.elapsed() <= window);
        if queue.len() >= limit {
            queue.pop_front();
        }
        queue.push_back(PendingCandidate {
            received: Instant::now(),
            candidate,
        });
    }

    async fn flush_candidates(&mut self, peer: &PeerId, link: &dyn PeerLink) {
        let Some(queue) = self.pending_candidates.remove(peer) else {
            return;
        };
        let window = self.settings.candidate_window;
        for pending in queue {
            if pending.received.elapsed() > window {
                continue;
            }
            if let Err(err) = link.add_candidate(pending.candidate).await {
                tracing::debug!(target = "mesh", peer = %peer, error = %err, "buffered candidate rejected");
            }
        }
    }

    async fn on_link_event(&mut self, peer: PeerId, generation: u64, event: LinkEvent) -> Vec<PeerEvent> {
        let Some(conn) = self
            .connections
            .get_mut(&peer)
            .filter(|conn| conn.generation == generation)
        else {
            tracing::trace!(target = "mesh", peer = %peer, generation, "dropping event from stale link");
            return Vec::new();
        };
        match event {
            LinkEvent::LocalCandidate(candidate) => {
                self.relay_to(&peer, Negotiation::Candidate(candidate));
                Vec::new()
            }
            LinkEvent::ChannelOpen => {
                if conn.state == ConnectionState::Connected {
                    return Vec::new();
                }
                conn.state = ConnectionState::Connected;
                if let Some(deadline) = conn.deadline.take() {
                    deadline.abort();
                }
                tracing::info!(target = "mesh", peer = %peer, "peer channel open");
                vec![PeerEvent::Connected(peer)]
            }
            LinkEvent::Message(text) => {
                if conn.state != ConnectionState::Connected {
                    tracing::debug!(target = "mesh", peer = %peer, "message before channel open");
                    return Vec::new();
                }
                vec![PeerEvent::Message { from: peer, text }]
            }
            LinkEvent::ChannelClosed => {
                tracing::info!(target = "mesh", peer = %peer, "peer channel closed");
                self.teardown(&peer).await
            }
            LinkEvent::Failed(reason) => {
                let was_connected = conn.state == ConnectionState::Connected;
                tracing::warn!(target = "mesh", peer = %peer, %reason, "peer link failed");
                let mut events = self.teardown(&peer).await;
                if !was_connected {
                    events.push(PeerEvent::NegotiationFailed { peer, reason });
                }
                events
            }
        }
    }

    /// Removes the peer's connection, if any, and closes its link.
    async fn teardown(&mut self, peer: &PeerId) -> Vec<PeerEvent> {
        let Some(mut conn) = self.connections.remove(peer) else {
            return Vec::new();
        };
        if let Some(deadline) = conn.deadline.take() {
            deadline.abort();
        }
        let was_connected = conn.state == ConnectionState::Connected;
        conn.link.close().await;
        tracing::trace!(target = "mesh", peer = %peer, generation = conn.generation, "connection closed");
        if was_connected {
            vec![PeerEvent::Disconnected(peer.clone())]
        } else {
            Vec::new()
        }
    }

    fn relay_to(&self, peer: &PeerId, message: Negotiation) {
        let kind = message.kind();
        match &self.relay {
            Some(relay) => {
                if let Err(err) = relay.relay(peer, message) {
                    tracing::warn!(target = "mesh", peer = %peer, kind = kind.as_str(), error = %err, "relay failed");
                }
            }
            None => {
                tracing::debug!(target = "mesh", peer = %peer, kind = kind.as_str(), "no signaling relay; dropping");
            }
        }
    }

    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn sink(&self, peer: &PeerId, generation: u64) -> LinkEventSink {
        LinkEventSink::new(peer.clone(), generation, self.inbound_tx.clone())
    }

    fn arm_deadline(&self, peer: &PeerId, generation: u64) -> JoinHandle<()> {
        let tx = self.inbound_tx.clone();
        let timeout = self.settings.negotiation_timeout;
        let peer = peer.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(MeshInput::NegotiationDeadline { peer, generation });
        })
    }
}

impl Drop for PeerManager {
    fn drop(&mut self) {
        for conn in self.connections.values_mut() {
            if let Some(deadline) = conn.deadline.take() {
                deadline.abort();
            }
        }
    }
}

fn parse_description(payload: Value, expected: SdpKind) -> Result<SessionDescription, SyncError> {
    let description: SessionDescription = serde_json::from_value(payload)
        .map_err(|err| SyncError::MalformedMessage(format!("session description: {err}")))?;
    if description.kind != expected {
        return Err(SyncError::MalformedMessage(format!(
            "expected {expected:?} description, got {:?}",
            description.kind
        )));
    }
    if description.sdp.trim().is_empty() {
        return Err(SyncError::MalformedMessage("empty sdp".into()));
    }
    Ok(description)
}
