//! In-process signaling room and peer links. Used by the test suite and by
//! `tally` demos that run several peers inside one process.

use super::{
    LinkEvent, LinkEventSink, PeerConnector, PeerLink, SignalRelay, SignalingDialer,
    SignalingEvent, SignalingLink, TransportError,
};
use crate::error::SyncError;
use crate::protocol::PeerId;
use crate::protocol::signaling::{IceCandidate, Negotiation, SdpKind, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkState>>,
}

#[derive(Default)]
struct NetworkState {
    offline: bool,
    rooms: HashMap<String, HashMap<PeerId, mpsc::UnboundedSender<SignalingEvent>>>,
    partitions: HashSet<(PeerId, PeerId)>,
    offers: HashMap<String, Arc<Endpoint>>,
    answers: HashMap<String, Arc<Endpoint>>,
    next_token: u64,
    open_channels: usize,
    applied_candidates: usize,
}

struct Endpoint {
    sink: LinkEventSink,
    remote: Mutex<Option<Pairing>>,
    closed: AtomicBool,
}

#[derive(Clone)]
struct Pairing {
    remote: Arc<Endpoint>,
    open: Arc<AtomicBool>,
}

impl Endpoint {
    fn new(sink: LinkEventSink) -> Arc<Self> {
        Arc::new(Self {
            sink,
            remote: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dialer(&self) -> MemoryDialer {
        MemoryDialer {
            network: self.clone(),
        }
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            network: self.clone(),
        }
    }

    /// While offline every dial fails with `SignalingUnavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.inner.lock().offline = offline;
    }

    /// Number of paired links whose channels are currently open.
    pub fn open_channels(&self) -> usize {
        self.inner.lock().open_channels
    }

    pub fn applied_candidates(&self) -> usize {
        self.inner.lock().applied_candidates
    }

    pub fn room_members(&self, session_id: &str) -> Vec<PeerId> {
        let state = self.inner.lock();
        let mut members: Vec<PeerId> = state
            .rooms
            .get(session_id)
            .map(|room| room.keys().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    /// Drops `peer`'s signaling connection as if the socket died. Its event
    /// stream ends and the rest of the room sees `PeerLeft`.
    pub fn sever(&self, session_id: &str, peer: &PeerId) {
        self.leave(session_id, peer);
    }

    /// Drops negotiation relayed between `a` and `b` in either direction, so
    /// the two can never open a direct channel.
    pub fn partition(&self, a: &PeerId, b: &PeerId) {
        let mut state = self.inner.lock();
        state.partitions.insert((a.clone(), b.clone()));
        state.partitions.insert((b.clone(), a.clone()));
    }

    /// Hands a raw event to one room member, bypassing the relay.
    pub fn deliver(&self, session_id: &str, to: &PeerId, event: SignalingEvent) -> bool {
        let state = self.inner.lock();
        state
            .rooms
            .get(session_id)
            .and_then(|room| room.get(to))
            .is_some_and(|tx| tx.send(event).is_ok())
    }

    fn leave(&self, session_id: &str, peer: &PeerId) {
        let mut state = self.inner.lock();
        let Some(room) = state.rooms.get_mut(session_id) else {
            return;
        };
        if room.remove(peer).is_none() {
            return;
        }
        for tx in room.values() {
            let _ = tx.send(SignalingEvent::PeerLeft(peer.clone()));
        }
        if room.is_empty() {
            state.rooms.remove(session_id);
        }
    }

    fn next_token(&self, prefix: &str) -> String {
        let mut state = self.inner.lock();
        state.next_token += 1;
        format!("{prefix}-{}", state.next_token)
    }
}

pub struct MemoryDialer {
    network: MemoryNetwork,
}

#[async_trait]
impl SignalingDialer for MemoryDialer {
    async fn dial(&self, session_id: &str, self_id: &PeerId) -> Result<SignalingLink, SyncError> {
        let (tx, events) = mpsc::unbounded_channel();
        {
            let mut state = self.network.inner.lock();
            if state.offline {
                return Err(SyncError::SignalingUnavailable(
                    "memory rendezvous is offline".into(),
                ));
            }
            let room = state.rooms.entry(session_id.to_string()).or_default();
            for (member, member_tx) in room.iter() {
                if member != self_id {
                    let _ = member_tx.send(SignalingEvent::PeerJoined(self_id.clone()));
                }
            }
            room.insert(self_id.clone(), tx);
        }
        Ok(SignalingLink {
            relay: Arc::new(MemoryRelay {
                network: self.network.clone(),
                session_id: session_id.to_string(),
                peer_id: self_id.clone(),
            }),
            events,
        })
    }
}

struct MemoryRelay {
    network: MemoryNetwork,
    session_id: String,
    peer_id: PeerId,
}

impl SignalRelay for MemoryRelay {
    fn relay(&self, to: &PeerId, message: Negotiation) -> Result<(), SyncError> {
        let payload = message.to_value()?;
        let state = self.network.inner.lock();
        let room = state
            .rooms
            .get(&self.session_id)
            .filter(|room| room.contains_key(&self.peer_id))
            .ok_or_else(|| SyncError::SignalingUnavailable("not joined".into()))?;
        if state.partitions.contains(&(self.peer_id.clone(), to.clone())) {
            tracing::debug!(target = "signaling", peer = %to, "partitioned; dropping negotiation");
            return Ok(());
        }
        match room.get(to) {
            Some(tx) => {
                let _ = tx.send(SignalingEvent::Negotiation {
                    kind: message.kind(),
                    payload,
                    from: self.peer_id.clone(),
                    to: to.clone(),
                });
            }
            None => tracing::debug!(target = "signaling", peer = %to, "relay target not in room"),
        }
        Ok(())
    }

    fn close(&self) {
        self.network.leave(&self.session_id, &self.peer_id);
    }
}

pub struct MemoryConnector {
    network: MemoryNetwork,
}

impl MemoryConnector {
    fn announce_candidate(sink: &LinkEventSink, token: &str) {
        sink.emit(LinkEvent::LocalCandidate(IceCandidate {
            candidate: format!("candidate:memory {token}"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));
    }
}

#[async_trait]
impl PeerConnector for MemoryConnector {
    async fn create_offer(
        &self,
        _peer: &PeerId,
        events: LinkEventSink,
    ) -> Result<(Box<dyn PeerLink>, SessionDescription), TransportError> {
        let token = self.network.next_token("mem");
        let endpoint = Endpoint::new(events.clone());
        self.network
            .inner
            .lock()
            .offers
            .insert(token.clone(), Arc::clone(&endpoint));
        Self::announce_candidate(&events, &token);
        let link = MemoryLink {
            token: token.clone(),
            endpoint,
            network: self.network.clone(),
        };
        Ok((Box::new(link), SessionDescription::offer(token)))
    }

    async fn accept_offer(
        &self,
        _peer: &PeerId,
        offer: SessionDescription,
        events: LinkEventSink,
    ) -> Result<(Box<dyn PeerLink>, SessionDescription), TransportError> {
        if offer.kind != SdpKind::Offer {
            return Err(TransportError::Setup("expected an offer".into()));
        }
        let token = offer.sdp;
        let endpoint = Endpoint::new(events.clone());
        {
            let mut state = self.network.inner.lock();
            if state.offers.remove(&token).is_none() {
                return Err(TransportError::Setup(format!("unknown offer {token}")));
            }
            state.answers.insert(token.clone(), Arc::clone(&endpoint));
        }
        let answer_token = format!("{token}/answer");
        Self::announce_candidate(&events, &answer_token);
        let link = MemoryLink {
            token: token.clone(),
            endpoint,
            network: self.network.clone(),
        };
        Ok((Box::new(link), SessionDescription::answer(token)))
    }
}

struct MemoryLink {
    token: String,
    endpoint: Arc<Endpoint>,
    network: MemoryNetwork,
}

#[async_trait]
impl PeerLink for MemoryLink {
    async fn apply_answer(&self, answer: SessionDescription) -> Result<(), TransportError> {
        if answer.kind != SdpKind::Answer || answer.sdp != self.token {
            return Err(TransportError::Setup("answer does not match offer".into()));
        }
        if self.endpoint.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed);
        }
        let answerer = {
            let mut state = self.network.inner.lock();
            let answerer = state
                .answers
                .remove(&self.token)
                .ok_or(TransportError::ChannelClosed)?;
            if answerer.closed.load(Ordering::SeqCst) {
                return Err(TransportError::ChannelClosed);
            }
            state.open_channels += 1;
            answerer
        };
        let open = Arc::new(AtomicBool::new(true));
        *self.endpoint.remote.lock() = Some(Pairing {
            remote: Arc::clone(&answerer),
            open: Arc::clone(&open),
        });
        *answerer.remote.lock() = Some(Pairing {
            remote: Arc::clone(&self.endpoint),
            open,
        });
        self.endpoint.sink.emit(LinkEvent::ChannelOpen);
        answerer.sink.emit(LinkEvent::ChannelOpen);
        Ok(())
    }

    async fn add_candidate(&self, _candidate: IceCandidate) -> Result<(), TransportError> {
        if self.endpoint.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed);
        }
        self.network.inner.lock().applied_candidates += 1;
        Ok(())
    }

    fn send(&self, text: &str) -> Result<(), TransportError> {
        let pairing = self.endpoint.remote.lock().clone();
        match pairing {
            Some(pairing) if pairing.open.load(Ordering::SeqCst) => {
                pairing.remote.sink.emit(LinkEvent::Message(text.to_string()));
                Ok(())
            }
            _ => Err(TransportError::ChannelClosed),
        }
    }

    async fn close(&self) {
        if self.endpoint.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut state = self.network.inner.lock();
            state.offers.remove(&self.token);
            if state
                .answers
                .get(&self.token)
                .is_some_and(|pending| Arc::ptr_eq(pending, &self.endpoint))
            {
                state.answers.remove(&self.token);
            }
        }
        let pairing = self.endpoint.remote.lock().take();
        if let Some(pairing) = pairing {
            if pairing.open.swap(false, Ordering::SeqCst) {
                self.network.inner.lock().open_channels -= 1;
                pairing.remote.sink.emit(LinkEvent::ChannelClosed);
            }
        }
    }
}

impl Drop for MemoryLink {
    fn drop(&mut self) {
        // Break the endpoint cycle for links dropped without close().
        self.endpoint.remote.lock().take();
    }
}
