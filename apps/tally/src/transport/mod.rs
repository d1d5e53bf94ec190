pub mod memory;
pub mod signaling;
pub mod webrtc;

use crate::error::SyncError;
use crate::mesh::MeshInput;
use crate::protocol::PeerId;
use crate::protocol::signaling::{IceCandidate, Negotiation, NegotiationKind, SessionDescription};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("transport timeout")]
    Timeout,
    #[error("transport channel closed")]
    ChannelClosed,
}

/// What a peer link reports back to the mesh manager.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    LocalCandidate(IceCandidate),
    ChannelOpen,
    Message(String),
    ChannelClosed,
    Failed(String),
}

/// Tags link events with the peer and connection generation they belong to
/// and pushes them onto the manager's inbound queue.
#[derive(Clone, Debug)]
pub struct LinkEventSink {
    peer: PeerId,
    generation: u64,
    tx: mpsc::UnboundedSender<MeshInput>,
}

impl LinkEventSink {
    pub(crate) fn new(peer: PeerId, generation: u64, tx: mpsc::UnboundedSender<MeshInput>) -> Self {
        Self {
            peer,
            generation,
            tx,
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn emit(&self, event: LinkEvent) -> bool {
        self.tx
            .send(MeshInput::Link {
                peer: self.peer.clone(),
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// Creates direct links to peers. One link backs at most one message channel.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn create_offer(
        &self,
        peer: &PeerId,
        events: LinkEventSink,
    ) -> Result<(Box<dyn PeerLink>, SessionDescription), TransportError>;

    async fn accept_offer(
        &self,
        peer: &PeerId,
        offer: SessionDescription,
        events: LinkEventSink,
    ) -> Result<(Box<dyn PeerLink>, SessionDescription), TransportError>;
}

#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn apply_answer(&self, answer: SessionDescription) -> Result<(), TransportError>;

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Queues a text frame on the message channel.
    fn send(&self, text: &str) -> Result<(), TransportError>;

    async fn close(&self);
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    PeerJoined(PeerId),
    PeerLeft(PeerId),
    Negotiation {
        kind: NegotiationKind,
        payload: Value,
        from: PeerId,
        to: PeerId,
    },
}

/// Send half of a signaling connection. Relays are fire-and-forget.
pub trait SignalRelay: Send + Sync {
    fn relay(&self, to: &PeerId, message: Negotiation) -> Result<(), SyncError>;

    fn close(&self);
}

/// A joined signaling room. The event stream ends when the connection drops.
pub struct SignalingLink {
    pub relay: Arc<dyn SignalRelay>,
    pub events: mpsc::UnboundedReceiver<SignalingEvent>,
}

#[async_trait]
pub trait SignalingDialer: Send + Sync {
    async fn dial(&self, session_id: &str, self_id: &PeerId) -> Result<SignalingLink, SyncError>;
}
