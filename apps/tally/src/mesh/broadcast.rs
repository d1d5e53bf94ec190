use super::PeerManager;
use crate::error::SyncError;
use crate::protocol::{Payload, PeerId, PeerMessage, SyncRequestPayload};

/// Stamps outgoing envelopes and classifies incoming ones.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    self_id: PeerId,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// State-bearing message for the reconciler.
    Apply {
        message: PeerMessage,
        payload: Payload,
    },
    SyncRequest {
        requester: PeerId,
        request: SyncRequestPayload,
        /// Request timestamp, echoed back as `replyTo`.
        asked_at: i64,
    },
    /// Our own envelope echoed back.
    Ignored,
}

impl Broadcaster {
    pub fn new(self_id: PeerId) -> Self {
        Self { self_id }
    }

    pub fn self_id(&self) -> &PeerId {
        &self.self_id
    }

    pub fn envelope(&self, payload: &Payload) -> Result<PeerMessage, SyncError> {
        PeerMessage::from_payload(payload, self.self_id.clone())
    }

    /// Sends one envelope on every open channel. Best effort: no
    /// acknowledgement and no ordering across peers.
    pub fn broadcast(
        &self,
        manager: &PeerManager,
        payload: &Payload,
    ) -> Result<(PeerMessage, usize), SyncError> {
        let message = self.envelope(payload)?;
        let sent = manager.broadcast(&message.encode()?);
        tracing::debug!(target = "mesh", kind = ?message.kind, peers = sent, "broadcast envelope");
        Ok((message, sent))
    }

    /// Fan-out to every open channel except `skip`.
    pub fn broadcast_except(
        &self,
        manager: &PeerManager,
        skip: &PeerId,
        payload: &Payload,
    ) -> Result<usize, SyncError> {
        let message = self.envelope(payload)?;
        Ok(manager.broadcast_except(skip, &message.encode()?))
    }

    pub fn send(
        &self,
        manager: &PeerManager,
        peer: &PeerId,
        payload: &Payload,
    ) -> Result<bool, SyncError> {
        let message = self.envelope(payload)?;
        Ok(manager.send(peer, &message.encode()?))
    }

    /// Unicasts `payload` marked as the answer to the request stamped `asked_at`.
    pub fn reply(
        &self,
        manager: &PeerManager,
        peer: &PeerId,
        payload: &Payload,
        asked_at: i64,
    ) -> Result<bool, SyncError> {
        let mut message = self.envelope(payload)?;
        message.reply_to = Some(asked_at);
        Ok(manager.send(peer, &message.encode()?))
    }

    /// Decodes a channel frame from `from`. Sync requests are answered to the
    /// channel the request arrived on.
    pub fn receive(&self, from: &PeerId, text: &str) -> Result<Inbound, SyncError> {
        let message = PeerMessage::decode(text)?;
        if message.sender == self.self_id {
            return Ok(Inbound::Ignored);
        }
        if &message.sender != from {
            tracing::debug!(
                target = "mesh",
                channel = %from,
                sender = %message.sender,
                "envelope sender differs from channel peer"
            );
        }
        Ok(match message.payload()? {
            Payload::SyncRequest(request) => Inbound::SyncRequest {
                requester: from.clone(),
                request,
                asked_at: message.timestamp,
            },
            payload => Inbound::Apply { message, payload },
        })
    }
}
