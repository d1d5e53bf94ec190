use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frames exchanged with the rendezvous server. Negotiation payloads are kept
/// as raw JSON here; the mesh manager validates them on receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    #[serde(rename_all = "camelCase")]
    Join { session_id: String, user_id: String },
    #[serde(rename_all = "camelCase")]
    UserJoined { user_id: String },
    #[serde(rename_all = "camelCase")]
    UserLeft { user_id: String },
    #[serde(rename_all = "camelCase")]
    Offer {
        offer: Value,
        sender: String,
        target: String,
        session_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Answer {
        answer: Value,
        sender: String,
        target: String,
        session_id: String,
    },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        candidate: Value,
        sender: String,
        target: String,
        session_id: String,
    },
    Ping,
    Pong,
    Error { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationKind {
    Offer,
    Answer,
    Candidate,
}

impl NegotiationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NegotiationKind::Offer => "offer",
            NegotiationKind::Answer => "answer",
            NegotiationKind::Candidate => "ice-candidate",
        }
    }
}

/// Browser `RTCSessionDescriptionInit` JSON: `{type, sdp}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Browser `RTCIceCandidateInit` JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

/// Outbound negotiation message, addressed by the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum Negotiation {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
}

impl Negotiation {
    pub fn kind(&self) -> NegotiationKind {
        match self {
            Negotiation::Offer(_) => NegotiationKind::Offer,
            Negotiation::Answer(_) => NegotiationKind::Answer,
            Negotiation::Candidate(_) => NegotiationKind::Candidate,
        }
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            Negotiation::Offer(desc) | Negotiation::Answer(desc) => serde_json::to_value(desc),
            Negotiation::Candidate(candidate) => serde_json::to_value(candidate),
        }
    }

    /// Wraps the payload into the wire frame for `target`.
    pub fn into_message(
        self,
        sender: &str,
        target: &str,
        session_id: &str,
    ) -> Result<SignalMessage, serde_json::Error> {
        let payload = self.to_value()?;
        let (sender, target, session_id) =
            (sender.to_string(), target.to_string(), session_id.to_string());
        Ok(match self {
            Negotiation::Offer(_) => SignalMessage::Offer {
                offer: payload,
                sender,
                target,
                session_id,
            },
            Negotiation::Answer(_) => SignalMessage::Answer {
                answer: payload,
                sender,
                target,
                session_id,
            },
            Negotiation::Candidate(_) => SignalMessage::IceCandidate {
                candidate: payload,
                sender,
                target,
                session_id,
            },
        })
    }
}
