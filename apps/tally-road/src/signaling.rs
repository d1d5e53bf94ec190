use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire frames spoken on `/signal`. Negotiation payloads are opaque to the
/// server and relayed untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalFrame {
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

impl SignalFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalFrame::Join { .. } => "join",
            SignalFrame::UserJoined { .. } => "user-joined",
            SignalFrame::UserLeft { .. } => "user-left",
            SignalFrame::Offer { .. } => "offer",
            SignalFrame::Answer { .. } => "answer",
            SignalFrame::IceCandidate { .. } => "ice-candidate",
            SignalFrame::Ping => "ping",
            SignalFrame::Pong => "pong",
            SignalFrame::Error { .. } => "error",
        }
    }

    /// Addressee of a negotiation frame. `None` for everything else.
    pub fn target(&self) -> Option<&str> {
        match self {
            SignalFrame::Offer { target, .. }
            | SignalFrame::Answer { target, .. }
            | SignalFrame::IceCandidate { target, .. } => Some(target),
            _ => None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        SignalFrame::Error {
            message: message.into(),
        }
    }
}
