//! Application protocol spoken over direct peer channels.
//!
//! Every frame is a JSON envelope `{type, data, sender, timestamp}`. The
//! envelope is immutable once stamped and never persisted. A snapshot sent in
//! answer to a `sync-request` also carries `replyTo`, the request's timestamp.

pub mod signaling;

use crate::error::SyncError;
use crate::model::{Participant, SessionState, Story, Vote};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    UpdateSession,
    NewParticipant,
    NewStory,
    Vote,
    Estimate,
    SyncRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub data: Value,
    pub sender: PeerId,
    /// Milliseconds since the unix epoch on the sender's clock.
    pub timestamp: i64,
    #[serde(default, rename = "replyTo", skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VotePayload {
    pub story_id: String,
    pub vote: Vote,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EstimatePayload {
    pub story_id: String,
    pub estimate: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequestPayload {
    pub user_id: String,
    #[serde(default)]
    pub user_name: String,
}

/// Typed view of an envelope's `data` field.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Snapshot(SessionState),
    Participant(Participant),
    Story(Story),
    Vote(VotePayload),
    Estimate(EstimatePayload),
    SyncRequest(SyncRequestPayload),
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl PeerMessage {
    pub fn new(kind: MessageKind, data: Value, sender: PeerId) -> Self {
        Self {
            kind,
            data,
            sender,
            timestamp: now_millis(),
            reply_to: None,
        }
    }

    pub fn from_payload(payload: &Payload, sender: PeerId) -> Result<Self, SyncError> {
        let (kind, data) = match payload {
            Payload::Snapshot(state) => (MessageKind::UpdateSession, serde_json::to_value(state)?),
            Payload::Participant(p) => (MessageKind::NewParticipant, serde_json::to_value(p)?),
            Payload::Story(story) => (MessageKind::NewStory, serde_json::to_value(story)?),
            Payload::Vote(vote) => (MessageKind::Vote, serde_json::to_value(vote)?),
            Payload::Estimate(est) => (MessageKind::Estimate, serde_json::to_value(est)?),
            Payload::SyncRequest(req) => (MessageKind::SyncRequest, serde_json::to_value(req)?),
        };
        Ok(Self::new(kind, data, sender))
    }

    pub fn encode(&self) -> Result<String, SyncError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, SyncError> {
        serde_json::from_str(text)
            .map_err(|err| SyncError::MalformedMessage(format!("peer envelope: {err}")))
    }

    pub fn payload(&self) -> Result<Payload, SyncError> {
        let data = self.data.clone();
        let malformed =
            |err: serde_json::Error| SyncError::MalformedMessage(format!("{:?} data: {err}", self.kind));
        Ok(match self.kind {
            MessageKind::UpdateSession => Payload::Snapshot(serde_json::from_value(data).map_err(malformed)?),
            MessageKind::NewParticipant => {
                Payload::Participant(serde_json::from_value(data).map_err(malformed)?)
            }
            MessageKind::NewStory => Payload::Story(serde_json::from_value(data).map_err(malformed)?),
            MessageKind::Vote => Payload::Vote(serde_json::from_value(data).map_err(malformed)?),
            MessageKind::Estimate => Payload::Estimate(serde_json::from_value(data).map_err(malformed)?),
            MessageKind::SyncRequest => {
                Payload::SyncRequest(serde_json::from_value(data).map_err(malformed)?)
            }
        })
    }
}
