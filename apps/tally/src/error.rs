use crate::transport::TransportError;
use crate::PeerId;

#[derive(thiserror::Error, Debug)]
pub enum SyncError {
    #[error("signaling unavailable: {0}")]
    SignalingUnavailable(String),
    #[error("negotiation with {peer} timed out")]
    NegotiationTimeout { peer: PeerId },
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("session {0} not found")]
    NotFound(String),
    #[error("failed to load session data after {attempts} attempts: {reason}")]
    StoreLoadFailure { attempts: u32, reason: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::MalformedMessage(err.to_string())
    }
}
