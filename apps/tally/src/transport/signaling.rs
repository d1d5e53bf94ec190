use super::{SignalRelay, SignalingDialer, SignalingEvent, SignalingLink};
use crate::error::SyncError;
use crate::protocol::PeerId;
use crate::protocol::signaling::{Negotiation, NegotiationKind, SignalMessage};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message, error::ProtocolError},
};
use url::Url;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_SIGNAL_PATH: &str = "/signal";

enum Outbound {
    Frame(SignalMessage),
    Close,
}

/// Long-lived websocket to the rendezvous server, joined to one session room.
pub struct SignalingClient {
    session_id: String,
    peer_id: PeerId,
    send_tx: mpsc::UnboundedSender<Outbound>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SignalingClient {
    pub async fn connect(
        signaling_url: &str,
        session_id: &str,
        peer_id: PeerId,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<SignalingEvent>), SyncError> {
        let websocket_url = derive_websocket_url(signaling_url)?;
        let (ws_stream, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(websocket_url.as_str()))
            .await
            .map_err(|_| SyncError::SignalingUnavailable(format!("connect to {websocket_url} timed out")))?
            .map_err(|err| SyncError::SignalingUnavailable(format!("websocket connect failed: {err}")))?;
        tracing::debug!(
            target = "signaling",
            url = %websocket_url,
            session = %session_id,
            "signaling websocket connected"
        );
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<Outbound>();
        let (events_tx, events_rx) = mpsc::unbounded_channel::<SignalingEvent>();

        let client = Arc::new(SignalingClient {
            session_id: session_id.to_string(),
            peer_id,
            send_tx,
            tasks: Mutex::new(Vec::new()),
        });

        let writer_handle = tokio::spawn(async move {
            while let Some(outbound) = send_rx.recv().await {
                match outbound {
                    Outbound::Frame(frame) => {
                        if let Ok(text) = serde_json::to_string(&frame) {
                            if ws_write.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Outbound::Close => {
                        let _ = ws_write.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        });

        let self_id = client.peer_id.clone();
        let reader_handle = tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        tracing::trace!(target = "signaling", event = "ws_in", len = text.len());
                        match serde_json::from_str::<SignalMessage>(&text) {
                            Ok(frame) => {
                                if let Some(event) = inbound_event(&self_id, frame) {
                                    if events_tx.send(event).is_err() {
                                        break;
                                    }
                                }
                            }
                            Err(err) => {
                                tracing::warn!(target = "signaling", error = %err, "dropping malformed signaling frame");
                            }
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(target = "signaling", "signaling websocket closed: {err}");
                            }
                            _ => {
                                tracing::warn!(target = "signaling", "signaling websocket error: {err}");
                            }
                        }
                        break;
                    }
                }
            }
            tracing::debug!(target = "signaling", "signaling reader finished");
        });

        let heartbeat_tx = client.send_tx.clone();
        let heartbeat_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if heartbeat_tx.send(Outbound::Frame(SignalMessage::Ping)).is_err() {
                    break;
                }
            }
        });

        client
            .tasks
            .lock()
            .extend([writer_handle, reader_handle, heartbeat_handle]);

        client
            .send_tx
            .send(Outbound::Frame(SignalMessage::Join {
                session_id: client.session_id.clone(),
                user_id: client.peer_id.to_string(),
            }))
            .map_err(|_| SyncError::SignalingUnavailable("signaling writer stopped".into()))?;
        tracing::debug!(target = "signaling", peer = %client.peer_id, "sent signaling join message");

        Ok((client, events_rx))
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl SignalRelay for SignalingClient {
    fn relay(&self, to: &PeerId, message: Negotiation) -> Result<(), SyncError> {
        let kind = message.kind();
        let frame = message.into_message(self.peer_id.as_str(), to.as_str(), &self.session_id)?;
        tracing::trace!(target = "signaling", peer = %to, kind = kind.as_str(), "relaying negotiation");
        self.send_tx
            .send(Outbound::Frame(frame))
            .map_err(|_| SyncError::SignalingUnavailable("signaling connection closed".into()))
    }

    fn close(&self) {
        let _ = self.send_tx.send(Outbound::Close);
        let mut tasks = self.tasks.lock();
        // The writer sits at index 0 and exits on its own after flushing the close frame.
        for handle in tasks.drain(..).skip(1) {
            handle.abort();
        }
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

fn inbound_event(self_id: &PeerId, frame: SignalMessage) -> Option<SignalingEvent> {
    let negotiation = |kind, payload, sender: String, target: String| {
        if target != self_id.as_str() || sender == self_id.as_str() {
            return None;
        }
        Some(SignalingEvent::Negotiation {
            kind,
            payload,
            from: PeerId::from(sender),
            to: PeerId::from(target),
        })
    };
    match frame {
        SignalMessage::UserJoined { user_id } if user_id != self_id.as_str() => {
            Some(SignalingEvent::PeerJoined(PeerId::from(user_id)))
        }
        SignalMessage::UserLeft { user_id } if user_id != self_id.as_str() => {
            Some(SignalingEvent::PeerLeft(PeerId::from(user_id)))
        }
        SignalMessage::Offer {
            offer,
            sender,
            target,
            ..
        } => negotiation(NegotiationKind::Offer, offer, sender, target),
        SignalMessage::Answer {
            answer,
            sender,
            target,
            ..
        } => negotiation(NegotiationKind::Answer, answer, sender, target),
        SignalMessage::IceCandidate {
            candidate,
            sender,
            target,
            ..
        } => negotiation(NegotiationKind::Candidate, candidate, sender, target),
        SignalMessage::Error { message } => {
            tracing::warn!(target = "signaling", %message, "rendezvous server reported an error");
            None
        }
        _ => None,
    }
}

pub(crate) fn derive_websocket_url(signaling_url: &str) -> Result<Url, SyncError> {
    let mut url = Url::parse(signaling_url).map_err(|err| {
        SyncError::SignalingUnavailable(format!("invalid signaling url {signaling_url}: {err}"))
    })?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(SyncError::SignalingUnavailable(format!(
                "unsupported signaling scheme {other}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SyncError::SignalingUnavailable("invalid websocket scheme".into()))?;
    if url.path().is_empty() || url.path() == "/" {
        url.set_path(DEFAULT_SIGNAL_PATH);
    }
    url.set_fragment(None);
    Ok(url)
}

/// Dials the rendezvous server over websockets.
#[derive(Debug, Clone)]
pub struct WebSocketDialer {
    url: String,
}

impl WebSocketDialer {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl SignalingDialer for WebSocketDialer {
    async fn dial(&self, session_id: &str, self_id: &PeerId) -> Result<SignalingLink, SyncError> {
        let (client, events) = SignalingClient::connect(&self.url, session_id, self_id.clone()).await?;
        Ok(SignalingLink {
            relay: client,
            events,
        })
    }
}
