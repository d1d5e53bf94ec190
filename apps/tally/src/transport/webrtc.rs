use super::{LinkEvent, LinkEventSink, PeerConnector, PeerLink, TransportError};
use crate::protocol::PeerId;
use crate::protocol::signaling::{IceCandidate, SdpKind, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use webrtc::api::APIBuilder;
use webrtc::api::API;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

pub const DEFAULT_DATA_CHANNEL_LABEL: &str = "scrum-estimation";

#[derive(Debug, Clone)]
pub struct WebRtcSettings {
    pub ice_servers: Vec<String>,
    pub data_channel_label: String,
    pub ordered: bool,
}

impl Default for WebRtcSettings {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            data_channel_label: DEFAULT_DATA_CHANNEL_LABEL.to_string(),
            ordered: true,
        }
    }
}

/// Opens real peer connections through webrtc-rs, trickling ICE candidates
/// back through the link event sink.
pub struct WebRtcConnector {
    api: API,
    settings: WebRtcSettings,
}

fn to_setup_error(err: impl std::fmt::Display) -> TransportError {
    TransportError::Setup(err.to_string())
}

impl WebRtcConnector {
    pub fn new(settings: WebRtcSettings) -> Self {
        Self {
            api: APIBuilder::new().build(),
            settings,
        }
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.settings.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.settings.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }

    async fn new_link(&self, peer: &PeerId, events: LinkEventSink) -> Result<WebRtcLink, TransportError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.rtc_configuration())
                .await
                .map_err(to_setup_error)?,
        );

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        events.emit(LinkEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(err) => {
                        tracing::warn!(target = "webrtc", error = %err, "failed to encode local candidate");
                    }
                }
            })
        }));

        let state_events = events.clone();
        let state_peer = peer.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = state_events.clone();
            let peer = state_peer.clone();
            Box::pin(async move {
                tracing::debug!(target = "webrtc", peer = %peer, ?state, "peer connection state changed");
                if state == RTCPeerConnectionState::Failed {
                    events.emit(LinkEvent::Failed("peer connection failed".into()));
                }
            })
        }));

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<String>();
        let (channel_tx, channel_rx) = oneshot::channel::<Arc<RTCDataChannel>>();
        let writer = tokio::spawn(run_writer(channel_rx, outbound_rx));

        Ok(WebRtcLink {
            pc,
            events,
            outbound_tx,
            channel_tx: Arc::new(Mutex::new(Some(channel_tx))),
            remote_ready: AtomicBool::new(false),
            pending_candidates: AsyncMutex::new(Vec::new()),
            writer: Mutex::new(Some(writer)),
        })
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn create_offer(
        &self,
        peer: &PeerId,
        events: LinkEventSink,
    ) -> Result<(Box<dyn PeerLink>, SessionDescription), TransportError> {
        let link = self.new_link(peer, events).await?;
        let init = RTCDataChannelInit {
            ordered: Some(self.settings.ordered),
            ..Default::default()
        };
        let dc = link
            .pc
            .create_data_channel(&self.settings.data_channel_label, Some(init))
            .await
            .map_err(to_setup_error)?;
        attach_channel(dc, link.events.clone(), Arc::clone(&link.channel_tx));

        let offer = link.pc.create_offer(None).await.map_err(to_setup_error)?;
        link.pc
            .set_local_description(offer.clone())
            .await
            .map_err(to_setup_error)?;
        tracing::debug!(target = "webrtc", peer = %peer, "created local offer");
        Ok((Box::new(link), SessionDescription::offer(offer.sdp)))
    }

    async fn accept_offer(
        &self,
        peer: &PeerId,
        offer: SessionDescription,
        events: LinkEventSink,
    ) -> Result<(Box<dyn PeerLink>, SessionDescription), TransportError> {
        if offer.kind != SdpKind::Offer {
            return Err(TransportError::Setup("expected an offer description".into()));
        }
        let link = self.new_link(peer, events).await?;
        let channel_events = link.events.clone();
        let channel_slot = Arc::clone(&link.channel_tx);
        link.pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let events = channel_events.clone();
            let slot = Arc::clone(&channel_slot);
            Box::pin(async move {
                tracing::debug!(target = "webrtc", label = dc.label(), "remote data channel announced");
                attach_channel(dc, events, slot);
            })
        }));

        let remote = RTCSessionDescription::offer(offer.sdp).map_err(to_setup_error)?;
        link.pc
            .set_remote_description(remote)
            .await
            .map_err(to_setup_error)?;
        link.mark_remote_ready().await?;
        let answer = link.pc.create_answer(None).await.map_err(to_setup_error)?;
        link.pc
            .set_local_description(answer.clone())
            .await
            .map_err(to_setup_error)?;
        tracing::debug!(target = "webrtc", peer = %peer, "created local answer");
        Ok((Box::new(link), SessionDescription::answer(answer.sdp)))
    }
}

fn attach_channel(
    dc: Arc<RTCDataChannel>,
    events: LinkEventSink,
    channel_slot: Arc<Mutex<Option<oneshot::Sender<Arc<RTCDataChannel>>>>>,
) {
    let open_events = events.clone();
    let open_dc = Arc::clone(&dc);
    dc.on_open(Box::new(move || {
        let events = open_events.clone();
        let dc = Arc::clone(&open_dc);
        let slot = Arc::clone(&channel_slot);
        Box::pin(async move {
            if let Some(tx) = slot.lock().take() {
                let _ = tx.send(dc);
            }
            events.emit(LinkEvent::ChannelOpen);
        })
    }));

    let message_events = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let events = message_events.clone();
        Box::pin(async move {
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => {
                    events.emit(LinkEvent::Message(text));
                }
                Err(_) => {
                    tracing::debug!(target = "webrtc", len = msg.data.len(), "dropping non-utf8 frame");
                }
            }
        })
    }));

    let close_events = events.clone();
    dc.on_close(Box::new(move || {
        let events = close_events.clone();
        Box::pin(async move {
            events.emit(LinkEvent::ChannelClosed);
        })
    }));

    dc.on_error(Box::new(move |err: webrtc::Error| {
        let events = events.clone();
        Box::pin(async move {
            events.emit(LinkEvent::Failed(err.to_string()));
        })
    }));
}

async fn run_writer(
    channel_rx: oneshot::Receiver<Arc<RTCDataChannel>>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
) {
    let Ok(dc) = channel_rx.await else {
        return;
    };
    while let Some(text) = outbound_rx.recv().await {
        if let Err(err) = dc.send_text(text).await {
            tracing::warn!(target = "webrtc", error = %err, "data channel send failed");
            break;
        }
    }
}

struct WebRtcLink {
    pc: Arc<RTCPeerConnection>,
    events: LinkEventSink,
    outbound_tx: mpsc::UnboundedSender<String>,
    channel_tx: Arc<Mutex<Option<oneshot::Sender<Arc<RTCDataChannel>>>>>,
    remote_ready: AtomicBool,
    pending_candidates: AsyncMutex<Vec<RTCIceCandidateInit>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl WebRtcLink {
    /// Flushes candidates that arrived before the remote description was set.
    async fn mark_remote_ready(&self) -> Result<(), TransportError> {
        let mut pending = self.pending_candidates.lock().await;
        self.remote_ready.store(true, Ordering::SeqCst);
        for candidate in pending.drain(..) {
            self.pc
                .add_ice_candidate(candidate)
                .await
                .map_err(to_setup_error)?;
        }
        Ok(())
    }
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn apply_answer(&self, answer: SessionDescription) -> Result<(), TransportError> {
        if answer.kind != SdpKind::Answer {
            return Err(TransportError::Setup("expected an answer description".into()));
        }
        let remote = RTCSessionDescription::answer(answer.sdp).map_err(to_setup_error)?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(to_setup_error)?;
        self.mark_remote_ready().await
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        let mut pending = self.pending_candidates.lock().await;
        if !self.remote_ready.load(Ordering::SeqCst) {
            pending.push(init);
            return Ok(());
        }
        drop(pending);
        self.pc.add_ice_candidate(init).await.map_err(to_setup_error)
    }

    fn send(&self, text: &str) -> Result<(), TransportError> {
        self.outbound_tx
            .send(text.to_string())
            .map_err(|_| TransportError::ChannelClosed)
    }

    async fn close(&self) {
        if let Some(writer) = self.writer.lock().take() {
            writer.abort();
        }
        if let Err(err) = self.pc.close().await {
            tracing::debug!(target = "webrtc", error = %err, "peer connection close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::MeshInput;

    #[test]
    fn default_settings_use_public_stun() {
        let settings = WebRtcSettings::default();
        assert_eq!(settings.data_channel_label, "scrum-estimation");
        assert_eq!(settings.ice_servers.len(), 2);
        assert!(settings.ordered);
    }

    #[test_timeout::tokio_timeout_test(30)]
    #[ignore = "requires UDP networking"]
    async fn loopback_pair_opens_channel_and_exchanges_text() {
        let settings = WebRtcSettings {
            ice_servers: Vec::new(),
            ..WebRtcSettings::default()
        };
        let connector = WebRtcConnector::new(settings);
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let alice = PeerId::from("alice");
        let bob = PeerId::from("bob");

        let (a_link, offer) = connector
            .create_offer(&bob, LinkEventSink::new(bob.clone(), 1, a_tx))
            .await
            .unwrap();
        let (b_link, answer) = connector
            .accept_offer(&alice, offer, LinkEventSink::new(alice.clone(), 1, b_tx))
            .await
            .unwrap();
        a_link.apply_answer(answer).await.unwrap();

        let (mut a_open, mut b_open) = (false, false);
        while !(a_open && b_open) {
            tokio::select! {
                Some(MeshInput::Link { event, .. }) = a_rx.recv() => match event {
                    LinkEvent::LocalCandidate(c) => b_link.add_candidate(c).await.unwrap(),
                    LinkEvent::ChannelOpen => a_open = true,
                    _ => {}
                },
                Some(MeshInput::Link { event, .. }) = b_rx.recv() => match event {
                    LinkEvent::LocalCandidate(c) => a_link.add_candidate(c).await.unwrap(),
                    LinkEvent::ChannelOpen => b_open = true,
                    _ => {}
                },
            }
        }

        a_link.send("hello").unwrap();
        loop {
            if let Some(MeshInput::Link {
                event: LinkEvent::Message(text),
                ..
            }) = b_rx.recv().await
            {
                assert_eq!(text, "hello");
                break;
            }
        }
        a_link.close().await;
        b_link.close().await;
    }
}
