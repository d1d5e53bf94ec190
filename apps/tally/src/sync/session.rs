//! The per-process sync runtime.
//!
//! One task owns the peer manager, the session copy and the signaling link.
//! Commands from the UI, signaling events, link events and timers all arrive
//! on queues that the task drains one at a time, so none of that state is
//! ever touched concurrently.

use crate::error::SyncError;
use crate::health::{ConnectionStatus, RetryPolicy, StatusBoard};
use crate::mesh::{Broadcaster, Inbound, MeshInput, MeshSettings, PeerEvent, PeerManager};
use crate::model::{Participant, SessionState, Story, Vote, VoteOutcome};
use crate::protocol::{EstimatePayload, Payload, PeerId, SyncRequestPayload, VotePayload};
use crate::sync::bootstrap::{Bootstrap, JoinMode, SnapshotRoute, SyncRequestAction};
use crate::sync::reconciler::{Reconciled, Reconciler, SideEffect};
use crate::transport::{
    PeerConnector, SignalRelay, SignalingDialer, SignalingEvent, TransportError,
};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub session_id: String,
    pub peer_id: PeerId,
    pub display_name: String,
}

impl LocalIdentity {
    pub fn new(
        session_id: impl Into<String>,
        peer_id: impl Into<PeerId>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            peer_id: peer_id.into(),
            display_name: display_name.into(),
        }
    }

    pub fn participant(&self) -> Participant {
        Participant::new(self.peer_id.as_str(), self.display_name.clone())
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub mesh: MeshSettings,
    /// Automatic signaling reconnects. The default only reconnects on request.
    pub reconnect: RetryPolicy,
    pub sweep_interval: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            mesh: MeshSettings::default(),
            reconnect: RetryPolicy::manual(),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// Notifications for the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// The local copy changed because of a remote update.
    Updated(SessionState),
    NewParticipant(Participant),
    NewStory(Story),
    VoteRecorded { story_id: String, vote: Vote },
    EstimateSet { story_id: String, estimate: String },
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
}

impl From<SideEffect> for SyncEvent {
    fn from(effect: SideEffect) -> Self {
        match effect {
            SideEffect::NewParticipant(participant) => SyncEvent::NewParticipant(participant),
            SideEffect::NewStory(story) => SyncEvent::NewStory(story),
            SideEffect::VoteRecorded { story_id, vote } => SyncEvent::VoteRecorded { story_id, vote },
            SideEffect::EstimateSet { story_id, estimate } => {
                SyncEvent::EstimateSet { story_id, estimate }
            }
        }
    }
}

/// An edit made by the local user.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalChange {
    ReplaceSession(SessionState),
    AddParticipant(Participant),
    AddStory(Story),
    CastVote { story_id: String, vote: Vote },
    SetEstimate { story_id: String, estimate: String },
}

enum Command {
    Apply {
        change: LocalChange,
        reply: oneshot::Sender<bool>,
    },
    Snapshot(oneshot::Sender<Option<SessionState>>),
    Reconnect,
    Shutdown(oneshot::Sender<()>),
}

/// Cheap, cloneable front end to a running [`MeshSession`].
#[derive(Clone)]
pub struct MeshHandle {
    identity: Arc<LocalIdentity>,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    peers: watch::Receiver<Vec<PeerId>>,
}

impl MeshHandle {
    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.peers.borrow().clone()
    }

    pub fn watch_peers(&self) -> watch::Receiver<Vec<PeerId>> {
        self.peers.clone()
    }

    /// Applies a local edit and disseminates it. Resolves to whether the edit
    /// changed anything.
    pub async fn apply(&self, change: LocalChange) -> Result<bool, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Apply { change, reply })?;
        rx.await.map_err(|_| closed())
    }

    pub async fn update_session(&self, state: SessionState) -> Result<bool, SyncError> {
        self.apply(LocalChange::ReplaceSession(state)).await
    }

    pub async fn add_participant(&self, participant: Participant) -> Result<bool, SyncError> {
        self.apply(LocalChange::AddParticipant(participant)).await
    }

    pub async fn add_story(&self, story: Story) -> Result<bool, SyncError> {
        self.apply(LocalChange::AddStory(story)).await
    }

    pub async fn cast_vote(&self, story_id: &str, value: &str) -> Result<bool, SyncError> {
        let vote = Vote {
            participant_id: self.identity.peer_id.to_string(),
            value: value.to_string(),
        };
        self.apply(LocalChange::CastVote {
            story_id: story_id.to_string(),
            vote,
        })
        .await
    }

    pub async fn set_estimate(&self, story_id: &str, estimate: &str) -> Result<bool, SyncError> {
        self.apply(LocalChange::SetEstimate {
            story_id: story_id.to_string(),
            estimate: estimate.to_string(),
        })
        .await
    }

    pub async fn snapshot(&self) -> Result<Option<SessionState>, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Snapshot(reply))?;
        rx.await.map_err(|_| closed())
    }

    /// Redials signaling if it is down. No-op while connected.
    pub fn reconnect(&self) -> Result<(), SyncError> {
        self.command(Command::Reconnect)
    }

    /// Closes every channel and the signaling connection. Safe to call twice.
    pub async fn shutdown(&self) {
        let (ack, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(ack)).is_ok() {
            let _ = rx.await;
        }
    }

    fn command(&self, command: Command) -> Result<(), SyncError> {
        self.commands.send(command).map_err(|_| closed())
    }
}

fn closed() -> SyncError {
    SyncError::Transport(TransportError::ChannelClosed)
}

pub struct MeshSession {
    identity: Arc<LocalIdentity>,
    options: SessionOptions,
    dialer: Arc<dyn SignalingDialer>,
    manager: PeerManager,
    mesh_rx: mpsc::UnboundedReceiver<MeshInput>,
    broadcaster: Broadcaster,
    reconciler: Reconciler,
    bootstrap: Bootstrap,
    board: StatusBoard,
    events: mpsc::UnboundedSender<SyncEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    signaling: Option<mpsc::UnboundedReceiver<SignalingEvent>>,
    relay: Option<Arc<dyn SignalRelay>>,
    reconnect_attempt: u32,
    reconnect_at: Option<Instant>,
}

impl MeshSession {
    /// Spawns the runtime on the current tokio runtime and dials signaling.
    pub fn start(
        identity: LocalIdentity,
        mode: JoinMode,
        initial: Option<SessionState>,
        dialer: Arc<dyn SignalingDialer>,
        connector: Arc<dyn PeerConnector>,
        options: SessionOptions,
    ) -> (MeshHandle, mpsc::UnboundedReceiver<SyncEvent>) {
        let identity = Arc::new(identity);
        let (manager, mesh_rx) =
            PeerManager::new(identity.peer_id.clone(), options.mesh.clone(), connector);
        let (board, status_rx, peers_rx) = StatusBoard::new();
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();

        let session = MeshSession {
            identity: Arc::clone(&identity),
            options,
            dialer,
            manager,
            mesh_rx,
            broadcaster: Broadcaster::new(identity.peer_id.clone()),
            reconciler: Reconciler::new(initial),
            bootstrap: Bootstrap::new(mode),
            board,
            events,
            commands,
            signaling: None,
            relay: None,
            reconnect_attempt: 0,
            reconnect_at: None,
        };
        tokio::spawn(session.run());

        let handle = MeshHandle {
            identity,
            commands: commands_tx,
            status: status_rx,
            peers: peers_rx,
        };
        (handle, events_rx)
    }

    async fn run(mut self) {
        tracing::info!(
            target = "sync",
            session = %self.identity.session_id,
            peer = %self.identity.peer_id,
            "mesh session starting"
        );
        self.connect().await;
        let mut sweep = tokio::time::interval(self.options.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let flow = match command {
                        Some(command) => self.on_command(command).await,
                        None => {
                            self.close().await;
                            ControlFlow::Break(())
                        }
                    };
                    if flow.is_break() {
                        break;
                    }
                }
                event = next_signal(&mut self.signaling) => match event {
                    Some(event) => {
                        let events = self.manager.handle_signal(event).await;
                        self.on_peer_events(events);
                    }
                    None => self.on_signaling_lost(),
                },
                Some(input) = self.mesh_rx.recv() => {
                    let events = self.manager.handle_input(input).await;
                    self.on_peer_events(events);
                }
                _ = reconnect_due(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.connect().await;
                }
                _ = sweep.tick() => self.manager.sweep_candidates(),
            }
        }
        tracing::info!(target = "sync", session = %self.identity.session_id, "mesh session stopped");
    }

    async fn on_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Apply { change, reply } => {
                let changed = self.apply_local(change);
                let _ = reply.send(changed);
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.reconciler.state().cloned());
            }
            Command::Reconnect => {
                if self.signaling.is_some() {
                    tracing::debug!(target = "sync", "reconnect requested while connected");
                } else {
                    self.reconnect_attempt = 0;
                    self.reconnect_at = None;
                    self.connect().await;
                }
            }
            Command::Shutdown(ack) => {
                self.close().await;
                let _ = ack.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn connect(&mut self) {
        if self.signaling.is_some() {
            return;
        }
        self.board.set_status(ConnectionStatus::Connecting);
        match self
            .dialer
            .dial(&self.identity.session_id, &self.identity.peer_id)
            .await
        {
            Ok(link) => {
                self.manager.set_relay(Some(Arc::clone(&link.relay)));
                self.relay = Some(link.relay);
                self.signaling = Some(link.events);
                self.reconnect_attempt = 0;
                self.board.set_status(ConnectionStatus::Connected);
            }
            Err(err) => {
                tracing::warn!(
                    target = "sync",
                    session = %self.identity.session_id,
                    error = %err,
                    "signaling connect failed"
                );
                self.board.set_status(ConnectionStatus::Error);
                self.schedule_reconnect();
            }
        }
    }

    fn on_signaling_lost(&mut self) {
        tracing::warn!(target = "sync", session = %self.identity.session_id, "signaling connection lost");
        self.signaling = None;
        self.relay = None;
        self.manager.set_relay(None);
        self.board.set_status(ConnectionStatus::Disconnected);
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        let policy = self.options.reconnect;
        if self.reconnect_attempt >= policy.max_retries {
            self.reconnect_at = None;
            return;
        }
        let delay = policy.delay_for(self.reconnect_attempt);
        self.reconnect_attempt += 1;
        tracing::info!(
            target = "sync",
            attempt = self.reconnect_attempt,
            delay_ms = delay.as_millis() as u64,
            "scheduling signaling reconnect"
        );
        self.reconnect_at = Some(Instant::now() + delay);
    }

    fn on_peer_events(&mut self, events: Vec<PeerEvent>) {
        for event in events {
            match event {
                PeerEvent::Connected(peer) => self.on_peer_connected(peer),
                PeerEvent::Disconnected(peer) => {
                    self.bootstrap.on_peer_disconnected(&peer);
                    self.board.set_peers(self.manager.connected_peers());
                    self.emit(SyncEvent::PeerDisconnected(peer));
                }
                PeerEvent::Message { from, text } => self.on_message(&from, &text),
                PeerEvent::NegotiationFailed { peer, reason } => {
                    tracing::debug!(target = "sync", peer = %peer, %reason, "peer unreachable");
                }
            }
        }
    }

    fn on_peer_connected(&mut self, peer: PeerId) {
        let connected = self.manager.connected_peers();
        self.board.set_peers(connected.clone());
        self.emit(SyncEvent::PeerConnected(peer.clone()));

        let request = Payload::SyncRequest(SyncRequestPayload {
            user_id: self.identity.peer_id.to_string(),
            user_name: self.identity.display_name.clone(),
        });
        let sent = match self.bootstrap.on_peer_connected(&peer, &connected) {
            SyncRequestAction::None => return,
            SyncRequestAction::Broadcast => self
                .broadcaster
                .broadcast(&self.manager, &request)
                .map(|(_, count)| count > 0),
            SyncRequestAction::Ask(target) => {
                self.broadcaster.send(&self.manager, &target, &request)
            }
        };
        match sent {
            Ok(_) => tracing::debug!(target = "sync", peer = %peer, "requested session snapshot"),
            Err(err) => {
                tracing::warn!(target = "sync", peer = %peer, error = %err, "sync request failed")
            }
        }
    }

    fn on_message(&mut self, from: &PeerId, text: &str) {
        let inbound = match self.broadcaster.receive(from, text) {
            Ok(inbound) => inbound,
            Err(err) => {
                tracing::warn!(target = "sync", peer = %from, error = %err, "dropping peer message");
                return;
            }
        };
        match inbound {
            Inbound::Ignored => {}
            Inbound::SyncRequest {
                requester,
                request,
                asked_at,
            } => self.answer_sync_request(&requester, request, asked_at),
            Inbound::Apply { message, payload } => {
                let result = match payload {
                    Payload::Snapshot(state) => match self.bootstrap.route_snapshot(from, message.reply_to) {
                        SnapshotRoute::Bootstrap => self.reconciler.adopt(&message, state),
                        SnapshotRoute::DuplicateReply => {
                            tracing::debug!(target = "sync", peer = %from, "ignoring extra bootstrap reply");
                            return;
                        }
                        SnapshotRoute::Regular => {
                            self.reconciler.apply(&message, &Payload::Snapshot(state))
                        }
                    },
                    payload => self.reconciler.apply(&message, &payload),
                };
                self.publish(result);
            }
        }
    }

    /// Records the requester as a participant, tells the other peers about it,
    /// and hands back the full session on the channel the request came in on.
    fn answer_sync_request(&mut self, requester: &PeerId, request: SyncRequestPayload, asked_at: i64) {
        if !self.bootstrap.can_answer() {
            tracing::debug!(target = "sync", peer = %requester, "still bootstrapping; not answering");
            return;
        }
        if !request.user_id.is_empty() {
            let participant = Participant::new(request.user_id, request.user_name);
            let joined = participant.clone();
            if self.reconciler.edit(|state| state.add_participant(participant)) {
                let notice = Payload::Participant(joined.clone());
                if let Err(err) = self
                    .broadcaster
                    .broadcast_except(&self.manager, requester, &notice)
                {
                    tracing::warn!(target = "sync", peer = %requester, error = %err, "participant broadcast failed");
                }
                self.emit(SyncEvent::NewParticipant(joined));
            }
        }
        let Some(state) = self.reconciler.state().cloned() else {
            tracing::debug!(target = "sync", peer = %requester, "no session to share yet");
            return;
        };
        match self
            .broadcaster
            .reply(&self.manager, requester, &Payload::Snapshot(state), asked_at)
        {
            Ok(true) => tracing::debug!(target = "sync", peer = %requester, "answered sync request"),
            Ok(false) => tracing::debug!(target = "sync", peer = %requester, "requester channel closed"),
            Err(err) => {
                tracing::warn!(target = "sync", peer = %requester, error = %err, "sync reply failed")
            }
        }
    }

    fn apply_local(&mut self, change: LocalChange) -> bool {
        let (changed, element) = match change {
            LocalChange::ReplaceSession(state) => {
                let changed = self.reconciler.state() != Some(&state);
                self.reconciler.replace(state);
                (changed, None)
            }
            LocalChange::AddParticipant(participant) => {
                let added = self
                    .reconciler
                    .edit(|state| state.add_participant(participant.clone()));
                (added, Some(Payload::Participant(participant)))
            }
            LocalChange::AddStory(story) => {
                let added = self.reconciler.edit(|state| state.add_story(story.clone()));
                (added, Some(Payload::Story(story)))
            }
            LocalChange::CastVote { story_id, vote } => {
                let recorded = self.reconciler.edit(|state| {
                    matches!(
                        state.record_vote(&story_id, vote.clone()),
                        VoteOutcome::Appended | VoteOutcome::Replaced
                    )
                });
                (recorded, Some(Payload::Vote(VotePayload { story_id, vote })))
            }
            LocalChange::SetEstimate { story_id, estimate } => {
                let set = self
                    .reconciler
                    .edit(|state| state.set_estimate(&story_id, &estimate));
                (set, Some(Payload::Estimate(EstimatePayload { story_id, estimate })))
            }
        };
        if !changed {
            tracing::debug!(target = "sync", "local change had no effect");
            return false;
        }

        if let Some(element) = element {
            if let Err(err) = self.broadcaster.broadcast(&self.manager, &element) {
                tracing::warn!(target = "sync", error = %err, "element broadcast failed");
            }
        }
        if let Some(state) = self.reconciler.state().cloned() {
            match self
                .broadcaster
                .broadcast(&self.manager, &Payload::Snapshot(state))
            {
                Ok((message, _)) => self.reconciler.note_snapshot(message.timestamp),
                Err(err) => tracing::warn!(target = "sync", error = %err, "snapshot broadcast failed"),
            }
        }
        true
    }

    fn publish(&self, result: Reconciled) {
        if !result.changed {
            return;
        }
        for effect in result.effects {
            self.emit(effect.into());
        }
        if let Some(state) = result.state {
            self.emit(SyncEvent::Updated(state));
        }
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    async fn close(&mut self) {
        self.manager.shutdown().await;
        if let Some(relay) = self.relay.take() {
            relay.close();
        }
        self.signaling = None;
        self.reconnect_at = None;
        self.board.set_peers(Vec::new());
        self.board.set_status(ConnectionStatus::Disconnected);
    }
}

async fn next_signal(
    signaling: &mut Option<mpsc::UnboundedReceiver<SignalingEvent>>,
) -> Option<SignalingEvent> {
    match signaling {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

async fn reconnect_due(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
