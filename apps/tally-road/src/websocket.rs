use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::signaling::SignalFrame;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("join a session before sending {0}")]
    NotJoined(&'static str),
    #[error("{0} frames are only sent by the server")]
    ServerOnly(&'static str),
    #[error("invalid message format: {0}")]
    Malformed(String),
}

/// One registered socket in a room.
struct Member {
    connection: u64,
    tx: mpsc::UnboundedSender<SignalFrame>,
    last_seen: Instant,
    joined_at: DateTime<Utc>,
    evict: Arc<Notify>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Seat {
    session_id: String,
    user_id: String,
    connection: u64,
}

/// Map of session_id -> (user_id -> Member)
#[derive(Default)]
struct Registry {
    rooms: DashMap<String, DashMap<String, Member>>,
    next_connection: AtomicU64,
}

impl Registry {
    /// Seats `user_id`, returning the member it displaced, if any.
    fn join(&self, seat: &Seat, tx: mpsc::UnboundedSender<SignalFrame>, evict: Arc<Notify>) -> Option<Member> {
        let member = Member {
            connection: seat.connection,
            tx,
            last_seen: Instant::now(),
            joined_at: Utc::now(),
            evict,
        };
        let replaced = self
            .rooms
            .entry(seat.session_id.clone())
            .or_default()
            .insert(seat.user_id.clone(), member);
        self.record_gauges();
        replaced
    }

    /// Removes the seat if it still belongs to `seat.connection`.
    fn leave(&self, seat: &Seat) -> Option<Member> {
        let removed = self.rooms.get(&seat.session_id).and_then(|room| {
            room.remove_if(&seat.user_id, |_, member| member.connection == seat.connection)
                .map(|(_, member)| member)
        });
        self.rooms
            .remove_if(&seat.session_id, |_, room| room.is_empty());
        if removed.is_some() {
            self.record_gauges();
        }
        removed
    }

    fn touch(&self, seat: &Seat) {
        if let Some(room) = self.rooms.get(&seat.session_id) {
            if let Some(mut member) = room.get_mut(&seat.user_id) {
                if member.connection == seat.connection {
                    member.last_seen = Instant::now();
                }
            }
        }
    }

    /// Delivers a negotiation frame to one member of the room.
    fn send_to(&self, session_id: &str, user_id: &str, frame: SignalFrame) -> bool {
        let Some(room) = self.rooms.get(session_id) else {
            return false;
        };
        let Some(member) = room.get(user_id) else {
            return false;
        };
        member.tx.send(frame).is_ok()
    }

    fn broadcast_except(&self, session_id: &str, user_id: &str, frame: SignalFrame) {
        if let Some(room) = self.rooms.get(session_id) {
            for member in room.iter() {
                if member.key() != user_id {
                    let _ = member.tx.send(frame.clone());
                }
            }
        }
    }

    fn stale_seats(&self, timeout: Duration) -> Vec<Seat> {
        let mut stale = Vec::new();
        for room in self.rooms.iter() {
            for member in room.value().iter() {
                if member.last_seen.elapsed() > timeout {
                    stale.push(Seat {
                        session_id: room.key().clone(),
                        user_id: member.key().clone(),
                        connection: member.connection,
                    });
                }
            }
        }
        stale
    }

    fn record_gauges(&self) {
        let members: usize = self.rooms.iter().map(|room| room.len()).sum();
        gauge!("tally_road_rooms_active", self.rooms.len() as f64);
        gauge!("tally_road_members_active", members as f64);
    }
}

/// Shared rendezvous state: rooms keyed by session id.
#[derive(Clone)]
pub struct RoadState {
    registry: Arc<Registry>,
}

impl RoadState {
    /// Creates the room table and starts the heartbeat monitor. The monitor
    /// stops once every clone of the state is dropped.
    pub fn new(config: &Config) -> Self {
        let state = Self {
            registry: Arc::new(Registry::default()),
        };
        tokio::spawn(monitor_heartbeats(
            Arc::downgrade(&state.registry),
            config.heartbeat_timeout,
            config.sweep_interval,
        ));
        state
    }

    /// User ids currently seated in `session_id`, sorted.
    pub fn room_members(&self, session_id: &str) -> Vec<String> {
        let mut members: Vec<String> = self
            .registry
            .rooms
            .get(session_id)
            .map(|room| room.iter().map(|member| member.key().clone()).collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    pub fn room_count(&self) -> usize {
        self.registry.rooms.len()
    }
}

async fn monitor_heartbeats(registry: Weak<Registry>, timeout: Duration, sweep: Duration) {
    let mut interval = tokio::time::interval(sweep);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let Some(registry) = registry.upgrade() else {
            debug!("signaling state dropped; heartbeat monitor exiting");
            return;
        };

        for seat in registry.stale_seats(timeout) {
            let Some(member) = registry.leave(&seat) else {
                continue;
            };
            info!(
                session = %seat.session_id,
                user = %seat.user_id,
                connected_secs = (Utc::now() - member.joined_at).num_seconds(),
                "evicting silent member (heartbeat timeout)"
            );
            counter!("tally_road_evictions_total", 1);
            member.evict.notify_one();
            registry.broadcast_except(
                &seat.session_id,
                &seat.user_id,
                SignalFrame::UserLeft {
                    user_id: seat.user_id.clone(),
                },
            );
        }
    }
}

/// WebSocket upgrade handler for `/signal`.
pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<RoadState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: RoadState) {
    let registry = state.registry;
    let connection = registry.next_connection.fetch_add(1, Ordering::Relaxed);
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<SignalFrame>();

    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match serde_json::to_string(&frame) {
                Ok(json) => {
                    if sink.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(err) => warn!(connection, error = %err, "failed to encode signaling frame"),
            }
        }
        let _ = sink.close().await;
        debug!(connection, "writer task ended");
    });

    let evict = Arc::new(Notify::new());
    let mut seat: Option<Seat> = None;
    debug!(connection, "websocket connected");

    loop {
        let next = tokio::select! {
            _ = evict.notified() => {
                debug!(connection, "socket evicted");
                break;
            }
            next = stream.next() => next,
        };
        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(err)) => {
                debug!(connection, error = %err, "websocket error");
                break;
            }
            None => break,
        };
        if let Some(seat) = &seat {
            registry.touch(seat);
        }

        let text = match message {
            Message::Text(text) => text,
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    let _ = tx.send(SignalFrame::error("binary frames must carry UTF-8 JSON"));
                    continue;
                }
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        let outcome = serde_json::from_str::<SignalFrame>(&text)
            .map_err(|err| RelayError::Malformed(err.to_string()))
            .and_then(|frame| {
                counter!("tally_road_frames_total", 1, "type" => frame.kind());
                handle_frame(&registry, frame, connection, &tx, &evict, &mut seat)
            });
        if let Err(err) = outcome {
            debug!(connection, error = %err, "rejecting signaling frame");
            counter!("tally_road_frames_rejected_total", 1);
            let _ = tx.send(SignalFrame::error(err.to_string()));
        }
    }

    if let Some(seat) = seat {
        vacate(&registry, &seat);
    }
    debug!(connection, "websocket disconnected");
}

fn handle_frame(
    registry: &Registry,
    frame: SignalFrame,
    connection: u64,
    tx: &mpsc::UnboundedSender<SignalFrame>,
    evict: &Arc<Notify>,
    seat: &mut Option<Seat>,
) -> Result<(), RelayError> {
    if let SignalFrame::Join {
        session_id,
        user_id,
    } = frame
    {
        if session_id.trim().is_empty() || user_id.trim().is_empty() {
            return Err(RelayError::Malformed(
                "join needs a sessionId and a userId".into(),
            ));
        }
        if let Some(previous) = seat.take() {
            vacate(registry, &previous);
        }
        let joined = Seat {
            session_id,
            user_id,
            connection,
        };
        if let Some(replaced) = registry.join(&joined, tx.clone(), evict.clone()) {
            info!(
                session = %joined.session_id,
                user = %joined.user_id,
                "user rejoined; closing previous socket"
            );
            replaced.evict.notify_one();
        }
        info!(session = %joined.session_id, user = %joined.user_id, "member joined");
        counter!("tally_road_joins_total", 1);
        registry.broadcast_except(
            &joined.session_id,
            &joined.user_id,
            SignalFrame::UserJoined {
                user_id: joined.user_id.clone(),
            },
        );
        *seat = Some(joined);
        return Ok(());
    }

    let Some(current) = seat.as_ref() else {
        return Err(RelayError::NotJoined(frame.kind()));
    };

    match frame {
        SignalFrame::Ping => {
            let _ = tx.send(SignalFrame::Pong);
        }
        SignalFrame::Pong => {}
        SignalFrame::Offer { .. } | SignalFrame::Answer { .. } | SignalFrame::IceCandidate { .. } => {
            let kind = frame.kind();
            let target = frame.target().unwrap_or_default().to_string();
            if registry.send_to(&current.session_id, &target, frame) {
                debug!(session = %current.session_id, from = %current.user_id, to = %target, kind, "relayed");
            } else {
                warn!(
                    session = %current.session_id,
                    from = %current.user_id,
                    to = %target,
                    kind,
                    "dropping negotiation frame for unknown target"
                );
                counter!("tally_road_relay_dropped_total", 1, "type" => kind);
            }
        }
        other => return Err(RelayError::ServerOnly(other.kind())),
    }
    Ok(())
}

fn vacate(registry: &Registry, seat: &Seat) {
    if registry.leave(seat).is_some() {
        info!(session = %seat.session_id, user = %seat.user_id, "member left");
        registry.broadcast_except(
            &seat.session_id,
            &seat.user_id,
            SignalFrame::UserLeft {
                user_id: seat.user_id.clone(),
            },
        );
    }
}
