//! Mesh sessions negotiating through a real tally-road relay. Peer links are
//! in-memory so the tests need no ICE connectivity.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tally_client_core::health::ConnectionStatus;
use tally_client_core::model::{SessionState, Story};
use tally_client_core::sync::{JoinMode, LocalIdentity, MeshHandle, MeshSession, SessionOptions, SyncEvent};
use tally_client_core::transport::memory::MemoryNetwork;
use tally_client_core::transport::signaling::WebSocketDialer;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

async fn spawn_road() -> SocketAddr {
    let road = tally_road::RoadState::new(&tally_road::Config::default());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, tally_road::build_router(road, None))
            .await
            .unwrap();
    });
    addr
}

fn start(
    url: &str,
    links: &MemoryNetwork,
    id: &str,
    initial: Option<SessionState>,
) -> (MeshHandle, UnboundedReceiver<SyncEvent>) {
    let mode = if initial.is_some() {
        JoinMode::Create
    } else {
        JoinMode::Join
    };
    MeshSession::start(
        LocalIdentity::new("ROAD01", id, id.to_uppercase()),
        mode,
        initial,
        Arc::new(WebSocketDialer::new(url)),
        Arc::new(links.connector()),
        SessionOptions::default(),
    )
}

async fn wait_for_status(handle: &MeshHandle, expected: ConnectionStatus) {
    let mut status = handle.watch_status();
    while *status.borrow_and_update() != expected {
        status.changed().await.expect("session stopped");
    }
}

async fn wait_for_state(handle: &MeshHandle, check: impl Fn(&SessionState) -> bool) -> SessionState {
    loop {
        if let Some(state) = handle.snapshot().await.unwrap() {
            if check(&state) {
                return state;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[test_timeout::tokio_timeout_test(30)]
async fn peers_meet_through_the_relay_and_sync() {
    init_tracing();
    let addr = spawn_road().await;
    let url = format!("ws://{addr}/signal");
    let links = MemoryNetwork::new();

    let identity = LocalIdentity::new("ROAD01", "alice", "ALICE");
    let initial = SessionState::new("ROAD01", "Relay sprint", identity.participant());
    let (alice, _alice_events) = start(&url, &links, "alice", Some(initial));
    wait_for_status(&alice, ConnectionStatus::Connected).await;

    let (bob, mut bob_events) = start(&url, &links, "bob", None);
    let state = wait_for_state(&bob, |_| true).await;
    let ids: Vec<&str> = state.participants.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, vec!["alice", "bob"]);
    assert!(links.applied_candidates() >= 1);

    assert!(bob.add_story(Story::new("st-9", "Relay-negotiated story")).await.unwrap());
    wait_for_state(&alice, |state| state.story("st-9").is_some()).await;

    let mut saw_alice = false;
    while let Ok(event) = bob_events.try_recv() {
        saw_alice |= event == SyncEvent::PeerConnected("alice".into());
    }
    assert!(saw_alice);

    bob.shutdown().await;
    alice.shutdown().await;
}

#[test_timeout::tokio_timeout_test(30)]
async fn closed_port_surfaces_connection_error() {
    init_tracing();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let links = MemoryNetwork::new();
    let (handle, _events) = start(&format!("ws://{addr}/signal"), &links, "alice", None);
    wait_for_status(&handle, ConnectionStatus::Error).await;
    assert!(handle.connected_peers().is_empty());
}

#[test_timeout::tokio_timeout_test]
async fn unsupported_scheme_is_rejected_before_dialing() {
    init_tracing();
    let links = MemoryNetwork::new();
    let (handle, _events) = start("ftp://127.0.0.1/signal", &links, "alice", None);
    wait_for_status(&handle, ConnectionStatus::Error).await;
}
