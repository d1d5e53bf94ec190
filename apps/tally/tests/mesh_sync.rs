use std::sync::Arc;
use std::time::Duration;
use tally_client_core::PeerId;
use tally_client_core::health::ConnectionStatus;
use tally_client_core::model::{SessionState, Story, StoryStatus};
use tally_client_core::sync::{JoinMode, LocalIdentity, MeshHandle, MeshSession, SessionOptions, SyncEvent};
use tally_client_core::transport::SignalingEvent;
use tally_client_core::transport::memory::MemoryNetwork;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing_subscriber::EnvFilter;

const SESSION: &str = "S1";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

struct Peer {
    handle: MeshHandle,
    events: UnboundedReceiver<SyncEvent>,
}

fn start(network: &MemoryNetwork, id: &str, initial: Option<SessionState>) -> Peer {
    let mode = if initial.is_some() {
        JoinMode::Create
    } else {
        JoinMode::Join
    };
    let (handle, events) = MeshSession::start(
        LocalIdentity::new(SESSION, id, id.to_uppercase()),
        mode,
        initial,
        Arc::new(network.dialer()),
        Arc::new(network.connector()),
        SessionOptions::default(),
    );
    Peer { handle, events }
}

fn creator(network: &MemoryNetwork, id: &str) -> Peer {
    let identity = LocalIdentity::new(SESSION, id, id.to_uppercase());
    let state = SessionState::new(SESSION, "Sprint 12", identity.participant());
    start(network, id, Some(state))
}

async fn wait_for_status(handle: &MeshHandle, expected: ConnectionStatus) {
    let mut status = handle.watch_status();
    while *status.borrow_and_update() != expected {
        status.changed().await.expect("session stopped");
    }
}

async fn wait_for_peer_count(handle: &MeshHandle, expected: usize) {
    let mut peers = handle.watch_peers();
    while peers.borrow_and_update().len() != expected {
        peers.changed().await.expect("session stopped");
    }
}

/// Polls the session copy until `check` holds.
async fn wait_for_state(handle: &MeshHandle, check: impl Fn(&SessionState) -> bool) -> SessionState {
    loop {
        if let Some(state) = handle.snapshot().await.unwrap() {
            if check(&state) {
                return state;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn drain(events: &mut UnboundedReceiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

fn participant_ids(state: &SessionState) -> Vec<&str> {
    state.participants.iter().map(|p| p.id.as_str()).collect()
}

#[test_timeout::tokio_timeout_test]
async fn joiner_adopts_creator_snapshot_including_itself() {
    init_tracing();
    let network = MemoryNetwork::new();
    let mut alice = creator(&network, "alice");
    wait_for_status(&alice.handle, ConnectionStatus::Connected).await;

    let mut bob = start(&network, "bob", None);
    wait_for_peer_count(&alice.handle, 1).await;
    wait_for_peer_count(&bob.handle, 1).await;

    let state = wait_for_state(&bob.handle, |_| true).await;
    assert_eq!(participant_ids(&state), vec!["alice", "bob"]);
    assert!(state.stories.is_empty());
    assert_eq!(state.name, "Sprint 12");

    let bob_events = drain(&mut bob.events);
    assert_eq!(bob_events.first(), Some(&SyncEvent::PeerConnected(PeerId::from("alice"))));
    assert!(bob_events.contains(&SyncEvent::Updated(state.clone())));
    assert!(
        !bob_events
            .iter()
            .any(|event| matches!(event, SyncEvent::NewParticipant(_))),
        "bootstrap snapshot must not raise participant events: {bob_events:?}"
    );

    let alice_state = alice.handle.snapshot().await.unwrap().unwrap();
    assert_eq!(alice_state, state);
    let alice_events = drain(&mut alice.events);
    assert!(alice_events.iter().any(|event| matches!(
        event,
        SyncEvent::NewParticipant(participant) if participant.id == "bob" && participant.name == "BOB"
    )));
}

#[test_timeout::tokio_timeout_test]
async fn edits_from_any_peer_converge_everywhere() {
    init_tracing();
    let network = MemoryNetwork::new();
    let alice = creator(&network, "alice");
    wait_for_status(&alice.handle, ConnectionStatus::Connected).await;
    let bob = start(&network, "bob", None);
    wait_for_state(&bob.handle, |_| true).await;
    let carol = start(&network, "carol", None);
    wait_for_state(&carol.handle, |_| true).await;
    for peer in [&alice, &bob, &carol] {
        wait_for_peer_count(&peer.handle, 2).await;
    }

    assert!(alice.handle.add_story(Story::new("st-1", "Checkout")).await.unwrap());
    wait_for_state(&bob.handle, |state| state.story("st-1").is_some()).await;
    assert!(bob.handle.cast_vote("st-1", "8").await.unwrap());
    wait_for_state(&carol.handle, |state| {
        state.story("st-1").is_some_and(|story| !story.votes.is_empty())
    })
    .await;
    assert!(carol.handle.set_estimate("st-1", "8").await.unwrap());

    let settled = |state: &SessionState| {
        state
            .story("st-1")
            .is_some_and(|story| story.final_estimate.as_deref() == Some("8") && story.votes.len() == 1)
    };
    let final_alice = wait_for_state(&alice.handle, settled).await;
    let final_bob = wait_for_state(&bob.handle, settled).await;
    let final_carol = wait_for_state(&carol.handle, settled).await;
    assert_eq!(final_alice, final_carol);
    assert_eq!(final_bob, final_carol);

    let story = final_carol.story("st-1").unwrap();
    assert_eq!(story.status, StoryStatus::Completed);
    assert_eq!(story.votes[0].participant_id, "bob");
    assert_eq!(final_carol.velocity(), 8.0);
    assert_eq!(network.open_channels(), 3);
}

#[test_timeout::tokio_timeout_test]
async fn own_broadcasts_never_come_back() {
    init_tracing();
    let network = MemoryNetwork::new();
    let mut alice = creator(&network, "alice");
    wait_for_status(&alice.handle, ConnectionStatus::Connected).await;
    let mut bob = start(&network, "bob", None);
    wait_for_state(&bob.handle, |_| true).await;
    drain(&mut bob.events);

    assert!(alice.handle.add_story(Story::new("st-1", "Search")).await.unwrap());
    wait_for_state(&bob.handle, |state| state.story("st-1").is_some()).await;
    let bob_events = drain(&mut bob.events);
    assert!(bob_events.iter().any(|event| matches!(event, SyncEvent::NewStory(story) if story.id == "st-1")));

    // let anything in flight land before checking the sender's queue
    tokio::time::sleep(Duration::from_millis(50)).await;
    let alice_events = drain(&mut alice.events);
    assert!(
        !alice_events
            .iter()
            .any(|event| matches!(event, SyncEvent::NewStory(_) | SyncEvent::Updated(_))),
        "sender saw its own update: {alice_events:?}"
    );
}

#[test_timeout::tokio_timeout_test]
async fn duplicate_join_notices_keep_a_single_channel() {
    init_tracing();
    let network = MemoryNetwork::new();
    let alice = creator(&network, "alice");
    wait_for_status(&alice.handle, ConnectionStatus::Connected).await;
    let bob = start(&network, "bob", None);
    wait_for_status(&bob.handle, ConnectionStatus::Connected).await;

    // bob also hears about alice, so both sides may offer at once
    assert!(network.deliver(SESSION, &PeerId::from("bob"), SignalingEvent::PeerJoined(PeerId::from("alice"))));

    wait_for_peer_count(&alice.handle, 1).await;
    wait_for_peer_count(&bob.handle, 1).await;
    wait_for_state(&bob.handle, |_| true).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    wait_for_peer_count(&alice.handle, 1).await;
    wait_for_peer_count(&bob.handle, 1).await;
    assert_eq!(network.open_channels(), 1);
    assert_eq!(alice.handle.connected_peers(), vec![PeerId::from("bob")]);
    assert_eq!(bob.handle.connected_peers(), vec![PeerId::from("alice")]);
}

#[test_timeout::tokio_timeout_test]
async fn restarted_peer_reconnects_under_the_same_id() {
    init_tracing();
    let network = MemoryNetwork::new();
    let alice = creator(&network, "alice");
    wait_for_status(&alice.handle, ConnectionStatus::Connected).await;
    let bob = start(&network, "bob", None);
    wait_for_state(&bob.handle, |_| true).await;
    wait_for_peer_count(&alice.handle, 1).await;

    // the first bob never leaves; its replacement takes over the room seat
    let bob_again = start(&network, "bob", None);
    let state = wait_for_state(&bob_again.handle, |_| true).await;
    assert_eq!(participant_ids(&state), vec!["alice", "bob"]);
    wait_for_peer_count(&bob_again.handle, 1).await;
    wait_for_peer_count(&bob.handle, 0).await;

    assert_eq!(alice.handle.connected_peers(), vec![PeerId::from("bob")]);
    assert_eq!(network.open_channels(), 1);
    assert!(alice.handle.add_story(Story::new("st-1", "After restart")).await.unwrap());
    wait_for_state(&bob_again.handle, |state| state.story("st-1").is_some()).await;
}

#[test_timeout::tokio_timeout_test]
async fn snapshot_from_peer_that_was_asked_during_bootstrap_is_applied() {
    init_tracing();
    let network = MemoryNetwork::new();
    // bob and carol meet before anyone holds the session, so each asks the
    // other and neither can answer
    let bob = start(&network, "bob", None);
    wait_for_status(&bob.handle, ConnectionStatus::Connected).await;
    let carol = start(&network, "carol", None);
    wait_for_peer_count(&bob.handle, 1).await;
    wait_for_peer_count(&carol.handle, 1).await;

    let alice = creator(&network, "alice");
    wait_for_state(&bob.handle, |_| true).await;
    let mut renamed = wait_for_state(&carol.handle, |_| true).await;
    wait_for_peer_count(&carol.handle, 2).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    renamed.name = "Renamed".into();
    assert!(carol.handle.update_session(renamed).await.unwrap());
    let is_renamed = |state: &SessionState| state.name == "Renamed";
    wait_for_state(&alice.handle, is_renamed).await;
    wait_for_state(&bob.handle, is_renamed).await;
}

#[test_timeout::tokio_timeout_test]
async fn responder_announces_joiner_to_peers_it_cannot_reach() {
    init_tracing();
    let network = MemoryNetwork::new();
    let alice = creator(&network, "alice");
    wait_for_status(&alice.handle, ConnectionStatus::Connected).await;
    let mut bob = start(&network, "bob", None);
    wait_for_state(&bob.handle, |_| true).await;
    drain(&mut bob.events);

    network.partition(&PeerId::from("bob"), &PeerId::from("carol"));
    let carol = start(&network, "carol", None);
    let state = wait_for_state(&carol.handle, |_| true).await;
    assert_eq!(participant_ids(&state), vec!["alice", "bob", "carol"]);

    let seen = wait_for_state(&bob.handle, |state| state.participants.len() == 3).await;
    assert_eq!(participant_ids(&seen), vec!["alice", "bob", "carol"]);
    assert_eq!(bob.handle.connected_peers(), vec![PeerId::from("alice")]);
    assert!(drain(&mut bob.events).iter().any(|event| matches!(
        event,
        SyncEvent::NewParticipant(participant) if participant.id == "carol"
    )));
}

#[test_timeout::tokio_timeout_test]
async fn lone_joiner_stays_empty_until_someone_can_answer() {
    init_tracing();
    let network = MemoryNetwork::new();
    let bob = start(&network, "bob", None);
    wait_for_status(&bob.handle, ConnectionStatus::Connected).await;
    assert_eq!(bob.handle.snapshot().await.unwrap(), None);
    assert!(!bob.handle.add_story(Story::new("st-1", "Orphan")).await.unwrap());
    assert!(bob.handle.connected_peers().is_empty());

    let alice = creator(&network, "alice");
    let state = wait_for_state(&bob.handle, |_| true).await;
    assert_eq!(participant_ids(&state), vec!["alice", "bob"]);
    assert_eq!(alice.handle.snapshot().await.unwrap(), Some(state));
}

#[test_timeout::tokio_timeout_test]
async fn unreachable_rendezvous_reports_error_and_keeps_local_state() {
    init_tracing();
    let network = MemoryNetwork::new();
    network.set_offline(true);
    let alice = creator(&network, "alice");
    wait_for_status(&alice.handle, ConnectionStatus::Error).await;

    assert!(alice.handle.add_story(Story::new("st-1", "Offline edit")).await.unwrap());
    let state = alice.handle.snapshot().await.unwrap().unwrap();
    assert_eq!(state.stories.len(), 1);
    assert!(alice.handle.connected_peers().is_empty());
    assert_eq!(alice.handle.status().label(), "Connection Error");
}

#[test_timeout::tokio_timeout_test]
async fn shutdown_closes_channels_and_notifies_remaining_peers() {
    init_tracing();
    let network = MemoryNetwork::new();
    let alice = creator(&network, "alice");
    wait_for_status(&alice.handle, ConnectionStatus::Connected).await;
    let mut bob = start(&network, "bob", None);
    wait_for_peer_count(&bob.handle, 1).await;
    assert_eq!(network.open_channels(), 1);

    alice.handle.shutdown().await;
    assert_eq!(alice.handle.status(), ConnectionStatus::Disconnected);
    wait_for_peer_count(&bob.handle, 0).await;
    assert_eq!(network.open_channels(), 0);
    assert_eq!(network.room_members(SESSION), vec![PeerId::from("bob")]);
    assert!(drain(&mut bob.events).contains(&SyncEvent::PeerDisconnected(PeerId::from("alice"))));
    assert_eq!(bob.handle.status(), ConnectionStatus::Connected);
}
