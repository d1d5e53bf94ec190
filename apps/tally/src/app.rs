use crate::cli::{Cli, Command};
use anyhow::{Context, bail};
use std::sync::Arc;
use tally_client_core::config::Config;
use tally_client_core::health::RetryPolicy;
use tally_client_core::model::{SessionState, Story};
use tally_client_core::store::{RestSessionStore, load_with_retry};
use tally_client_core::sync::{JoinMode, LocalIdentity, MeshHandle, MeshSession, SyncEvent};
use tally_client_core::transport::signaling::WebSocketDialer;
use tally_client_core::transport::webrtc::WebRtcConnector;
use tokio::io::{AsyncBufReadExt, BufReader};
use uuid::Uuid;

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::from_env();
    if let Some(url) = cli.signaling_url {
        config.signaling_url = url;
    }

    let (identity, mode, initial) = match cli.command {
        Command::Create(args) => {
            let session_id = args.session.unwrap_or_else(session_code);
            let identity = LocalIdentity::new(
                session_id.clone(),
                args.user.unwrap_or_else(random_id),
                args.name,
            );
            let mut state = SessionState::new(session_id, args.title, identity.participant());
            state.voting_system = args.voting_system;
            (identity, JoinMode::Create, Some(state))
        }
        Command::Join(args) => {
            let session_id = args.session;
            let initial = if args.load {
                Some(load_from_store(&config, &session_id).await?)
            } else {
                None
            };
            let identity = LocalIdentity::new(
                session_id,
                args.user.unwrap_or_else(random_id),
                args.name,
            );
            (identity, JoinMode::Join, initial)
        }
    };

    let dialer = Arc::new(WebSocketDialer::new(config.signaling_url.clone()));
    let connector = Arc::new(WebRtcConnector::new(config.webrtc_settings()));
    let (handle, mut events) = MeshSession::start(
        identity,
        mode,
        initial,
        dialer,
        connector,
        config.session_options(),
    );
    println!(
        "session {} as {} ({}). Type `help` for commands.",
        handle.identity().session_id,
        handle.identity().display_name,
        handle.identity().peer_id
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut status = handle.watch_status();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    break;
                };
                match parse_input(&line) {
                    Ok(Some(Input::Quit)) => break,
                    Ok(Some(input)) => execute(&handle, input).await?,
                    Ok(None) => {}
                    Err(message) => println!("{message}"),
                }
            }
            Some(event) = events.recv() => print_event(&event),
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *status.borrow_and_update();
                println!("[status] {}", current.label());
            }
        }
    }

    handle.shutdown().await;
    Ok(())
}

async fn load_from_store(config: &Config, session_id: &str) -> anyhow::Result<SessionState> {
    let (Some(url), Some(key)) = (config.store_url.as_deref(), config.store_key.as_deref()) else {
        bail!("--load needs TALLY_STORE_URL and TALLY_STORE_KEY");
    };
    let store = RestSessionStore::new(url, key)?;
    let record = load_with_retry(&store, session_id, &RetryPolicy::default()).await?;
    Ok(record.into_session_state())
}

fn random_id() -> String {
    Uuid::new_v4().to_string()
}

fn session_code() -> String {
    Uuid::new_v4().simple().to_string()[..6].to_uppercase()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Input {
    Story(String),
    Vote { story_id: String, value: String },
    Estimate { story_id: String, value: String },
    Peers,
    Show,
    Stats,
    Status,
    Reconnect,
    Help,
    Quit,
}

const HELP: &str = "commands: story <title> | vote <story-id> <value> | estimate <story-id> <value> | peers | show | stats | status | reconnect | quit";

fn parse_input(line: &str) -> Result<Option<Input>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (command, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();
    let two_args = |usage: &str| {
        let mut parts = rest.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some(story_id), Some(value), None) => Ok((story_id.to_string(), value.to_string())),
            _ => Err(format!("usage: {usage}")),
        }
    };
    let input = match command {
        "story" if rest.is_empty() => return Err("usage: story <title>".into()),
        "story" => Input::Story(rest.to_string()),
        "vote" => {
            let (story_id, value) = two_args("vote <story-id> <value>")?;
            Input::Vote { story_id, value }
        }
        "estimate" => {
            let (story_id, value) = two_args("estimate <story-id> <value>")?;
            Input::Estimate { story_id, value }
        }
        "peers" => Input::Peers,
        "show" => Input::Show,
        "stats" => Input::Stats,
        "status" => Input::Status,
        "reconnect" => Input::Reconnect,
        "help" | "?" => Input::Help,
        "quit" | "exit" => Input::Quit,
        other => return Err(format!("unknown command `{other}`; {HELP}")),
    };
    Ok(Some(input))
}

async fn execute(handle: &MeshHandle, input: Input) -> anyhow::Result<()> {
    match input {
        Input::Story(title) => {
            let id = format!("story-{}", &Uuid::new_v4().simple().to_string()[..8]);
            if handle.add_story(Story::new(id.clone(), title)).await? {
                println!("added {id}");
            } else {
                println!("no session yet; wait for a peer to share it");
            }
        }
        Input::Vote { story_id, value } => {
            if !handle.cast_vote(&story_id, &value).await? {
                println!("vote not recorded (unknown story or same value)");
            }
        }
        Input::Estimate { story_id, value } => {
            if !handle.set_estimate(&story_id, &value).await? {
                println!("estimate not set (unknown story or same value)");
            }
        }
        Input::Peers => {
            let peers = handle.connected_peers();
            if peers.is_empty() {
                println!("no connected peers");
            }
            for peer in peers {
                println!("  {peer}");
            }
        }
        Input::Show => match handle.snapshot().await? {
            Some(state) => print!("{}", render_session(&state)),
            None => println!("no session yet"),
        },
        Input::Stats => match handle.snapshot().await? {
            Some(state) => {
                println!("velocity: {}", state.velocity());
                println!("average:  {:.1}", state.average_points());
                for (estimate, count) in state.estimate_distribution() {
                    println!("  {estimate}: {count}");
                }
            }
            None => println!("no session yet"),
        },
        Input::Status => println!(
            "{} ({} peers)",
            handle.status().label(),
            handle.connected_peers().len()
        ),
        Input::Reconnect => handle.reconnect()?,
        Input::Help => println!("{HELP}"),
        Input::Quit => {}
    }
    Ok(())
}

fn render_session(state: &SessionState) -> String {
    use std::fmt::Write as _;
    let mut out = String::new();
    let _ = writeln!(out, "{} [{}] by {} ({})", state.name, state.id, state.creator, state.voting_system);
    let names: Vec<&str> = state.participants.iter().map(|p| p.name.as_str()).collect();
    let _ = writeln!(out, "participants: {}", names.join(", "));
    for story in &state.stories {
        let estimate = story.final_estimate.as_deref().unwrap_or("-");
        let _ = writeln!(
            out,
            "  {} {:?} \"{}\" votes={} estimate={}",
            story.id,
            story.status,
            story.title,
            story.votes.len(),
            estimate
        );
    }
    out
}

fn print_event(event: &SyncEvent) {
    match event {
        SyncEvent::Updated(state) => println!(
            "[sync] session updated: {} participants, {} stories",
            state.participants.len(),
            state.stories.len()
        ),
        SyncEvent::NewParticipant(participant) => println!("[sync] {} joined", participant.name),
        SyncEvent::NewStory(story) => println!("[sync] new story {}: {}", story.id, story.title),
        SyncEvent::VoteRecorded { story_id, vote } => {
            println!("[sync] {} voted on {story_id}", vote.participant_id)
        }
        SyncEvent::EstimateSet { story_id, estimate } => {
            println!("[sync] {story_id} estimated at {estimate}")
        }
        SyncEvent::PeerConnected(peer) => println!("[peer] {peer} connected"),
        SyncEvent::PeerDisconnected(peer) => println!("[peer] {peer} disconnected"),
    }
}
