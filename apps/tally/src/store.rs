//! Read path into the hosted primary store (PostgREST rows), used to seed a
//! mesh session with data that already exists server side.

use crate::error::SyncError;
use crate::health::{RetryError, RetryPolicy, retry_with_backoff};
use crate::model::{Participant, SessionState, Story, StoryStatus, Vote};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("session not found")]
    NotFound,
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SessionRow {
    pub id: String,
    #[serde(default)]
    pub story: Option<String>,
    #[serde(default)]
    pub revealed: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ParticipantRow {
    pub id: String,
    pub session_id: String,
    pub name: String,
    #[serde(default)]
    pub is_host: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VoteRow {
    pub participant_id: String,
    pub session_id: String,
    #[serde(default)]
    pub value: Option<String>,
}

/// Everything the store knows about one session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub session: SessionRow,
    pub participants: Vec<ParticipantRow>,
    pub votes: Vec<VoteRow>,
}

impl SessionRecord {
    /// Maps the row model onto the replicated session shape. The store keeps a
    /// single story per session; it becomes story `<session>-story`.
    pub fn into_session_state(self) -> SessionState {
        let SessionRecord {
            session,
            participants,
            votes,
        } = self;
        let creator = participants
            .iter()
            .find(|p| p.is_host)
            .map(|p| p.name.clone())
            .unwrap_or_default();
        let mut stories = Vec::new();
        if let Some(title) = session.story.filter(|title| !title.is_empty()) {
            let mut story = Story::new(format!("{}-story", session.id), title);
            story.votes = votes
                .into_iter()
                .filter_map(|row| {
                    row.value.map(|value| Vote {
                        participant_id: row.participant_id,
                        value,
                    })
                })
                .collect();
            story.status = if session.revealed {
                StoryStatus::Discussing
            } else {
                StoryStatus::Voting
            };
            stories.push(story);
        }
        SessionState {
            name: format!("Session {}", session.id),
            id: session.id,
            creator,
            voting_system: crate::model::DEFAULT_VOTING_SYSTEM.to_string(),
            participants: participants
                .into_iter()
                .map(|row| Participant {
                    id: row.id,
                    name: row.name,
                    joined_at: row.created_at,
                })
                .collect(),
            stories,
            created: session.created_at,
        }
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, session_id: &str) -> Result<SessionRecord, StoreError>;
}

#[derive(Clone)]
pub struct RestSessionStore {
    http: Client,
    base_url: Url,
    api_key: String,
}

impl RestSessionStore {
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Result<Self, StoreError> {
        let mut base_url = Url::parse(base_url)
            .map_err(|err| StoreError::Unavailable(format!("invalid store url {base_url}: {err}")))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            http: Client::new(),
            base_url,
            api_key: api_key.into(),
        })
    }

    fn table_url(&self, table: &str, column: &str, session_id: &str) -> Result<Url, StoreError> {
        let mut url = self
            .base_url
            .join(&format!("rest/v1/{table}"))
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        url.query_pairs_mut()
            .append_pair(column, &format!("eq.{session_id}"))
            .append_pair("select", "*");
        Ok(url)
    }

    async fn rows<T: DeserializeOwned>(&self, url: Url) -> Result<Vec<T>, StoreError> {
        tracing::debug!(target = "store", %url, "fetching rows");
        let res = self
            .http
            .get(url)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        if res.status().is_success() {
            Ok(res.json::<Vec<T>>().await?)
        } else {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            Err(StoreError::Unavailable(format!(
                "unexpected status: {status} body={body}"
            )))
        }
    }
}

#[async_trait]
impl SessionStore for RestSessionStore {
    async fn load(&self, session_id: &str) -> Result<SessionRecord, StoreError> {
        let session = self
            .rows::<SessionRow>(self.table_url("sessions", "id", session_id)?)
            .await?
            .into_iter()
            .next()
            .ok_or(StoreError::NotFound)?;
        let participants = self
            .rows(self.table_url("participants", "session_id", session_id)?)
            .await?;
        let votes = self
            .rows(self.table_url("votes", "session_id", session_id)?)
            .await?;
        Ok(SessionRecord {
            session,
            participants,
            votes,
        })
    }
}

/// Loads a session, retrying transient failures with exponential backoff.
/// A missing session is reported straight away.
pub async fn load_with_retry(
    store: &dyn SessionStore,
    session_id: &str,
    policy: &RetryPolicy,
) -> Result<SessionRecord, SyncError> {
    let result = retry_with_backoff(
        policy,
        |attempt| {
            tracing::info!(target = "store", session = %session_id, attempt = attempt + 1, "loading session");
            store.load(session_id)
        },
        |err| !matches!(err, StoreError::NotFound),
    )
    .await;
    match result {
        Ok(record) => Ok(record),
        Err(RetryError::Fatal(StoreError::NotFound)) => Err(SyncError::NotFound(session_id.to_string())),
        Err(RetryError::Fatal(err)) => Err(SyncError::StoreLoadFailure {
            attempts: 1,
            reason: err.to_string(),
        }),
        Err(RetryError::Exhausted { attempts, last }) => {
            tracing::error!(target = "store", session = %session_id, attempts, error = %last, "giving up on session load");
            Err(SyncError::StoreLoadFailure {
                attempts,
                reason: last.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::time::Duration;
    use tokio::time::Instant;

    fn record() -> SessionRecord {
        let created_at = "2024-03-01T10:00:00Z".parse().unwrap();
        SessionRecord {
            session: SessionRow {
                id: "ABC123".into(),
                story: Some("Checkout flow".into()),
                revealed: false,
                created_at,
                expires_at: None,
            },
            participants: vec![
                ParticipantRow {
                    id: "alice".into(),
                    session_id: "ABC123".into(),
                    name: "Alice".into(),
                    is_host: true,
                    created_at: None,
                },
                ParticipantRow {
                    id: "bob".into(),
                    session_id: "ABC123".into(),
                    name: "Bob".into(),
                    is_host: false,
                    created_at: None,
                },
            ],
            votes: vec![
                VoteRow {
                    participant_id: "bob".into(),
                    session_id: "ABC123".into(),
                    value: Some("8".into()),
                },
                VoteRow {
                    participant_id: "alice".into(),
                    session_id: "ABC123".into(),
                    value: None,
                },
            ],
        }
    }

    struct ScriptedStore {
        started: Instant,
        outcomes: Mutex<VecDeque<Result<SessionRecord, StoreError>>>,
        calls: Mutex<Vec<u64>>,
    }

    impl ScriptedStore {
        fn new(outcomes: Vec<Result<SessionRecord, StoreError>>) -> Self {
            Self {
                started: Instant::now(),
                outcomes: Mutex::new(outcomes.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn call_times(&self) -> Vec<u64> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl SessionStore for ScriptedStore {
        async fn load(&self, _session_id: &str) -> Result<SessionRecord, StoreError> {
            self.calls
                .lock()
                .push(self.started.elapsed().as_millis() as u64);
            self.outcomes
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(StoreError::Unavailable("offline".into())))
        }
    }

    #[test]
    fn record_maps_onto_session_state() {
        let state = record().into_session_state();
        assert_eq!(state.id, "ABC123");
        assert_eq!(state.creator, "Alice");
        assert_eq!(state.participants.len(), 2);
        let story = &state.stories[0];
        assert_eq!(story.id, "ABC123-story");
        assert_eq!(story.status, StoryStatus::Voting);
        assert_eq!(
            story.votes,
            vec![Vote {
                participant_id: "bob".into(),
                value: "8".into()
            }]
        );
    }

    #[test]
    fn rows_deserialize_from_postgrest_json() {
        let rows: Vec<SessionRow> = serde_json::from_str(
            r#"[{"id":"ABC123","story":"Login","revealed":true,"created_at":"2024-03-01T10:00:00+00:00","expires_at":null}]"#,
        )
        .unwrap();
        assert!(rows[0].revealed);
        let store = RestSessionStore::new("https://db.example.com", "anon").unwrap();
        let url = store.table_url("votes", "session_id", "ABC123").unwrap();
        assert_eq!(
            url.as_str(),
            "https://db.example.com/rest/v1/votes?session_id=eq.ABC123&select=*"
        );
    }

    #[test_timeout::tokio_timeout_test(30, paused)]
    async fn unavailable_store_is_retried_with_backoff_then_fails() {
        let store = ScriptedStore::new(Vec::new());
        let err = load_with_retry(&store, "ABC123", &RetryPolicy::default())
            .await
            .unwrap_err();
        match err {
            SyncError::StoreLoadFailure { attempts, reason } => {
                assert_eq!(attempts, 4);
                assert!(reason.contains("offline"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(store.call_times(), vec![0, 1000, 3000, 7000]);
    }

    #[test_timeout::tokio_timeout_test(30, paused)]
    async fn missing_session_is_not_retried() {
        let store = ScriptedStore::new(vec![Err(StoreError::NotFound)]);
        let err = load_with_retry(&store, "NOPE", &RetryPolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound(id) if id == "NOPE"));
        assert_eq!(store.call_times().len(), 1);
    }

    #[test_timeout::tokio_timeout_test(30, paused)]
    async fn recovers_after_transient_failures() {
        let store = ScriptedStore::new(vec![
            Err(StoreError::Unavailable("timeout".into())),
            Err(StoreError::Unavailable("timeout".into())),
            Ok(record()),
        ]);
        let policy = RetryPolicy::new(3, Duration::from_millis(1000));
        let loaded = load_with_retry(&store, "ABC123", &policy).await.unwrap();
        assert_eq!(loaded.session.id, "ABC123");
        assert_eq!(store.call_times(), vec![0, 1000, 3000]);
    }
}
