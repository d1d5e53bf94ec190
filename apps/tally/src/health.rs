//! Signaling connection status and retry pacing.

use crate::protocol::PeerId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
        }
    }

    /// Human readable form for status bars.
    pub fn label(self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "Disconnected",
            ConnectionStatus::Connecting => "Connecting...",
            ConnectionStatus::Connected => "Connected",
            ConnectionStatus::Error => "Connection Error",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Publishes the signaling status and the set of open channels to any number
/// of observers. Readers always see the latest value.
#[derive(Debug)]
pub struct StatusBoard {
    status: watch::Sender<ConnectionStatus>,
    peers: watch::Sender<Vec<PeerId>>,
}

impl StatusBoard {
    pub fn new() -> (
        Self,
        watch::Receiver<ConnectionStatus>,
        watch::Receiver<Vec<PeerId>>,
    ) {
        let (status, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        let (peers, peers_rx) = watch::channel(Vec::new());
        (Self { status, peers }, status_rx, peers_rx)
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn set_status(&self, next: ConnectionStatus) {
        let previous = self.status.send_replace(next);
        if previous != next {
            tracing::info!(target = "health", from = %previous, to = %next, "signaling status changed");
        }
    }

    pub fn set_peers(&self, peers: Vec<PeerId>) {
        self.peers.send_if_modified(|current| {
            if *current == peers {
                return false;
            }
            *current = peers;
            true
        });
    }
}

/// Bounded exponential backoff: attempt `n` (zero based) of a retry waits
/// `base_delay * 2^n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    pub const fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// No automatic retries.
    pub fn manual() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RetryError<E> {
    /// Not worth retrying; returned after the first failure.
    Fatal(E),
    Exhausted { attempts: u32, last: E },
}

/// Runs `op` until it succeeds, fails with an error `retryable` rejects, or
/// the policy runs out of retries.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    mut op: F,
    retryable: impl Fn(&E) -> bool,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if !retryable(&err) => return Err(RetryError::Fatal(err)),
            Err(err) => {
                if attempt >= policy.max_retries {
                    return Err(RetryError::Exhausted {
                        attempts: attempt + 1,
                        last: err,
                    });
                }
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    target = "health",
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "attempt failed; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tokio::time::Instant;

    #[test]
    fn labels_match_status_bar_wording() {
        assert_eq!(ConnectionStatus::Connecting.label(), "Connecting...");
        assert_eq!(ConnectionStatus::Error.label(), "Connection Error");
        assert_eq!(ConnectionStatus::default(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn delays_double_from_base() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (0..3).map(|n| policy.delay_for(n).as_millis() as u64).collect();
        assert_eq!(delays, vec![1000, 2000, 4000]);
        assert_eq!(policy.max_attempts(), 4);
        assert_eq!(RetryPolicy::manual().max_attempts(), 1);
        assert_eq!(policy.delay_for(40), Duration::from_millis(1000).saturating_mul(u32::MAX));
    }

    #[test]
    fn status_board_publishes_latest() {
        let (board, status, peers) = StatusBoard::new();
        board.set_status(ConnectionStatus::Connecting);
        board.set_status(ConnectionStatus::Connected);
        assert_eq!(*status.borrow(), ConnectionStatus::Connected);
        board.set_peers(vec![PeerId::from("bob")]);
        assert_eq!(*peers.borrow(), vec![PeerId::from("bob")]);
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn retry_waits_between_attempts_and_gives_up() {
        let started = Instant::now();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let result: Result<(), RetryError<String>> = retry_with_backoff(
            &RetryPolicy::default(),
            |attempt| {
                let log = log.clone();
                async move {
                    log.lock().push((attempt, started.elapsed().as_millis() as u64));
                    Err::<(), String>("offline".into())
                }
            },
            |_| true,
        )
        .await;

        assert_eq!(
            result,
            Err(RetryError::Exhausted {
                attempts: 4,
                last: "offline".into()
            })
        );
        assert_eq!(
            *seen.lock(),
            vec![(0, 0), (1, 1000), (2, 3000), (3, 7000)]
        );
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn fatal_errors_are_not_retried() {
        let calls = Arc::new(Mutex::new(0u32));
        let counter = calls.clone();
        let result: Result<(), RetryError<String>> = retry_with_backoff(
            &RetryPolicy::default(),
            |_| {
                let counter = counter.clone();
                async move {
                    *counter.lock() += 1;
                    Err::<(), String>("gone".into())
                }
            },
            |err| err != "gone",
        )
        .await;
        assert_eq!(result, Err(RetryError::Fatal("gone".into())));
        assert_eq!(*calls.lock(), 1);
    }
}
