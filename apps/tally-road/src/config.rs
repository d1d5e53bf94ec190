use std::env;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    /// Sockets silent for longer than this are evicted from their room.
    pub heartbeat_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        let heartbeat_timeout = env::var("TALLY_ROAD_HEARTBEAT_TIMEOUT_SECS")
            .ok()
            .and_then(|val| val.parse().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_HEARTBEAT_TIMEOUT);

        Self {
            port: env::var("TALLY_ROAD_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            heartbeat_timeout,
            sweep_interval: sweep_interval_for(heartbeat_timeout),
        }
    }

    /// Settings for tests and embedders that run the relay with short timers.
    pub fn with_heartbeat_timeout(heartbeat_timeout: Duration) -> Self {
        Self {
            heartbeat_timeout,
            sweep_interval: sweep_interval_for(heartbeat_timeout),
            ..Self::default()
        }
    }
}

const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(120);

fn sweep_interval_for(timeout: Duration) -> Duration {
    (timeout / 4).clamp(Duration::from_millis(10), Duration::from_secs(30))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            sweep_interval: sweep_interval_for(DEFAULT_HEARTBEAT_TIMEOUT),
        }
    }
}
