use crate::health::RetryPolicy;
use crate::mesh::MeshSettings;
use crate::sync::SessionOptions;
use crate::telemetry::env_truthy;
use crate::transport::webrtc::WebRtcSettings;
use std::env;
use std::time::Duration;

pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8080/signal";
pub const DEFAULT_ICE_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Client configuration, read from `TALLY_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub signaling_url: String,
    pub ice_servers: Vec<String>,
    pub negotiation_timeout: Duration,
    pub candidate_window: Duration,
    /// Automatic signaling reconnect attempts. Zero means manual only.
    pub signaling_retries: u32,
    pub store_url: Option<String>,
    pub store_key: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let ice_servers = if env_truthy("TALLY_LOCALHOST_ONLY").unwrap_or(false) {
            Vec::new()
        } else {
            env::var("TALLY_ICE_SERVERS")
                .ok()
                .map(|value| {
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|url| !url.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or(defaults.ice_servers)
        };

        Self {
            signaling_url: env::var("TALLY_SIGNALING_URL")
                .ok()
                .filter(|url| !url.trim().is_empty())
                .unwrap_or(defaults.signaling_url),
            ice_servers,
            negotiation_timeout: env::var("TALLY_NEGOTIATION_TIMEOUT_MS")
                .ok()
                .and_then(|val| val.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.negotiation_timeout),
            candidate_window: env::var("TALLY_CANDIDATE_WINDOW_MS")
                .ok()
                .and_then(|val| val.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.candidate_window),
            signaling_retries: env::var("TALLY_SIGNALING_RETRIES")
                .ok()
                .and_then(|val| val.parse().ok())
                .unwrap_or(defaults.signaling_retries),
            store_url: env::var("TALLY_STORE_URL").ok().filter(|v| !v.is_empty()),
            store_key: env::var("TALLY_STORE_KEY").ok().filter(|v| !v.is_empty()),
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            mesh: MeshSettings {
                negotiation_timeout: self.negotiation_timeout,
                candidate_window: self.candidate_window,
                ..MeshSettings::default()
            },
            reconnect: RetryPolicy {
                max_retries: self.signaling_retries,
                ..RetryPolicy::default()
            },
            ..SessionOptions::default()
        }
    }

    pub fn webrtc_settings(&self) -> WebRtcSettings {
        WebRtcSettings {
            ice_servers: self.ice_servers.clone(),
            ..WebRtcSettings::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let mesh = MeshSettings::default();
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect(),
            negotiation_timeout: mesh.negotiation_timeout,
            candidate_window: mesh.candidate_window,
            signaling_retries: 0,
            store_url: None,
            store_key: None,
        }
    }
}
