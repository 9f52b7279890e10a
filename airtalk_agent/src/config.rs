//! Call agent settings

use airtalk_protocol::{DEFAULT_COUNTRY, UserId};
use std::time::Duration;

/// Interval between application keepalive pings
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(25);

/// Pause between hanging up and searching again with auto-next
pub const AUTO_NEXT_DELAY: Duration = Duration::from_secs(1);

/// Delays before each reconnection attempt
pub const RECONNECT_DELAYS: [Duration; 4] = [
    Duration::from_secs(2),
    Duration::from_secs(4),
    Duration::from_secs(8),
    Duration::from_secs(16),
];

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// WebSocket URL of the signaling server
    pub server_url: String,
    pub user_id: UserId,
    /// Flag shown to partners
    pub country: String,
    pub keepalive_interval: Duration,
    pub auto_next_delay: Duration,
    pub reconnect_delays: Vec<Duration>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:8080".to_string(),
            user_id: UserId::generate(),
            country: DEFAULT_COUNTRY.to_string(),
            keepalive_interval: KEEPALIVE_INTERVAL,
            auto_next_delay: AUTO_NEXT_DELAY,
            reconnect_delays: RECONNECT_DELAYS.to_vec(),
        }
    }
}

impl AgentConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }

    /// Set the country from an ISO 3166 alpha-2 code such as `"fr"`
    pub fn with_country_code(mut self, code: &str) -> Self {
        if let Some(flag) = flag_from_country_code(code) {
            self.country = flag;
        }
        self
    }
}

/// Regional-indicator flag for a two-letter country code
pub fn flag_from_country_code(code: &str) -> Option<String> {
    let code = code.trim();
    if code.len() != 2 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    code.chars()
        .map(|c| char::from_u32(0x1F1E6 + (c.to_ascii_uppercase() as u32 - 'A' as u32)))
        .collect()
}
