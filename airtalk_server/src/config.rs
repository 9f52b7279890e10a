//! Server configuration, from flags or the environment

use crate::error::SignalingError;
use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 25_000;
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_WAITING_TIME_MS: u64 = 60_000;
pub const DEFAULT_STALE_SWEEP_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_ALLOWED_ORIGIN: &str = "http://localhost:5173";

/// AirTalk signaling server
///
/// Pairs anonymous users for one-on-one voice calls and relays their
/// WebRTC negotiation messages.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct ServerConfig {
    /// Interface to listen on
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED), env = "HOST")]
    pub host: IpAddr,

    /// Port for both WebSocket signaling and the HTTP status endpoints
    #[arg(short, long, default_value_t = DEFAULT_PORT, env = "PORT")]
    pub port: u16,

    /// Liveness probe interval in milliseconds
    #[arg(
        long = "heartbeat-interval",
        value_name = "MS",
        default_value_t = DEFAULT_HEARTBEAT_INTERVAL_MS,
        env = "WS_HEARTBEAT_INTERVAL"
    )]
    pub heartbeat_interval_ms: u64,

    /// Longest idle period tolerated by intermediaries, in milliseconds
    #[arg(
        long = "heartbeat-timeout",
        value_name = "MS",
        default_value_t = DEFAULT_HEARTBEAT_TIMEOUT_MS,
        env = "WS_HEARTBEAT_TIMEOUT"
    )]
    pub heartbeat_timeout_ms: u64,

    /// How long a user may wait for a partner before being told to give up
    #[arg(
        long = "max-waiting-time",
        value_name = "MS",
        default_value_t = DEFAULT_MAX_WAITING_TIME_MS,
        env = "MAX_WAITING_TIME"
    )]
    pub max_waiting_time_ms: u64,

    /// How often the waiting pool is swept for stale entries
    #[arg(
        long = "stale-sweep-interval",
        value_name = "MS",
        default_value_t = DEFAULT_STALE_SWEEP_INTERVAL_MS,
        env = "STALE_SWEEP_INTERVAL"
    )]
    pub stale_sweep_interval_ms: u64,

    /// Origins allowed to connect (comma-separated, `*` for any)
    #[arg(
        long,
        value_delimiter = ',',
        default_value = DEFAULT_ALLOWED_ORIGIN,
        env = "ALLOWED_ORIGINS"
    )]
    pub allowed_origins: Vec<String>,

    /// Never pair a user with the partner they just left
    #[arg(long, env = "AVOID_REPEAT_PARTNER")]
    pub avoid_repeat_partner: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            heartbeat_timeout_ms: DEFAULT_HEARTBEAT_TIMEOUT_MS,
            max_waiting_time_ms: DEFAULT_MAX_WAITING_TIME_MS,
            stale_sweep_interval_ms: DEFAULT_STALE_SWEEP_INTERVAL_MS,
            allowed_origins: vec![DEFAULT_ALLOWED_ORIGIN.to_string()],
            avoid_repeat_partner: false,
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn max_waiting_time(&self) -> Duration {
        Duration::from_millis(self.max_waiting_time_ms)
    }

    pub fn stale_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.stale_sweep_interval_ms)
    }

    /// Whether any origin may connect
    pub fn any_origin(&self) -> bool {
        self.allowed_origins.iter().any(|o| o.trim() == "*")
    }

    pub fn origin_allowed(&self, origin: &str) -> bool {
        self.any_origin()
            || self
                .allowed_origins
                .iter()
                .any(|allowed| allowed.trim() == origin)
    }

    /// Reject settings the heartbeat cannot work with
    pub fn validate(&self) -> Result<(), SignalingError> {
        if self.heartbeat_interval_ms == 0
            || self.max_waiting_time_ms == 0
            || self.stale_sweep_interval_ms == 0
        {
            return Err(SignalingError::Config(
                "intervals and wait times must be non-zero".to_string(),
            ));
        }
        if self.heartbeat_interval_ms >= self.heartbeat_timeout_ms {
            return Err(SignalingError::Config(format!(
                "heartbeat interval ({} ms) must be shorter than the heartbeat timeout ({} ms)",
                self.heartbeat_interval_ms, self.heartbeat_timeout_ms
            )));
        }
        Ok(())
    }
}
