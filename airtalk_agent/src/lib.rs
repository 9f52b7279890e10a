//! Call agent for AirTalk random voice calls
//!
//! Drives one user through search, negotiation, talk and teardown against
//! an AirTalk signaling server. The decisions live in [`CallMachine`], a
//! pure state machine; [`CallAgent`] runs it on tokio with a real WebSocket
//! transport and a caller-supplied [`PeerConnector`] for media.
//!
//! ```no_run
//! # use airtalk_agent::{AgentConfig, CallAgent, CallStatus, PeerConnector};
//! # async fn demo(connector: impl PeerConnector) -> Result<(), airtalk_agent::AgentError> {
//! let config = AgentConfig::new("ws://127.0.0.1:8080").with_country_code("fr");
//! let agent = CallAgent::spawn(config, connector);
//! agent.start_search()?;
//! agent.wait_for(|s| s.status == CallStatus::Connected).await?;
//! agent.send_chat("hello")?;
//! agent.hang_up(true)?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod backoff;
pub mod call;
pub mod config;
pub mod error;
pub mod machine;
pub mod peer;
pub mod runtime;

pub use backoff::Backoff;
pub use call::{CallState, CallStatus, ChatEntry, ChatSender};
pub use config::{AgentConfig, flag_from_country_code};
pub use error::AgentError;
pub use machine::{
    CallMachine, Command, Event, IceConnectionState, NegotiationId, PeerConnectionState,
    PeerEvent, Role, TimerId, TimerKind,
};
pub use peer::{PeerConnector, PeerEvents, PeerSession};
pub use runtime::CallAgent;
