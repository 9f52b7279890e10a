//! Signaling server for anonymous one-on-one voice calls
//!
//! Users connect over WebSocket, ask to be paired with `find`, and are
//! matched uniformly at random with another waiting user. The server then
//! relays opaque WebRTC negotiation envelopes (session descriptions and
//! ICE candidates) between the two partners until one of them leaves.
//!
//! # Protocol
//!
//! See [`airtalk_protocol`] for the message set. In short:
//!
//! - `find` → `searching`, or `match` to both partners (the user who was
//!   already waiting is told to create the offer)
//! - `signal` → forwarded verbatim to the partner, dropped if there is none
//! - `reconnect` → leave the current match and search again
//! - `ping` → `pong`
//!
//! A heartbeat monitor probes every connection and reclaims half-open ones;
//! a sweeper sends `timeout` to users who waited too long.
//!
//! # Example
//!
//! ```bash
//! # Start the server
//! airtalk-signaling --port 8080 --allowed-origins http://localhost:5173
//!
//! # Check it is up
//! curl http://127.0.0.1:8080/health
//! curl http://127.0.0.1:8080/stats
//! ```

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod handler;
pub mod heartbeat;
pub mod state;

pub use config::ServerConfig;
pub use error::{ClientRequestError, SignalingError};
pub use handler::router;
pub use heartbeat::Monitors;
pub use state::{ConnectionHandle, ConnectionId, JoinOutcome, Outbound, Registry, ServerState};

use std::future::Future;
use tokio::net::TcpListener;
use tracing::info;

/// Serve signaling on `listener` until `shutdown` resolves
///
/// On shutdown every client is sent `serverShutdown` before the listener
/// stops accepting connections.
pub async fn serve(
    listener: TcpListener,
    state: ServerState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), SignalingError> {
    let monitors = Monitors::spawn(&state);
    let app = router(state.clone());

    info!("Signaling server listening on {}", listener.local_addr()?);
    let notify = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            notify.shutdown();
        })
        .await?;

    monitors.abort();
    info!("Signaling server stopped");
    Ok(())
}
