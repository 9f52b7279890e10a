//! Seam between the call agent and a real peer-connection stack
//!
//! The agent never touches media itself. A [`PeerConnector`] opens one
//! [`PeerSession`] per match; the session reports progress back through the
//! [`PeerEvents`] it was handed, tagged with the negotiation it belongs to.

use crate::error::AgentError;
use crate::machine::{Event, NegotiationId, PeerEvent, Role};
use crate::runtime::Input;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

/// Reporting channel handed to a peer session
#[derive(Debug, Clone)]
pub struct PeerEvents {
    negotiation: NegotiationId,
    tx: mpsc::UnboundedSender<Input>,
}

impl PeerEvents {
    pub(crate) fn new(negotiation: NegotiationId, tx: mpsc::UnboundedSender<Input>) -> Self {
        Self { negotiation, tx }
    }

    pub fn negotiation(&self) -> NegotiationId {
        self.negotiation
    }

    /// Report an event; returns false once the agent is gone
    pub fn emit(&self, event: PeerEvent) -> bool {
        self.tx
            .send(Input::Event(Event::Peer {
                negotiation: self.negotiation,
                event,
            }))
            .is_ok()
    }

    /// Forward an offer, answer or candidate to the partner
    pub fn signal(&self, data: Value) -> bool {
        self.emit(PeerEvent::LocalSignal(data))
    }
}

#[async_trait]
pub trait PeerConnector: Send + Sync + 'static {
    /// Acquire the microphone and build a session for a new partner.
    ///
    /// An [`Role::Initiator`] session creates its offer right away and emits
    /// it through `events`; an answerer waits for the remote offer.
    async fn open(
        &self,
        role: Role,
        muted: bool,
        events: PeerEvents,
    ) -> Result<Box<dyn PeerSession>, AgentError>;
}

#[async_trait]
pub trait PeerSession: Send {
    /// Apply an offer, answer or candidate received from the partner
    async fn apply_remote_signal(&mut self, data: Value) -> Result<(), AgentError>;

    /// Create a fresh offer with new connectivity candidates
    async fn restart_ice(&mut self) -> Result<(), AgentError>;

    fn set_microphone(&mut self, enabled: bool);

    async fn send_chat(&mut self, text: String) -> Result<(), AgentError>;

    /// Stop local tracks and release the connection
    async fn close(&mut self);
}
