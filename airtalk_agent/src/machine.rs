//! Call negotiation state machine
//!
//! [`CallMachine`] is a reducer: every input (user action, server message,
//! peer-layer callback, timer) arrives as an [`Event`], and the machine
//! answers with the [`Command`]s the runtime must carry out. It performs no
//! I/O of its own, so every transition can be exercised synchronously.
//!
//! ```text
//! idle ──startSearch──▶ searching ──match──▶ connecting ──media──▶ connected
//!   ▲                       ▲                    │                     │
//!   │                       └──── reconnect ◀────┴──── peer failure ───┘
//!   └── hangUp ── disconnected ──(auto-next)──▶ searching
//! ```
//!
//! Timers are identified by kind plus a generation number. Cancelling or
//! restarting a timer bumps the generation, so a timer that still fires
//! after being invalidated is recognised and dropped.

use crate::backoff::Backoff;
use crate::call::{CallState, CallStatus, ChatEntry, ChatSender};
use crate::config::AgentConfig;
use airtalk_protocol::{ClientMessage, ServerMessage, UserId};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Identifies one offer/answer cycle; events from older cycles are dropped
pub type NegotiationId = u64;

const CALL_CLOCK_TICK: Duration = Duration::from_secs(1);

/// Which side of the pairing creates the offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Answerer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Keepalive,
    Reconnect,
    AutoNext,
    CallClock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId {
    pub kind: TimerKind,
    pub generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Callbacks from the local peer-connection layer
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// Offer, answer or candidate to forward to the partner
    LocalSignal(Value),
    /// Inbound audio is flowing
    RemoteTrack,
    ConnectionState(PeerConnectionState),
    IceConnectionState(IceConnectionState),
    ChannelOpen,
    ChannelClosed,
    ChatReceived(String),
    /// Media acquisition failed or a payload was rejected
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    StartSearch,
    HangUp { auto_next: bool },
    ToggleMute,
    SendChat(String),
    TransportOpened,
    /// The signaling connection closed without being asked to
    TransportClosed,
    Server(ServerMessage),
    Peer {
        negotiation: NegotiationId,
        event: PeerEvent,
    },
    Timer(TimerId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    OpenTransport,
    CloseTransport,
    Send(ClientMessage),
    /// Start a fresh peer session, discarding any previous one
    OpenPeer {
        negotiation: NegotiationId,
        role: Role,
        muted: bool,
    },
    ApplyRemoteSignal {
        negotiation: NegotiationId,
        data: Value,
    },
    /// Renegotiate connectivity candidates without dropping the session
    RestartIce { negotiation: NegotiationId },
    ClosePeer,
    SetMicrophone { enabled: bool },
    SendChat(String),
    StartTimer { timer: TimerId, after: Duration },
    CancelTimer(TimerKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transport {
    Closed,
    Opening,
    Open,
}

#[derive(Debug, Clone, Copy)]
struct Negotiation {
    id: NegotiationId,
    ice_restarted: bool,
}

pub struct CallMachine {
    user_id: UserId,
    keepalive_interval: Duration,
    auto_next_delay: Duration,
    state: CallState,
    transport: Transport,
    find_pending: bool,
    /// `searching` arrived since our last find, so we were waiting when matched
    told_searching: bool,
    /// A `serverShutdown` notice was received; no reconnection follows
    server_gone: bool,
    negotiation: Option<Negotiation>,
    next_negotiation: NegotiationId,
    backoff: Backoff,
    timers: HashMap<TimerKind, u64>,
    next_generation: u64,
}

impl CallMachine {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            user_id: config.user_id.clone(),
            keepalive_interval: config.keepalive_interval,
            auto_next_delay: config.auto_next_delay,
            state: CallState::new(config.country.clone()),
            transport: Transport::Closed,
            find_pending: false,
            told_searching: false,
            server_gone: false,
            negotiation: None,
            next_negotiation: 0,
            backoff: Backoff::new(config.reconnect_delays.clone()),
            timers: HashMap::new(),
            next_generation: 0,
        }
    }

    pub fn state(&self) -> &CallState {
        &self.state
    }

    pub fn status(&self) -> CallStatus {
        self.state.status
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Current negotiation, if a peer session is live
    pub fn negotiation(&self) -> Option<NegotiationId> {
        self.negotiation.map(|n| n.id)
    }

    /// Whether a timer of this kind is armed
    pub fn timer_armed(&self, kind: TimerKind) -> bool {
        self.timers.contains_key(&kind)
    }

    /// Feed one event and collect the commands it produces
    pub fn handle(&mut self, event: Event, now: DateTime<Utc>) -> Vec<Command> {
        let mut out = Vec::new();
        match event {
            Event::StartSearch => {
                if self.state.status.is_active() {
                    debug!(status = %self.state.status, "Already searching or in a call");
                } else {
                    self.backoff.reset();
                    self.begin_search(&mut out);
                }
            }
            Event::HangUp { auto_next } => {
                if self.state.status != CallStatus::Idle {
                    self.hang_up(auto_next, &mut out);
                }
            }
            Event::ToggleMute => {
                self.state.is_muted = !self.state.is_muted;
                out.push(Command::SetMicrophone {
                    enabled: !self.state.is_muted,
                });
            }
            Event::SendChat(text) => self.send_chat(text, now, &mut out),
            Event::TransportOpened => self.transport_opened(&mut out),
            Event::TransportClosed => self.transport_closed(&mut out),
            Event::Server(message) => self.server_message(message, &mut out),
            Event::Peer { negotiation, event } => {
                if self.negotiation() == Some(negotiation) {
                    self.peer_event(event, now, &mut out);
                } else {
                    debug!(negotiation, "Dropping event from a discarded peer session");
                }
            }
            Event::Timer(timer) => self.timer_fired(timer, &mut out),
        }
        out
    }

    fn begin_search(&mut self, out: &mut Vec<Command>) {
        self.cancel_timer(TimerKind::AutoNext, out);
        self.cancel_timer(TimerKind::Reconnect, out);
        self.teardown_peer(out);
        self.state.reset_partner();
        self.state.status = CallStatus::Searching;
        self.told_searching = false;
        self.server_gone = false;
        self.request_find(out);
    }

    fn request_find(&mut self, out: &mut Vec<Command>) {
        match self.transport {
            Transport::Open => self.send_find(out),
            Transport::Opening => self.find_pending = true,
            Transport::Closed => {
                self.find_pending = true;
                self.transport = Transport::Opening;
                out.push(Command::OpenTransport);
            }
        }
    }

    fn send_find(&mut self, out: &mut Vec<Command>) {
        self.find_pending = false;
        out.push(Command::Send(ClientMessage::Find {
            id: Some(self.user_id.clone()),
            country: Some(self.state.my_country.clone()),
        }));
    }

    fn hang_up(&mut self, auto_next: bool, out: &mut Vec<Command>) {
        info!(auto_next, "Hanging up");
        for kind in [
            TimerKind::Reconnect,
            TimerKind::AutoNext,
            TimerKind::Keepalive,
            TimerKind::CallClock,
        ] {
            self.cancel_timer(kind, out);
        }
        self.teardown_peer(out);
        self.backoff.reset();
        self.find_pending = false;
        if self.transport != Transport::Closed {
            self.transport = Transport::Closed;
            out.push(Command::CloseTransport);
        }
        if auto_next {
            self.state.status = CallStatus::Disconnected;
            self.start_timer(TimerKind::AutoNext, self.auto_next_delay, out);
        } else {
            self.state.status = CallStatus::Idle;
        }
    }

    fn teardown_peer(&mut self, out: &mut Vec<Command>) {
        self.cancel_timer(TimerKind::CallClock, out);
        self.state.chat_open = false;
        if self.negotiation.take().is_some() {
            out.push(Command::ClosePeer);
        }
    }

    fn open_negotiation(&mut self, role: Role, out: &mut Vec<Command>) {
        self.teardown_peer(out);
        let id = self.next_negotiation;
        self.next_negotiation += 1;
        self.negotiation = Some(Negotiation {
            id,
            ice_restarted: false,
        });
        out.push(Command::OpenPeer {
            negotiation: id,
            role,
            muted: self.state.is_muted,
        });
    }

    /// Walk one step along the reconnection schedule, or give up
    fn schedule_reconnect(&mut self, out: &mut Vec<Command>) {
        if self.timer_armed(TimerKind::Reconnect) {
            return;
        }
        match self.backoff.next_delay() {
            Some(delay) => {
                info!(
                    attempt = self.backoff.attempts(),
                    budget = self.backoff.budget(),
                    "Reconnecting in {delay:?}"
                );
                self.start_timer(TimerKind::Reconnect, delay, out);
            }
            None => {
                warn!("Max reconnection attempts reached");
                self.hang_up(false, out);
            }
        }
    }

    fn reconnect_now(&mut self, out: &mut Vec<Command>) {
        if self.transport == Transport::Open {
            self.teardown_peer(out);
            self.state.reset_partner();
            self.state.status = CallStatus::Searching;
            self.told_searching = false;
            out.push(Command::Send(ClientMessage::Reconnect));
        } else {
            self.begin_search(out);
        }
    }

    fn transport_opened(&mut self, out: &mut Vec<Command>) {
        if self.transport != Transport::Opening {
            debug!("Ignoring open of a transport we did not ask for");
            return;
        }
        info!("Signaling connection open");
        self.transport = Transport::Open;
        self.start_timer(TimerKind::Keepalive, self.keepalive_interval, out);
        if self.find_pending {
            self.send_find(out);
        }
    }

    fn transport_closed(&mut self, out: &mut Vec<Command>) {
        if self.transport == Transport::Closed {
            return;
        }
        warn!("Signaling connection lost");
        self.transport = Transport::Closed;
        self.cancel_timer(TimerKind::Keepalive, out);
        if self.server_gone || !self.state.status.is_active() {
            return;
        }
        self.teardown_peer(out);
        self.state.status = CallStatus::Disconnected;
        self.schedule_reconnect(out);
    }

    fn server_message(&mut self, message: ServerMessage, out: &mut Vec<Command>) {
        match message {
            ServerMessage::Searching => {
                debug!("Searching for match");
                self.told_searching = true;
            }
            ServerMessage::Match {
                country,
                partner_id,
                initiator,
            } => {
                if self.state.status != CallStatus::Searching {
                    warn!(status = %self.state.status, "Ignoring match outside of search");
                    return;
                }
                let role = if initiator.unwrap_or(self.told_searching) {
                    Role::Initiator
                } else {
                    Role::Answerer
                };
                info!(partner = %partner_id, %country, ?role, "Match found");
                self.state.reset_partner();
                self.state.partner_country = country;
                self.state.partner_id = Some(partner_id);
                self.state.status = CallStatus::Connecting;
                self.open_negotiation(role, out);
            }
            ServerMessage::Signal { data } => match self.negotiation {
                Some(negotiation) => out.push(Command::ApplyRemoteSignal {
                    negotiation: negotiation.id,
                    data,
                }),
                None => debug!("Signal without a peer session"),
            },
            ServerMessage::PartnerDisconnected => {
                if matches!(
                    self.state.status,
                    CallStatus::Connecting | CallStatus::Connected
                ) {
                    info!("Partner disconnected");
                    self.cancel_timer(TimerKind::Reconnect, out);
                    self.teardown_peer(out);
                    self.state.status = CallStatus::Searching;
                    self.told_searching = false;
                }
            }
            ServerMessage::Timeout => {
                warn!("Matching timeout - no partner found");
                self.hang_up(false, out);
            }
            ServerMessage::ServerShutdown => {
                warn!("Server shutting down");
                self.server_gone = true;
                for kind in [
                    TimerKind::Reconnect,
                    TimerKind::AutoNext,
                    TimerKind::Keepalive,
                    TimerKind::CallClock,
                ] {
                    self.cancel_timer(kind, out);
                }
                self.teardown_peer(out);
                self.find_pending = false;
                if self.transport != Transport::Closed {
                    self.transport = Transport::Closed;
                    out.push(Command::CloseTransport);
                }
                self.state.status = CallStatus::Disconnected;
            }
            ServerMessage::Pong { .. } => {}
        }
    }

    fn peer_event(&mut self, event: PeerEvent, now: DateTime<Utc>, out: &mut Vec<Command>) {
        match event {
            PeerEvent::LocalSignal(data) => {
                if self.transport == Transport::Open {
                    out.push(Command::Send(ClientMessage::Signal { data }));
                } else {
                    debug!("Dropping local signal, transport is not open");
                }
            }
            PeerEvent::RemoteTrack => {
                if self.state.status == CallStatus::Connecting {
                    info!("Remote audio received");
                    self.state.status = CallStatus::Connected;
                    self.state.call_seconds = 0;
                    self.backoff.reset();
                    self.start_timer(TimerKind::CallClock, CALL_CLOCK_TICK, out);
                }
            }
            PeerEvent::ConnectionState(state) => {
                debug!(?state, "Peer connection state");
                match state {
                    PeerConnectionState::Connected => {
                        self.backoff.reset();
                        self.cancel_timer(TimerKind::Reconnect, out);
                    }
                    PeerConnectionState::Disconnected => self.connectivity_lost(false, out),
                    PeerConnectionState::Failed => self.schedule_reconnect(out),
                    PeerConnectionState::Closed => {
                        if matches!(
                            self.state.status,
                            CallStatus::Connecting | CallStatus::Connected
                        ) {
                            self.hang_up(true, out);
                        }
                    }
                    PeerConnectionState::New | PeerConnectionState::Connecting => {}
                }
            }
            PeerEvent::IceConnectionState(state) => {
                debug!(?state, "ICE connection state");
                match state {
                    IceConnectionState::Disconnected => self.connectivity_lost(false, out),
                    IceConnectionState::Failed => self.connectivity_lost(true, out),
                    IceConnectionState::Connected | IceConnectionState::Completed => {
                        if let Some(negotiation) = self.negotiation.as_mut() {
                            negotiation.ice_restarted = false;
                        }
                        self.cancel_timer(TimerKind::Reconnect, out);
                    }
                    _ => {}
                }
            }
            PeerEvent::ChannelOpen => {
                debug!("Data channel is open");
                self.state.chat_open = true;
            }
            PeerEvent::ChannelClosed => {
                debug!("Data channel is closed");
                self.state.chat_open = false;
            }
            PeerEvent::ChatReceived(text) => self.state.chat_history.push(ChatEntry {
                sender: ChatSender::Peer,
                text,
                timestamp: now,
            }),
            PeerEvent::Failed(reason) => {
                warn!(%reason, "Negotiation failed");
                self.hang_up(false, out);
            }
        }
    }

    /// Try an ICE restart once; after that, or on `fatal` failure once the
    /// restart was spent, fall back to the reconnection schedule
    fn connectivity_lost(&mut self, fatal: bool, out: &mut Vec<Command>) {
        let Some(negotiation) = self.negotiation.as_mut() else {
            return;
        };
        if !negotiation.ice_restarted {
            info!("Attempting ICE restart");
            negotiation.ice_restarted = true;
            out.push(Command::RestartIce {
                negotiation: negotiation.id,
            });
        } else if fatal {
            self.schedule_reconnect(out);
        }
    }

    fn send_chat(&mut self, text: String, now: DateTime<Utc>, out: &mut Vec<Command>) {
        if text.trim().is_empty() {
            return;
        }
        if !self.state.chat_open || self.negotiation.is_none() {
            debug!("Chat channel is not open");
            return;
        }
        out.push(Command::SendChat(text.clone()));
        self.state.chat_history.push(ChatEntry {
            sender: ChatSender::Local,
            text,
            timestamp: now,
        });
    }

    fn timer_fired(&mut self, timer: TimerId, out: &mut Vec<Command>) {
        if self.timers.get(&timer.kind) != Some(&timer.generation) {
            debug!(?timer, "Ignoring stale timer");
            return;
        }
        self.timers.remove(&timer.kind);
        match timer.kind {
            TimerKind::Keepalive => {
                if self.transport == Transport::Open {
                    out.push(Command::Send(ClientMessage::Ping));
                    self.start_timer(TimerKind::Keepalive, self.keepalive_interval, out);
                }
            }
            TimerKind::CallClock => {
                if self.state.status == CallStatus::Connected {
                    self.state.call_seconds += 1;
                    self.start_timer(TimerKind::CallClock, CALL_CLOCK_TICK, out);
                }
            }
            TimerKind::AutoNext => {
                if self.state.status == CallStatus::Disconnected {
                    self.backoff.reset();
                    self.begin_search(out);
                }
            }
            TimerKind::Reconnect => {
                info!(attempt = self.backoff.attempts(), "Reconnecting");
                self.reconnect_now(out);
            }
        }
    }

    fn start_timer(&mut self, kind: TimerKind, after: Duration, out: &mut Vec<Command>) {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.timers.insert(kind, generation);
        out.push(Command::StartTimer {
            timer: TimerId { kind, generation },
            after,
        });
    }

    fn cancel_timer(&mut self, kind: TimerKind, out: &mut Vec<Command>) {
        if self.timers.remove(&kind).is_some() {
            out.push(Command::CancelTimer(kind));
        }
    }
}
