//! Tokio driver for [`CallMachine`]
//!
//! One task owns the machine and everything it commands: the signaling
//! WebSocket, the current peer session and the armed timers. User actions,
//! socket frames, peer callbacks and timer expiries all arrive on a single
//! queue, so the machine sees them strictly one at a time.

use crate::call::CallState;
use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::machine::{CallMachine, Command, Event, NegotiationId, PeerEvent, TimerKind};
use crate::peer::{PeerConnector, PeerEvents, PeerSession};
use airtalk_protocol::ServerMessage;
use chrono::Utc;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::collections::HashMap;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

pub(crate) enum Input {
    Event(Event),
    Transport {
        generation: u64,
        event: TransportEvent,
    },
    Stop,
}

pub(crate) enum TransportEvent {
    Opened(mpsc::UnboundedSender<Message>),
    Message(ServerMessage),
    Closed,
}

/// Handle to a running call agent
pub struct CallAgent {
    tx: mpsc::UnboundedSender<Input>,
    state: watch::Receiver<CallState>,
    task: JoinHandle<()>,
}

impl CallAgent {
    /// Start the agent task; it stays idle until [`CallAgent::start_search`]
    pub fn spawn<C: PeerConnector>(config: AgentConfig, connector: C) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let machine = CallMachine::new(&config);
        let (state_tx, state) = watch::channel(machine.state().clone());
        let driver = Driver {
            server_url: config.server_url,
            machine,
            connector,
            inputs_tx: tx.clone(),
            inputs: rx,
            state_tx,
            outbound: None,
            transport_generation: 0,
            peer: None,
            timers: HashMap::new(),
        };
        let task = tokio::spawn(driver.run());
        Self { tx, state, task }
    }

    pub fn start_search(&self) -> Result<(), AgentError> {
        self.send(Event::StartSearch)
    }

    pub fn hang_up(&self, auto_next: bool) -> Result<(), AgentError> {
        self.send(Event::HangUp { auto_next })
    }

    pub fn toggle_mute(&self) -> Result<(), AgentError> {
        self.send(Event::ToggleMute)
    }

    pub fn send_chat(&self, text: impl Into<String>) -> Result<(), AgentError> {
        self.send(Event::SendChat(text.into()))
    }

    /// Snapshot of the current call state
    pub fn state(&self) -> CallState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CallState> {
        self.state.clone()
    }

    /// Wait until the call state satisfies `condition`
    pub async fn wait_for(
        &self,
        condition: impl FnMut(&CallState) -> bool,
    ) -> Result<CallState, AgentError> {
        let mut state = self.state.clone();
        let matched = state
            .wait_for(condition)
            .await
            .map_err(|_| AgentError::Stopped)?;
        Ok(matched.clone())
    }

    /// Release the call and wait for the agent task to finish
    pub async fn stop(self) {
        let _ = self.tx.send(Input::Stop);
        if let Err(e) = self.task.await {
            error!("Agent task failed: {e}");
        }
    }

    fn send(&self, event: Event) -> Result<(), AgentError> {
        self.tx
            .send(Input::Event(event))
            .map_err(|_| AgentError::Stopped)
    }
}

struct Driver<C> {
    server_url: String,
    machine: CallMachine,
    connector: C,
    inputs_tx: mpsc::UnboundedSender<Input>,
    inputs: mpsc::UnboundedReceiver<Input>,
    state_tx: watch::Sender<CallState>,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    /// Bumped whenever a transport is opened or dropped; frames from older
    /// connections are discarded
    transport_generation: u64,
    peer: Option<(NegotiationId, Box<dyn PeerSession>)>,
    timers: HashMap<TimerKind, JoinHandle<()>>,
}

impl<C: PeerConnector> Driver<C> {
    async fn run(mut self) {
        while let Some(input) = self.inputs.recv().await {
            match input {
                Input::Event(event) => self.feed(event).await,
                Input::Transport { generation, event } => {
                    if generation != self.transport_generation {
                        continue;
                    }
                    match event {
                        TransportEvent::Opened(tx) => {
                            self.outbound = Some(tx);
                            self.feed(Event::TransportOpened).await;
                        }
                        TransportEvent::Message(message) => {
                            self.feed(Event::Server(message)).await
                        }
                        TransportEvent::Closed => {
                            self.outbound = None;
                            self.feed(Event::TransportClosed).await;
                        }
                    }
                }
                Input::Stop => break,
            }
        }
        self.shutdown().await;
    }

    async fn feed(&mut self, event: Event) {
        let commands = self.machine.handle(event, Utc::now());
        for command in commands {
            self.execute(command).await;
        }
        let state = self.machine.state();
        self.state_tx.send_if_modified(|current| {
            if *current != *state {
                *current = state.clone();
                true
            } else {
                false
            }
        });
    }

    async fn execute(&mut self, command: Command) {
        match command {
            Command::OpenTransport => self.open_transport(),
            Command::CloseTransport => {
                self.transport_generation += 1;
                // dropping the sender lets the writer send a close frame
                self.outbound = None;
            }
            Command::Send(message) => match &self.outbound {
                Some(tx) => {
                    if tx.send(Message::text(message.to_string())).is_err() {
                        debug!("Signaling writer is gone, dropping {}", message.kind());
                    }
                }
                None => debug!("Not connected, dropping {}", message.kind()),
            },
            Command::OpenPeer {
                negotiation,
                role,
                muted,
            } => {
                self.close_peer().await;
                let events = PeerEvents::new(negotiation, self.inputs_tx.clone());
                match self.connector.open(role, muted, events).await {
                    Ok(session) => self.peer = Some((negotiation, session)),
                    Err(e) => self.peer_failed(negotiation, e),
                }
            }
            Command::ApplyRemoteSignal { negotiation, data } => {
                let result = match self.peer.as_mut() {
                    Some((id, session)) if *id == negotiation => {
                        session.apply_remote_signal(data).await
                    }
                    _ => Ok(()),
                };
                if let Err(e) = result {
                    self.peer_failed(negotiation, e);
                }
            }
            Command::RestartIce { negotiation } => {
                if let Some((id, session)) = self.peer.as_mut() {
                    if *id == negotiation {
                        if let Err(e) = session.restart_ice().await {
                            warn!("ICE restart failed: {e}");
                        }
                    }
                }
            }
            Command::ClosePeer => self.close_peer().await,
            Command::SetMicrophone { enabled } => {
                if let Some((_, session)) = self.peer.as_mut() {
                    session.set_microphone(enabled);
                }
            }
            Command::SendChat(text) => {
                if let Some((_, session)) = self.peer.as_mut() {
                    if let Err(e) = session.send_chat(text).await {
                        warn!("Failed to send chat message: {e}");
                    }
                }
            }
            Command::StartTimer { timer, after } => {
                let tx = self.inputs_tx.clone();
                let task = tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    let _ = tx.send(Input::Event(Event::Timer(timer)));
                });
                if let Some(previous) = self.timers.insert(timer.kind, task) {
                    previous.abort();
                }
            }
            Command::CancelTimer(kind) => {
                if let Some(task) = self.timers.remove(&kind) {
                    task.abort();
                }
            }
        }
    }

    fn peer_failed(&self, negotiation: NegotiationId, e: AgentError) {
        let _ = self.inputs_tx.send(Input::Event(Event::Peer {
            negotiation,
            event: PeerEvent::Failed(e.to_string()),
        }));
    }

    async fn close_peer(&mut self) {
        if let Some((_, mut session)) = self.peer.take() {
            session.close().await;
        }
    }

    fn open_transport(&mut self) {
        self.transport_generation += 1;
        self.outbound = None;
        let generation = self.transport_generation;
        let url = self.server_url.clone();
        let inputs = self.inputs_tx.clone();
        tokio::spawn(async move {
            run_transport(url, generation, inputs).await;
        });
    }

    async fn shutdown(&mut self) {
        for (_, task) in self.timers.drain() {
            task.abort();
        }
        self.close_peer().await;
        self.outbound = None;
        debug!("Call agent stopped");
    }
}

type WsError = tokio_tungstenite::tungstenite::Error;

/// Open the signaling WebSocket
pub(crate) async fn connect(
    url: &str,
) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, AgentError> {
    let (stream, _) = connect_async(url)
        .await
        .map_err(|e| AgentError::Transport(format!("Failed to connect to {url}: {e}")))?;
    Ok(stream)
}

/// Connect, then pump frames both ways until either side ends
async fn run_transport(url: String, generation: u64, inputs: mpsc::UnboundedSender<Input>) {
    let report = |event| {
        inputs
            .send(Input::Transport { generation, event })
            .is_ok()
    };

    let stream = match connect(&url).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("{e}");
            report(TransportEvent::Closed);
            return;
        }
    };
    info!("Connected to signaling server at {url}");

    let (write, read) = stream.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();
    if !report(TransportEvent::Opened(tx)) {
        return;
    }
    pump(write, read, rx, &report).await;
}

/// Drain `outbound` into `write` and report frames from `read`
///
/// `Closed` is reported once, whichever side stops first.
async fn pump<W, R>(
    mut write: W,
    mut read: R,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    report: &impl Fn(TransportEvent) -> bool,
) where
    W: Sink<Message, Error = WsError> + Unpin,
    R: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let writer = async {
        while let Some(message) = outbound.recv().await {
            if let Err(e) = write.send(message).await {
                error!("Failed to send WebSocket message: {e}");
                return;
            }
        }
        let _ = write.close().await;
    };

    let reader = async {
        while let Some(frame) = read.next().await {
            match frame {
                Ok(Message::Text(text)) => match text.parse::<ServerMessage>() {
                    Ok(message) => {
                        if !report(TransportEvent::Message(message)) {
                            return;
                        }
                    }
                    Err(e) => warn!("Ignoring server frame: {e}"),
                },
                Ok(Message::Close(_)) => {
                    info!("Signaling server closed the connection");
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("WebSocket error: {e}");
                    return;
                }
            }
        }
    };

    tokio::select! {
        _ = writer => debug!("Signaling writer finished"),
        _ = reader => debug!("Signaling reader finished"),
    }
    report(TransportEvent::Closed);
}
