//! Event loop tying the relay link, the current [`PeerSession`] and the
//! user together.
//!
//! The front end sends [`Command`]s in and receives [`UiEvent`]s out; it
//! never touches the session directly. A finished session (closed or
//! failed) is replaced by a fresh idle one when the next call starts or
//! arrives.

use std::sync::Arc;

use decent_common::{ServerEvent, SessionId};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::chat::ChatEntry;
use crate::error::Result;
use crate::peer::{PeerConnector, PeerEvent};
use crate::relay::RelayConnection;
use crate::session::{PeerSession, SessionConfig, SessionState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Call(SessionId),
    Accept,
    Send(String),
    HangUp,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    /// Our id, to be shared with whoever should call us.
    Assigned(SessionId),
    State(SessionState),
    IncomingCall(SessionId),
    Chat(ChatEntry),
    /// Some client left the relay.
    CallEnded,
    Error(String),
}

#[derive(Debug, Clone, Default)]
pub struct DriverConfig {
    pub session: SessionConfig,
    /// Answer incoming calls without waiting for [`Command::Accept`].
    pub auto_accept: bool,
}

pub struct ClientDriver {
    relay: RelayConnection,
    connector: Arc<dyn PeerConnector>,
    config: DriverConfig,
    session: PeerSession,
    peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    ui: mpsc::UnboundedSender<UiEvent>,
    last_state: SessionState,
    published_chat: usize,
}

impl ClientDriver {
    pub fn new(
        relay: RelayConnection,
        connector: Arc<dyn PeerConnector>,
        config: DriverConfig,
        ui: mpsc::UnboundedSender<UiEvent>,
    ) -> Self {
        let (session, peer_events) = PeerSession::new(
            relay.id().clone(),
            config.session.clone(),
            connector.clone(),
        );
        Self {
            relay,
            connector,
            config,
            session,
            peer_events,
            ui,
            last_state: SessionState::Idle,
            published_chat: 0,
        }
    }

    /// Run until [`Command::Quit`], the command channel closing, or the
    /// relay going away. Any open call is hung up on the way out.
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        self.emit(UiEvent::Assigned(self.relay.id().clone()));

        loop {
            let deadline = self.session.deadline();
            let step = tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Quit) | None => break,
                    Some(command) => self.on_command(command).await,
                },
                event = self.relay.recv() => match event {
                    Some(event) => self.on_relay_event(event).await,
                    None => {
                        self.emit(UiEvent::Error("relay connection closed".into()));
                        break;
                    }
                },
                Some(event) = self.peer_events.recv() => self.on_peer_event(event).await,
                _ = sleep_until(deadline) => {
                    self.session.check_deadline(Instant::now()).await;
                    Ok(())
                }
            };
            if let Err(err) = step {
                warn!("{}", err);
                self.emit(UiEvent::Error(err.to_string()));
            }
            self.publish();
        }

        self.session.hang_up().await;
        self.publish();
        self.relay.close().await;
        info!("client stopped");
    }

    async fn on_command(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Call(target) => {
                self.renew_if_finished();
                self.session.call(target).await
            }
            Command::Accept => self.session.accept().await,
            Command::Send(text) => self.session.send_text(&text).await.map(|_| ()),
            Command::HangUp => {
                self.session.hang_up().await;
                Ok(())
            }
            Command::Quit => Ok(()),
        }
    }

    async fn on_relay_event(&mut self, event: ServerEvent) -> Result<()> {
        match event {
            ServerEvent::IncomingCall(_) => {
                self.renew_if_finished();
                let was_ringing = matches!(self.session.state(), SessionState::Ringing { .. });
                self.session.handle_relay_event(event).await?;
                if let SessionState::Ringing { caller } = self.session.state() {
                    if !was_ringing {
                        self.emit(UiEvent::IncomingCall(caller.clone()));
                        if self.config.auto_accept {
                            self.session.accept().await?;
                        }
                    }
                }
                Ok(())
            }
            ServerEvent::CallEnded => {
                self.emit(UiEvent::CallEnded);
                self.session.handle_relay_event(event).await
            }
            event => self.session.handle_relay_event(event).await,
        }
    }

    async fn on_peer_event(&mut self, event: PeerEvent) -> Result<()> {
        if let Some(frame) = self.session.handle_peer_event(event).await? {
            self.relay.send(frame).await?;
        }
        Ok(())
    }

    fn renew_if_finished(&mut self) {
        if !self.session.state().is_terminal() {
            return;
        }
        let (session, peer_events) = PeerSession::new(
            self.relay.id().clone(),
            self.config.session.clone(),
            self.connector.clone(),
        );
        self.session = session;
        self.peer_events = peer_events;
        self.published_chat = 0;
    }

    /// Report state changes and chat lines added since the last step.
    fn publish(&mut self) {
        if *self.session.state() != self.last_state {
            self.last_state = self.session.state().clone();
            self.emit(UiEvent::State(self.last_state.clone()));
        }
        let entries = self.session.chat().entries();
        for entry in &entries[self.published_chat..] {
            let _ = self.ui.send(UiEvent::Chat(entry.clone()));
        }
        self.published_chat = entries.len();
    }

    fn emit(&self, event: UiEvent) {
        let _ = self.ui.send(event);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
