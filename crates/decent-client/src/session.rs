//! Call negotiation as an explicit state machine.
//!
//! A [`PeerSession`] covers exactly one call attempt, either as the caller
//! (`Idle -> Offering -> AwaitingAnswer -> Connected`) or as the callee
//! (`Idle -> Ringing -> Answering -> Connected`). It is driven from three
//! sides: relay frames ([`PeerSession::handle_relay_event`]), peer-connection
//! events ([`PeerSession::handle_peer_event`]) and user actions (`call`,
//! `accept`, `send_text`, `hang_up`). Frames that must go out through the
//! relay are returned to the caller rather than sent from here.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use decent_common::{
    CallAnswer, CallRequest, ClientEvent, IncomingCall, PeerUnavailable, ServerEvent, SessionId,
    Signal,
};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::chat::{Author, ChatEntry, ChatLog};
use crate::error::{ClientError, Result};
use crate::peer::{PeerConnection, PeerConnector, PeerEvent, PeerOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Caller,
    Callee,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// Caller: peer instance built, offer not produced yet.
    Offering { target: SessionId },
    /// Caller: offer sent through the relay.
    AwaitingAnswer { target: SessionId },
    /// Callee: an offer arrived and waits for the user.
    Ringing { caller: SessionId },
    /// Callee: offer fed to the peer instance, answer pending or sent.
    Answering { caller: SessionId },
    Connected { remote: SessionId, role: Role },
    Failed { reason: String },
    Closed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Failed { .. } | SessionState::Closed)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected { .. })
    }

    fn is_negotiating(&self) -> bool {
        matches!(
            self,
            SessionState::Offering { .. }
                | SessionState::AwaitingAnswer { .. }
                | SessionState::Answering { .. }
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Offering { target } => write!(f, "creating offer for {}", target),
            SessionState::AwaitingAnswer { target } => write!(f, "waiting for {} to answer", target),
            SessionState::Ringing { caller } => write!(f, "incoming call from {}", caller),
            SessionState::Answering { caller } => write!(f, "answering {}", caller),
            SessionState::Connected { remote, .. } => write!(f, "connected to {}", remote),
            SessionState::Failed { reason } => write!(f, "failed: {}", reason),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub trickle: bool,
    pub ice_servers: Vec<String>,
    /// Give up on a call that is not connected this long after `call` or
    /// `accept`. `None` waits forever.
    pub negotiation_timeout: Option<Duration>,
}

impl SessionConfig {
    fn peer_options(&self, initiator: bool) -> PeerOptions {
        PeerOptions {
            initiator,
            trickle: self.trickle,
            ice_servers: self.ice_servers.clone(),
        }
    }
}

pub struct PeerSession {
    me: SessionId,
    config: SessionConfig,
    connector: Arc<dyn PeerConnector>,
    state: SessionState,
    peer: Option<Box<dyn PeerConnection>>,
    /// Offer (and any trickled candidates) received while ringing.
    pending: Vec<Signal>,
    deadline: Option<Instant>,
    events: mpsc::UnboundedSender<PeerEvent>,
    chat: ChatLog,
}

impl PeerSession {
    /// Build an idle session for the client that the relay knows as `me`.
    ///
    /// The returned receiver yields the events of the peer instance this
    /// session creates; feed them back through [`PeerSession::handle_peer_event`].
    pub fn new(
        me: SessionId,
        config: SessionConfig,
        connector: Arc<dyn PeerConnector>,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let session = Self {
            me,
            config,
            connector,
            state: SessionState::Idle,
            peer: None,
            pending: Vec::new(),
            deadline: None,
            events,
            chat: ChatLog::new(),
        };
        (session, rx)
    }

    pub fn me(&self) -> &SessionId {
        &self.me
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn chat(&self) -> &ChatLog {
        &self.chat
    }

    /// When the negotiation timeout fires, if one is armed.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Start a call to `target` as the initiator.
    pub async fn call(&mut self, target: SessionId) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(self.invalid("place a call"));
        }
        let peer = self
            .connector
            .connect(self.config.peer_options(true), self.events.clone())
            .await?;
        self.peer = Some(peer);
        info!("calling {}", target);
        self.state = SessionState::Offering { target };
        self.arm_deadline();
        Ok(())
    }

    /// Accept the ringing call.
    ///
    /// If the peer instance cannot be built the session keeps ringing and
    /// the call can be accepted again. If the stored offer is rejected the
    /// call is over: the session fails and the instance is closed.
    pub async fn accept(&mut self) -> Result<()> {
        let caller = match &self.state {
            SessionState::Ringing { caller } => caller.clone(),
            _ => return Err(self.invalid("accept a call")),
        };
        let peer = self
            .connector
            .connect(self.config.peer_options(false), self.events.clone())
            .await?;

        let mut applied = Ok(());
        for signal in &self.pending {
            if let Err(err) = peer.signal(signal.clone()).await {
                applied = Err(err);
                break;
            }
        }
        if let Err(err) = applied {
            warn!("offer from {} rejected: {}", caller, err);
            if let Err(close_err) = peer.close().await {
                debug!("error closing peer connection: {}", close_err);
            }
            self.fail(format!("offer from {} rejected: {}", caller, err))
                .await;
            return Err(err);
        }
        self.pending.clear();
        self.peer = Some(peer);
        info!("accepted call from {}", caller);
        self.state = SessionState::Answering { caller };
        self.arm_deadline();
        Ok(())
    }

    /// Send chat text over the direct channel and record it locally.
    /// Empty text is ignored.
    pub async fn send_text(&mut self, text: &str) -> Result<Option<&ChatEntry>> {
        if text.is_empty() {
            return Ok(None);
        }
        if !self.state.is_connected() {
            return Err(ClientError::NotConnected);
        }
        let peer = self.peer.as_ref().ok_or(ClientError::NotConnected)?;
        peer.send(Bytes::copy_from_slice(text.as_bytes())).await?;
        Ok(Some(self.chat.push(text, Author::Me)))
    }

    /// Tear down the peer instance and end the session.
    pub async fn hang_up(&mut self) {
        self.release_peer().await;
        if !self.state.is_terminal() {
            self.state = SessionState::Closed;
        }
    }

    /// Fail the call if the negotiation deadline has passed.
    pub async fn check_deadline(&mut self, now: Instant) {
        let Some(deadline) = self.deadline else {
            return;
        };
        if now < deadline {
            return;
        }
        if self.state.is_negotiating() {
            warn!("negotiation timed out while {}", self.state);
            self.fail("negotiation timed out").await;
        } else {
            self.deadline = None;
        }
    }

    pub async fn handle_relay_event(&mut self, event: ServerEvent) -> Result<()> {
        match event {
            ServerEvent::IncomingCall(IncomingCall { signal, from_id }) => {
                self.on_incoming_call(signal, from_id).await
            }
            ServerEvent::CallAccepted(signal) => self.on_call_accepted(signal).await,
            ServerEvent::PeerUnavailable(PeerUnavailable { target_id }) => {
                let ours = matches!(
                    &self.state,
                    SessionState::Offering { target } | SessionState::AwaitingAnswer { target }
                        if *target == target_id
                );
                if ours {
                    self.fail(format!("{} is not connected to the relay", target_id))
                        .await;
                }
                Ok(())
            }
            // Not addressed to anyone in particular; the front end decides
            // what to show.
            ServerEvent::CallEnded => Ok(()),
            ServerEvent::AssignedId(id) => {
                debug!("ignoring late assigned-id {}", id);
                Ok(())
            }
        }
    }

    /// Apply an event from the peer instance, returning the frame to send
    /// through the relay if there is one.
    pub async fn handle_peer_event(&mut self, event: PeerEvent) -> Result<Option<ClientEvent>> {
        match event {
            PeerEvent::Signal(signal) => Ok(self.on_local_signal(signal)),
            PeerEvent::Connected => {
                let connected = match &self.state {
                    SessionState::Offering { target } | SessionState::AwaitingAnswer { target } => {
                        Some((target.clone(), Role::Caller))
                    }
                    SessionState::Answering { caller } => Some((caller.clone(), Role::Callee)),
                    _ => None,
                };
                if let Some((remote, role)) = connected {
                    info!("direct channel open with {}", remote);
                    self.state = SessionState::Connected { remote, role };
                    self.deadline = None;
                }
                Ok(None)
            }
            PeerEvent::Data(data) => {
                if self.state.is_connected() {
                    self.chat.push_received(&data);
                } else {
                    debug!("dropping {} bytes received outside a call", data.len());
                }
                Ok(None)
            }
            PeerEvent::Closed => {
                if !self.state.is_terminal() {
                    info!("direct channel closed");
                    self.state = SessionState::Closed;
                    self.deadline = None;
                }
                self.peer = None;
                Ok(None)
            }
            PeerEvent::Error(reason) => {
                if !self.state.is_terminal() {
                    self.fail(reason).await;
                }
                Ok(None)
            }
        }
    }

    async fn on_incoming_call(&mut self, signal: Signal, from: SessionId) -> Result<()> {
        match &self.state {
            SessionState::Idle => {
                info!("incoming call from {}", from);
                self.pending.push(signal);
                self.state = SessionState::Ringing { caller: from };
            }
            SessionState::Ringing { caller } if *caller == from => {
                self.pending.push(signal);
            }
            SessionState::Answering { caller } if *caller == from => {
                self.feed(signal).await?;
            }
            SessionState::Connected {
                remote,
                role: Role::Callee,
            } if *remote == from => {
                self.feed(signal).await?;
            }
            state => {
                debug!("ignoring call from {} while {}", from, state);
            }
        }
        Ok(())
    }

    async fn on_call_accepted(&mut self, signal: Signal) -> Result<()> {
        match &self.state {
            SessionState::Offering { .. }
            | SessionState::AwaitingAnswer { .. }
            | SessionState::Connected {
                role: Role::Caller,
                ..
            } => self.feed(signal).await,
            state => {
                debug!("ignoring call-accepted while {}", state);
                Ok(())
            }
        }
    }

    fn on_local_signal(&mut self, signal: Signal) -> Option<ClientEvent> {
        match &self.state {
            SessionState::Offering { target } => {
                let target = target.clone();
                self.state = SessionState::AwaitingAnswer {
                    target: target.clone(),
                };
                Some(self.call_request(target, signal))
            }
            SessionState::AwaitingAnswer { target }
            | SessionState::Connected {
                remote: target,
                role: Role::Caller,
            } => Some(self.call_request(target.clone(), signal)),
            SessionState::Answering { caller }
            | SessionState::Connected {
                remote: caller,
                role: Role::Callee,
            } => Some(ClientEvent::AcceptCall(CallAnswer {
                signal,
                target_id: caller.clone(),
            })),
            state => {
                debug!("discarding local signal while {}", state);
                None
            }
        }
    }

    fn call_request(&self, target: SessionId, signal: Signal) -> ClientEvent {
        ClientEvent::InitiateCall(CallRequest {
            target_id: target,
            signal,
            from_id: self.me.clone(),
        })
    }

    async fn feed(&self, signal: Signal) -> Result<()> {
        match &self.peer {
            Some(peer) => peer.signal(signal).await,
            None => Err(self.invalid("apply a remote signal")),
        }
    }

    async fn fail(&mut self, reason: impl Into<String>) {
        self.release_peer().await;
        self.state = SessionState::Failed {
            reason: reason.into(),
        };
    }

    async fn release_peer(&mut self) {
        self.deadline = None;
        self.pending.clear();
        if let Some(peer) = self.peer.take() {
            if let Err(err) = peer.close().await {
                debug!("error closing peer connection: {}", err);
            }
        }
    }

    fn arm_deadline(&mut self) {
        self.deadline = self
            .config
            .negotiation_timeout
            .map(|timeout| Instant::now() + timeout);
    }

    fn invalid(&self, action: &'static str) -> ClientError {
        ClientError::InvalidState {
            action,
            state: self.state.clone(),
        }
    }
}
