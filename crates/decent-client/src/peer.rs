//! Boundary to the peer-connection library.
//!
//! A [`PeerConnector`] builds one [`PeerConnection`] per call. Everything the
//! connection learns asynchronously (local signals, channel open, incoming
//! data, teardown) is reported as a [`PeerEvent`] on the channel handed to
//! [`PeerConnector::connect`], so the session above it can be driven as a
//! plain state machine instead of through nested callbacks.

use async_trait::async_trait;
use bytes::Bytes;
use decent_common::Signal;
use tokio::sync::mpsc;

use crate::error::Result;

pub type PeerEvents = mpsc::UnboundedSender<PeerEvent>;

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// Local negotiation material to hand to the remote side through the relay.
    Signal(Signal),
    /// The direct channel is open.
    Connected,
    /// Bytes received over the direct channel.
    Data(Bytes),
    /// The direct channel was closed.
    Closed,
    /// Negotiation or transport failed.
    Error(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerOptions {
    /// The initiator opens the data channel and produces the offer.
    pub initiator: bool,
    /// Emit candidates as separate signals instead of waiting for gathering
    /// to finish and sending one complete description.
    pub trickle: bool,
    /// STUN/TURN urls, empty for host candidates only.
    pub ice_servers: Vec<String>,
}

#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Construct a connection. Failures here surface to whoever asked for
    /// the call; failures after construction arrive as [`PeerEvent::Error`].
    async fn connect(
        &self,
        options: PeerOptions,
        events: PeerEvents,
    ) -> Result<Box<dyn PeerConnection>>;
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Feed negotiation material received from the remote side.
    async fn signal(&self, remote: Signal) -> Result<()>;

    /// Send bytes over the open direct channel.
    async fn send(&self, data: Bytes) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
