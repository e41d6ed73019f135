use std::borrow::Borrow;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// Opaque negotiation payload (offer, answer or candidate) produced by the
/// peer-connection library. The relay forwards it without looking inside.
pub type Signal = serde_json::Value;

/// Identifier the relay assigns to one live signaling connection.
///
/// It is only meaningful while that connection stays open and is never
/// reused for another connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Fresh random identifier (UUIDv4, simple hex form).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl Borrow<str> for SessionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Call envelope sent by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    pub target_id: SessionId,
    pub signal: Signal,
    pub from_id: SessionId,
}

/// What the callee receives for a forwarded [`CallRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingCall {
    pub signal: Signal,
    pub from_id: SessionId,
}

/// Answer envelope sent by the callee after accepting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallAnswer {
    pub signal: Signal,
    pub target_id: SessionId,
}

/// Sent back to a sender whose envelope could not be delivered, when the
/// relay is configured to report it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerUnavailable {
    pub target_id: SessionId,
}

/// Frames a client sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    InitiateCall(CallRequest),
    AcceptCall(CallAnswer),
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::InitiateCall(_) => "initiate-call",
            ClientEvent::AcceptCall(_) => "accept-call",
        }
    }

    /// Session the envelope is addressed to.
    pub fn target(&self) -> &SessionId {
        match self {
            ClientEvent::InitiateCall(req) => &req.target_id,
            ClientEvent::AcceptCall(answer) => &answer.target_id,
        }
    }
}

/// Frames the relay sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    AssignedId(SessionId),
    IncomingCall(IncomingCall),
    CallAccepted(Signal),
    CallEnded,
    PeerUnavailable(PeerUnavailable),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::AssignedId(_) => "assigned-id",
            ServerEvent::IncomingCall(_) => "incoming-call",
            ServerEvent::CallAccepted(_) => "call-accepted",
            ServerEvent::CallEnded => "call-ended",
            ServerEvent::PeerUnavailable(_) => "peer-unavailable",
        }
    }
}

/// Encode a frame as JSON text.
pub fn encode<T: Serialize>(frame: &T) -> Result<String> {
    serde_json::to_string(frame).map_err(Error::serialization)
}

/// Decode a JSON text frame.
pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T> {
    serde_json::from_str(text).map_err(Error::serialization)
}
