use thiserror::Error;

use crate::session::SessionState;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Common(#[from] decent_common::Error),

    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),

    #[error("relay connection closed")]
    RelayClosed,

    #[error("peer connection error: {0}")]
    Peer(String),

    #[error("no direct channel is open")]
    NotConnected,

    #[error("cannot {action} while {state}")]
    InvalidState {
        action: &'static str,
        state: SessionState,
    },
}

impl ClientError {
    /// Wrap an error raised by the peer-connection library.
    pub fn peer(err: impl std::fmt::Display) -> Self {
        Self::Peer(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}
