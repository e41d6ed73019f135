//! Decent chat client.
//!
//! Connects to the relay, negotiates a direct WebRTC data channel with one
//! other client and exchanges chat text over it.

#![forbid(unsafe_code)]

pub mod chat;
pub mod driver;
pub mod error;
pub mod loopback;
pub mod peer;
pub mod relay;
pub mod rtc;
pub mod session;

pub use chat::{Author, ChatEntry, ChatLog};
pub use driver::{ClientDriver, Command, DriverConfig, UiEvent};
pub use error::{ClientError, Result};
pub use loopback::LoopbackConnector;
pub use peer::{PeerConnection, PeerConnector, PeerEvent, PeerOptions};
pub use relay::RelayConnection;
pub use rtc::WebRtcConnector;
pub use session::{PeerSession, Role, SessionConfig, SessionState};
