//! In-process peer connections.
//!
//! Instances created from the same [`LoopbackConnector`] negotiate with each
//! other through fake offer/answer signals and then exchange data over
//! channels. Used to exercise sessions and the client driver without a real
//! network stack.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use decent_common::Signal;
use serde_json::json;

use crate::error::{ClientError, Result};
use crate::peer::{PeerConnection, PeerConnector, PeerEvent, PeerEvents, PeerOptions};

#[derive(Default)]
struct Hub {
    next_key: u64,
    /// Initiators whose offer has not been picked up yet.
    offered: HashMap<u64, PeerEvents>,
    /// Responders whose answer has not been applied yet.
    answered: HashMap<u64, PeerEvents>,
}

#[derive(Clone, Default)]
pub struct LoopbackConnector {
    hub: Arc<Mutex<Hub>>,
    refuse: bool,
}

impl LoopbackConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// A connector whose every `connect` fails, as on a host without WebRTC
    /// support.
    pub fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl PeerConnector for LoopbackConnector {
    async fn connect(
        &self,
        options: PeerOptions,
        events: PeerEvents,
    ) -> Result<Box<dyn PeerConnection>> {
        if self.refuse {
            return Err(ClientError::peer("loopback peer connections are disabled"));
        }

        let key = if options.initiator {
            let mut hub = lock(&self.hub)?;
            hub.next_key += 1;
            let key = hub.next_key;
            hub.offered.insert(key, events.clone());
            let _ = events.send(PeerEvent::Signal(
                json!({"type": "offer", "sdp": loopback_sdp(key)}),
            ));
            if options.trickle {
                let _ = events.send(PeerEvent::Signal(json!({
                    "type": "candidate",
                    "candidate": {"candidate": loopback_sdp(key), "sdpMid": "0"}
                })));
            }
            Some(key)
        } else {
            None
        };

        Ok(Box::new(LoopbackPeer {
            hub: self.hub.clone(),
            key: Mutex::new(key),
            events,
            remote: Mutex::new(None),
        }))
    }
}

struct LoopbackPeer {
    hub: Arc<Mutex<Hub>>,
    key: Mutex<Option<u64>>,
    events: PeerEvents,
    remote: Mutex<Option<PeerEvents>>,
}

fn loopback_sdp(key: u64) -> String {
    format!("loopback-{}", key)
}

fn parse_key(signal: &Signal) -> Result<u64> {
    signal
        .get("sdp")
        .and_then(|sdp| sdp.as_str())
        .and_then(|sdp| sdp.strip_prefix("loopback-"))
        .and_then(|key| key.parse().ok())
        .ok_or_else(|| ClientError::peer("not a loopback description"))
}

fn lock<T>(mutex: &Mutex<T>) -> Result<std::sync::MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| ClientError::peer("loopback state poisoned"))
}

#[async_trait]
impl PeerConnection for LoopbackPeer {
    async fn signal(&self, remote: Signal) -> Result<()> {
        match remote.get("type").and_then(|t| t.as_str()) {
            Some("offer") => {
                let key = parse_key(&remote)?;
                let initiator = lock(&self.hub)?
                    .offered
                    .remove(&key)
                    .ok_or_else(|| ClientError::peer("offer is stale or unknown"))?;
                lock(&self.hub)?.answered.insert(key, self.events.clone());
                *lock(&self.key)? = Some(key);
                *lock(&self.remote)? = Some(initiator);
                let _ = self.events.send(PeerEvent::Signal(
                    json!({"type": "answer", "sdp": loopback_sdp(key)}),
                ));
                Ok(())
            }
            Some("answer") => {
                let key = parse_key(&remote)?;
                if *lock(&self.key)? != Some(key) {
                    return Err(ClientError::peer("answer does not match our offer"));
                }
                let responder = lock(&self.hub)?
                    .answered
                    .remove(&key)
                    .ok_or_else(|| ClientError::peer("answer is stale or unknown"))?;
                let _ = responder.send(PeerEvent::Connected);
                let _ = self.events.send(PeerEvent::Connected);
                *lock(&self.remote)? = Some(responder);
                Ok(())
            }
            Some("candidate") => Ok(()),
            other => Err(ClientError::peer(format!(
                "unrecognised signal type {:?}",
                other
            ))),
        }
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        let remote = lock(&self.remote)?;
        let remote = remote.as_ref().ok_or(ClientError::NotConnected)?;
        remote
            .send(PeerEvent::Data(data))
            .map_err(|_| ClientError::NotConnected)
    }

    async fn close(&self) -> Result<()> {
        if let Some(remote) = lock(&self.remote)?.take() {
            let _ = remote.send(PeerEvent::Closed);
        }
        Ok(())
    }
}
