//! [`PeerConnector`] backed by webrtc-rs.
//!
//! The initiator opens a `chat` data channel and produces an offer; the
//! other side waits for the channel to show up. Without trickle, a
//! description is only reported once ICE gathering has finished so that a
//! single offer and a single answer are enough to connect. With trickle,
//! the description goes out immediately and candidates follow as
//! `{"type":"candidate","candidate":{...}}` signals.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use decent_common::Signal;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::error::{ClientError, Result};
use crate::peer::{PeerConnection, PeerConnector, PeerEvent, PeerEvents, PeerOptions};

const CHAT_CHANNEL_LABEL: &str = "chat";

#[derive(Debug, Clone, Copy, Default)]
pub struct WebRtcConnector;

impl WebRtcConnector {
    pub fn new() -> Self {
        Self
    }
}

#[derive(Deserialize)]
struct Description {
    sdp: String,
}

#[derive(Deserialize)]
struct Candidate {
    candidate: RTCIceCandidateInit,
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(
        &self,
        options: PeerOptions,
        events: PeerEvents,
    ) -> Result<Box<dyn PeerConnection>> {
        let mut media = MediaEngine::default();
        media.register_default_codecs().map_err(ClientError::peer)?;
        let registry = register_default_interceptors(Registry::new(), &mut media)
            .map_err(ClientError::peer)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: options
                .ice_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(ClientError::peer)?,
        );

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            debug!("peer connection state changed: {}", state);
            let events = state_events.clone();
            Box::pin(async move {
                if let Some(event) = state_event(state) {
                    let _ = events.send(event);
                }
            })
        }));

        if options.trickle {
            let candidate_events = events.clone();
            pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events = candidate_events.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = events.send(PeerEvent::Signal(
                                json!({"type": "candidate", "candidate": init}),
                            ));
                        }
                        Err(err) => debug!("skipping local candidate: {}", err),
                    }
                })
            }));
        }

        let channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>> = Arc::default();

        if options.initiator {
            let dc = pc
                .create_data_channel(CHAT_CHANNEL_LABEL, None)
                .await
                .map_err(ClientError::peer)?;
            wire_channel(&dc, &events);
            *channel.lock().await = Some(dc);

            let offer = pc.create_offer(None).await.map_err(ClientError::peer)?;
            spawn_publish(pc.clone(), offer, "offer", options.trickle, events.clone());
        } else {
            let slot = channel.clone();
            let channel_events = events.clone();
            pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                info!("remote opened data channel {}", dc.label());
                let slot = slot.clone();
                let events = channel_events.clone();
                Box::pin(async move {
                    *slot.lock().await = Some(dc.clone());
                    wire_channel(&dc, &events);
                })
            }));
        }

        Ok(Box::new(WebRtcPeer {
            pc,
            channel,
            early_candidates: Mutex::default(),
            trickle: options.trickle,
            events,
        }))
    }
}

struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    /// Remote candidates that arrived before the remote description.
    early_candidates: Mutex<Vec<RTCIceCandidateInit>>,
    trickle: bool,
    events: PeerEvents,
}

impl WebRtcPeer {
    async fn apply_remote(&self, desc: RTCSessionDescription) -> Result<()> {
        let mut early = self.early_candidates.lock().await;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(ClientError::peer)?;
        for candidate in early.drain(..) {
            self.pc
                .add_ice_candidate(candidate)
                .await
                .map_err(ClientError::peer)?;
        }
        Ok(())
    }

    async fn add_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        let mut early = self.early_candidates.lock().await;
        if self.pc.remote_description().await.is_none() {
            early.push(candidate);
            return Ok(());
        }
        self.pc
            .add_ice_candidate(candidate)
            .await
            .map_err(ClientError::peer)
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn signal(&self, remote: Signal) -> Result<()> {
        let kind = remote
            .get("type")
            .and_then(|kind| kind.as_str())
            .map(str::to_owned);
        match kind.as_deref() {
            Some("offer") => {
                let Description { sdp } =
                    serde_json::from_value(remote).map_err(ClientError::peer)?;
                let offer = RTCSessionDescription::offer(sdp).map_err(ClientError::peer)?;
                self.apply_remote(offer).await?;
                let answer = self
                    .pc
                    .create_answer(None)
                    .await
                    .map_err(ClientError::peer)?;
                spawn_publish(
                    self.pc.clone(),
                    answer,
                    "answer",
                    self.trickle,
                    self.events.clone(),
                );
                Ok(())
            }
            Some("answer") => {
                let Description { sdp } =
                    serde_json::from_value(remote).map_err(ClientError::peer)?;
                let answer = RTCSessionDescription::answer(sdp).map_err(ClientError::peer)?;
                self.apply_remote(answer).await
            }
            Some("candidate") => {
                let Candidate { candidate } =
                    serde_json::from_value(remote).map_err(ClientError::peer)?;
                self.add_candidate(candidate).await
            }
            other => Err(ClientError::peer(format!(
                "unrecognised signal type {:?}",
                other
            ))),
        }
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        let dc = self
            .channel
            .lock()
            .await
            .clone()
            .ok_or(ClientError::NotConnected)?;
        dc.send(&data).await.map_err(ClientError::peer)?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await.map_err(ClientError::peer)
    }
}

/// `Disconnected` is left out: ICE may still recover from it.
fn state_event(state: RTCPeerConnectionState) -> Option<PeerEvent> {
    match state {
        RTCPeerConnectionState::Failed => Some(PeerEvent::Error("ICE negotiation failed".into())),
        RTCPeerConnectionState::Closed => Some(PeerEvent::Closed),
        RTCPeerConnectionState::Disconnected => {
            info!("peer connection interrupted, waiting for ICE to recover");
            None
        }
        _ => None,
    }
}

fn wire_channel(dc: &Arc<RTCDataChannel>, events: &PeerEvents) {
    let open_events = events.clone();
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            let _ = open_events.send(PeerEvent::Connected);
        })
    }));

    let message_events = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let events = message_events.clone();
        Box::pin(async move {
            let _ = events.send(PeerEvent::Data(msg.data));
        })
    }));

    let close_events = events.clone();
    dc.on_close(Box::new(move || {
        let events = close_events.clone();
        Box::pin(async move {
            let _ = events.send(PeerEvent::Closed);
        })
    }));
}

fn spawn_publish(
    pc: Arc<RTCPeerConnection>,
    desc: RTCSessionDescription,
    kind: &'static str,
    trickle: bool,
    events: PeerEvents,
) {
    tokio::spawn(async move {
        if let Err(err) = publish_local(&pc, desc, kind, trickle, &events).await {
            let _ = events.send(PeerEvent::Error(err.to_string()));
        }
    });
}

/// Apply a local description and report it once it may leave.
async fn publish_local(
    pc: &RTCPeerConnection,
    desc: RTCSessionDescription,
    kind: &'static str,
    trickle: bool,
    events: &PeerEvents,
) -> Result<()> {
    let mut gathered = pc.gathering_complete_promise().await;
    pc.set_local_description(desc)
        .await
        .map_err(ClientError::peer)?;
    if !trickle {
        let _ = gathered.recv().await;
    }
    let local = pc
        .local_description()
        .await
        .ok_or_else(|| ClientError::peer("local description missing after negotiation"))?;
    let _ = events.send(PeerEvent::Signal(json!({"type": kind, "sdp": local.sdp})));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    const NEGOTIATION: Duration = Duration::from_secs(30);

    struct Pair {
        initiator: Box<dyn PeerConnection>,
        initiator_events: UnboundedReceiver<PeerEvent>,
        responder: Box<dyn PeerConnection>,
        responder_events: UnboundedReceiver<PeerEvent>,
        /// `type` of every signal exchanged, tagged with the side that produced it.
        signals: Vec<(&'static str, String)>,
    }

    fn options(initiator: bool, trickle: bool) -> PeerOptions {
        PeerOptions {
            initiator,
            trickle,
            ice_servers: Vec::new(),
        }
    }

    fn signal_type(signal: &Signal) -> String {
        signal["type"].as_str().unwrap_or_default().to_string()
    }

    /// Hand signals across until both sides report the channel open.
    async fn negotiate(trickle: bool) -> Pair {
        let connector = WebRtcConnector::new();
        let (tx, mut initiator_events) = mpsc::unbounded_channel();
        let initiator = connector
            .connect(options(true, trickle), tx)
            .await
            .expect("initiator");
        let (tx, mut responder_events) = mpsc::unbounded_channel();
        let responder = connector
            .connect(options(false, trickle), tx)
            .await
            .expect("responder");

        let mut signals = Vec::new();
        let (mut initiator_up, mut responder_up) = (false, false);
        tokio::time::timeout(NEGOTIATION, async {
            while !(initiator_up && responder_up) {
                tokio::select! {
                    Some(event) = initiator_events.recv() => match event {
                        PeerEvent::Signal(signal) => {
                            signals.push(("initiator", signal_type(&signal)));
                            responder.signal(signal).await.expect("responder applies signal");
                        }
                        PeerEvent::Connected => initiator_up = true,
                        PeerEvent::Error(err) => panic!("initiator failed: {}", err),
                        _ => {}
                    },
                    Some(event) = responder_events.recv() => match event {
                        PeerEvent::Signal(signal) => {
                            signals.push(("responder", signal_type(&signal)));
                            initiator.signal(signal).await.expect("initiator applies signal");
                        }
                        PeerEvent::Connected => responder_up = true,
                        PeerEvent::Error(err) => panic!("responder failed: {}", err),
                        _ => {}
                    },
                }
            }
        })
        .await
        .expect("peers connected in time");

        Pair {
            initiator,
            initiator_events,
            responder,
            responder_events,
            signals,
        }
    }

    async fn next_data(events: &mut UnboundedReceiver<PeerEvent>) -> Bytes {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match events.recv().await {
                    Some(PeerEvent::Data(data)) => return data,
                    Some(PeerEvent::Error(err)) => panic!("peer failed: {}", err),
                    Some(_) => continue,
                    None => panic!("peer events closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for data")
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_single_offer_and_answer_connect() {
        let mut pair = negotiate(false).await;

        assert_eq!(
            pair.signals,
            vec![
                ("initiator", "offer".to_string()),
                ("responder", "answer".to_string()),
            ]
        );

        pair.initiator
            .send(Bytes::from_static(b"hello"))
            .await
            .expect("initiator send");
        assert_eq!(
            next_data(&mut pair.responder_events).await,
            Bytes::from_static(b"hello")
        );

        pair.responder
            .send(Bytes::from_static(b"hi back"))
            .await
            .expect("responder send");
        assert_eq!(
            next_data(&mut pair.initiator_events).await,
            Bytes::from_static(b"hi back")
        );

        pair.initiator.close().await.expect("close initiator");
        pair.responder.close().await.expect("close responder");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_trickle_sends_candidates_separately() {
        let mut pair = negotiate(true).await;

        let sent = |side: &str, kind: &str| {
            pair.signals
                .iter()
                .any(|(from, k)| *from == side && k.as_str() == kind)
        };
        assert!(sent("initiator", "offer"));
        assert!(sent("responder", "answer"));
        assert!(pair
            .signals
            .iter()
            .any(|(_, kind)| kind.as_str() == "candidate"));

        pair.initiator
            .send(Bytes::from_static(b"hello"))
            .await
            .expect("initiator send");
        assert_eq!(
            next_data(&mut pair.responder_events).await,
            Bytes::from_static(b"hello")
        );

        pair.initiator.close().await.expect("close initiator");
        pair.responder.close().await.expect("close responder");
    }

    #[tokio::test]
    async fn test_responder_cannot_send_before_channel_opens() {
        let (tx, _events) = mpsc::unbounded_channel();
        let responder = WebRtcConnector::new()
            .connect(options(false, false), tx)
            .await
            .expect("responder");

        assert!(matches!(
            responder.send(Bytes::from_static(b"early")).await,
            Err(ClientError::NotConnected)
        ));
        responder.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_unknown_signal_type_is_rejected() {
        let (tx, _events) = mpsc::unbounded_channel();
        let responder = WebRtcConnector::new()
            .connect(options(false, false), tx)
            .await
            .expect("responder");

        let err = responder
            .signal(json!({"type": "pranswer", "sdp": ""}))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Peer(_)));
        responder.close().await.expect("close");
    }

    #[test]
    fn test_only_final_connection_states_end_the_call() {
        assert_eq!(
            state_event(RTCPeerConnectionState::Closed),
            Some(PeerEvent::Closed)
        );
        assert!(matches!(
            state_event(RTCPeerConnectionState::Failed),
            Some(PeerEvent::Error(_))
        ));
        assert_eq!(state_event(RTCPeerConnectionState::Disconnected), None);
        assert_eq!(state_event(RTCPeerConnectionState::Connected), None);
        assert_eq!(state_event(RTCPeerConnectionState::Connecting), None);
    }
}
