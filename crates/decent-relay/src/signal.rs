use std::net::SocketAddr;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
};
use decent_common::{
    protocol, CallAnswer, CallRequest, ClientEvent, IncomingCall, PeerUnavailable, ServerEvent,
    SessionId,
};
use futures::{stream::StreamExt, SinkExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::registry::{Forward, Registry};
use crate::AppState;

const WS_MAX_TEXT_BYTES: usize = 64 * 1024;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    ws.max_message_size(WS_MAX_TEXT_BYTES)
        .max_frame_size(WS_MAX_TEXT_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, state, addr))
}

async fn handle_socket(stream: WebSocket, state: AppState, addr: SocketAddr) {
    let (mut sender, mut receiver) = stream.split();
    let (tx, mut rx) = mpsc::channel::<ServerEvent>(state.config.outbox_capacity.max(1));
    let id = state.registry.connect(tx).await;
    info!("client {} connected from {}", id, addr);

    let (disconnect_tx, mut disconnect_rx) = mpsc::channel::<()>(1);

    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match protocol::encode(&event) {
                Ok(text) => text,
                Err(err) => {
                    warn!("dropping unencodable {} frame: {}", event.name(), err);
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = disconnect_tx.try_send(());
    });

    loop {
        tokio::select! {
            _ = disconnect_rx.recv() => {
                break;
            }
            msg = receiver.next() => {
                let Some(msg) = msg else { break; };
                let Ok(msg) = msg else { break; };

                let text = match msg {
                    Message::Text(text) => text,
                    Message::Binary(_) => {
                        debug!("ignoring binary frame from {}", id);
                        continue;
                    }
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => continue,
                };

                let event: ClientEvent = match protocol::decode(&text) {
                    Ok(event) => event,
                    Err(err) => {
                        warn!("ignoring malformed frame from {}: {}", id, err);
                        continue;
                    }
                };

                dispatch(&state.registry, &id, event, &state.config).await;
            }
        }
    }

    let notified = state.registry.disconnect(&id).await;
    info!("client {} disconnected, notified {} others", id, notified);
    writer.abort();
}

/// Apply one client frame: rewrap the envelope for its target and forward it.
///
/// The signal payload passes through untouched. Nothing is remembered
/// afterwards, so the same envelope sent twice is forwarded twice.
pub async fn dispatch(
    registry: &Registry,
    sender: &SessionId,
    event: ClientEvent,
    config: &RelayConfig,
) -> Forward {
    let name = event.name();
    let (target, outbound) = match event {
        ClientEvent::InitiateCall(CallRequest {
            target_id,
            signal,
            from_id,
        }) => (
            target_id,
            ServerEvent::IncomingCall(IncomingCall { signal, from_id }),
        ),
        ClientEvent::AcceptCall(CallAnswer { signal, target_id }) => {
            (target_id, ServerEvent::CallAccepted(signal))
        }
    };

    let outcome = registry.forward(&target, outbound).await;
    match outcome {
        Forward::Delivered => debug!("forwarded {} from {} to {}", name, sender, target),
        Forward::Congested => warn!("failed to queue {} for {}", name, target),
        Forward::Unreachable => {
            warn!("{} target not connected: {}", name, target);
            if config.notify_unreachable {
                let notice = ServerEvent::PeerUnavailable(PeerUnavailable { target_id: target });
                if registry.forward(sender, notice).await != Forward::Delivered {
                    debug!("could not report unreachable target back to {}", sender);
                }
            }
        }
    }
    outcome
}
