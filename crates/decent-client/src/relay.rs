//! WebSocket link to the relay.
//!
//! The socket is split into a reader and a writer task so the caller only
//! deals with typed frames through two channels. Dropping the connection
//! closes the outgoing channel, which makes the writer send a close frame.

use std::time::Duration;

use decent_common::{decode, encode, ClientEvent, Error, ServerEvent, SessionId};
use futures::{SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result};

/// How long to wait for `assigned-id` after the upgrade.
const ASSIGN_TIMEOUT: Duration = Duration::from_secs(10);
const CHANNEL_CAPACITY: usize = 64;

pub struct RelayConnection {
    id: SessionId,
    outgoing: mpsc::Sender<ClientEvent>,
    incoming: mpsc::Receiver<ServerEvent>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl RelayConnection {
    /// Connect to `url` and wait for the relay to assign our session id.
    pub async fn connect(url: &str) -> Result<Self> {
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(
                Error::config(format!("relay url must be ws:// or wss://, got {}", url)).into(),
            );
        }

        let (ws, _) = connect_async(url).await?;
        let (mut sink, mut stream) = ws.split();

        let id = tokio::time::timeout(ASSIGN_TIMEOUT, await_assigned(&mut stream))
            .await
            .map_err(|_| Error::protocol("relay did not assign an id in time"))??;
        info!("connected to relay {} as {}", url, id);

        let (outgoing, mut outgoing_rx) = mpsc::channel::<ClientEvent>(CHANNEL_CAPACITY);
        let writer = tokio::spawn(async move {
            while let Some(event) = outgoing_rx.recv().await {
                let text = match encode(&event) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!("failed to encode {}: {}", event.name(), err);
                        continue;
                    }
                };
                if let Err(err) = sink.send(Message::Text(text.into())).await {
                    debug!("relay write failed: {}", err);
                    return;
                }
            }
            let _ = sink.close().await;
        });

        let (incoming_tx, incoming) = mpsc::channel::<ServerEvent>(CHANNEL_CAPACITY);
        let reader = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Text(text)) => match decode::<ServerEvent>(&text) {
                        Ok(event) => {
                            if incoming_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!("ignoring malformed relay frame: {}", err),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        debug!("relay read failed: {}", err);
                        break;
                    }
                }
            }
            info!("relay connection closed");
        });

        Ok(Self {
            id,
            outgoing,
            incoming,
            writer,
            reader,
        })
    }

    /// The session id the relay assigned to this connection.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub async fn send(&self, event: ClientEvent) -> Result<()> {
        debug!("sending {} to {}", event.name(), event.target());
        self.outgoing
            .send(event)
            .await
            .map_err(|_| ClientError::RelayClosed)
    }

    /// Next frame from the relay, `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        self.incoming.recv().await
    }

    /// Flush pending frames and close the socket.
    pub async fn close(self) {
        let Self {
            outgoing,
            writer,
            reader,
            ..
        } = self;
        drop(outgoing);
        let _ = writer.await;
        reader.abort();
    }
}

/// The relay sends `assigned-id` before anything else on a new socket.
async fn await_assigned<S>(stream: &mut S) -> Result<SessionId>
where
    S: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
{
    while let Some(msg) = stream.next().await {
        match msg? {
            Message::Text(text) => {
                return match decode::<ServerEvent>(&text)? {
                    ServerEvent::AssignedId(id) => Ok(id),
                    other => Err(Error::protocol(format!(
                        "expected assigned-id first, got {}",
                        other.name()
                    ))
                    .into()),
                };
            }
            Message::Close(_) => break,
            _ => continue,
        }
    }
    Err(ClientError::RelayClosed)
}
