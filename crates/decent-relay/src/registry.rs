use std::collections::HashMap;
use std::sync::Arc;

use decent_common::{ServerEvent, SessionId};
use tokio::sync::{mpsc, RwLock};
use tracing::warn;

/// Handle used to push frames to one connected client's socket writer.
pub type Outbox = mpsc::Sender<ServerEvent>;

/// Result of a single forwarding attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forward {
    /// Queued on the target's outbox exactly once.
    Delivered,
    /// No live connection holds the target id.
    Unreachable,
    /// The target is registered but its outbox is full or already closed.
    Congested,
}

/// Live connections keyed by the id the relay assigned them.
///
/// Entries are only added by [`Registry::connect`] / [`Registry::connect_as`]
/// and only removed by [`Registry::disconnect`]; forwarding takes a read lock
/// just long enough to clone the target's outbox.
#[derive(Clone, Default)]
pub struct Registry {
    clients: Arc<RwLock<HashMap<SessionId, Outbox>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a new connection under a fresh id. The connection is told its
    /// id before it becomes reachable by anyone else.
    pub async fn connect(&self, outbox: Outbox) -> SessionId {
        let mut guard = self.clients.write().await;
        let id = loop {
            let candidate = SessionId::generate();
            if !guard.contains_key(&candidate) {
                break candidate;
            }
        };
        admit(&mut guard, id.clone(), outbox);
        id
    }

    /// Admit a connection under a caller-chosen id. Returns `false` and
    /// leaves the registry untouched if the id is already live.
    pub async fn connect_as(&self, id: SessionId, outbox: Outbox) -> bool {
        let mut guard = self.clients.write().await;
        if guard.contains_key(&id) {
            return false;
        }
        admit(&mut guard, id, outbox);
        true
    }

    /// Drop `id` and tell every remaining client that a call ended.
    ///
    /// Returns how many clients were notified. A client whose outbox is full
    /// or closed misses the notice and is not counted; nothing is retried.
    /// Unknown ids are a no-op.
    pub async fn disconnect(&self, id: &SessionId) -> usize {
        let remaining: Vec<(SessionId, Outbox)> = {
            let mut guard = self.clients.write().await;
            if guard.remove(id).is_none() {
                return 0;
            }
            guard
                .iter()
                .map(|(other, tx)| (other.clone(), tx.clone()))
                .collect()
        };

        let mut notified = 0;
        for (other, tx) in remaining {
            if tx.try_send(ServerEvent::CallEnded).is_ok() {
                notified += 1;
            } else {
                warn!("failed to queue call-ended for {}", other);
            }
        }
        notified
    }

    /// Queue `event` for `target` if it is connected.
    pub async fn forward(&self, target: &SessionId, event: ServerEvent) -> Forward {
        let tx = {
            let guard = self.clients.read().await;
            guard.get(target).cloned()
        };

        match tx {
            Some(tx) => match tx.try_send(event) {
                Ok(()) => Forward::Delivered,
                Err(_) => Forward::Congested,
            },
            None => Forward::Unreachable,
        }
    }

    pub async fn contains(&self, id: &SessionId) -> bool {
        self.clients.read().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }
}

fn admit(clients: &mut HashMap<SessionId, Outbox>, id: SessionId, outbox: Outbox) {
    // A fresh outbox always has room for its first frame.
    if outbox.try_send(ServerEvent::AssignedId(id.clone())).is_err() {
        warn!("failed to queue assigned-id for {}", id);
    }
    clients.insert(id, outbox);
}
