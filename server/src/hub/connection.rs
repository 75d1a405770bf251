use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use super::message::ServerMessage;
use super::{ListId, UserId};

/// Queued message, shared between every destination of one event.
pub type Outbound = Arc<ServerMessage>;

/// Receiving half of a connection's outbound queue, drained by its writer task.
pub type OutboundReceiver = mpsc::Receiver<Outbound>;

/// Unique identifier of one physical WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EnqueueError {
    #[error("outbound queue is full")]
    Full,
    #[error("connection is closed")]
    Closed,
}

/// Shared handle to a live connection.
///
/// The registry and the dispatcher only ever hold this handle: they can push
/// onto the bounded outbound queue, read the subscription set, and close the
/// queue. The socket itself belongs to the connection's reader and writer.
///
/// Closing drops the only sender, so the writer drains whatever is already
/// queued, sees the end of the queue, and sends a close frame.
pub struct ConnectionHandle {
    id: ConnectionId,
    user_id: UserId,
    sender: Mutex<Option<mpsc::Sender<Outbound>>>,
    // Written only by the connection's own reader task.
    subscriptions: RwLock<HashSet<ListId>>,
}

impl ConnectionHandle {
    /// Create a handle with an outbound queue of `capacity` messages.
    pub fn open(user_id: UserId, capacity: usize) -> (Arc<Self>, OutboundReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Arc::new(Self {
            id: ConnectionId::new(),
            user_id,
            sender: Mutex::new(Some(tx)),
            subscriptions: RwLock::new(HashSet::new()),
        });
        (handle, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Non-blocking push onto the outbound queue.
    pub fn try_enqueue(&self, message: Outbound) -> Result<(), EnqueueError> {
        let sender = self.sender();
        let Some(tx) = sender.as_ref() else {
            return Err(EnqueueError::Closed);
        };
        tx.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => EnqueueError::Full,
            TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    /// Close the outbound queue. Returns `true` only for the call that closed it.
    pub fn close(&self) -> bool {
        self.sender().take().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.sender()
            .as_ref()
            .map(|tx| tx.is_closed())
            .unwrap_or(true)
    }

    /// Returns `true` if the list was not already subscribed.
    pub fn subscribe(&self, list_id: ListId) -> bool {
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(list_id)
    }

    /// Returns `true` if the list was subscribed.
    pub fn unsubscribe(&self, list_id: ListId) -> bool {
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&list_id)
    }

    pub fn is_subscribed(&self, list_id: ListId) -> bool {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&list_id)
    }

    pub fn subscriptions(&self) -> Vec<ListId> {
        let mut lists: Vec<ListId> = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect();
        lists.sort_unstable();
        lists
    }

    fn sender(&self) -> MutexGuard<'_, Option<mpsc::Sender<Outbound>>> {
        self.sender.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
