//! Real-time fan-out hub.
//!
//! The hub owns the connection registry and a dispatcher task. HTTP handlers
//! publish events after their database writes succeed; the dispatcher routes
//! each event to the right connections and enqueues it without ever blocking
//! on a slow client.

pub mod connection;
pub mod dispatch;
pub mod event;
pub mod message;
pub mod registry;

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::HubConfig;
use connection::{ConnectionHandle, OutboundReceiver};
use dispatch::{Delivery, Dispatcher};
use event::Event;
use message::ServerMessage;
use registry::{Arrival, Registry};

pub type UserId = i64;
pub type ListId = i64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    #[error("user {user_id} already has {limit} open connections")]
    UserLimit { user_id: UserId, limit: usize },
    #[error("hub is at capacity ({limit} connections)")]
    AtCapacity { limit: usize },
}

pub struct Hub {
    registry: Arc<Registry>,
    dispatcher: Dispatcher,
    events: mpsc::UnboundedSender<Event>,
    config: HubConfig,
}

impl Hub {
    /// Build a hub and spawn its dispatcher task on the current tokio runtime.
    ///
    /// The dispatcher stops once the hub is dropped.
    pub fn start(config: HubConfig) -> Arc<Self> {
        let registry = Arc::new(Registry::new(config.limits()));
        let dispatcher = Dispatcher::new(registry.clone());
        let (events, rx) = mpsc::unbounded_channel();

        tokio::spawn(run_dispatcher(dispatcher.clone(), rx));

        Arc::new(Self {
            registry,
            dispatcher,
            events,
            config,
        })
    }

    /// Fire-and-forget publication of an event.
    ///
    /// Events from one caller are dispatched in the order they were published.
    pub fn publish(&self, event: Event) {
        if let Err(e) = self.events.send(event) {
            tracing::warn!(
                kind = e.0.kind().as_str(),
                "Dispatcher is not running, dropping event"
            );
        }
    }

    /// Create and register a connection for `user_id`.
    ///
    /// If this is the user's first connection, `user_online` is delivered to
    /// every other connected user before this returns.
    pub fn connect(
        &self,
        user_id: UserId,
    ) -> Result<(Arc<ConnectionHandle>, OutboundReceiver), HubError> {
        let (conn, rx) = ConnectionHandle::open(user_id, self.config.queue_capacity);
        if self.registry.register(conn.clone())? == Arrival::FirstForUser {
            tracing::info!(user_id = user_id, "User came online");
            self.dispatcher.dispatch(Event::UserOnline { user_id });
        }
        Ok((conn, rx))
    }

    /// Unregister a connection and close its queue. Idempotent.
    ///
    /// If this was the user's last connection, `user_offline` is delivered to
    /// every other connected user.
    pub fn disconnect(&self, conn: &ConnectionHandle) {
        if self.dispatcher.retire(conn) == Some(registry::Departure::LastForUser) {
            tracing::info!(user_id = conn.user_id(), "User went offline");
        }
    }

    /// Enqueue a reply on one connection, shedding it if its queue is full.
    pub fn deliver(&self, conn: &ConnectionHandle, message: ServerMessage) -> Delivery {
        self.dispatcher.deliver(conn, Arc::new(message))
    }

    pub fn online_user_ids(&self) -> Vec<UserId> {
        self.registry.online_user_ids()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Close every connection. Writers flush what is queued and send a close
    /// frame. No presence events are raised.
    pub fn shutdown(&self) -> usize {
        let closed = self.registry.close_all();
        tracing::info!(connections = closed, "Hub shut down");
        closed
    }
}

async fn run_dispatcher(dispatcher: Dispatcher, mut events: mpsc::UnboundedReceiver<Event>) {
    while let Some(event) = events.recv().await {
        let kind = event.kind();
        let report = dispatcher.dispatch(event);
        if report.shed > 0 {
            tracing::info!(
                kind = kind.as_str(),
                delivered = report.delivered,
                shed = report.shed,
                "Event delivered with slow clients shed"
            );
        }
    }
    tracing::debug!("Dispatcher stopped");
}
