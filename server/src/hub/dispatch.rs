use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;

use super::connection::{ConnectionHandle, EnqueueError, Outbound};
use super::event::{Event, Scope};
use super::registry::{Departure, Registry};
use super::UserId;

/// Result of handing one message to one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Queue was full: the connection was dropped from the registry.
    Shed,
    /// Connection was already closing; nothing was queued.
    Closed,
}

/// Totals for one `dispatch` call, including presence changes it caused.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub shed: usize,
}

/// Maps events to destination connections and enqueues them.
///
/// Every send is a non-blocking `try_send` on a snapshot taken from the
/// registry, so a wedged client can never stall delivery to anyone else.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Deliver an event to every connection in its scope.
    ///
    /// Connections shed along the way may take a user offline; the resulting
    /// `user_offline` events are delivered before this returns.
    pub fn dispatch(&self, event: Event) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        let mut pending = VecDeque::from([event]);

        while let Some(event) = pending.pop_front() {
            let message = Arc::new(event.to_message(Utc::now()));

            let destinations = self.destinations(event.scope());
            tracing::trace!(
                kind = event.kind().as_str(),
                destinations = destinations.len(),
                "Dispatching event"
            );

            for conn in &destinations {
                match self.enqueue(conn, message.clone(), &mut |user_id| {
                    pending.push_back(Event::UserOffline { user_id })
                }) {
                    Delivery::Queued => report.delivered += 1,
                    Delivery::Shed => report.shed += 1,
                    Delivery::Closed => {}
                }
            }
        }

        report
    }

    /// Enqueue a single message on one connection with the same shedding rule
    /// the fan-out uses. Used for replies to client control messages.
    pub fn deliver(&self, conn: &ConnectionHandle, message: Outbound) -> Delivery {
        let mut went_offline = None;
        let delivery = self.enqueue(conn, message, &mut |user_id| went_offline = Some(user_id));
        if let Some(user_id) = went_offline {
            self.dispatch(Event::UserOffline { user_id });
        }
        delivery
    }

    /// Unregister a connection and announce the user going offline if it was
    /// their last one. Safe to call more than once.
    pub fn retire(&self, conn: &ConnectionHandle) -> Option<Departure> {
        let departure = self.registry.unregister(conn);
        if departure == Some(Departure::LastForUser) {
            self.dispatch(Event::UserOffline {
                user_id: conn.user_id(),
            });
        }
        departure
    }

    fn enqueue(
        &self,
        conn: &ConnectionHandle,
        message: Outbound,
        on_offline: &mut dyn FnMut(UserId),
    ) -> Delivery {
        let (delivery, error) = match conn.try_enqueue(message) {
            Ok(()) => return Delivery::Queued,
            Err(EnqueueError::Full) => (Delivery::Shed, EnqueueError::Full),
            Err(EnqueueError::Closed) => (Delivery::Closed, EnqueueError::Closed),
        };

        let departure = self.registry.unregister(conn);
        if delivery == Delivery::Shed {
            tracing::warn!(
                user_id = conn.user_id(),
                connection_id = %conn.id(),
                "Outbound queue full, disconnecting slow client"
            );
        } else if departure.is_some() {
            tracing::debug!(
                user_id = conn.user_id(),
                connection_id = %conn.id(),
                error = %error,
                "Removed connection whose writer had already stopped"
            );
        }
        if departure == Some(Departure::LastForUser) {
            on_offline(conn.user_id());
        }
        delivery
    }

    fn destinations(&self, scope: Scope) -> Vec<Arc<ConnectionHandle>> {
        match scope {
            Scope::User(user_id) => self.registry.connections_for_user(user_id),
            Scope::List(list_id) => self
                .registry
                .all_connections()
                .into_iter()
                .filter(|conn| conn.is_subscribed(list_id))
                .collect(),
            Scope::All { except } => self
                .registry
                .all_connections()
                .into_iter()
                .filter(|conn| conn.user_id() != except)
                .collect(),
        }
    }
}
