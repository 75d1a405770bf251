//! Connection registry: live connections grouped by owning user.
//!
//! Each user's connection set is mutated under that user's map entry, so the
//! first-connection / last-connection transitions are atomic per user. Reads
//! return owned snapshots; no lock is held once a method returns, so callers
//! are free to enqueue on the returned handles.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::connection::{ConnectionHandle, ConnectionId};
use super::{HubError, UserId};

/// Upper bounds on live connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionLimits {
    pub per_user: usize,
    pub total: usize,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            per_user: 16,
            total: 10_000,
        }
    }
}

/// Outcome of a successful `register`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// The user had no other connection: they just came online.
    FirstForUser,
    AdditionalForUser,
}

/// Outcome of an `unregister` that actually removed something.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Departure {
    /// That was the user's last connection: they just went offline.
    LastForUser,
    OthersRemain,
}

pub struct Registry {
    users: DashMap<UserId, HashMap<ConnectionId, Arc<ConnectionHandle>>>,
    total: AtomicUsize,
    limits: ConnectionLimits,
}

impl Registry {
    pub fn new(limits: ConnectionLimits) -> Self {
        Self {
            users: DashMap::new(),
            total: AtomicUsize::new(0),
            limits,
        }
    }

    /// Insert a connection under its user id.
    ///
    /// Callers must not register the same handle twice.
    pub fn register(&self, conn: Arc<ConnectionHandle>) -> Result<Arrival, HubError> {
        // Reserve a global slot first so concurrent registrations cannot overshoot.
        let limit = self.limits.total;
        if self
            .total
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .is_err()
        {
            return Err(HubError::AtCapacity { limit });
        }

        let user_id = conn.user_id();
        let outcome = match self.users.entry(user_id) {
            Entry::Occupied(mut entry) => {
                let connections = entry.get_mut();
                if connections.len() >= self.limits.per_user {
                    Err(HubError::UserLimit {
                        user_id,
                        limit: self.limits.per_user,
                    })
                } else {
                    connections.insert(conn.id(), conn);
                    Ok(Arrival::AdditionalForUser)
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(HashMap::from([(conn.id(), conn)]));
                Ok(Arrival::FirstForUser)
            }
        };

        match &outcome {
            Ok(arrival) => {
                tracing::debug!(
                    user_id = user_id,
                    arrival = ?arrival,
                    total = self.connection_count(),
                    "Connection registered"
                );
            }
            Err(_) => {
                self.total.fetch_sub(1, Ordering::AcqRel);
            }
        }
        outcome
    }

    /// Remove a connection and close its outbound queue.
    ///
    /// Returns `None` if the connection was not registered (already removed),
    /// in which case nothing else changes.
    pub fn unregister(&self, conn: &ConnectionHandle) -> Option<Departure> {
        let user_id = conn.user_id();
        let departure = match self.users.entry(user_id) {
            Entry::Occupied(mut entry) => {
                if entry.get_mut().remove(&conn.id()).is_none() {
                    None
                } else if entry.get().is_empty() {
                    entry.remove();
                    Some(Departure::LastForUser)
                } else {
                    Some(Departure::OthersRemain)
                }
            }
            Entry::Vacant(_) => None,
        };

        conn.close();

        if departure.is_some() {
            self.total.fetch_sub(1, Ordering::AcqRel);
            tracing::debug!(
                user_id = user_id,
                connection_id = %conn.id(),
                departure = ?departure,
                "Connection unregistered"
            );
        }
        departure
    }

    /// Whether one more connection for `user_id` would currently be accepted.
    pub fn has_capacity(&self, user_id: UserId) -> bool {
        self.connection_count() < self.limits.total
            && self.user_connection_count(user_id) < self.limits.per_user
    }

    pub fn contains(&self, conn: &ConnectionHandle) -> bool {
        self.users
            .get(&conn.user_id())
            .map(|connections| connections.contains_key(&conn.id()))
            .unwrap_or(false)
    }

    pub fn connections_for_user(&self, user_id: UserId) -> Vec<Arc<ConnectionHandle>> {
        self.users
            .get(&user_id)
            .map(|connections| connections.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn all_connections(&self) -> Vec<Arc<ConnectionHandle>> {
        self.users
            .iter()
            .flat_map(|entry| entry.value().values().cloned().collect::<Vec<_>>())
            .collect()
    }

    /// Online users, sorted ascending.
    pub fn online_user_ids(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.users.iter().map(|entry| *entry.key()).collect();
        users.sort_unstable();
        users
    }

    /// Whether the user has a registry entry. Users with zero connections
    /// never keep an entry.
    pub fn is_online(&self, user_id: UserId) -> bool {
        self.users.contains_key(&user_id)
    }

    pub fn user_connection_count(&self, user_id: UserId) -> usize {
        self.users
            .get(&user_id)
            .map(|connections| connections.len())
            .unwrap_or(0)
    }

    pub fn connection_count(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    /// Unregister every connection without raising presence changes.
    /// Returns how many were closed.
    pub fn close_all(&self) -> usize {
        self.all_connections()
            .iter()
            .filter(|conn| self.unregister(conn).is_some())
            .count()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(ConnectionLimits::default())
    }
}
