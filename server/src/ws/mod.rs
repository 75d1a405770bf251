//! WebSocket transport: upgrade endpoint, per-connection actor, client
//! protocol and the REST endpoints that feed the hub.

pub mod actor;
pub mod endpoints;
pub mod handler;
pub mod protocol;
