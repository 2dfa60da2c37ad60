//! WebSocket gateway: live group snapshots with local unread counts, and
//! typing presence, pushed to each connected client.

pub mod connection;
pub mod session;
