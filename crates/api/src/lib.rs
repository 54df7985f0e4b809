//! Admin HTTP surface for the notification outbox.

pub mod middleware;
pub mod routes;
pub mod state;
