//! Request handlers and the event loop driving them.

pub mod handler;
pub mod server;
