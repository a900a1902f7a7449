pub mod connection;
pub mod fd;
pub mod socket;

pub use connection::{ConnState, Connection, Role};
pub use fd::Fd;
