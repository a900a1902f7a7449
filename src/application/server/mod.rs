pub mod manager;
pub mod reactor;

pub use manager::{Exchange, ServerManager};
pub use reactor::{Reactor, ReactorSettings};
