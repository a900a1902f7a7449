//! Single-process HTTP/1.1 server.
//!
//! One readiness-polling loop ([`application::server::Reactor`]) multiplexes
//! listening sockets, client sockets, CGI pipes and static files. Requests
//! are parsed incrementally by [`http::Request`], resolved through a
//! [`routing::Routing`] collaborator and answered by [`http::Response`].

pub mod application;
pub mod config;
pub mod core;
pub mod error;
pub mod http;
pub mod routing;

pub use error::{HttpError, ServerError, Step};
