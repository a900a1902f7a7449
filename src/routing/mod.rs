//! Maps a parsed request onto the filesystem and the configured policy.

use std::path::PathBuf;

use crate::config::ListenAddr;
use crate::http::{Method, StatusCode};

pub mod resolver;

pub use resolver::ConfigRouter;

/// What the request state machine knows when it asks for a route.
#[derive(Debug, Clone, Copy)]
pub struct RouteQuery<'a> {
    pub listen: &'a ListenAddr,
    pub method: Method,
    pub path: &'a str,
    pub host: &'a str,
}

/// Resolution result. `failed` routes carry the status to answer with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub status: StatusCode,
    pub failed: bool,
    pub root: PathBuf,
    pub real_path: PathBuf,
    pub redirect_path: Option<String>,
    pub autoindex: bool,
    pub cgi: bool,
    pub cgi_interpreter: Option<PathBuf>,
    pub redirect: bool,
    /// Zero means unlimited.
    pub max_body_size: u64,
    pub server_name: String,
}

impl Route {
    pub fn new(server_name: impl Into<String>, root: PathBuf) -> Self {
        Route {
            status: StatusCode::Ok,
            failed: false,
            real_path: root.clone(),
            root,
            redirect_path: None,
            autoindex: false,
            cgi: false,
            cgi_interpreter: None,
            redirect: false,
            max_body_size: 0,
            server_name: server_name.into(),
        }
    }

    pub fn fail(mut self, status: StatusCode) -> Self {
        self.status = status;
        self.failed = true;
        self
    }
}

impl Default for Route {
    fn default() -> Self {
        Route::new(crate::config::DEFAULT_SERVER_NAME, PathBuf::new())
    }
}

/// The routing collaborator consulted by [`crate::http::Request`].
pub trait Routing {
    fn resolve(&self, query: &RouteQuery<'_>) -> Route;

    /// Route to the page answering `status`. A failed route means no usable
    /// page; its status is what resolution fell back to.
    fn resolve_error(&self, query: &RouteQuery<'_>, status: StatusCode) -> Route;
}
