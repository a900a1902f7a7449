use std::io;

use thiserror::Error;

use crate::http::StatusCode;

/// Outcome of one non-blocking step of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The operation reached its terminal state.
    Done,
    /// The descriptor would block; try again on a later tick.
    Pending,
}

impl Step {
    pub fn is_done(self) -> bool {
        self == Step::Done
    }
}

/// Per-request failure, tagged by how the reactor must react to it.
#[derive(Debug, Error)]
pub enum HttpError {
    /// Recoverable at request granularity: answered with an error page.
    #[error("{status}: {reason}")]
    Protocol { status: StatusCode, reason: String },
    /// A descriptor failed unexpectedly. Fatal to the connection.
    #[error("unavailable resource: {0}")]
    Server(#[from] io::Error),
    /// Peer closed the connection or it went idle for too long.
    #[error("connection ended")]
    EndOfConnection,
    /// The CGI child could not run or exited with a failure.
    #[error("cgi failure: {0}")]
    Cgi(String),
    /// Error-page resolution kept failing; carries the last status tried.
    #[error("endless error page loop with code {0}")]
    ErrorLoop(StatusCode),
}

impl HttpError {
    pub fn protocol(status: StatusCode, reason: impl Into<String>) -> Self {
        HttpError::Protocol { status, reason: reason.into() }
    }

    pub fn bad_request(reason: impl Into<String>) -> Self {
        Self::protocol(StatusCode::BadRequest, reason)
    }

    /// Status the failure is answered with, if it is answered at all.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            HttpError::Protocol { status, .. } => Some(*status),
            HttpError::Cgi(_) => Some(StatusCode::InternalServerError),
            HttpError::ErrorLoop(status) => Some(*status),
            HttpError::Server(_) | HttpError::EndOfConnection => None,
        }
    }
}

/// Startup and reactor-fatal failures.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("configuration: {0}")]
    Config(#[from] crate::config::ConfigError),
    #[error("no available host:port in the configuration provided")]
    NoListeners,
    #[error("poll failed: {0}")]
    Poll(#[source] io::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}
