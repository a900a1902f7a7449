use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use super::fd::Fd;
use crate::config::ListenAddr;

/// What a registered descriptor is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Listener,
    ClientSocket,
    /// Parent's write end of the pipe feeding a CGI child's stdin.
    CgiInPipe,
    /// Parent's read end of the pipe carrying a CGI child's stdout.
    CgiOutPipe,
    StaticFile,
}

/// Where a descriptor is in its exchange. Selects the action run on
/// readiness together with [`Role`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    WaitingForConnection,
    ReadHeader,
    ReadFile,
    ReadBody,
    WaitForCgi,
    ReadCgiResponse,
    WriteToClient,
    WriteToCgi,
}

pub struct Connection {
    pub fd: Fd,
    pub role: Role,
    pub state: ConnState,
    pub peer: Option<SocketAddr>,
    /// Listener a client socket was accepted on, or the address a listener binds.
    pub listen: Option<ListenAddr>,
    pub last_activity: Instant,
}

impl Connection {
    pub fn new(fd: Fd, role: Role, state: ConnState) -> Self {
        Self {
            fd,
            role,
            state,
            peer: None,
            listen: None,
            last_activity: Instant::now(),
        }
    }

    pub fn with_peer(mut self, peer: Option<SocketAddr>, listen: Option<ListenAddr>) -> Self {
        self.peer = peer;
        self.listen = listen;
        self
    }

    pub fn raw(&self) -> RawFd {
        self.fd.raw()
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn is_timed_out(&self, idle: Duration) -> bool {
        self.last_activity.elapsed() > idle
    }
}
