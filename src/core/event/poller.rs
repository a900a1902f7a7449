use libc::{c_int, nfds_t, pollfd, POLLIN, POLLOUT};
use std::io;
use std::os::fd::RawFd;

use super::event::Event;

/// poll(2) based readiness set.
///
/// Every descriptor is registered for both read and write readiness. Each
/// call to [`Poller::wait`] reports every registered descriptor, ready or not,
/// so the caller can run idle checks on the ones that produced nothing.
pub struct Poller {
    fds: Vec<pollfd>,
}

impl Poller {
    pub fn new() -> Self {
        Self { fds: Vec::new() }
    }

    pub fn register(&mut self, fd: RawFd) -> io::Result<()> {
        if fd < 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid file descriptor"));
        }
        if self.contains(fd) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("fd {fd} already registered"),
            ));
        }
        self.fds.push(pollfd { fd, events: POLLIN | POLLOUT, revents: 0 });
        Ok(())
    }

    pub fn deregister(&mut self, fd: RawFd) {
        self.fds.retain(|p| p.fd != fd);
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.fds.iter().any(|p| p.fd == fd)
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Polls the whole set. A zero timeout never blocks.
    pub fn wait(&mut self, timeout_ms: i32) -> io::Result<Vec<Event>> {
        let n = unsafe {
            libc::poll(self.fds.as_mut_ptr(), self.fds.len() as nfds_t, timeout_ms as c_int)
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => Ok(Vec::new()),
                _ => Err(err),
            };
        }
        Ok(self
            .fds
            .iter()
            .map(|p| Event::from_revents(p.fd, if n == 0 { 0 } else { p.revents }))
            .collect())
    }
}

impl Default for Poller {
    fn default() -> Self {
        Self::new()
    }
}
