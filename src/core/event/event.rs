use std::os::fd::RawFd;

/// Readiness of one registered descriptor after a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub hangup: bool,
    pub invalid: bool,
}

impl Event {
    pub fn from_revents(fd: RawFd, revents: libc::c_short) -> Self {
        Self {
            fd,
            readable: revents & libc::POLLIN != 0,
            writable: revents & libc::POLLOUT != 0,
            error: revents & libc::POLLERR != 0,
            hangup: revents & libc::POLLHUP != 0,
            invalid: revents & libc::POLLNVAL != 0,
        }
    }

    /// Hang-up, error or invalid descriptor.
    pub fn is_broken(&self) -> bool {
        self.hangup || self.error || self.invalid
    }
}
