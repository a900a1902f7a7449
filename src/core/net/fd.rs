use libc::{c_int, close, fcntl, FD_CLOEXEC, F_GETFD, F_GETFL, F_SETFD, F_SETFL, O_NONBLOCK};
use std::fs::File;
use std::io::{self, Read, Write};
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

/// Owned raw descriptor. Closed on drop.
#[derive(Debug)]
pub struct Fd(pub RawFd);

impl Fd {
    pub fn raw(&self) -> RawFd {
        self.0
    }

    pub fn set_nonblocking(&self) -> io::Result<()> {
        set_flag(self.0, F_GETFL, F_SETFL, O_NONBLOCK)
    }

    pub fn set_cloexec(&self) -> io::Result<()> {
        set_flag(self.0, F_GETFD, F_SETFD, FD_CLOEXEC)
    }

    /// Shuts both directions of a socket down before it gets closed.
    pub fn shutdown(&self) {
        unsafe { libc::shutdown(self.0, libc::SHUT_RDWR) };
    }
}

fn set_flag(fd: RawFd, get: c_int, set: c_int, flag: c_int) -> io::Result<()> {
    let flags = unsafe { fcntl(fd, get) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { fcntl(fd, set, flags | flag) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl Read for Fd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::read(self.0, buf.as_mut_ptr() as *mut _, buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

impl Write for Fd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe { libc::write(self.0, buf.as_ptr() as *const _, buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsRawFd for Fd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl IntoRawFd for Fd {
    fn into_raw_fd(self) -> RawFd {
        let fd = self.0;
        mem::forget(self);
        fd
    }
}

impl From<File> for Fd {
    fn from(file: File) -> Self {
        Fd(file.into_raw_fd())
    }
}

impl From<Fd> for OwnedFd {
    fn from(fd: Fd) -> Self {
        unsafe { OwnedFd::from_raw_fd(fd.into_raw_fd()) }
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        if self.0 >= 0 {
            unsafe { close(self.0) };
        }
    }
}

/// Unidirectional pipe as `(read_end, write_end)`. Both ends are
/// close-on-exec so they never leak into spawned children.
pub fn pipe() -> io::Result<(Fd, Fd)> {
    let mut ends: [RawFd; 2] = [-1; 2];
    if unsafe { libc::pipe(ends.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let (read_end, write_end) = (Fd(ends[0]), Fd(ends[1]));
    read_end.set_cloexec()?;
    write_end.set_cloexec()?;
    Ok((read_end, write_end))
}
