use libc::{
    accept, bind, c_int, listen, sa_family_t, setsockopt, sockaddr, sockaddr_in, sockaddr_in6,
    sockaddr_storage, socket, socklen_t, AF_INET, AF_INET6, SOCK_STREAM, SOL_SOCKET, SO_REUSEADDR,
};
use std::io;
use std::mem::{size_of, zeroed};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, ToSocketAddrs};
use std::os::fd::RawFd;

use super::fd::Fd;

/// Pending connections queued by the kernel per listener.
pub const BACKLOG: c_int = 128;

pub fn create_listening_socket(addr: SocketAddr) -> io::Result<Fd> {
    let (storage, len, domain) = to_sockaddr(&addr);
    let raw = unsafe { socket(domain, SOCK_STREAM, 0) };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    let fd = Fd(raw);

    set_option(fd.raw(), SO_REUSEADDR);
    #[cfg(target_os = "macos")]
    set_option(fd.raw(), libc::SO_NOSIGPIPE);

    fd.set_nonblocking()?;
    fd.set_cloexec()?;

    let res = unsafe { bind(fd.raw(), &storage as *const sockaddr_storage as *const sockaddr, len) };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { listen(fd.raw(), BACKLOG) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

/// Resolves `host:port` and binds the first address that accepts a bind.
pub fn listen_on(host: &str, port: u16) -> io::Result<(Fd, SocketAddr)> {
    let mut last_err = io::Error::new(io::ErrorKind::NotFound, format!("no address for {host}:{port}"));
    for addr in (host, port).to_socket_addrs()? {
        match create_listening_socket(addr) {
            Ok(fd) => {
                let local = local_addr(fd.raw()).unwrap_or(addr);
                return Ok((fd, local));
            }
            Err(e) => last_err = e,
        }
    }
    Err(last_err)
}

/// Accepts one pending connection. `Ok(None)` when the queue is empty.
pub fn accept_nonblocking(listen_fd: RawFd) -> io::Result<Option<(Fd, Option<SocketAddr>)>> {
    let mut addr: sockaddr_storage = unsafe { zeroed() };
    let mut len = size_of::<sockaddr_storage>() as socklen_t;
    let raw = unsafe { accept(listen_fd, &mut addr as *mut _ as *mut sockaddr, &mut len) };
    if raw < 0 {
        let err = io::Error::last_os_error();
        return match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(None),
            _ => Err(err),
        };
    }
    let fd = Fd(raw);
    fd.set_nonblocking()?;
    fd.set_cloexec()?;
    #[cfg(target_os = "macos")]
    set_option(fd.raw(), libc::SO_NOSIGPIPE);
    Ok(Some((fd, from_sockaddr(&addr))))
}

pub fn local_addr(fd: RawFd) -> Option<SocketAddr> {
    let mut addr: sockaddr_storage = unsafe { zeroed() };
    let mut len = size_of::<sockaddr_storage>() as socklen_t;
    let res = unsafe { libc::getsockname(fd, &mut addr as *mut _ as *mut sockaddr, &mut len) };
    if res < 0 {
        return None;
    }
    from_sockaddr(&addr)
}

/// Writes to a peer that went away must come back as EPIPE instead of
/// killing the process.
pub fn ignore_sigpipe() {
    unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };
}

fn set_option(fd: RawFd, option: c_int) {
    let yes: c_int = 1;
    unsafe {
        setsockopt(
            fd,
            SOL_SOCKET,
            option,
            &yes as *const _ as *const _,
            size_of::<c_int>() as socklen_t,
        );
    }
}

fn to_sockaddr(addr: &SocketAddr) -> (sockaddr_storage, socklen_t, c_int) {
    let mut storage: sockaddr_storage = unsafe { zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let mut sa: sockaddr_in = unsafe { zeroed() };
            sa.sin_family = AF_INET as sa_family_t;
            sa.sin_port = v4.port().to_be();
            sa.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut sockaddr_in, sa);
            }
            (storage, size_of::<sockaddr_in>() as socklen_t, AF_INET)
        }
        SocketAddr::V6(v6) => {
            let mut sa: sockaddr_in6 = unsafe { zeroed() };
            sa.sin6_family = AF_INET6 as sa_family_t;
            sa.sin6_port = v6.port().to_be();
            sa.sin6_flowinfo = v6.flowinfo();
            sa.sin6_scope_id = v6.scope_id();
            sa.sin6_addr.s6_addr = v6.ip().octets();
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut sockaddr_in6, sa);
            }
            (storage, size_of::<sockaddr_in6>() as socklen_t, AF_INET6)
        }
    }
}

fn from_sockaddr(storage: &sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as c_int {
        AF_INET => {
            let sa = unsafe { &*(storage as *const _ as *const sockaddr_in) };
            let ip = Ipv4Addr::from(sa.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sa.sin_port))))
        }
        AF_INET6 => {
            let sa = unsafe { &*(storage as *const _ as *const sockaddr_in6) };
            let ip = Ipv6Addr::from(sa.sin6_addr.s6_addr);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sa.sin6_port),
                sa.sin6_flowinfo,
                sa.sin6_scope_id,
            )))
        }
        _ => None,
    }
}
