use std::collections::HashMap;
use std::os::fd::RawFd;
use std::process::Child;

use tracing::{debug, trace};

use crate::application::handler::CgiProcess;
use crate::core::net::{ConnState, Connection, Role};
use crate::http::{Request, Response};

/// Everything produced for the request currently in flight on a client.
#[derive(Debug)]
pub struct Exchange {
    pub request: Request,
    pub response: Option<Response>,
    pub cgi: Option<CgiProcess>,
    /// Pipes and files opened on behalf of this request.
    pub aux: Vec<RawFd>,
}

impl Exchange {
    pub fn new(request: Request) -> Self {
        Self { request, response: None, cgi: None, aux: Vec::new() }
    }
}

/// Owns every registered descriptor and the exchanges hanging off client
/// sockets. Closing is deferred: descriptors are queued during a tick and
/// released together by [`ServerManager::remove_closed`].
#[derive(Default)]
pub struct ServerManager {
    conns: HashMap<RawFd, Connection>,
    exchanges: HashMap<RawFd, Exchange>,
    /// Auxiliary descriptor to the client socket it serves.
    owners: HashMap<RawFd, RawFd>,
    pending_close: Vec<RawFd>,
    /// Killed CGI children that still need reaping.
    orphans: Vec<Child>,
}

impl ServerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, conn: Connection) {
        self.conns.insert(conn.raw(), conn);
    }

    /// Registers a pipe or file descriptor serving the client `owner`.
    pub fn attach(&mut self, conn: Connection, owner: RawFd) {
        let fd = conn.raw();
        self.owners.insert(fd, owner);
        if let Some(ex) = self.exchanges.get_mut(&owner) {
            ex.aux.push(fd);
        }
        self.add(conn);
    }

    pub fn get(&self, fd: RawFd) -> Option<&Connection> {
        self.conns.get(&fd)
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Client socket a descriptor belongs to; a client socket owns itself.
    pub fn owner_of(&self, fd: RawFd) -> Option<RawFd> {
        match self.conns.get(&fd)?.role {
            Role::ClientSocket => Some(fd),
            Role::Listener => None,
            _ => self.owners.get(&fd).copied(),
        }
    }

    pub fn set_state(&mut self, fd: RawFd, state: ConnState) {
        if let Some(conn) = self.conns.get_mut(&fd) {
            trace!(fd, from = ?conn.state, to = ?state, "state change");
            conn.state = state;
        }
    }

    pub fn touch(&mut self, fd: RawFd) {
        if let Some(conn) = self.conns.get_mut(&fd) {
            conn.touch();
        }
    }

    /// First auxiliary descriptor of `owner` with the given role.
    pub fn aux_with_role(&self, owner: RawFd, role: Role) -> Option<RawFd> {
        let ex = self.exchanges.get(&owner)?;
        ex.aux
            .iter()
            .copied()
            .find(|fd| self.conns.get(fd).map_or(false, |c| c.role == role))
    }

    pub fn has_exchange(&self, client: RawFd) -> bool {
        self.exchanges.contains_key(&client)
    }

    pub fn insert_exchange(&mut self, client: RawFd, exchange: Exchange) {
        self.exchanges.insert(client, exchange);
    }

    pub fn exchange(&self, client: RawFd) -> Option<&Exchange> {
        self.exchanges.get(&client)
    }

    pub fn exchange_mut(&mut self, client: RawFd) -> Option<&mut Exchange> {
        self.exchanges.get_mut(&client)
    }

    /// Detaches the exchange of `client`. Its auxiliary descriptors stay
    /// registered until they are closed on their own.
    pub fn take_exchange(&mut self, client: RawFd) -> Option<Exchange> {
        self.exchanges.remove(&client)
    }

    /// The client socket together with its exchange.
    pub fn client_parts(&mut self, fd: RawFd) -> Option<(&mut Connection, &mut Exchange)> {
        let conn = self.conns.get_mut(&fd)?;
        let ex = self.exchanges.get_mut(&fd)?;
        Some((conn, ex))
    }

    /// An auxiliary descriptor together with the exchange of its owner.
    pub fn aux_parts(&mut self, fd: RawFd) -> Option<(&mut Connection, &mut Exchange)> {
        let owner = *self.owners.get(&fd)?;
        let conn = self.conns.get_mut(&fd)?;
        let ex = self.exchanges.get_mut(&owner)?;
        Some((conn, ex))
    }

    /// Closes every auxiliary descriptor of `client` and kills its CGI child.
    pub fn abort_exchange(&mut self, client: RawFd) {
        let Some(ex) = self.exchanges.get_mut(&client) else {
            return;
        };
        let aux = std::mem::take(&mut ex.aux);
        let orphan = ex.cgi.as_mut().and_then(CgiProcess::terminate);
        ex.cgi = None;
        for fd in aux {
            self.schedule_close(fd);
        }
        self.orphans.extend(orphan);
    }

    pub fn schedule_close(&mut self, fd: RawFd) {
        if !self.pending_close.contains(&fd) {
            self.pending_close.push(fd);
        }
    }

    pub fn is_closing(&self, fd: RawFd) -> bool {
        self.pending_close.contains(&fd)
    }

    /// Unregisters everything queued for closing and hands the connections
    /// back so the caller can deregister them before they drop. Closing a
    /// client cascades to its auxiliary descriptors and CGI child.
    pub fn remove_closed(&mut self) -> Vec<Connection> {
        let mut removed = Vec::new();
        while let Some(fd) = self.pending_close.pop() {
            let Some(conn) = self.conns.remove(&fd) else {
                continue;
            };
            match conn.role {
                Role::ClientSocket => {
                    if let Some(mut ex) = self.exchanges.remove(&fd) {
                        self.orphans.extend(ex.cgi.as_mut().and_then(CgiProcess::terminate));
                        for aux in ex.aux {
                            self.schedule_close(aux);
                        }
                    }
                }
                Role::Listener => {}
                _ => {
                    if let Some(owner) = self.owners.remove(&fd) {
                        if let Some(ex) = self.exchanges.get_mut(&owner) {
                            ex.aux.retain(|&a| a != fd);
                        }
                    }
                }
            }
            removed.push(conn);
        }
        removed
    }

    /// Collects killed children that have exited since the last call.
    pub fn reap_orphans(&mut self) {
        self.orphans.retain_mut(|child| match child.try_wait() {
            Ok(Some(status)) => {
                debug!(pid = child.id(), %status, "reaped cgi");
                false
            }
            Ok(None) => true,
            Err(_) => false,
        });
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }
}
