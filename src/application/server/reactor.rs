use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use super::manager::{Exchange, ServerManager};
use crate::application::handler::{self, error_page_handler, CgiProcess};
use crate::config::ListenAddr;
use crate::core::event::{Event, Poller};
use crate::core::net::socket::{accept_nonblocking, listen_on};
use crate::core::net::{ConnState, Connection, Role};
use crate::error::{HttpError, ServerError, Step};
use crate::http::{Limits, ParseState, Request, RequestKind, Response, StatusCode};
use crate::routing::resolver::status_for_io;
use crate::routing::Routing;

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(7);
pub const DEFAULT_ERROR_PAGES: &str = "default/errors";

/// Tunables of the event loop.
#[derive(Debug, Clone)]
pub struct ReactorSettings {
    /// Client sockets without progress for this long are dropped.
    pub idle_timeout: Duration,
    /// Passed to poll(2); zero never blocks.
    pub poll_timeout_ms: i32,
    pub limits: Limits,
    /// Directory holding `<code>.html` pages used when routing offers none.
    pub error_pages: PathBuf,
}

impl Default for ReactorSettings {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            poll_timeout_ms: 0,
            limits: Limits::default(),
            error_pages: PathBuf::from(DEFAULT_ERROR_PAGES),
        }
    }
}

/// Single-threaded readiness loop. Each tick polls every registered
/// descriptor once and runs the action selected by its role and state.
pub struct Reactor<R: Routing> {
    poller: Poller,
    router: R,
    manager: ServerManager,
    settings: ReactorSettings,
    bound: Vec<(ListenAddr, SocketAddr)>,
}

impl<R: Routing> Reactor<R> {
    /// Opens a listener per address. Addresses that cannot be bound are
    /// logged and skipped; failing all of them is fatal.
    pub fn bind(
        router: R,
        addrs: &[(ListenAddr, bool)],
        settings: ReactorSettings,
    ) -> Result<Self, ServerError> {
        let mut reactor = Reactor {
            poller: Poller::new(),
            router,
            manager: ServerManager::new(),
            settings,
            bound: Vec::new(),
        };
        for (addr, default_server) in addrs {
            match listen_on(&addr.host, addr.port) {
                Ok((fd, local)) => {
                    reactor.poller.register(fd.raw())?;
                    info!(%addr, %local, default_server, "listening");
                    let conn = Connection::new(fd, Role::Listener, ConnState::WaitingForConnection)
                        .with_peer(None, Some(addr.clone()));
                    reactor.manager.add(conn);
                    reactor.bound.push((addr.clone(), local));
                }
                Err(e) => error!(%addr, error = %e, "cannot listen"),
            }
        }
        if reactor.bound.is_empty() {
            return Err(ServerError::NoListeners);
        }
        Ok(reactor)
    }

    /// Configured address and the socket address actually bound for it.
    pub fn local_addrs(&self) -> &[(ListenAddr, SocketAddr)] {
        &self.bound
    }

    pub fn run(&mut self) -> Result<(), ServerError> {
        loop {
            self.tick()?;
        }
    }

    pub fn tick(&mut self) -> Result<(), ServerError> {
        let events = self
            .poller
            .wait(self.settings.poll_timeout_ms)
            .map_err(ServerError::Poll)?;
        for ev in events {
            self.dispatch(ev);
        }
        self.flush_closed();
        self.manager.reap_orphans();
        Ok(())
    }

    fn dispatch(&mut self, ev: Event) {
        if self.manager.is_closing(ev.fd) {
            return;
        }
        let Some(role) = self.manager.get(ev.fd).map(|c| c.role) else {
            return;
        };
        match role {
            Role::Listener if ev.readable => self.accept(ev.fd),
            Role::Listener => {}
            Role::ClientSocket => self.on_client(ev),
            Role::StaticFile if ev.readable => self.read_static(ev.fd),
            Role::StaticFile => {}
            Role::CgiInPipe => self.on_cgi_input(ev),
            Role::CgiOutPipe => self.on_cgi_output(ev),
        }
    }

    fn state_of(&self, fd: RawFd) -> Option<ConnState> {
        self.manager.get(fd).map(|c| c.state)
    }

    fn accept(&mut self, listener: RawFd) {
        let listen = self.manager.get(listener).and_then(|c| c.listen.clone());
        loop {
            match accept_nonblocking(listener) {
                Ok(Some((client, peer))) => {
                    let fd = client.raw();
                    if let Err(e) = self.poller.register(fd) {
                        warn!(fd, error = %e, "cannot register client");
                        continue;
                    }
                    info!(fd, peer = ?peer, "accepted");
                    let conn = Connection::new(client, Role::ClientSocket, ConnState::ReadHeader)
                        .with_peer(peer, listen.clone());
                    self.manager.add(conn);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn on_client(&mut self, ev: Event) {
        if ev.is_broken() {
            debug!(fd = ev.fd, hangup = ev.hangup, error = ev.error, "client socket broken");
            self.drop_client(ev.fd);
            return;
        }
        match self.state_of(ev.fd) {
            Some(ConnState::ReadHeader) if ev.readable => self.read_head(ev.fd),
            Some(ConnState::ReadBody) if ev.readable => self.read_body(ev.fd),
            Some(ConnState::WriteToClient) if ev.writable => self.write_response(ev.fd),
            _ => {}
        }
        if !ev.readable && !self.manager.is_closing(ev.fd) {
            let idle = self
                .manager
                .get(ev.fd)
                .map_or(false, |c| c.is_timed_out(self.settings.idle_timeout));
            if idle {
                info!(fd = ev.fd, "idle timeout");
                self.drop_client(ev.fd);
            }
        }
    }

    fn on_cgi_input(&mut self, ev: Event) {
        let Some(owner) = self.manager.owner_of(ev.fd) else {
            return;
        };
        if ev.is_broken() {
            // reader went away; whatever the child wrote is still collected
            self.finish_cgi_input(ev.fd, owner);
        } else if ev.writable && self.state_of(ev.fd) == Some(ConnState::WriteToCgi) {
            self.write_cgi(ev.fd, owner);
        }
    }

    fn on_cgi_output(&mut self, ev: Event) {
        if self.state_of(ev.fd) == Some(ConnState::WaitForCgi) {
            if !ev.is_broken() {
                return;
            }
            self.manager.set_state(ev.fd, ConnState::ReadCgiResponse);
        }
        if ev.readable || ev.is_broken() {
            self.read_cgi(ev.fd);
        }
    }

    fn read_head(&mut self, fd: RawFd) {
        if !self.manager.has_exchange(fd) {
            let Some(conn) = self.manager.get(fd) else {
                return;
            };
            let Some(listen) = conn.listen.clone() else {
                return;
            };
            let request = Request::new(listen, conn.peer, self.settings.limits);
            self.manager.insert_exchange(fd, Exchange::new(request));
        }

        let result = match self.manager.client_parts(fd) {
            Some((conn, ex)) => {
                let parsed = ex.request.parse_head(&mut conn.fd, &self.router);
                if parsed.is_ok() {
                    conn.touch();
                }
                parsed.map(|_| ex.request.state())
            }
            None => return,
        };
        match result {
            Ok(ParseState::Done) => self.start_response(fd),
            Ok(ParseState::BodyReading) => self.manager.set_state(fd, ConnState::ReadBody),
            Ok(_) => {}
            Err(e) => self.handle_failure(fd, e),
        }
    }

    fn read_body(&mut self, fd: RawFd) {
        let result = match self.manager.client_parts(fd) {
            Some((conn, ex)) => {
                let parsed = ex.request.parse_body(&mut conn.fd);
                if parsed.is_ok() {
                    conn.touch();
                }
                parsed
            }
            None => return,
        };
        match result {
            Ok(Step::Done) => self.start_response(fd),
            Ok(Step::Pending) => {}
            Err(e) => self.handle_failure(fd, e),
        }
    }

    /// The request is complete: pick how its response gets produced.
    fn start_response(&mut self, fd: RawFd) {
        let Some(ex) = self.manager.exchange_mut(fd) else {
            return;
        };
        debug!(
            fd,
            method = %ex.request.method(),
            path = %ex.request.url().path,
            kind = ?ex.request.kind(),
            "request complete"
        );
        match ex.request.kind() {
            RequestKind::Cgi => self.start_cgi(fd),
            RequestKind::Static => {
                let resp = Response::for_request(&ex.request);
                if let Err(e) = self.serve_file(fd, resp) {
                    let status = status_for_io(&e);
                    self.handle_failure(fd, HttpError::protocol(status, format!("cannot open target: {e}")));
                }
            }
            _ => {
                ex.response = Some(Response::for_request(&ex.request));
                self.manager.set_state(fd, ConnState::WriteToClient);
            }
        }
    }

    /// Registers the response's file for reading and parks the client until
    /// it has been read in.
    fn serve_file(&mut self, fd: RawFd, resp: Response) -> io::Result<()> {
        let file = resp.open_target()?;
        self.poller.register(file.raw())?;
        trace!(fd, file = file.raw(), target = %resp.target().display(), "streaming file");
        if let Some(ex) = self.manager.exchange_mut(fd) {
            ex.response = Some(resp);
        }
        self.manager.attach(Connection::new(file, Role::StaticFile, ConnState::ReadFile), fd);
        self.manager.set_state(fd, ConnState::WriteToClient);
        Ok(())
    }

    fn start_cgi(&mut self, fd: RawFd) {
        let Some(ex) = self.manager.exchange_mut(fd) else {
            return;
        };
        let mut cgi = CgiProcess::new(&ex.request);
        if let Err(e) = cgi.spawn() {
            self.handle_failure(fd, e);
            return;
        }
        let upload = cgi.take_upload_pipe();
        let output = cgi.take_response_pipe();
        let has_body = !ex.request.body().is_empty();
        ex.response = Some(Response::for_request(&ex.request));
        ex.cgi = Some(cgi);

        let Some(output) = output else {
            self.handle_failure(fd, HttpError::Cgi("child has no output pipe".into()));
            return;
        };
        if let Err(e) = self.poller.register(output.raw()) {
            self.handle_failure(fd, HttpError::Server(e));
            return;
        }
        // stdout stays parked until the body has been fed to stdin
        let out_state = if has_body { ConnState::WaitForCgi } else { ConnState::ReadCgiResponse };
        self.manager.attach(Connection::new(output, Role::CgiOutPipe, out_state), fd);

        if let (true, Some(input)) = (has_body, upload) {
            if let Err(e) = self.poller.register(input.raw()) {
                self.handle_failure(fd, HttpError::Server(e));
                return;
            }
            self.manager.attach(Connection::new(input, Role::CgiInPipe, ConnState::WriteToCgi), fd);
        }
        self.manager.set_state(fd, ConnState::WaitForCgi);
    }

    fn write_cgi(&mut self, fd: RawFd, owner: RawFd) {
        let result = match self.manager.aux_parts(fd) {
            Some((conn, ex)) => match ex.cgi.as_mut() {
                Some(cgi) => cgi.forward_body(&mut conn.fd, ex.request.body()),
                None => return,
            },
            None => return,
        };
        match result {
            Ok(Step::Done) => self.finish_cgi_input(fd, owner),
            Ok(Step::Pending) => self.manager.touch(owner),
            Err(e) => self.handle_failure(owner, e),
        }
    }

    /// Closes the child's stdin and lets its output be read.
    fn finish_cgi_input(&mut self, fd: RawFd, owner: RawFd) {
        trace!(fd, owner, "cgi input complete");
        self.manager.schedule_close(fd);
        if let Some(out) = self.manager.aux_with_role(owner, Role::CgiOutPipe) {
            if self.state_of(out) == Some(ConnState::WaitForCgi) {
                self.manager.set_state(out, ConnState::ReadCgiResponse);
            }
        }
        self.manager.touch(owner);
    }

    fn read_cgi(&mut self, fd: RawFd) {
        let Some(owner) = self.manager.owner_of(fd) else {
            return;
        };
        let result = match self.manager.aux_parts(fd) {
            Some((conn, ex)) => match ex.cgi.as_mut() {
                Some(cgi) => cgi.drain(&mut conn.fd),
                None => return,
            },
            None => return,
        };
        match result {
            Ok(Step::Done) => {
                trace!(fd, owner, "cgi output complete");
                self.manager.schedule_close(fd);
                self.manager.set_state(owner, ConnState::WriteToClient);
                self.manager.touch(owner);
            }
            Ok(Step::Pending) => self.manager.touch(owner),
            Err(e) => self.handle_failure(owner, e),
        }
    }

    fn read_static(&mut self, fd: RawFd) {
        let Some(owner) = self.manager.owner_of(fd) else {
            return;
        };
        let result = match self.manager.aux_parts(fd) {
            Some((conn, ex)) => match ex.response.as_mut() {
                Some(resp) => resp.read_file(&mut conn.fd),
                None => return,
            },
            None => return,
        };
        match result {
            Ok(Step::Done) => {
                self.manager.schedule_close(fd);
                self.manager.touch(owner);
            }
            Ok(Step::Pending) => self.manager.touch(owner),
            Err(e) => self.handle_failure(owner, e),
        }
    }

    /// Renders the response once its content is available, then writes it.
    fn write_response(&mut self, fd: RawFd) {
        let result = match self.manager.client_parts(fd) {
            Some((conn, ex)) => {
                let Exchange { request, response, cgi, .. } = ex;
                match response.as_mut() {
                    Some(resp) if !resp.needs_file() => {
                        let rendered = if resp.is_rendered() {
                            Ok(())
                        } else {
                            handler::render(resp, request, cgi.as_ref())
                        };
                        rendered.and_then(|()| {
                            let step = resp.write_to(&mut conn.fd)?;
                            conn.touch();
                            Ok(step)
                        })
                    }
                    _ => return,
                }
            }
            None => return,
        };
        match result {
            Ok(Step::Done) => self.finish_exchange(fd),
            Ok(Step::Pending) => {}
            Err(e) => self.handle_failure(fd, e),
        }
    }

    /// The response went out: close, or reset for the next request.
    fn finish_exchange(&mut self, fd: RawFd) {
        let Some(mut ex) = self.manager.take_exchange(fd) else {
            return;
        };
        let (status, keep_alive) = ex
            .response
            .as_ref()
            .map_or((StatusCode::InternalServerError, false), |r| (r.status(), r.keep_alive()));
        info!(
            fd,
            method = %ex.request.method(),
            path = %ex.request.url().path,
            status = status.as_u16(),
            keep_alive,
            "served"
        );
        for aux in ex.aux.drain(..) {
            self.manager.schedule_close(aux);
        }
        if !keep_alive {
            self.manager.schedule_close(fd);
            return;
        }

        let carry = ex.request.take_leftover();
        let listen = ex.request.listen().clone();
        let peer = ex.request.peer();
        drop(ex);
        self.manager.set_state(fd, ConnState::ReadHeader);
        if carry.is_empty() {
            return;
        }
        let request = Request::new(listen, peer, self.settings.limits).with_carry(carry);
        let pipelined = request.has_buffered_head();
        self.manager.insert_exchange(fd, Exchange::new(request));
        if pipelined {
            self.read_head(fd);
        }
    }

    fn handle_failure(&mut self, fd: RawFd, err: HttpError) {
        if self.manager.is_closing(fd) {
            return;
        }
        match err {
            HttpError::EndOfConnection => {
                debug!(fd, "peer closed connection");
                self.drop_client(fd);
            }
            HttpError::Server(e) => {
                error!(fd, error = %e, "descriptor failure");
                self.drop_client(fd);
            }
            HttpError::Protocol { status, reason } => {
                warn!(fd, status = status.as_u16(), %reason, "request failed");
                self.redirect_to_error_page(fd, status);
            }
            HttpError::Cgi(reason) => {
                error!(fd, %reason, "cgi failed");
                self.redirect_to_error_page(fd, StatusCode::InternalServerError);
            }
            HttpError::ErrorLoop(status) => {
                warn!(fd, status = status.as_u16(), "error page loop");
                self.manager.abort_exchange(fd);
                self.serve_fallback_page(fd, status);
            }
        }
    }

    fn drop_client(&mut self, fd: RawFd) {
        self.manager.abort_exchange(fd);
        self.manager.schedule_close(fd);
    }

    /// Abandons the current response and answers with the page for `status`.
    fn redirect_to_error_page(&mut self, fd: RawFd, status: StatusCode) {
        self.manager.abort_exchange(fd);
        if status == StatusCode::NoResponse {
            debug!(fd, "closing without response");
            self.manager.schedule_close(fd);
            return;
        }
        let Some(ex) = self.manager.exchange_mut(fd) else {
            self.manager.schedule_close(fd);
            return;
        };
        ex.response = None;
        match ex.request.update_error_code(status, &self.router) {
            Ok(()) => {
                let resp = Response::for_request(&ex.request);
                if let Err(e) = self.serve_file(fd, resp) {
                    warn!(fd, error = %e, "configured error page unusable");
                    self.serve_fallback_page(fd, status);
                }
            }
            Err(e) => {
                debug!(fd, error = %e, "no configured error page");
                self.serve_fallback_page(fd, status);
            }
        }
    }

    /// Serves `<error_pages>/<code>.html`, then the 500 page, then a
    /// generated body.
    fn serve_fallback_page(&mut self, fd: RawFd, status: StatusCode) {
        let (keep_alive, server_name) = self
            .manager
            .exchange(fd)
            .map(|ex| (ex.request.keep_alive(), ex.request.route().server_name.clone()))
            .unwrap_or_default();
        for candidate in [status, StatusCode::InternalServerError] {
            let page = error_page_handler::default_page_path(&self.settings.error_pages, candidate);
            let mut resp = Response::for_file(candidate, page, &server_name);
            resp.set_keep_alive(keep_alive);
            match self.serve_file(fd, resp) {
                Ok(()) => return,
                Err(e) => debug!(fd, status = candidate.as_u16(), error = %e, "default error page missing"),
            }
        }
        let mut resp = error_page_handler::builtin_response(StatusCode::InternalServerError, &server_name);
        resp.set_keep_alive(keep_alive);
        match self.manager.exchange_mut(fd) {
            Some(ex) => {
                ex.response = Some(resp);
                self.manager.set_state(fd, ConnState::WriteToClient);
            }
            None => self.manager.schedule_close(fd),
        }
    }

    fn flush_closed(&mut self) {
        for conn in self.manager.remove_closed() {
            self.poller.deregister(conn.raw());
            if conn.role == Role::ClientSocket {
                conn.fd.shutdown();
                debug!(fd = conn.raw(), "connection closed");
            } else {
                trace!(fd = conn.raw(), role = ?conn.role, "descriptor closed");
            }
        }
    }
}
