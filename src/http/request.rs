use std::io::{self, Read};
use std::net::SocketAddr;

use tracing::{debug, trace};

use super::chunked::ChunkedDecoder;
use super::headers::Headers;
use super::method::Method;
use super::parser::{self, find_head_end};
use super::status::StatusCode;
use super::url::Url;
use crate::config::ListenAddr;
use crate::error::{HttpError, Step};
use crate::routing::{Route, RouteQuery, Routing};

pub const DEFAULT_READ_BUFFER: usize = 8 * 1024;
pub const DEFAULT_MAX_HEAD_SIZE: usize = 16 * 1024;

/// Error-page resolutions attempted before giving up.
const MAX_ERROR_RESOLUTIONS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_head_size: usize,
    pub read_buffer: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self { max_head_size: DEFAULT_MAX_HEAD_SIZE, read_buffer: DEFAULT_READ_BUFFER }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    HeadReading,
    HeadParsed,
    BodyReading,
    Done,
}

/// How the response to this request is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Static,
    Redirect,
    AutoIndex,
    Cgi,
    Upload,
    Delete,
}

#[derive(Debug)]
enum BodyFraming {
    None,
    Length(u64),
    Chunked(ChunkedDecoder),
}

/// One HTTP request, parsed incrementally off a non-blocking source.
#[derive(Debug)]
pub struct Request {
    listen: ListenAddr,
    peer: Option<SocketAddr>,
    limits: Limits,
    method: Method,
    url: Url,
    version: String,
    headers: Headers,
    head_buf: Vec<u8>,
    body: Vec<u8>,
    /// Bytes received past the end of this request.
    leftover: Vec<u8>,
    content_length: Option<u64>,
    framing: BodyFraming,
    route: Route,
    kind: RequestKind,
    state: ParseState,
}

impl Request {
    pub fn new(listen: ListenAddr, peer: Option<SocketAddr>, limits: Limits) -> Self {
        Request {
            listen,
            peer,
            limits,
            method: Method::Get,
            url: Url::default(),
            version: String::new(),
            headers: Headers::new(),
            head_buf: Vec::new(),
            body: Vec::new(),
            leftover: Vec::new(),
            content_length: None,
            framing: BodyFraming::None,
            route: Route::default(),
            kind: RequestKind::Static,
            state: ParseState::HeadReading,
        }
    }

    /// Seeds the head buffer with bytes left over by a previous request.
    pub fn with_carry(mut self, carry: Vec<u8>) -> Self {
        self.head_buf = carry;
        self
    }

    /// True when the buffered bytes already hold a complete head.
    pub fn has_buffered_head(&self) -> bool {
        find_head_end(&self.head_buf).is_some()
    }

    /// Reads at most once from `src` and parses the head once its terminator
    /// has arrived. Returns `Done` when the whole request, body included, is
    /// available; `Pending` otherwise (check [`Request::state`]).
    pub fn parse_head<S, R>(&mut self, src: &mut S, router: &R) -> Result<Step, HttpError>
    where
        S: Read + ?Sized,
        R: Routing + ?Sized,
    {
        if self.state != ParseState::HeadReading {
            return Err(HttpError::protocol(
                StatusCode::InternalServerError,
                "head parsing requested twice",
            ));
        }

        if find_head_end(&self.head_buf).is_none() {
            let mut buf = vec![0u8; self.limits.read_buffer];
            match read_once(src, &mut buf)? {
                Some(n) => self.head_buf.extend_from_slice(&buf[..n]),
                None => return Ok(Step::Pending),
            }
        }

        let Some(end) = find_head_end(&self.head_buf) else {
            if self.head_buf.len() > self.limits.max_head_size {
                return Err(self.head_too_large());
            }
            return Ok(Step::Pending);
        };
        if end > self.limits.max_head_size {
            return Err(self.head_too_large());
        }

        let rest = self.head_buf.split_off(end);
        let (line, headers) = parser::parse_head(&self.head_buf)?;
        self.method = line.method;
        self.version = line.version;
        self.url = Url::parse(&line.target, self.listen.port)?;
        self.headers = headers;
        self.state = ParseState::HeadParsed;
        debug!(method = %self.method, path = %self.url.path, "request head parsed");

        self.validate_headers()?;
        if let Err(e) = self.route_and_classify(router) {
            // without a body the request is fully read and the connection survives
            if matches!(self.framing, BodyFraming::None) {
                self.leftover = rest;
                self.state = ParseState::Done;
            }
            return Err(e);
        }
        self.begin_body(rest)?;
        Ok(self.step())
    }

    /// One read of body bytes. Valid only while in `BodyReading`.
    pub fn parse_body<S: Read + ?Sized>(&mut self, src: &mut S) -> Result<Step, HttpError> {
        if self.state != ParseState::BodyReading {
            return Err(HttpError::protocol(
                StatusCode::InternalServerError,
                "body read outside of body state",
            ));
        }
        let mut buf = vec![0u8; self.limits.read_buffer];
        let Some(n) = read_once(src, &mut buf)? else {
            return Ok(Step::Pending);
        };
        self.feed_body(&buf[..n])?;
        Ok(self.step())
    }

    /// Re-targets the request at the error page for `status`. Resolution is
    /// retried against whatever status a failed attempt falls back to, up to
    /// a fixed number of times; a status resolving to itself is a loop.
    pub fn update_error_code<R: Routing + ?Sized>(
        &mut self,
        status: StatusCode,
        router: &R,
    ) -> Result<(), HttpError> {
        let mut current = status;
        for _ in 0..MAX_ERROR_RESOLUTIONS {
            let route = router.resolve_error(&self.query(), current);
            if !route.failed {
                trace!(from = status.as_u16(), to = route.status.as_u16(), "error page resolved");
                self.route = route;
                self.kind = RequestKind::Static;
                return Ok(());
            }
            if route.status == current {
                return Err(HttpError::ErrorLoop(current));
            }
            current = route.status;
        }
        Err(HttpError::ErrorLoop(current))
    }

    fn head_too_large(&self) -> HttpError {
        HttpError::protocol(
            StatusCode::RequestHeaderFieldsTooLarge,
            format!("head larger than {} bytes", self.limits.max_head_size),
        )
    }

    fn validate_headers(&mut self) -> Result<(), HttpError> {
        let Some(host) = self.headers.get("Host").map(str::to_string) else {
            return Err(HttpError::protocol(StatusCode::NoResponse, "missing Host header"));
        };
        if self.url.has_authority {
            if !host.contains(&self.url.host) {
                return Err(HttpError::protocol(
                    StatusCode::PreconditionFailed,
                    format!("target host {} does not match Host {host}", self.url.host),
                ));
            }
        } else {
            self.url.set_host_port(host.trim(), self.listen.port)?;
        }

        if let Some(raw) = self.headers.get("Content-Length") {
            let len = raw
                .trim()
                .parse::<u64>()
                .map_err(|_| HttpError::bad_request(format!("invalid Content-Length: {raw}")))?;
            self.content_length = Some(len);
        }
        let chunked = match self.headers.get("Transfer-Encoding") {
            Some(te) if te.trim().eq_ignore_ascii_case("chunked") => true,
            Some(te) => return Err(HttpError::bad_request(format!("unsupported Transfer-Encoding: {te}"))),
            None => false,
        };

        if self.method.carries_body() {
            if !self.headers.contains_key("Content-Type") {
                return Err(HttpError::bad_request("missing Content-Type"));
            }
            if !chunked && self.content_length.is_none() {
                return Err(HttpError::protocol(StatusCode::LengthRequired, "missing Content-Length"));
            }
        }

        self.framing = if chunked {
            BodyFraming::Chunked(ChunkedDecoder::new())
        } else {
            match self.content_length {
                Some(len) if len > 0 => BodyFraming::Length(len),
                _ => BodyFraming::None,
            }
        };
        Ok(())
    }

    fn route_and_classify<R: Routing + ?Sized>(&mut self, router: &R) -> Result<(), HttpError> {
        let route = router.resolve(&self.query());
        self.kind = if route.redirect {
            RequestKind::Redirect
        } else if route.status.as_u16() >= 300 {
            RequestKind::Static
        } else if self.method == Method::Post && self.headers.contains_key("Content-Type") {
            if route.cgi { RequestKind::Cgi } else { RequestKind::Upload }
        } else if route.autoindex {
            RequestKind::AutoIndex
        } else if route.cgi {
            RequestKind::Cgi
        } else if self.method == Method::Delete {
            RequestKind::Delete
        } else {
            RequestKind::Static
        };
        let failed = route.failed || route.status.is_error();
        let status = route.status;
        self.route = route;
        if failed {
            return Err(HttpError::protocol(status, format!("routing refused {}", self.url.path)));
        }

        let max = self.route.max_body_size;
        if max > 0 && self.content_length.map_or(false, |len| len > max) && !self.is_chunked() {
            return Err(HttpError::protocol(
                StatusCode::PayloadTooLarge,
                format!("declared body larger than {max} bytes"),
            ));
        }
        Ok(())
    }

    fn begin_body(&mut self, rest: Vec<u8>) -> Result<(), HttpError> {
        if matches!(self.framing, BodyFraming::None) {
            self.leftover = rest;
            self.state = ParseState::Done;
            return Ok(());
        }
        self.state = ParseState::BodyReading;
        self.feed_body(&rest)
    }

    fn feed_body(&mut self, bytes: &[u8]) -> Result<(), HttpError> {
        let max = self.route.max_body_size;
        match &mut self.framing {
            BodyFraming::None => self.leftover.extend_from_slice(bytes),
            BodyFraming::Length(len) => {
                let missing = (*len as usize).saturating_sub(self.body.len());
                let take = missing.min(bytes.len());
                self.body.extend_from_slice(&bytes[..take]);
                self.leftover.extend_from_slice(&bytes[take..]);
                if self.body.len() as u64 >= *len {
                    self.state = ParseState::Done;
                }
            }
            BodyFraming::Chunked(decoder) => {
                let consumed = decoder.feed(bytes, &mut self.body)?;
                if max > 0 && self.body.len() as u64 > max {
                    return Err(HttpError::protocol(
                        StatusCode::PayloadTooLarge,
                        format!("chunked body larger than {max} bytes"),
                    ));
                }
                if decoder.is_done() {
                    self.leftover.extend_from_slice(&bytes[consumed..]);
                    self.content_length = Some(self.body.len() as u64);
                    self.state = ParseState::Done;
                }
            }
        }
        trace!(body = self.body.len(), "body bytes buffered");
        Ok(())
    }

    fn step(&self) -> Step {
        if self.state == ParseState::Done {
            Step::Done
        } else {
            Step::Pending
        }
    }

    pub fn query(&self) -> RouteQuery<'_> {
        RouteQuery {
            listen: &self.listen,
            method: self.method,
            path: &self.url.path,
            host: &self.url.host,
        }
    }

    pub fn listen(&self) -> &ListenAddr {
        &self.listen
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub fn is_chunked(&self) -> bool {
        matches!(self.framing, BodyFraming::Chunked(_))
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn status(&self) -> StatusCode {
        self.route.status
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    /// True once every byte of this request, body included, has been read,
    /// whether or not routing accepted it.
    pub fn is_done(&self) -> bool {
        self.state == ParseState::Done
    }

    /// Bytes that belong to the next request on this connection.
    pub fn take_leftover(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.leftover)
    }

    /// Whether the connection may carry another request after this one.
    /// Unread body bytes would be taken for the next head, so a request
    /// abandoned mid-body always closes.
    pub fn keep_alive(&self) -> bool {
        if !self.is_done() {
            return false;
        }
        let connection = self.headers.get("Connection").map(str::trim);
        if connection.map_or(false, |c| c.eq_ignore_ascii_case("close")) {
            return false;
        }
        if self.version == "HTTP/1.0" {
            return connection.map_or(false, |c| c.eq_ignore_ascii_case("keep-alive"));
        }
        true
    }
}

/// `Some(n)` bytes read, `None` when the source would block.
fn read_once<S: Read + ?Sized>(src: &mut S, buf: &mut [u8]) -> Result<Option<usize>, HttpError> {
    match src.read(buf) {
        Ok(0) => Err(HttpError::EndOfConnection),
        Ok(n) => Ok(Some(n)),
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => Ok(None),
        Err(e) if matches!(e.kind(), io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe) => {
            Err(HttpError::EndOfConnection)
        }
        Err(e) => Err(HttpError::Server(e)),
    }
}
