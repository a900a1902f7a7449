use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use tracing::trace;

use super::headers::Headers;
use super::request::{Request, RequestKind, DEFAULT_READ_BUFFER};
use super::serializer::serialize_response;
use super::status::StatusCode;
use crate::core::net::Fd;
use crate::error::{HttpError, Step};

/// Reply to one request, rendered once and then written across ticks.
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    kind: RequestKind,
    target: PathBuf,
    root: PathBuf,
    request_path: String,
    redirect: Option<String>,
    server_name: String,
    keep_alive: bool,
    headers: Headers,
    body: Vec<u8>,
    file_done: bool,
    out: Vec<u8>,
    written: usize,
    rendered: bool,
}

impl Response {
    pub fn for_request(req: &Request) -> Self {
        let route = req.route();
        Response {
            status: route.status,
            kind: req.kind(),
            target: route.real_path.clone(),
            root: route.root.clone(),
            request_path: req.url().path.clone(),
            redirect: route.redirect_path.clone(),
            server_name: route.server_name.clone(),
            keep_alive: req.keep_alive(),
            headers: Headers::new(),
            body: Vec::new(),
            file_done: false,
            out: Vec::new(),
            written: 0,
            rendered: false,
        }
    }

    /// A response whose body is supplied directly instead of read from disk.
    pub fn with_body(status: StatusCode, server_name: &str, content_type: &str, body: Vec<u8>) -> Self {
        let mut headers = Headers::new();
        headers.insert("Content-Type", content_type);
        Response {
            status,
            kind: RequestKind::Static,
            target: PathBuf::new(),
            root: PathBuf::new(),
            request_path: String::new(),
            redirect: None,
            server_name: server_name.to_string(),
            keep_alive: false,
            headers,
            body,
            file_done: true,
            out: Vec::new(),
            written: 0,
            rendered: false,
        }
    }

    /// A static reply streaming `target` from disk, detached from any route.
    pub fn for_file(status: StatusCode, target: PathBuf, server_name: &str) -> Self {
        let root = target.parent().map(Path::to_path_buf).unwrap_or_default();
        let mut resp = Response::with_body(status, server_name, "text/html; charset=utf-8", Vec::new());
        resp.headers = Headers::new();
        resp.target = target;
        resp.root = root;
        resp.file_done = false;
        resp
    }

    /// Static replies stream their target file through the reactor first.
    pub fn needs_file(&self) -> bool {
        self.kind == RequestKind::Static && !self.file_done
    }

    /// Opens the target for non-blocking reads.
    pub fn open_target(&self) -> io::Result<Fd> {
        let fd = Fd::from(File::open(&self.target)?);
        fd.set_nonblocking()?;
        Ok(fd)
    }

    /// One read of the target file into the body buffer.
    pub fn read_file<S: Read + ?Sized>(&mut self, src: &mut S) -> Result<Step, HttpError> {
        let mut buf = [0u8; DEFAULT_READ_BUFFER];
        match src.read(&mut buf) {
            Ok(0) => {
                self.file_done = true;
                trace!(bytes = self.body.len(), "file read complete");
                Ok(Step::Done)
            }
            Ok(n) => {
                self.body.extend_from_slice(&buf[..n]);
                Ok(Step::Pending)
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                Ok(Step::Pending)
            }
            Err(e) => Err(HttpError::Server(e)),
        }
    }

    pub fn is_rendered(&self) -> bool {
        self.rendered
    }

    /// Serializes status line, headers and body into the output buffer.
    pub fn finalize(&mut self) {
        self.out = serialize_response(self);
        self.written = 0;
        self.rendered = true;
    }

    /// One write of pending output. `Done` once everything went out.
    pub fn write_to<W: Write + ?Sized>(&mut self, dst: &mut W) -> Result<Step, HttpError> {
        if !self.rendered {
            self.finalize();
        }
        if self.written < self.out.len() {
            match dst.write(&self.out[self.written..]) {
                Ok(0) => return Err(HttpError::EndOfConnection),
                Ok(n) => self.written += n,
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                    return Ok(Step::Pending)
                }
                Err(e) if matches!(e.kind(), io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset) => {
                    return Err(HttpError::EndOfConnection)
                }
                Err(e) => return Err(HttpError::Server(e)),
            }
        }
        trace!(written = self.written, total = self.out.len(), "response bytes sent");
        Ok(if self.written >= self.out.len() { Step::Done } else { Step::Pending })
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn set_body(&mut self, body: Vec<u8>) {
        self.body = body;
        self.file_done = true;
    }

    pub fn set_keep_alive(&mut self, keep_alive: bool) {
        self.keep_alive = keep_alive;
    }

    pub fn insert_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    pub fn append_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.append(name, value);
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn request_path(&self) -> &str {
        &self.request_path
    }

    pub fn redirect(&self) -> Option<&str> {
        self.redirect.as_deref()
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn output(&self) -> &[u8] {
        &self.out
    }
}
