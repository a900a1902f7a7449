use std::fs;
use std::io::{self, Read, Write};
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};

use tracing::{debug, trace, warn};

use crate::core::net::fd::{pipe, Fd};
use crate::error::{HttpError, Step};
use crate::http::serializer::SERVER_SOFTWARE;
use crate::http::{Headers, Request, StatusCode};

const READ_CHUNK: usize = 8 * 1024;

/// One CGI child and the two pipes wired to it.
#[derive(Debug)]
pub struct CgiProcess {
    env: Vec<(String, String)>,
    script: PathBuf,
    interpreter: Option<PathBuf>,
    child: Option<Child>,
    exit: Option<ExitStatus>,
    /// Parent's write end of the child's stdin.
    upload_pipe: Option<Fd>,
    /// Parent's read end of the child's stdout.
    response_pipe: Option<Fd>,
    forwarded: usize,
    output: Vec<u8>,
}

impl CgiProcess {
    pub fn new(req: &Request) -> Self {
        let route = req.route();
        let script = fs::canonicalize(&route.real_path).unwrap_or_else(|_| route.real_path.clone());
        let env = build_env(req, &script);
        CgiProcess {
            env,
            script,
            interpreter: route.cgi_interpreter.clone(),
            child: None,
            exit: None,
            upload_pipe: None,
            response_pipe: None,
            forwarded: 0,
            output: Vec::new(),
        }
    }

    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    pub fn env_var(&self, name: &str) -> Option<&str> {
        self.env.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    pub fn is_spawned(&self) -> bool {
        self.child.is_some()
    }

    /// Forks the child with both pipes in place. The child's pipe ends are
    /// closed in the parent before this returns.
    pub fn spawn(&mut self) -> Result<(), HttpError> {
        if self.child.is_some() {
            return Err(HttpError::Cgi("process already spawned".into()));
        }
        let (stdin_read, stdin_write) = pipe()?;
        let (stdout_read, stdout_write) = pipe()?;

        let mut command = match &self.interpreter {
            Some(interpreter) => {
                let mut c = Command::new(interpreter);
                c.arg(&self.script);
                c
            }
            None => Command::new(&self.script),
        };
        command
            .env_clear()
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::from(OwnedFd::from(stdin_read)))
            .stdout(Stdio::from(OwnedFd::from(stdout_write)))
            .stderr(Stdio::null());
        if let Some(dir) = self.script.parent() {
            command.current_dir(dir);
        }

        let child = command
            .spawn()
            .map_err(|e| HttpError::Cgi(format!("cannot run {}: {e}", self.script.display())))?;
        // the Command still holds the child's pipe ends
        drop(command);

        stdin_write.set_nonblocking()?;
        stdout_read.set_nonblocking()?;
        debug!(pid = child.id(), script = %self.script.display(), "cgi spawned");
        self.child = Some(child);
        self.upload_pipe = Some(stdin_write);
        self.response_pipe = Some(stdout_read);
        Ok(())
    }

    pub fn take_upload_pipe(&mut self) -> Option<Fd> {
        self.upload_pipe.take()
    }

    pub fn take_response_pipe(&mut self) -> Option<Fd> {
        self.response_pipe.take()
    }

    /// Non-blocking exit check. `Ok(true)` once the child exited cleanly.
    pub fn poll_exit(&mut self) -> Result<bool, HttpError> {
        if let Some(status) = self.exit {
            return exit_result(status);
        }
        let child = self
            .child
            .as_mut()
            .ok_or_else(|| HttpError::Cgi("process was never spawned".into()))?;
        match child.try_wait() {
            Ok(None) => Ok(false),
            Ok(Some(status)) => {
                trace!(pid = child.id(), %status, "cgi exited");
                self.exit = Some(status);
                exit_result(status)
            }
            Err(e) => Err(HttpError::Cgi(format!("waiting for child: {e}"))),
        }
    }

    /// One read of the child's output. `Done` only at end of file after the
    /// child has exited; anything it spawned may still hold the pipe open.
    pub fn drain<S: Read + ?Sized>(&mut self, src: &mut S) -> Result<Step, HttpError> {
        let finished = self.poll_exit()?;
        let mut buf = [0u8; READ_CHUNK];
        match src.read(&mut buf) {
            Ok(0) => Ok(if finished { Step::Done } else { Step::Pending }),
            Ok(n) => {
                self.output.extend_from_slice(&buf[..n]);
                trace!(read = n, total = self.output.len(), "cgi output");
                Ok(Step::Pending)
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                Ok(Step::Pending)
            }
            Err(e) => Err(HttpError::Server(e)),
        }
    }

    /// One write of the request body into the child's stdin.
    pub fn forward_body<W: Write + ?Sized>(&mut self, dst: &mut W, body: &[u8]) -> Result<Step, HttpError> {
        if self.forwarded < body.len() {
            match dst.write(&body[self.forwarded..]) {
                Ok(n) => self.forwarded += n,
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                    return Ok(Step::Pending)
                }
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    // the script stopped reading; what it already wrote still counts
                    warn!(forwarded = self.forwarded, total = body.len(), "cgi closed its stdin early");
                    return Ok(Step::Done);
                }
                Err(e) => return Err(HttpError::Server(e)),
            }
        }
        Ok(if self.forwarded >= body.len() { Step::Done } else { Step::Pending })
    }

    pub fn output(&self) -> &[u8] {
        &self.output
    }

    /// Kills a child that is still running. Returns it when it could not be
    /// reaped right away so the caller can reap it later.
    pub fn terminate(&mut self) -> Option<Child> {
        let mut child = self.child.take()?;
        if self.exit.is_some() {
            return None;
        }
        if let Ok(Some(_)) = child.try_wait() {
            return None;
        }
        debug!(pid = child.id(), "killing cgi");
        if let Err(e) = child.kill() {
            warn!(pid = child.id(), error = %e, "cannot kill cgi");
        }
        match child.try_wait() {
            Ok(Some(_)) => None,
            _ => Some(child),
        }
    }
}

impl Drop for CgiProcess {
    fn drop(&mut self) {
        if self.child.is_some() && self.exit.is_none() {
            if let Some(mut child) = self.terminate() {
                // last resort; SIGKILL was delivered so this returns promptly
                let _ = child.wait();
            }
        }
    }
}

fn exit_result(status: ExitStatus) -> Result<bool, HttpError> {
    if status.success() {
        Ok(true)
    } else {
        Err(HttpError::Cgi(format!("script exited with {status}")))
    }
}

fn build_env(req: &Request, script: &Path) -> Vec<(String, String)> {
    let url = req.url();
    let route = req.route();
    let content_length = if req.method().carries_body() || !req.body().is_empty() {
        req.body().len().to_string()
    } else {
        String::new()
    };
    let cookies = req.headers().get_all("Cookie").collect::<Vec<_>>().join("; ");
    let request_uri = if url.query_raw.is_empty() {
        url.path.clone()
    } else {
        format!("{}?{}", url.path, url.query_raw)
    };
    let script = script.display().to_string();

    let mut env: Vec<(String, String)> = vec![
        ("AUTH_TYPE".into(), String::new()),
        ("CONTENT_LENGTH".into(), content_length),
        ("CONTENT_TYPE".into(), req.header("Content-Type").unwrap_or_default().to_string()),
        ("GATEWAY_INTERFACE".into(), "CGI/1.1".into()),
        ("PATH_INFO".into(), url.path.clone()),
        ("PATH_TRANSLATED".into(), script.clone()),
        ("QUERY_STRING".into(), url.query_raw.clone()),
        ("REMOTE_ADDR".into(), req.peer().map(|p| p.ip().to_string()).unwrap_or_default()),
        ("REMOTE_HOST".into(), String::new()),
        ("REMOTE_IDENT".into(), String::new()),
        ("REMOTE_USER".into(), String::new()),
        ("REQUEST_METHOD".into(), req.method().to_string()),
        ("REQUEST_URI".into(), request_uri),
        ("SCRIPT_NAME".into(), url.path.clone()),
        ("SCRIPT_FILENAME".into(), script),
        ("SERVER_NAME".into(), route.server_name.clone()),
        ("SERVER_PORT".into(), req.listen().port.to_string()),
        ("SERVER_PROTOCOL".into(), "HTTP/1.1".into()),
        ("SERVER_SOFTWARE".into(), SERVER_SOFTWARE.into()),
        ("HTTP_COOKIE".into(), cookies),
        ("HTTP_HOST".into(), req.header("Host").unwrap_or_default().to_string()),
        ("HTTP_USER_AGENT".into(), req.header("User-Agent").unwrap_or_default().to_string()),
    ];
    // scripts still need to find their tools
    if let Ok(path) = std::env::var("PATH") {
        env.push(("PATH".into(), path));
    }
    env
}

/// Reply assembled from a script's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgiReply {
    pub status: StatusCode,
    pub headers: Headers,
    pub body: Vec<u8>,
}

/// Splits script output into CGI headers and body. Output that does not
/// open with a header block is all body.
pub fn parse_cgi_output(out: &[u8]) -> Result<CgiReply, HttpError> {
    let mut reply = CgiReply { status: StatusCode::Ok, headers: Headers::new(), body: Vec::new() };
    let Some((head, body)) = split_headers_body(out) else {
        reply.headers.insert("Content-Type", "text/html; charset=utf-8");
        reply.body = out.to_vec();
        return Ok(reply);
    };

    let mut explicit_status = false;
    for (name, value) in head {
        if name.eq_ignore_ascii_case("Status") {
            let code = value.split_whitespace().next().and_then(|c| c.parse::<u16>().ok());
            reply.status = code.and_then(StatusCode::from_u16).ok_or_else(|| {
                HttpError::protocol(StatusCode::BadGateway, format!("bad cgi status: {value}"))
            })?;
            explicit_status = true;
        } else if name.eq_ignore_ascii_case("Content-Length") || name.eq_ignore_ascii_case("Connection") {
            continue;
        } else {
            reply.headers.append(name, value);
        }
    }
    if !explicit_status && reply.headers.contains_key("Location") {
        reply.status = StatusCode::Found;
    }
    if !reply.headers.contains_key("Content-Type") {
        reply.headers.insert("Content-Type", "text/html; charset=utf-8");
    }
    reply.body = body.to_vec();
    Ok(reply)
}

fn split_headers_body(buf: &[u8]) -> Option<(Vec<(String, String)>, &[u8])> {
    let crlf = twoway::find_bytes(buf, b"\r\n\r\n").map(|i| (i, 4));
    let lf = twoway::find_bytes(buf, b"\n\n").map(|i| (i, 2));
    let (idx, sep_len) = match (crlf, lf) {
        (Some(a), Some(b)) => if a.0 <= b.0 { a } else { b },
        (a, b) => a.or(b)?,
    };
    let head = std::str::from_utf8(&buf[..idx]).ok()?;
    let mut headers = Vec::new();
    for line in head.split('\n').map(|l| l.trim_end_matches('\r')) {
        let (name, value) = line.split_once(':')?;
        if name.is_empty() || name.contains(char::is_whitespace) {
            return None;
        }
        headers.push((name.to_string(), value.trim().to_string()));
    }
    Some((headers, &buf[idx + sep_len..]))
}
