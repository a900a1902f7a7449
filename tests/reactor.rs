use std::fs;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::Duration;

use webserv::application::server::{Reactor, ReactorSettings};
use webserv::config::load_config;
use webserv::http::Limits;
use webserv::routing::ConfigRouter;

const CONFIG: &str = r#"
server {
    listen 127.0.0.1:0;
    root www;
    index index.html;
    error_page 404 errors/404.html;

    location / { allow_methods GET; }
    location /files { autoindex on; allow_methods GET POST DELETE; }
    location /cgi-bin {
        allow_methods GET POST;
        cgi_extension .sh /bin/sh;
    }
    location /old { return 301 /files; }
}
"#;

const ECHO_SCRIPT: &str = "#!/bin/sh\n\
printf 'Content-Type: text/plain\\r\\n\\r\\n'\n\
echo \"method=$REQUEST_METHOD\"\n\
echo \"query=$QUERY_STRING\"\n\
echo \"len=$CONTENT_LENGTH\"\n\
cat\n";

struct TestServer {
    dir: tempfile::TempDir,
    addr: SocketAddr,
}

fn start(idle_timeout: Duration) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    for sub in ["www/files", "www/cgi-bin", "errors", "fallback"] {
        fs::create_dir_all(root.join(sub)).unwrap();
    }
    fs::write(root.join("www/index.html"), "<h1>home</h1>").unwrap();
    fs::write(root.join("www/files/a.txt"), "alpha").unwrap();
    fs::write(root.join("www/cgi-bin/echo.sh"), ECHO_SCRIPT).unwrap();
    fs::write(root.join("errors/404.html"), "custom missing").unwrap();
    fs::write(root.join("fallback/400.html"), "fallback bad request").unwrap();
    fs::write(root.join("fallback/403.html"), "fallback forbidden").unwrap();
    fs::write(root.join("server.conf"), CONFIG).unwrap();

    let config = load_config(&root.join("server.conf")).unwrap();
    let listens = config.listen_addrs();
    let settings = ReactorSettings {
        idle_timeout,
        poll_timeout_ms: 5,
        limits: Limits::default(),
        error_pages: root.join("fallback"),
    };
    let mut reactor = Reactor::bind(ConfigRouter::new(config), &listens, settings).unwrap();
    let addr = reactor.local_addrs()[0].1;
    thread::spawn(move || {
        let _ = reactor.run();
    });
    TestServer { dir, addr }
}

impl TestServer {
    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        stream
    }

    /// Sends raw bytes and reads until the server closes.
    fn roundtrip(&self, raw: &[u8]) -> String {
        let mut stream = self.connect();
        stream.write_all(raw).unwrap();
        let mut out = Vec::new();
        let mut chunk = [0u8; 4096];
        // a reset after the response still counts as the end of it
        while let Ok(n @ 1..) = stream.read(&mut chunk) {
            out.extend_from_slice(&chunk[..n]);
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    fn get(&self, path: &str) -> String {
        self.roundtrip(format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n").as_bytes())
    }
}

fn body_of(response: &str) -> &str {
    response.split_once("\r\n\r\n").map_or("", |(_, body)| body)
}

#[test]
fn serves_static_file() {
    let server = start(Duration::from_secs(5));
    let resp = server.get("/");
    assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"), "{resp}");
    assert!(resp.contains("Content-Type: text/html"));
    assert!(resp.contains("Content-Length: 13\r\n"));
    assert!(resp.contains("Connection: close\r\n"));
    assert_eq!(body_of(&resp), "<h1>home</h1>");
}

#[test]
fn missing_file_gets_configured_error_page() {
    let server = start(Duration::from_secs(5));
    let resp = server.get("/nope.html");
    assert!(resp.starts_with("HTTP/1.1 404 Not Found\r\n"), "{resp}");
    assert_eq!(body_of(&resp), "custom missing");
}

#[test]
fn unconfigured_error_uses_fallback_directory() {
    let server = start(Duration::from_secs(5));
    fs::create_dir(server.dir.path().join("www/files/sub")).unwrap();
    let resp = server.roundtrip(b"DELETE /files/sub HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    assert!(resp.starts_with("HTTP/1.1 403 Forbidden\r\n"), "{resp}");
    assert_eq!(body_of(&resp), "fallback forbidden");
}

#[test]
fn missing_fallback_pages_end_in_generated_500() {
    let server = start(Duration::from_secs(5));
    let resp = server.roundtrip(
        b"POST /index.html HTTP/1.1\r\nHost: localhost\r\nContent-Type: text/plain\r\nContent-Length: 1\r\n\r\nx",
    );
    assert!(resp.starts_with("HTTP/1.1 500 Internal Server Error\r\n"), "{resp}");
    assert!(body_of(&resp).contains("<h1>500 Internal Server Error</h1>"));
}

#[test]
fn redirects_with_location() {
    let server = start(Duration::from_secs(5));
    let resp = server.get("/old/page");
    assert!(resp.starts_with("HTTP/1.1 301 Moved Permanently\r\n"), "{resp}");
    assert!(resp.contains("Location: /files\r\n"));
}

#[test]
fn lists_directories() {
    let server = start(Duration::from_secs(5));
    let resp = server.get("/files/");
    assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"), "{resp}");
    assert!(body_of(&resp).contains("a.txt"));
}

#[test]
fn cgi_get_sees_query_string() {
    let server = start(Duration::from_secs(5));
    let resp = server.get("/cgi-bin/echo.sh?name=world");
    assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"), "{resp}");
    assert!(resp.contains("Content-Type: text/plain\r\n"));
    let body = body_of(&resp);
    assert!(body.contains("method=GET\n"), "{body}");
    assert!(body.contains("query=name=world\n"), "{body}");
}

#[test]
fn chunked_post_reaches_cgi_stdin() {
    let server = start(Duration::from_secs(5));
    let resp = server.roundtrip(
        b"POST /cgi-bin/echo.sh HTTP/1.1\r\nHost: localhost\r\nContent-Type: text/plain\r\n\
          Transfer-Encoding: chunked\r\nConnection: close\r\n\r\n\
          7\r\nMozilla\r\n9\r\nDeveloper\r\n7\r\nNetwork\r\n0\r\n\r\n",
    );
    assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"), "{resp}");
    let body = body_of(&resp);
    assert!(body.contains("method=POST\n"), "{body}");
    assert!(body.contains("len=23\n"), "{body}");
    assert!(body.ends_with("MozillaDeveloperNetwork"), "{body}");
}

#[test]
fn raw_upload_then_delete() {
    let server = start(Duration::from_secs(5));
    let target = server.dir.path().join("www/files/new.txt");

    let resp = server.roundtrip(
        b"POST /files/new.txt HTTP/1.1\r\nHost: localhost\r\nContent-Type: text/plain\r\n\
          Content-Length: 5\r\nConnection: close\r\n\r\nhello",
    );
    assert!(resp.starts_with("HTTP/1.1 201 Created\r\n"), "{resp}");
    assert_eq!(fs::read_to_string(&target).unwrap(), "hello");

    let resp = server.roundtrip(b"DELETE /files/new.txt HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"), "{resp}");
    assert!(!target.exists());
}

#[test]
fn pipelined_requests_share_a_connection() {
    let server = start(Duration::from_secs(5));
    let resp = server.roundtrip(
        b"GET /files/a.txt HTTP/1.1\r\nHost: localhost\r\n\r\n\
          GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    );
    assert_eq!(resp.matches("HTTP/1.1 200 OK\r\n").count(), 2, "{resp}");
    assert!(resp.contains("Connection: keep-alive\r\n"));
    assert!(resp.contains("alpha"));
    assert!(resp.ends_with("<h1>home</h1>"));
}

#[test]
fn error_page_keeps_a_pipelined_connection_open() {
    let server = start(Duration::from_secs(5));
    let resp = server.roundtrip(
        b"GET /nope.html HTTP/1.1\r\nHost: localhost\r\n\r\n\
          GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    );
    assert!(resp.starts_with("HTTP/1.1 404 Not Found\r\n"), "{resp}");
    assert!(resp.contains("Connection: keep-alive\r\n"), "{resp}");
    assert!(resp.contains("custom missing"));
    assert!(resp.contains("HTTP/1.1 200 OK\r\n"), "{resp}");
    assert!(resp.ends_with("<h1>home</h1>"));
}

#[test]
fn keep_alive_serves_sequential_requests() {
    let server = start(Duration::from_secs(5));
    let mut stream = server.connect();
    for _ in 0..2 {
        stream.write_all(b"GET /files/a.txt HTTP/1.1\r\nHost: localhost\r\n\r\n").unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        while !String::from_utf8_lossy(&buf).ends_with("alpha") {
            let n = stream.read(&mut chunk).unwrap();
            assert!(n > 0, "connection closed early");
            buf.extend_from_slice(&chunk[..n]);
        }
        assert!(String::from_utf8_lossy(&buf).starts_with("HTTP/1.1 200 OK\r\n"));
    }
}

#[test]
fn missing_host_closes_without_response() {
    let server = start(Duration::from_secs(5));
    let resp = server.roundtrip(b"GET / HTTP/1.1\r\nUser-Agent: x\r\n\r\n");
    assert!(resp.is_empty(), "{resp}");
}

#[test]
fn malformed_request_line_is_400() {
    let server = start(Duration::from_secs(5));
    let resp = server.roundtrip(b"GET /\r\nHost: localhost\r\n\r\n");
    assert!(resp.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{resp}");
    assert!(resp.contains("Connection: close\r\n"));
    assert_eq!(body_of(&resp), "fallback bad request");
}

#[test]
fn idle_clients_are_dropped() {
    let server = start(Duration::from_millis(200));
    let mut stream = server.connect();
    thread::sleep(Duration::from_millis(600));
    let mut buf = [0u8; 16];
    let n = stream.read(&mut buf).unwrap_or(0);
    assert_eq!(n, 0);
}
