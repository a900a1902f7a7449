use std::collections::VecDeque;
use std::io::{self, Read};
use std::path::PathBuf;

use super::*;
use crate::config::ListenAddr;
use crate::error::{HttpError, Step};
use crate::routing::{Route, RouteQuery, Routing};

struct StubRouter {
    route: Route,
    error_pages: Vec<(StatusCode, Route)>,
}

impl StubRouter {
    fn serving(route: Route) -> Self {
        StubRouter { route, error_pages: Vec::new() }
    }

    fn static_file() -> Self {
        let mut route = Route::new("localhost", PathBuf::from("/srv"));
        route.real_path = PathBuf::from("/srv/index.html");
        Self::serving(route)
    }
}

impl Routing for StubRouter {
    fn resolve(&self, _query: &RouteQuery<'_>) -> Route {
        self.route.clone()
    }

    fn resolve_error(&self, _query: &RouteQuery<'_>, status: StatusCode) -> Route {
        self.error_pages
            .iter()
            .find(|(s, _)| *s == status)
            .map(|(_, r)| r.clone())
            .unwrap_or_else(|| Route::default().fail(status))
    }
}

/// Hands out scripted reads. An empty chunk reads as `WouldBlock`; once the
/// script is exhausted reads block, or report EOF when `closed`.
struct Script {
    chunks: VecDeque<Vec<u8>>,
    closed: bool,
}

impl Script {
    fn whole(bytes: &[u8]) -> Self {
        Script { chunks: VecDeque::from(vec![bytes.to_vec()]), closed: false }
    }

    fn bytewise(bytes: &[u8]) -> Self {
        let mut chunks = VecDeque::new();
        for b in bytes {
            chunks.push_back(vec![*b]);
            chunks.push_back(Vec::new());
        }
        Script { chunks, closed: false }
    }

    fn exhausted(&self) -> bool {
        self.chunks.is_empty()
    }
}

impl Read for Script {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(mut chunk) = self.chunks.pop_front() else {
            return if self.closed { Ok(0) } else { Err(io::ErrorKind::WouldBlock.into()) };
        };
        if chunk.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(chunk.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            self.chunks.push_front(chunk.split_off(n));
        }
        Ok(n)
    }
}

fn new_request() -> Request {
    Request::new(ListenAddr::new("127.0.0.1", 8080), None, Limits::default())
}

/// Feeds the script until the request completes or no more input exists.
fn drive(req: &mut Request, src: &mut Script, router: &StubRouter) -> Result<ParseState, HttpError> {
    loop {
        let step = match req.state() {
            ParseState::HeadReading => req.parse_head(src, router)?,
            ParseState::BodyReading => req.parse_body(src)?,
            _ => Step::Done,
        };
        if step.is_done() || req.is_done() || src.exhausted() {
            // one last attempt drains whatever is still buffered
            if !req.is_done() && req.state() == ParseState::HeadReading && req.has_buffered_head() {
                continue;
            }
            return Ok(req.state());
        }
    }
}

fn parse(bytes: &[u8], router: &StubRouter) -> Result<Request, HttpError> {
    let mut req = new_request();
    drive(&mut req, &mut Script::whole(bytes), router)?;
    Ok(req)
}

fn status_of(result: Result<Request, HttpError>) -> Option<StatusCode> {
    result.err().and_then(|e| e.status())
}

#[test]
fn get_static_file() {
    let req = parse(b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n", &StubRouter::static_file()).unwrap();
    assert!(req.is_done());
    assert_eq!(req.status(), StatusCode::Ok);
    assert_eq!(req.kind(), RequestKind::Static);
    assert_eq!(req.method(), Method::Get);
    assert_eq!(req.url().path, "/index.html");
    assert_eq!(req.url().host, "x");
    assert_eq!(req.url().port, 8080);
    assert!(req.keep_alive());
}

#[test]
fn split_reads_match_single_read() {
    let wire = b"POST /up?name=a%20b HTTP/1.1\r\nHost: example.com:8080\r\nContent-Type: text/plain\r\n\
Cookie: a=1\r\ncookie: b=2\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n3\r\n!!!\r\n0\r\n\r\n";
    let router = StubRouter::static_file();

    let whole = parse(wire, &router).unwrap();
    let mut split = new_request();
    let mut script = Script::bytewise(wire);
    while !split.is_done() {
        match split.state() {
            ParseState::HeadReading => split.parse_head(&mut script, &router).unwrap(),
            ParseState::BodyReading => split.parse_body(&mut script).unwrap(),
            other => panic!("unexpected state {other:?}"),
        };
    }

    assert_eq!(whole.method(), split.method());
    assert_eq!(whole.url(), split.url());
    assert_eq!(whole.headers(), split.headers());
    assert_eq!(whole.body(), split.body());
    assert_eq!(whole.kind(), split.kind());
    assert_eq!(split.body(), b"hello!!!");
    assert_eq!(split.url().query_value("name"), Some("a b"));
    assert_eq!(split.kind(), RequestKind::Upload);
}

#[test]
fn chunked_wiki_body() {
    let req = parse(
        b"POST /up HTTP/1.1\r\nHost: x\r\nContent-Type: text/plain\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n0\r\n\r\n",
        &StubRouter::static_file(),
    )
    .unwrap();
    assert!(req.is_done());
    assert!(req.is_chunked());
    assert_eq!(req.body(), b"Wiki");
    assert_eq!(req.content_length(), Some(4));
}

#[test]
fn content_length_truncates_and_waits() {
    let router = StubRouter::static_file();
    let mut req = parse(
        b"POST /up HTTP/1.1\r\nHost: x\r\nContent-Type: a/b\r\nContent-Length: 3\r\n\r\nabcGET / HTTP/1.1\r\n",
        &router,
    )
    .unwrap();
    assert!(req.is_done());
    assert_eq!(req.body(), b"abc");
    assert_eq!(req.take_leftover(), b"GET / HTTP/1.1\r\n");

    let req = parse(b"POST /up HTTP/1.1\r\nHost: x\r\nContent-Type: a/b\r\nContent-Length: 10\r\n\r\nabc", &router)
        .unwrap();
    assert_eq!(req.state(), ParseState::BodyReading);
    assert_eq!(req.body(), b"abc");
    assert!(!req.keep_alive());
}

#[test]
fn oversized_bodies_fail_with_413() {
    let mut route = Route::new("localhost", PathBuf::from("/srv"));
    route.max_body_size = 5;
    let router = StubRouter::serving(route);

    let mut req = new_request();
    let mut src = Script::whole(b"POST /up HTTP/1.1\r\nHost: x\r\nContent-Type: a/b\r\nContent-Length: 6\r\n\r\nabcdef");
    let err = req.parse_head(&mut src, &router).unwrap_err();
    assert_eq!(err.status(), Some(StatusCode::PayloadTooLarge));
    assert!(req.body().is_empty());

    let chunked = b"POST /up HTTP/1.1\r\nHost: x\r\nContent-Type: a/b\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n3\r\ndef\r\n0\r\n\r\n";
    assert_eq!(status_of(parse(chunked, &router)), Some(StatusCode::PayloadTooLarge));

    let fits = b"POST /up HTTP/1.1\r\nHost: x\r\nContent-Type: a/b\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nabcde\r\n0\r\n\r\n";
    assert_eq!(parse(fits, &router).unwrap().body(), b"abcde");
}

#[test]
fn declared_oversize_is_refused_before_the_body_arrives() {
    let mut route = Route::new("localhost", PathBuf::from("/srv"));
    route.max_body_size = 5;
    let router = StubRouter::serving(route);

    let mut req = new_request();
    let mut src = Script {
        chunks: VecDeque::from(vec![
            b"POST /up HTTP/1.1\r\nHost: x\r\nContent-Type: a/b\r\nContent-Length: 6\r\n\r\n".to_vec(),
            b"abcdef".to_vec(),
        ]),
        closed: false,
    };
    let err = req.parse_head(&mut src, &router).unwrap_err();
    assert_eq!(err.status(), Some(StatusCode::PayloadTooLarge));
    assert_eq!(src.chunks.front().map(Vec::as_slice), Some(&b"abcdef"[..]));
    assert!(req.body().is_empty());
    assert!(!req.keep_alive());
}

#[test]
fn host_validation() {
    let router = StubRouter::static_file();
    assert_eq!(status_of(parse(b"GET / HTTP/1.1\r\nAccept: */*\r\n\r\n", &router)), Some(StatusCode::NoResponse));
    assert_eq!(
        status_of(parse(b"GET http://a.test/ HTTP/1.1\r\nHost: b.test\r\n\r\n", &router)),
        Some(StatusCode::PreconditionFailed)
    );
    let req = parse(b"GET http://a.test:9000/x HTTP/1.1\r\nHost: a.test\r\n\r\n", &router).unwrap();
    assert_eq!(req.url().port, 9000);
    assert_eq!(status_of(parse(b"GET / HTTP/1.1\r\nHost: x:y\r\n\r\n", &router)), Some(StatusCode::BadRequest));
}

#[test]
fn body_header_requirements() {
    let router = StubRouter::static_file();
    let status = |wire: &[u8]| status_of(parse(wire, &router));
    assert_eq!(status(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 1\r\n\r\na"), Some(StatusCode::BadRequest));
    assert_eq!(status(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Type: a/b\r\n\r\n"), Some(StatusCode::LengthRequired));
    assert_eq!(
        status(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Type: a/b\r\nTransfer-Encoding: gzip\r\n\r\n"),
        Some(StatusCode::BadRequest)
    );
    assert_eq!(
        status(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Type: a/b\r\nContent-Length: -4\r\n\r\n"),
        Some(StatusCode::BadRequest)
    );
    assert_eq!(status(b"GET / HTTP/1.1\r\n\r\n"), Some(StatusCode::BadRequest));
}

#[test]
fn head_size_limit() {
    let mut req = Request::new(
        ListenAddr::new("127.0.0.1", 8080),
        None,
        Limits { max_head_size: 64, read_buffer: 16 },
    );
    let mut wire = b"GET / HTTP/1.1\r\nHost: x\r\nX-Long: ".to_vec();
    wire.extend(std::iter::repeat(b'a').take(100));
    let mut src = Script::whole(&wire);
    let router = StubRouter::static_file();
    let err = loop {
        match req.parse_head(&mut src, &router) {
            Ok(_) => continue,
            Err(e) => break e,
        }
    };
    assert_eq!(err.status(), Some(StatusCode::RequestHeaderFieldsTooLarge));
}

#[test]
fn peer_close_ends_connection() {
    let mut req = new_request();
    let mut src = Script { chunks: VecDeque::from(vec![b"GET / HT".to_vec()]), closed: true };
    let router = StubRouter::static_file();
    assert_eq!(req.parse_head(&mut src, &router).unwrap(), Step::Pending);
    assert!(matches!(req.parse_head(&mut src, &router), Err(HttpError::EndOfConnection)));
}

#[test]
fn routing_status_is_surfaced() {
    let route = Route::new("localhost", PathBuf::from("/srv")).fail(StatusCode::Forbidden);
    let router = StubRouter::serving(route);
    let result = parse(b"DELETE /protected HTTP/1.1\r\nHost: x\r\n\r\n", &router);
    assert_eq!(status_of(result), Some(StatusCode::Forbidden));
}

#[test]
fn refused_bodyless_request_keeps_the_connection() {
    let route = Route::new("localhost", PathBuf::from("/srv")).fail(StatusCode::NotFound);
    let router = StubRouter::serving(route);

    let mut req = new_request();
    let mut src = Script::whole(b"GET /nope HTTP/1.1\r\nHost: x\r\n\r\nGET / HTTP/1.1\r\nHost: x\r\n\r\n");
    let err = req.parse_head(&mut src, &router).unwrap_err();
    assert_eq!(err.status(), Some(StatusCode::NotFound));
    assert!(req.is_done());
    assert!(req.keep_alive());
    assert_eq!(req.take_leftover(), b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");

    // an unread body would be mistaken for the next head
    let mut req = new_request();
    let mut src = Script::whole(b"POST /nope HTTP/1.1\r\nHost: x\r\nContent-Type: a/b\r\nContent-Length: 4\r\n\r\nbody");
    let err = req.parse_head(&mut src, &router).unwrap_err();
    assert_eq!(err.status(), Some(StatusCode::NotFound));
    assert!(!req.keep_alive());
}

#[test]
fn classification_order() {
    let mut route = Route::new("localhost", PathBuf::from("/srv"));
    route.cgi = true;
    let router = StubRouter::serving(route.clone());
    assert_eq!(parse(b"GET /a.sh HTTP/1.1\r\nHost: x\r\n\r\n", &router).unwrap().kind(), RequestKind::Cgi);
    let post = b"POST /a.sh HTTP/1.1\r\nHost: x\r\nContent-Type: a/b\r\nContent-Length: 1\r\n\r\nz";
    assert_eq!(parse(post, &router).unwrap().kind(), RequestKind::Cgi);

    route.cgi = false;
    route.autoindex = true;
    let router = StubRouter::serving(route.clone());
    assert_eq!(parse(b"GET /d HTTP/1.1\r\nHost: x\r\n\r\n", &router).unwrap().kind(), RequestKind::AutoIndex);

    route.autoindex = false;
    let router = StubRouter::serving(route.clone());
    assert_eq!(parse(b"DELETE /f HTTP/1.1\r\nHost: x\r\n\r\n", &router).unwrap().kind(), RequestKind::Delete);

    route.redirect = true;
    route.status = StatusCode::MovedPermanently;
    let router = StubRouter::serving(route);
    assert_eq!(parse(b"GET /old HTTP/1.1\r\nHost: x\r\n\r\n", &router).unwrap().kind(), RequestKind::Redirect);
}

#[test]
fn error_code_resolution() {
    let mut page = Route::new("localhost", PathBuf::from("/srv/errors"));
    page.status = StatusCode::NotFound;
    page.real_path = PathBuf::from("/srv/errors/404.html");
    let mut router = StubRouter::static_file();
    router.error_pages = vec![
        (StatusCode::InternalServerError, Route::default().fail(StatusCode::NotFound)),
        (StatusCode::NotFound, page.clone()),
    ];

    let mut req = new_request();
    req.update_error_code(StatusCode::InternalServerError, &router).unwrap();
    assert_eq!(req.status(), StatusCode::NotFound);
    assert_eq!(req.route().real_path, page.real_path);
    assert_eq!(req.kind(), RequestKind::Static);
}

#[test]
fn self_mapping_error_page_is_a_loop() {
    let mut router = StubRouter::static_file();
    router.error_pages = vec![(StatusCode::NotFound, Route::default().fail(StatusCode::NotFound))];
    let mut req = new_request();
    let err = req.update_error_code(StatusCode::NotFound, &router).unwrap_err();
    assert!(matches!(err, HttpError::ErrorLoop(StatusCode::NotFound)));

    router.error_pages = vec![
        (StatusCode::BadRequest, Route::default().fail(StatusCode::Forbidden)),
        (StatusCode::Forbidden, Route::default().fail(StatusCode::NotFound)),
        (StatusCode::NotFound, Route::default().fail(StatusCode::BadRequest)),
    ];
    let err = req.update_error_code(StatusCode::BadRequest, &router).unwrap_err();
    assert!(matches!(err, HttpError::ErrorLoop(_)));
}

#[test]
fn pipelined_requests_share_a_buffer() {
    let router = StubRouter::static_file();
    let mut first = parse(
        b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
        &router,
    )
    .unwrap();
    assert_eq!(first.url().path, "/a");
    assert!(first.keep_alive());

    let mut second = new_request().with_carry(first.take_leftover());
    assert!(second.has_buffered_head());
    let mut idle = Script::whole(b"");
    idle.chunks.clear();
    assert_eq!(second.parse_head(&mut idle, &router).unwrap(), Step::Done);
    assert_eq!(second.url().path, "/b");
    assert!(!second.keep_alive());
}

#[test]
fn http10_closes_by_default() {
    let router = StubRouter::static_file();
    assert!(!parse(b"GET / HTTP/1.0\r\nHost: x\r\n\r\n", &router).unwrap().keep_alive());
    assert!(parse(b"GET / HTTP/1.0\r\nHost: x\r\nConnection: Keep-Alive\r\n\r\n", &router).unwrap().keep_alive());
}

#[test]
fn head_cannot_be_parsed_twice() {
    let router = StubRouter::static_file();
    let mut req = parse(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n", &router).unwrap();
    let err = req.parse_head(&mut Script::whole(b""), &router).unwrap_err();
    assert_eq!(err.status(), Some(StatusCode::InternalServerError));
}
