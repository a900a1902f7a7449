use crate::http::response::Response;

pub const SERVER_SOFTWARE: &str = concat!("webserv/", env!("CARGO_PKG_VERSION"));

/// Status line, the fixed headers, any extra headers, then the body.
pub fn serialize_response(resp: &Response) -> Vec<u8> {
    let body = resp.body();
    let mut out = Vec::with_capacity(256 + body.len());
    out.extend_from_slice(
        format!("HTTP/1.1 {} {}\r\n", resp.status().as_u16(), resp.status().reason()).as_bytes(),
    );
    out.extend_from_slice(format!("Server: {SERVER_SOFTWARE}\r\n").as_bytes());
    out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    let connection = if resp.keep_alive() { "keep-alive" } else { "close" };
    out.extend_from_slice(format!("Connection: {connection}\r\n").as_bytes());
    for (k, v) in resp.headers().iter() {
        if k.eq_ignore_ascii_case("Content-Length") || k.eq_ignore_ascii_case("Connection") {
            continue;
        }
        out.extend_from_slice(format!("{k}: {v}\r\n").as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}
