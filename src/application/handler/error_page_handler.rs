use std::path::{Path, PathBuf};

use crate::http::{Response, StatusCode};

/// `<dir>/<code>.html`, the fallback page for `status`.
pub fn default_page_path(dir: &Path, status: StatusCode) -> PathBuf {
    dir.join(format!("{}.html", status.as_u16()))
}

/// Generated page for when no file can be served.
pub fn builtin_page(status: StatusCode) -> Vec<u8> {
    format!(
        "<html><head><title>{status}</title></head>\
         <body><h1>{status}</h1><p>{}</p><hr><p>webserv</p></body></html>",
        default_message(status)
    )
    .into_bytes()
}

pub fn builtin_response(status: StatusCode, server_name: &str) -> Response {
    Response::with_body(status, server_name, "text/html; charset=utf-8", builtin_page(status))
}

fn default_message(status: StatusCode) -> &'static str {
    match status.as_u16() {
        400 => "The request could not be understood.",
        403 => "You do not have access to this resource.",
        404 => "The requested resource was not found.",
        405 => "The method is not allowed for this resource.",
        409 => "The resource already exists.",
        411 => "The request must declare its length.",
        413 => "The request body is too large.",
        431 => "The request head is too large.",
        500 => "The server failed to handle the request.",
        501 => "The method is not implemented.",
        502 => "The gateway received an invalid reply.",
        505 => "The HTTP version is not supported.",
        _ => "An error occurred.",
    }
}
