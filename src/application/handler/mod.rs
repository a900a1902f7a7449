//! Renderers that turn a classified request into response bytes.

pub mod autoindex;
pub mod cgi;
pub mod delete;
pub mod error_page_handler;
pub mod redirect;
pub mod static_file;
pub mod upload;

use crate::error::HttpError;
use crate::http::{Request, RequestKind, Response, StatusCode};

pub use cgi::{parse_cgi_output, CgiProcess};

/// Produces headers and body for `resp`, then serializes it.
pub fn render(resp: &mut Response, req: &Request, cgi: Option<&CgiProcess>) -> Result<(), HttpError> {
    match resp.kind() {
        RequestKind::Static => static_file::render(resp),
        RequestKind::Redirect => redirect::render(resp),
        RequestKind::AutoIndex => autoindex::render(resp)?,
        RequestKind::Delete => delete::render(resp)?,
        RequestKind::Upload => upload::render(resp, req)?,
        RequestKind::Cgi => {
            let cgi = cgi.ok_or_else(|| {
                HttpError::protocol(StatusCode::InternalServerError, "cgi response without a process")
            })?;
            let reply = parse_cgi_output(cgi.output())?;
            resp.set_status(reply.status);
            for (name, value) in reply.headers.iter() {
                resp.append_header(name, value);
            }
            resp.set_body(reply.body);
        }
    }
    resp.finalize();
    Ok(())
}
