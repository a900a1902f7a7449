use std::fs;
use std::io;

use tracing::info;

use crate::error::HttpError;
use crate::http::{Response, StatusCode};

pub fn render(resp: &mut Response) -> Result<(), HttpError> {
    match fs::remove_file(resp.target()) {
        Ok(()) => {
            info!(path = %resp.target().display(), "file deleted");
            resp.set_status(StatusCode::Ok);
            resp.insert_header("Content-Type", "text/html; charset=utf-8");
            let body = format!("<html><body><h1>File deleted</h1><p>{}</p></body></html>", resp.request_path());
            resp.set_body(body.into_bytes());
            Ok(())
        }
        Err(e) => {
            let status = match e.kind() {
                io::ErrorKind::NotFound => StatusCode::NotFound,
                io::ErrorKind::PermissionDenied => StatusCode::Forbidden,
                _ => StatusCode::InternalServerError,
            };
            Err(HttpError::protocol(status, format!("delete {}: {e}", resp.target().display())))
        }
    }
}
