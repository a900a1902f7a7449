use std::path::Path;

use crate::http::Response;

pub fn mime_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "pdf" => "application/pdf",
        "txt" => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

/// The body was already streamed in by the reactor; only the type is left.
pub fn render(resp: &mut Response) {
    if !resp.headers().contains_key("Content-Type") {
        let mime = mime_for(resp.target());
        resp.insert_header("Content-Type", mime);
    }
}
