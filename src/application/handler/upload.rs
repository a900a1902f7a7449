use std::fs;
use std::io;
use std::path::Path;

use tracing::info;

use crate::error::HttpError;
use crate::http::{Request, Response, StatusCode};

/// Stores the request body: every file part of a multipart body when the
/// target is a directory, the raw body when it is a file path.
pub fn render(resp: &mut Response, req: &Request) -> Result<(), HttpError> {
    let target = resp.target().to_path_buf();
    let mut stored = Vec::new();

    if target.is_dir() {
        let content_type = req.header("Content-Type").unwrap_or_default();
        let boundary = boundary_of(content_type).ok_or_else(|| {
            HttpError::protocol(
                StatusCode::UnsupportedMediaType,
                format!("directory uploads need multipart/form-data, got {content_type}"),
            )
        })?;
        let parts = parse_multipart(&boundary, req.body())
            .ok_or_else(|| HttpError::bad_request("malformed multipart body"))?;
        if parts.is_empty() {
            return Err(HttpError::bad_request("multipart body carries no file"));
        }
        for (filename, data) in parts {
            let name = sanitize(&filename)
                .ok_or_else(|| HttpError::bad_request(format!("bad upload name: {filename}")))?;
            write(&target.join(name), data)?;
            stored.push(name.to_string());
        }
    } else {
        write(&target, req.body())?;
        stored.push(target.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default());
    }

    info!(path = %target.display(), files = stored.len(), bytes = req.body().len(), "upload stored");
    let mut html = String::from("<html><body><h1>Upload complete</h1><ul>");
    for name in &stored {
        html.push_str(&format!("<li>{name}</li>"));
    }
    html.push_str("</ul></body></html>");
    resp.set_status(StatusCode::Created);
    resp.insert_header("Content-Type", "text/html; charset=utf-8");
    resp.set_body(html.into_bytes());
    Ok(())
}

fn write(path: &Path, data: &[u8]) -> Result<(), HttpError> {
    fs::write(path, data).map_err(|e| {
        let status = match e.kind() {
            io::ErrorKind::PermissionDenied => StatusCode::Forbidden,
            io::ErrorKind::NotFound => StatusCode::NotFound,
            _ => StatusCode::InternalServerError,
        };
        HttpError::protocol(status, format!("store {}: {e}", path.display()))
    })
}

fn boundary_of(content_type: &str) -> Option<String> {
    if !content_type.trim_start().to_ascii_lowercase().starts_with("multipart/form-data") {
        return None;
    }
    let raw = content_type.split("boundary=").nth(1)?;
    let raw = raw.split(';').next()?.trim().trim_matches('"');
    if raw.is_empty() {
        return None;
    }
    Some(format!("--{raw}"))
}

/// Base name only; anything that could escape the target directory is refused.
fn sanitize(filename: &str) -> Option<&str> {
    let name = filename.rsplit(['/', '\\']).next()?;
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }
    Some(name)
}

/// File parts of a multipart body as `(filename, data)`. `None` when the
/// framing is broken.
fn parse_multipart<'a>(boundary: &str, body: &'a [u8]) -> Option<Vec<(String, &'a [u8])>> {
    let delimiter = format!("\r\n{boundary}");
    let delimiter_bytes = delimiter.as_bytes();
    let boundary_bytes = boundary.as_bytes();

    let start_offset = twoway::find_bytes(body, boundary_bytes)? + boundary_bytes.len();
    if body.get(start_offset..start_offset + 2) != Some(b"\r\n") {
        return None;
    }

    let mut parts = Vec::new();
    let mut current_pos = start_offset + 2;
    loop {
        let end_of_part = current_pos + twoway::find_bytes(&body[current_pos..], delimiter_bytes)?;
        let part_data = &body[current_pos..end_of_part];

        let header_end = twoway::find_bytes(part_data, b"\r\n\r\n")?;
        let headers = std::str::from_utf8(&part_data[..header_end]).ok()?;
        let content = &part_data[header_end + 4..];
        let filename = headers
            .lines()
            .filter(|line| line.to_ascii_lowercase().starts_with("content-disposition:"))
            .find_map(|line| line.split("filename=").nth(1))
            .map(|v| v.trim().trim_matches('"').to_string())
            .filter(|v| !v.is_empty());
        if let Some(filename) = filename {
            parts.push((filename, content));
        }

        current_pos = end_of_part + delimiter_bytes.len();
        match body.get(current_pos..current_pos + 2) {
            Some(b"--") => return Some(parts),
            Some(b"\r\n") => current_pos += 2,
            _ => return None,
        }
    }
}
