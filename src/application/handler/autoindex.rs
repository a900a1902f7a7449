use std::fs;

use crate::error::HttpError;
use crate::http::{Response, StatusCode};

/// Sorted HTML listing of the target directory, directories first.
pub fn render(resp: &mut Response) -> Result<(), HttpError> {
    let entries = fs::read_dir(resp.target()).map_err(|e| {
        HttpError::protocol(StatusCode::InternalServerError, format!("listing {}: {e}", resp.target().display()))
    })?;
    let mut names: Vec<(bool, String)> = entries
        .filter_map(Result::ok)
        .map(|entry| {
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            (!is_dir, entry.file_name().to_string_lossy().into_owned())
        })
        .collect();
    names.sort();

    let req_path = resp.request_path();
    let base = req_path.trim_end_matches('/');
    let mut html = format!(
        "<html><head><title>Index of {req_path}</title></head><body><h1>Index of {req_path}</h1><hr><ul>"
    );
    if !base.is_empty() {
        html.push_str("<li><a href=\"../\">../</a></li>");
    }
    for (is_file, name) in names {
        let slash = if is_file { "" } else { "/" };
        html.push_str(&format!("<li><a href=\"{base}/{name}{slash}\">{name}{slash}</a></li>"));
    }
    html.push_str("</ul><hr></body></html>");

    resp.set_status(StatusCode::Ok);
    resp.insert_header("Content-Type", "text/html; charset=utf-8");
    resp.set_body(html.into_bytes());
    Ok(())
}
