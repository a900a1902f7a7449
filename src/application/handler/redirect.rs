use crate::http::Response;

pub fn render(resp: &mut Response) {
    let status = resp.status();
    let body = match resp.redirect().map(str::to_string) {
        Some(location) => {
            let body = format!(
                "<html><head><title>{status}</title></head>\
                 <body><h1>{status}</h1><p><a href=\"{location}\">{location}</a></p></body></html>"
            );
            resp.insert_header("Location", location);
            body
        }
        None => format!("<html><head><title>{status}</title></head><body><h1>{status}</h1></body></html>"),
    };
    resp.insert_header("Content-Type", "text/html; charset=utf-8");
    resp.set_body(body.into_bytes());
}
