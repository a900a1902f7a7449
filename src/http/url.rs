use crate::error::HttpError;

pub const DEFAULT_SCHEME: &str = "http";

/// Parsed request target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Url {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    /// True when the target carried its own `//host[:port]`.
    pub has_authority: bool,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub query_raw: String,
    pub fragment: String,
}

impl Url {
    /// Parses origin-form (`/path?q#f`) and absolute-form
    /// (`http://host:port/path`) targets. Only `%20` is percent-decoded.
    pub fn parse(target: &str, default_port: u16) -> Result<Self, HttpError> {
        let decoded = target.replace("%20", " ");
        let mut url = Url {
            scheme: DEFAULT_SCHEME.to_string(),
            port: default_port,
            ..Url::default()
        };

        let mut rest = decoded.as_str();
        if !rest.starts_with('/') {
            let (scheme, after) = rest
                .split_once(':')
                .ok_or_else(|| HttpError::bad_request(format!("bad format URL: {target}")))?;
            if !scheme.eq_ignore_ascii_case(DEFAULT_SCHEME) {
                return Err(HttpError::bad_request(format!("unsupported scheme: {scheme}")));
            }
            rest = after;
        }

        if let Some(after) = rest.strip_prefix("//") {
            let end = after.find('/').unwrap_or(after.len());
            if end == 0 {
                return Err(HttpError::bad_request(format!("bad format URL: {target}")));
            }
            url.set_host_port(&after[..end], default_port)?;
            url.has_authority = true;
            rest = &after[end..];
        }

        if !rest.starts_with('/') {
            return Err(HttpError::bad_request(format!("missing path in URL: {target}")));
        }

        let (before_fragment, fragment) = match rest.split_once('#') {
            Some((p, f)) => (p, Some(f)),
            None => (rest, None),
        };
        let (path, query) = match before_fragment.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (before_fragment, None),
        };
        url.path = path.to_string();
        if let Some(query) = query {
            url.query = parse_query(query)?;
            url.query_raw = query.to_string();
        }
        if let Some(fragment) = fragment {
            url.fragment = fragment.to_string();
        }
        Ok(url)
    }

    /// `host[:port]`; an empty or missing port keeps the default.
    pub fn set_host_port(&mut self, authority: &str, default_port: u16) -> Result<(), HttpError> {
        match authority.split_once(':') {
            Some((host, port)) => {
                self.host = host.to_string();
                self.port = if port.is_empty() {
                    default_port
                } else {
                    port.parse()
                        .map_err(|_| HttpError::bad_request(format!("invalid port format: {port}")))?
                };
            }
            None => {
                self.host = authority.to_string();
                self.port = default_port;
            }
        }
        Ok(())
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}

fn parse_query(raw: &str) -> Result<Vec<(String, String)>, HttpError> {
    if raw.is_empty() {
        return Err(HttpError::bad_request("empty query"));
    }
    raw.split('&')
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| HttpError::bad_request(format!("invalid query: {pair}")))?;
            if key.is_empty() {
                return Err(HttpError::bad_request(format!("invalid query: {pair}")));
            }
            Ok((key.to_string(), value.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::StatusCode;

    fn bad(target: &str) -> bool {
        matches!(
            Url::parse(target, 8080),
            Err(HttpError::Protocol { status: StatusCode::BadRequest, .. })
        )
    }

    #[test]
    fn origin_form_with_query_and_fragment() {
        let url = Url::parse("/search%20me?q=rust&page=2#top", 8080).unwrap();
        assert_eq!(url.scheme, "http");
        assert_eq!(url.path, "/search me");
        assert_eq!(url.query_raw, "q=rust&page=2");
        assert_eq!(url.query_value("page"), Some("2"));
        assert_eq!(url.fragment, "top");
        assert!(!url.has_authority);
        assert_eq!(url.port, 8080);
    }

    #[test]
    fn absolute_form() {
        let url = Url::parse("HTTP://example.com:9000/a/b?x=", 8080).unwrap();
        assert!(url.has_authority);
        assert_eq!(url.host, "example.com");
        assert_eq!(url.port, 9000);
        assert_eq!(url.path, "/a/b");
        assert_eq!(url.query, vec![("x".to_string(), String::new())]);

        let url = Url::parse("http://example.com:/index.html", 8080).unwrap();
        assert_eq!(url.port, 8080);
        let url = Url::parse("http://example.com/", 81).unwrap();
        assert_eq!(url.port, 81);
    }

    #[test]
    fn rejects_malformed_targets() {
        assert!(bad("https://example.com/"));
        assert!(bad("ftp:/file"));
        assert!(bad("http://example.com"));
        assert!(bad("http:///path"));
        assert!(bad("index.html"));
        assert!(bad("/a?"));
        assert!(bad("/a?novalue"));
        assert!(bad("/a?=v"));
        assert!(bad("/a?k=v&"));
        assert!(bad("http://host:port/"));
    }

    #[test]
    fn scheme_without_authority() {
        let url = Url::parse("http:/plain", 8080).unwrap();
        assert_eq!(url.path, "/plain");
        assert!(!url.has_authority);
    }
}
