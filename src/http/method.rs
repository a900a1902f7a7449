use std::fmt;

use crate::error::HttpError;
use crate::http::StatusCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Delete,
}

impl Method {
    /// Known-but-unsupported methods fail with 501, anything else with 400.
    pub fn parse(s: &str) -> Result<Self, HttpError> {
        match s {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "DELETE" => Ok(Method::Delete),
            "HEAD" | "PUT" | "PATCH" | "OPTIONS" | "CONNECT" | "TRACE" => Err(HttpError::protocol(
                StatusCode::NotImplemented,
                format!("unsupported HTTP method: {s}"),
            )),
            _ => Err(HttpError::bad_request(format!("unknown HTTP method: {s}"))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Delete => "DELETE",
        }
    }

    /// Methods that must declare a body.
    pub fn carries_body(self) -> bool {
        self == Method::Post
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
