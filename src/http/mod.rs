pub mod chunked;
pub mod headers;
pub mod method;
pub mod parser;
pub mod request;
pub mod response;
pub mod serializer;
pub mod status;
pub mod url;

#[cfg(test)]
mod tests;

pub use chunked::{decode_chunked, ChunkedDecoder};
pub use headers::Headers;
pub use method::Method;
pub use request::{Limits, ParseState, Request, RequestKind};
pub use response::Response;
pub use status::StatusCode;
pub use url::Url;
