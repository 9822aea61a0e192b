//! HTTP request/response values seen by the engine

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode, Uri};

/// Default port for a URI scheme
#[must_use]
pub fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        s if s.eq_ignore_ascii_case("http") => Some(80),
        s if s.eq_ignore_ascii_case("https") => Some(443),
        _ => None,
    }
}

/// An intercepted request with an absolute target URI
///
/// The engine only ever reads a `Request`; forwarded copies are built from it.
#[derive(Debug, Clone)]
pub struct Request {
    /// HTTP method
    pub method: Method,
    /// Absolute target URI
    pub uri: Uri,
    /// Request headers (case-insensitive, multi-valued)
    pub headers: HeaderMap,
    /// Request body, possibly empty
    pub body: Bytes,
}

impl Request {
    /// Create a request with no headers and an empty body
    #[must_use]
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Append a header value
    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Replace the body
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Destination as `host:port`, using the scheme's default port when none is given
    #[must_use]
    pub fn destination(&self) -> Option<String> {
        let host = self.uri.host()?;
        let port = self
            .uri
            .port_u16()
            .or_else(|| self.uri.scheme_str().and_then(default_port))?;
        Some(format!("{host}:{port}"))
    }
}

/// A response, either from the real upstream or rebuilt from a recording
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// HTTP status code
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Response body
    pub body: Bytes,
}

impl Response {
    /// Create a response with no headers
    #[must_use]
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// Append a header value
    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }
}
