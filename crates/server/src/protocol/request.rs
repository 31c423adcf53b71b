//! Inbound request line and headers.
//!
//! [`RequestHeader`] wraps a bodyless `http::Request` so transports can hand
//! over whatever they parsed without the state machines depending on any
//! particular wire format.

use http::request::Parts;
use http::{HeaderMap, Method, Request, Uri, Version};

use crate::ServerError;

/// The head of an inbound HTTP request or WebSocket upgrade.
#[derive(Debug)]
pub struct RequestHeader {
    inner: Request<()>,
}

impl AsRef<Request<()>> for RequestHeader {
    fn as_ref(&self) -> &Request<()> {
        &self.inner
    }
}

impl RequestHeader {
    /// Builds a header from a method and a URI string, rejecting URIs that do not parse.
    pub fn new(method: Method, uri: &str) -> Result<Self, ServerError> {
        let uri = uri.parse::<Uri>().map_err(|e| ServerError::invalid_argument(format!("invalid uri {uri:?}: {e}")))?;
        let mut inner = Request::new(());
        *inner.method_mut() = method;
        *inner.uri_mut() = uri;
        Ok(Self { inner })
    }

    /// Appends a header, rejecting names or values that are not valid HTTP.
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self, ServerError> {
        let name = http::HeaderName::from_bytes(name.as_bytes()).map_err(ServerError::invalid_argument)?;
        let value = http::HeaderValue::from_str(value).map_err(ServerError::invalid_argument)?;
        self.inner.headers_mut().append(name, value);
        Ok(self)
    }

    /// Consumes the header, returning the wrapped `http::Request`.
    pub fn into_inner(self) -> Request<()> {
        self.inner
    }

    /// Returns a reference to the request's HTTP method.
    pub fn method(&self) -> &Method {
        self.inner.method()
    }

    /// Returns a reference to the request's URI.
    pub fn uri(&self) -> &Uri {
        self.inner.uri()
    }

    /// Returns the path component of the request's URI.
    pub fn path(&self) -> &str {
        self.inner.uri().path()
    }

    /// Returns the request's HTTP version.
    pub fn version(&self) -> Version {
        self.inner.version()
    }

    /// Returns a reference to the request's headers.
    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    /// The first value of header `name`, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.inner.headers().get(name).and_then(|v| v.to_str().ok())
    }
}

impl From<Parts> for RequestHeader {
    #[inline]
    fn from(parts: Parts) -> Self {
        Self { inner: Request::from_parts(parts, ()) }
    }
}

impl From<Request<()>> for RequestHeader {
    #[inline]
    fn from(inner: Request<()>) -> Self {
        Self { inner }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_from_method_and_uri() {
        let header = RequestHeader::new(Method::POST, "/upload?x=1").unwrap().with_header("X-Test", "1").unwrap();
        assert_eq!(header.method(), Method::POST);
        assert_eq!(header.path(), "/upload");
        assert_eq!(header.uri().query(), Some("x=1"));
        assert_eq!(header.header("x-test"), Some("1"));
        assert_eq!(header.header("missing"), None);
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(matches!(RequestHeader::new(Method::GET, "http://[::1"), Err(ServerError::InvalidArgument { .. })));
        let header = RequestHeader::new(Method::GET, "/").unwrap();
        assert!(header.with_header("bad name", "v").is_err());
    }

    #[test]
    fn converts_from_http_request() {
        let request = Request::builder().method(Method::PUT).uri("/a/b").body(()).unwrap();
        let header = RequestHeader::from(request);
        assert_eq!(header.method(), Method::PUT);
        assert_eq!(header.into_inner().uri().path(), "/a/b");
    }
}
