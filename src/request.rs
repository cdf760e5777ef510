//! Incoming HTTP request type.

use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::Bytes;
use http::{Extensions, HeaderMap, Method, Uri};

use crate::middleware::request_id::RequestId;

/// An incoming HTTP request with its body already collected.
///
/// The request-scoped value store is [`extensions`](Request::extensions):
/// pipeline stages publish values there (the correlation id, the
/// authenticated character) and handlers read them back by type.
pub struct Request {
    parts: http::request::Parts,
    body: Bytes,
    params: HashMap<String, String>,
    remote_addr: Option<SocketAddr>,
}

impl Request {
    pub(crate) fn new(
        parts: http::request::Parts,
        body: Bytes,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        Self { parts, body, params: HashMap::new(), remote_addr }
    }

    /// Attaches the transport peer address. Mostly useful in tests; the
    /// server sets it for every accepted connection.
    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn method(&self) -> &Method { &self.parts.method }
    pub fn uri(&self) -> &Uri { &self.parts.uri }
    pub fn path(&self) -> &str { self.parts.uri.path() }
    pub fn query(&self) -> &str { self.parts.uri.query().unwrap_or("") }
    pub fn headers(&self) -> &HeaderMap { &self.parts.headers }
    pub fn body(&self) -> &[u8] { &self.body }
    pub fn remote_addr(&self) -> Option<SocketAddr> { self.remote_addr }
    pub fn extensions(&self) -> &Extensions { &self.parts.extensions }
    pub fn extensions_mut(&mut self) -> &mut Extensions { &mut self.parts.extensions }

    /// Header lookup. Returns `None` for absent or non-UTF-8 values.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.parts.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Returns a named path parameter.
    ///
    /// For a route `/routes/{id}`, `req.param("id")` on `/routes/42` returns `Some("42")`.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// The correlation id assigned to this request, once the observer has run.
    pub fn request_id(&self) -> Option<&str> {
        self.parts.extensions.get::<RequestId>().map(RequestId::as_str)
    }

    pub(crate) fn set_params(&mut self, params: HashMap<String, String>) {
        self.params = params;
    }
}

impl<B: Into<Bytes>> From<http::Request<B>> for Request {
    fn from(req: http::Request<B>) -> Self {
        let (parts, body) = req.into_parts();
        Self::new(parts, body.into(), None)
    }
}
