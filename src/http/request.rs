//! Parsed request head and the immutable request handed to handlers.

use bytes::Bytes;

use super::{Headers, Method, Version};

/// The request line plus headers, as delivered by the decoder's `Head` event.
///
/// # Examples
///
/// ```
/// use rivet::http::{Method, RequestHead, Version};
///
/// let head = RequestHead::new(Method::Get, "/search?q=rust", Version::Http11);
/// assert_eq!(head.path(), "/search");
/// assert_eq!(head.query_param("q"), Some("rust"));
/// assert!(head.is_keep_alive());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    method: Method,
    uri: String,
    path: String,
    query: Option<String>,
    version: Version,
    headers: Headers,
}

impl RequestHead {
    /// Builds a head from a raw request target; the query string is split off the path.
    pub fn new(method: Method, uri: impl Into<String>, version: Version) -> Self {
        let uri = uri.into();
        let (path, query) = match uri.split_once('?') {
            Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
            None => (uri.clone(), None),
        };
        Self {
            method,
            uri,
            path,
            query,
            version,
            headers: Headers::new(),
        }
    }

    #[must_use]
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request target exactly as received, query string included.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// The request path without the query string. This is the routing key.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Looks up one `key=value` pair in the query string. Values are returned
    /// undecoded.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query
            .as_deref()?
            .split('&')
            .filter_map(|pair| pair.split_once('=').or(Some((pair, ""))))
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Whether the client asked for a persistent connection.
    ///
    /// HTTP/1.0 is persistent only with an explicit `Connection: keep-alive`;
    /// HTTP/1.1 is persistent unless `Connection: close` is present.
    pub fn is_keep_alive(&self) -> bool {
        match self.version {
            Version::Http10 => self.headers.has_token("connection", "keep-alive"),
            Version::Http11 => !self.headers.has_token("connection", "close"),
        }
    }
}

/// A complete request: head plus the body accumulated until `end`.
///
/// Built only by the connection state machine, and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct Request {
    head: RequestHead,
    body: Bytes,
}

impl Request {
    pub fn new(head: RequestHead, body: Bytes) -> Self {
        Self { head, body }
    }

    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    pub fn method(&self) -> &Method {
        self.head.method()
    }

    pub fn path(&self) -> &str {
        self.head.path()
    }

    pub fn version(&self) -> Version {
        self.head.version()
    }

    pub fn headers(&self) -> &Headers {
        self.head.headers()
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Deserializes the body as JSON.
    pub fn json<T>(&self) -> Result<T, serde_json::Error>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_slice(&self.body)
    }
}
