//! Response builder.
//!
//! A [`Response`] only describes what to send. Framing headers
//! (`Content-Length`, `Transfer-Encoding`, `Connection`) are decided by the
//! [`ResponseWriter`](super::ResponseWriter) at write time, because they depend on
//! the request they answer.

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;

use super::{Headers, StatusCode};

/// Response payload.
#[derive(Debug)]
pub enum Body {
    /// A body whose length is known up front; written with `Content-Length`.
    Full(Bytes),
    /// A body produced incrementally; each received chunk is written and flushed
    /// as soon as it arrives. The body ends when every sender is dropped.
    Stream(mpsc::Receiver<Bytes>),
}

impl Body {
    pub fn empty() -> Self {
        Body::Full(Bytes::new())
    }

    /// Creates a streamed body and the sender that feeds it.
    ///
    /// `capacity` bounds how many chunks may be queued ahead of the socket; a
    /// producer that gets ahead of a slow client waits on `send`.
    pub fn channel(capacity: usize) -> (mpsc::Sender<Bytes>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Body::Stream(rx))
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, Body::Stream(_))
    }
}

/// An HTTP response, ready to be handed to the writer.
///
/// # Examples
///
/// ```
/// use rivet::http::{Response, StatusCode};
///
/// let response = Response::json(StatusCode::Ok, &serde_json::json!({"ok": true})).unwrap();
/// assert_eq!(response.status(), StatusCode::Ok);
/// assert_eq!(response.headers().get("content-type"), Some("application/json"));
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Body,
}

impl Response {
    /// Creates a response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Body::empty(),
        }
    }

    /// Serializes `value` as compact JSON with object keys in sorted order.
    ///
    /// Going through [`serde_json::Value`] sorts the keys, so payloads are byte-for-byte
    /// stable regardless of struct field order or map iteration order.
    pub fn json<T>(status: StatusCode, value: &T) -> Result<Self, serde_json::Error>
    where
        T: Serialize + ?Sized,
    {
        let value = serde_json::to_value(value)?;
        let body = serde_json::to_vec(&value)?;
        Ok(Self::new(status)
            .header("Content-Type", "application/json")
            .body_bytes(body))
    }

    /// Plain-text response.
    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        Self::new(status)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body)
    }

    /// Appends a header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    #[must_use]
    pub fn body(self, body: impl Into<String>) -> Self {
        self.body_bytes(body.into())
    }

    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Body::Full(body.into());
        self
    }

    /// Replaces the body with a streamed one, see [`Body::channel`].
    #[must_use]
    pub fn streaming(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn body_ref(&self) -> &Body {
        &self.body
    }

    pub fn into_parts(self) -> (StatusCode, Headers, Body) {
        (self.status, self.headers, self.body)
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}
