//! Incremental request decoder built on [`httparse`].
//!
//! The decoder turns a growing byte buffer into a sequence of [`Event`]s:
//! one `Head`, zero or more `Body` chunks, then one `End`, repeated for every
//! request on the connection. It consumes only what it has decoded, so bytes of a
//! following pipelined request stay in the buffer untouched until asked for.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

use super::{Headers, Method, RequestHead, StatusCode, Version};

/// One parsed unit of an inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Head(RequestHead),
    Body(Bytes),
    End,
}

/// Errors produced while decoding request bytes.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed request: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("request head exceeds maximum allowed size of {max_bytes} bytes")]
    HeadTooLarge { max_bytes: usize },

    #[error("request body of {length} bytes exceeds maximum allowed size of {max_bytes} bytes")]
    BodyTooLarge { length: usize, max_bytes: usize },

    #[error("invalid Content-Length header")]
    InvalidContentLength,

    #[error("value of header {name} is not valid UTF-8")]
    InvalidHeaderValue { name: String },

    #[error("Transfer-Encoding request bodies are not supported")]
    UnsupportedTransferEncoding,
}

impl DecodeError {
    /// The status sent back before the connection is closed.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::HeadTooLarge { .. } | Self::BodyTooLarge { .. } => StatusCode::PayloadTooLarge,
            Self::UnsupportedTransferEncoding => StatusCode::NotImplemented,
            Self::Parse(httparse::Error::Version) => StatusCode::HttpVersionNotSupported,
            _ => StatusCode::BadRequest,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Head,
    Body { remaining: usize },
}

/// Push decoder for HTTP/1.0 and HTTP/1.1 requests with `Content-Length` framing.
///
/// # Examples
///
/// ```
/// use bytes::BytesMut;
/// use rivet::http::{Event, RequestDecoder};
///
/// let mut decoder = RequestDecoder::new(8 * 1024, 1024);
/// let mut buf = BytesMut::from(&b"POST /echo HTTP/1.1\r\nContent-Length: 2\r\n\r\nhi"[..]);
///
/// assert!(matches!(decoder.decode(&mut buf).unwrap(), Some(Event::Head(_))));
/// assert!(matches!(decoder.decode(&mut buf).unwrap(), Some(Event::Body(b)) if &b[..] == b"hi"));
/// assert_eq!(decoder.decode(&mut buf).unwrap(), Some(Event::End));
/// assert_eq!(decoder.decode(&mut buf).unwrap(), None);
/// ```
#[derive(Debug)]
pub struct RequestDecoder {
    state: State,
    version: Option<Version>,
    max_head_bytes: usize,
    max_body_bytes: usize,
}

impl RequestDecoder {
    /// Maximum number of headers accepted per request.
    const MAX_HEADERS: usize = 64;

    pub fn new(max_head_bytes: usize, max_body_bytes: usize) -> Self {
        Self {
            state: State::Head,
            version: None,
            max_head_bytes,
            max_body_bytes,
        }
    }

    /// Version from the request line of the request being decoded, once that line
    /// has been read. Lets a rejection answer in the client's own version.
    pub fn version(&self) -> Option<Version> {
        self.version
    }

    /// Decodes the next event from `buf`, consuming the bytes it covers.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Event>, DecodeError> {
        match self.state {
            State::Head => self.decode_head(buf),
            State::Body { remaining: 0 } => {
                self.state = State::Head;
                Ok(Some(Event::End))
            }
            State::Body { remaining } => {
                if buf.is_empty() {
                    return Ok(None);
                }
                let take = remaining.min(buf.len());
                let chunk = buf.split_to(take).freeze();
                self.state = State::Body {
                    remaining: remaining - take,
                };
                Ok(Some(Event::Body(chunk)))
            }
        }
    }

    fn decode_head(&mut self, buf: &mut BytesMut) -> Result<Option<Event>, DecodeError> {
        let mut raw_headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw = httparse::Request::new(&mut raw_headers);

        self.version = None;
        let parsed = raw.parse(&buf[..]);
        self.version = raw.version.map(Version::from_minor);
        let head_len = match parsed? {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => {
                if buf.len() > self.max_head_bytes {
                    return Err(DecodeError::HeadTooLarge {
                        max_bytes: self.max_head_bytes,
                    });
                }
                return Ok(None);
            }
        };
        if head_len > self.max_head_bytes {
            return Err(DecodeError::HeadTooLarge {
                max_bytes: self.max_head_bytes,
            });
        }

        let method = Method::from(raw.method.ok_or(DecodeError::MissingField { field: "method" })?);
        let uri = raw.path.ok_or(DecodeError::MissingField { field: "path" })?;
        let version = self
            .version
            .ok_or(DecodeError::MissingField { field: "version" })?;

        let mut headers = Headers::with_capacity(raw.headers.len());
        for header in raw.headers.iter() {
            // Framing is decided from these values, so one that cannot be read fails the
            // whole request instead of being skipped.
            let value = std::str::from_utf8(header.value).map_err(|_| {
                DecodeError::InvalidHeaderValue {
                    name: header.name.to_owned(),
                }
            })?;
            headers.append(header.name, value);
        }

        let head = RequestHead::new(method, uri, version).with_headers(headers);
        let length = self.body_length(&head)?;

        buf.advance(head_len);
        self.state = State::Body { remaining: length };
        Ok(Some(Event::Head(head)))
    }

    fn body_length(&self, head: &RequestHead) -> Result<usize, DecodeError> {
        if head.headers().contains("transfer-encoding") {
            return Err(DecodeError::UnsupportedTransferEncoding);
        }

        let mut length = None;
        for value in head.headers().get_all("content-length") {
            let parsed: usize = value
                .trim()
                .parse()
                .map_err(|_| DecodeError::InvalidContentLength)?;
            if length.is_some_and(|previous| previous != parsed) {
                return Err(DecodeError::InvalidContentLength);
            }
            length = Some(parsed);
        }

        let length = length.unwrap_or(0);
        if length > self.max_body_bytes {
            return Err(DecodeError::BodyTooLarge {
                length,
                max_bytes: self.max_body_bytes,
            });
        }
        Ok(length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder() -> RequestDecoder {
        RequestDecoder::new(1024, 64)
    }

    fn drain(decoder: &mut RequestDecoder, buf: &mut BytesMut) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(event) = decoder.decode(buf).unwrap() {
            events.push(event);
        }
        events
    }

    #[test]
    fn get_without_body_is_head_then_end() {
        let mut buf = BytesMut::from(&b"GET /api/ping HTTP/1.1\r\nHost: localhost\r\n\r\n"[..]);
        let mut d = decoder();
        let events = drain(&mut d, &mut buf);
        assert_eq!(events.len(), 2);
        match &events[0] {
            Event::Head(head) => {
                assert_eq!(head.method(), &Method::Get);
                assert_eq!(head.path(), "/api/ping");
                assert_eq!(head.version(), Version::Http11);
                assert_eq!(head.headers().get("host"), Some("localhost"));
            }
            other => panic!("expected head, got {other:?}"),
        }
        assert_eq!(events[1], Event::End);
        assert_eq!(d.version(), Some(Version::Http11));
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_head_waits_for_more() {
        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\nHost:"[..]);
        let mut d = decoder();
        assert_eq!(d.decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 21);

        buf.extend_from_slice(b" x\r\n\r\n");
        assert!(matches!(d.decode(&mut buf).unwrap(), Some(Event::Head(_))));
    }

    #[test]
    fn body_arrives_in_pieces() {
        let mut buf = BytesMut::from(&b"POST /e HTTP/1.1\r\nContent-Length: 5\r\n\r\nhe"[..]);
        let mut d = decoder();
        assert!(matches!(d.decode(&mut buf).unwrap(), Some(Event::Head(_))));
        assert_eq!(
            d.decode(&mut buf).unwrap(),
            Some(Event::Body(Bytes::from_static(b"he")))
        );
        assert_eq!(d.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"llo");
        assert_eq!(
            d.decode(&mut buf).unwrap(),
            Some(Event::Body(Bytes::from_static(b"llo")))
        );
        assert_eq!(d.decode(&mut buf).unwrap(), Some(Event::End));
    }

    #[test]
    fn pipelined_requests_stay_separate() {
        let mut buf = BytesMut::from(
            &b"POST /a HTTP/1.1\r\nContent-Length: 3\r\n\r\nabcGET /b HTTP/1.1\r\n\r\n"[..],
        );
        let mut d = decoder();
        let events = drain(&mut d, &mut buf);
        assert_eq!(events.len(), 5);
        assert_eq!(events[1], Event::Body(Bytes::from_static(b"abc")));
        assert_eq!(events[2], Event::End);
        assert!(matches!(&events[3], Event::Head(h) if h.path() == "/b"));
        assert_eq!(events[4], Event::End);
    }

    #[test]
    fn http10_version_detected() {
        let mut buf = BytesMut::from(&b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n"[..]);
        match decoder().decode(&mut buf).unwrap() {
            Some(Event::Head(head)) => {
                assert_eq!(head.version(), Version::Http10);
                assert!(head.is_keep_alive());
            }
            other => panic!("expected head, got {other:?}"),
        }
    }

    #[test]
    fn garbage_is_bad_request() {
        let mut buf = BytesMut::from(&b"\x01\x02 nonsense\r\n\r\n"[..]);
        let err = decoder().decode(&mut buf).unwrap_err();
        assert_eq!(err.status(), StatusCode::BadRequest);
    }

    #[test]
    fn oversized_head_rejected() {
        let mut d = RequestDecoder::new(32, 64);
        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\nX-Long: aaaaaaaaaaaaaaaaaaaaaaa"[..]);
        let err = d.decode(&mut buf).unwrap_err();
        assert!(matches!(err, DecodeError::HeadTooLarge { max_bytes: 32 }));
        assert_eq!(err.status(), StatusCode::PayloadTooLarge);
    }

    #[test]
    fn oversized_body_rejected() {
        let mut buf = BytesMut::from(&b"POST / HTTP/1.1\r\nContent-Length: 65\r\n\r\n"[..]);
        let err = decoder().decode(&mut buf).unwrap_err();
        assert!(matches!(err, DecodeError::BodyTooLarge { length: 65, .. }));
    }

    #[test]
    fn rejected_head_still_reports_its_version() {
        let mut d = decoder();
        let mut buf = BytesMut::from(&b"POST / HTTP/1.0\r\nContent-Length: 65\r\n\r\n"[..]);
        assert!(d.decode(&mut buf).is_err());
        assert_eq!(d.version(), Some(Version::Http10));

        let mut garbage = BytesMut::from(&b"\x01\x02 nonsense\r\n\r\n"[..]);
        assert!(d.decode(&mut garbage).is_err());
        assert_eq!(d.version(), None);
    }

    #[test]
    fn conflicting_content_lengths_rejected() {
        let mut buf = BytesMut::from(
            &b"POST / HTTP/1.1\r\nContent-Length: 1\r\nContent-Length: 2\r\n\r\n"[..],
        );
        let err = decoder().decode(&mut buf).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidContentLength));
    }

    #[test]
    fn transfer_encoding_not_implemented() {
        let mut buf = BytesMut::from(
            &b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n"[..],
        );
        let err = decoder().decode(&mut buf).unwrap_err();
        assert_eq!(err.status(), StatusCode::NotImplemented);
    }

    #[test]
    fn non_utf8_transfer_encoding_is_rejected() {
        let mut buf = BytesMut::from(
            &b"POST /e HTTP/1.1\r\nTransfer-Encoding: chunked\x80\r\n\r\n\
               GET /b HTTP/1.1\r\n\r\n"[..],
        );
        let err = decoder().decode(&mut buf).unwrap_err();
        assert!(matches!(
            &err,
            DecodeError::InvalidHeaderValue { name } if name == "Transfer-Encoding"
        ));
        assert_eq!(err.status(), StatusCode::BadRequest);
    }

    #[test]
    fn non_utf8_content_length_is_rejected() {
        let mut buf = BytesMut::from(&b"POST /e HTTP/1.1\r\nContent-Length: 3\xff\r\n\r\nabc"[..]);
        let err = decoder().decode(&mut buf).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidHeaderValue { .. }));
    }
}
