//! Response serialization onto an [`AsyncWrite`] transport.
//!
//! The writer mirrors the transport boundary one call at a time:
//! [`write_head`](ResponseWriter::write_head), any number of
//! [`write_body_chunk`](ResponseWriter::write_body_chunk), then
//! [`write_end`](ResponseWriter::write_end). [`send`](ResponseWriter::send) runs all
//! three for a complete [`Response`]. Every call awaits `write_all` and `flush`, so a
//! slow reader slows the producer down instead of growing a buffer.

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::{Body, Headers, Method, RequestHead, Response, StatusCode, Version};

/// How the body of the response in progress is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    /// `Content-Length` was written; body bytes are copied as-is.
    Length,
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// HTTP/1.0 stream: the body ends when the connection closes.
    CloseDelimited,
    /// `HEAD` request or a status that forbids a body: nothing is written.
    Suppressed,
}

/// Adds a `Connection` header mirroring the request's keep-alive intent, unless the
/// response already chose one.
///
/// - response already says `keep-alive` or `close`: left untouched;
/// - HTTP/1.0 request asking for keep-alive: `Connection: keep-alive`;
/// - HTTP/1.1 request asking to close: `Connection: close`;
/// - anything else: no header, the protocol default applies.
pub fn apply_connection_policy(request: &RequestHead, headers: &mut Headers) {
    if headers.has_token("connection", "keep-alive") || headers.has_token("connection", "close") {
        return;
    }

    match (request.is_keep_alive(), request.version()) {
        (true, Version::Http10) => headers.append("Connection", "keep-alive"),
        (false, Version::Http11) => headers.append("Connection", "close"),
        _ => {}
    }
}

/// Writes responses for one connection.
///
/// # Examples
///
/// ```
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> std::io::Result<()> {
/// use rivet::http::{Method, RequestHead, Response, ResponseWriter, StatusCode, Version};
///
/// let request = RequestHead::new(Method::Get, "/", Version::Http11);
/// let mut out = Vec::new();
/// let keep_alive = ResponseWriter::new(&mut out)
///     .send(&request, Response::text(StatusCode::Ok, "hi"), true)
///     .await?;
///
/// assert!(keep_alive);
/// assert!(out.starts_with(b"HTTP/1.1 200 OK\r\n"));
/// assert!(out.ends_with(b"\r\n\r\nhi"));
/// # Ok(())
/// # }
/// ```
pub struct ResponseWriter<'io, W> {
    io: &'io mut W,
    framing: Option<Framing>,
    keep_alive: bool,
}

impl<'io, W> ResponseWriter<'io, W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(io: &'io mut W) -> Self {
        Self {
            io,
            framing: None,
            keep_alive: false,
        }
    }

    /// Writes and flushes the status line and headers.
    ///
    /// `keep_alive` is the connection's current intent; the returned value from
    /// [`write_end`](Self::write_end) may be narrower if the response forces a close.
    pub async fn write_head(
        &mut self,
        request: &RequestHead,
        status: StatusCode,
        mut headers: Headers,
        body: &Body,
        keep_alive: bool,
    ) -> io::Result<()> {
        let head_only = request.method() == &Method::Head || status.forbids_body();

        let framing = match body {
            Body::Full(bytes) => {
                headers.remove("transfer-encoding");
                if status.forbids_body() {
                    headers.remove("content-length");
                } else {
                    headers.set("Content-Length", bytes.len().to_string());
                }
                if head_only { Framing::Suppressed } else { Framing::Length }
            }
            Body::Stream(_) => {
                headers.remove("content-length");
                match request.version() {
                    _ if head_only => Framing::Suppressed,
                    Version::Http11 => {
                        headers.set("Transfer-Encoding", "chunked");
                        Framing::Chunked
                    }
                    Version::Http10 => {
                        headers.set("Connection", "close");
                        Framing::CloseDelimited
                    }
                }
            }
        };

        apply_connection_policy(request, &mut headers);

        self.keep_alive = keep_alive
            && framing != Framing::CloseDelimited
            && !headers.has_token("connection", "close");
        self.framing = Some(framing);

        let mut buf = BytesMut::with_capacity(128 + headers.len() * 64);
        buf.put(
            format!(
                "{} {} {}\r\n",
                request.version(),
                status.as_u16(),
                status.canonical_reason()
            )
            .as_bytes(),
        );
        buf.put(headers.to_string().as_bytes());
        buf.put(&b"\r\n"[..]);

        self.io.write_all(&buf).await?;
        self.io.flush().await
    }

    /// Writes and flushes one piece of body.
    pub async fn write_body_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        match self.framing {
            None => Err(io::Error::other("response body written before head")),
            Some(Framing::Suppressed) => Ok(()),
            // An empty chunk would read as the terminator.
            Some(Framing::Chunked) if chunk.is_empty() => Ok(()),
            Some(Framing::Chunked) => {
                let mut buf = BytesMut::with_capacity(chunk.len() + 12);
                buf.put(format!("{:x}\r\n", chunk.len()).as_bytes());
                buf.put(chunk);
                buf.put(&b"\r\n"[..]);
                self.io.write_all(&buf).await?;
                self.io.flush().await
            }
            Some(Framing::Length | Framing::CloseDelimited) => {
                self.io.write_all(chunk).await?;
                self.io.flush().await
            }
        }
    }

    /// Writes the terminal marker and returns whether the connection may be reused.
    pub async fn write_end(&mut self) -> io::Result<bool> {
        match self.framing.take() {
            None => Err(io::Error::other("response ended before head")),
            Some(Framing::Chunked) => {
                self.io.write_all(b"0\r\n\r\n").await?;
                self.io.flush().await?;
                Ok(self.keep_alive)
            }
            Some(_) => {
                self.io.flush().await?;
                Ok(self.keep_alive)
            }
        }
    }

    /// Writes a complete response: head, every body chunk, then the end marker.
    pub async fn send(
        &mut self,
        request: &RequestHead,
        response: Response,
        keep_alive: bool,
    ) -> io::Result<bool> {
        let (status, headers, body) = response.into_parts();
        self.write_head(request, status, headers, &body, keep_alive)
            .await?;

        match body {
            Body::Full(bytes) => self.write_body_chunk(&bytes).await?,
            Body::Stream(mut rx) => {
                if self.framing == Some(Framing::Suppressed) {
                    drop(rx);
                } else {
                    while let Some(chunk) = rx.recv().await {
                        self.write_body_chunk(&chunk).await?;
                    }
                }
            }
        }

        self.write_end().await
    }

    /// Answers a request that could not be decoded and must not be reused.
    ///
    /// `version` is the client's version when its request line was readable.
    pub async fn reject(
        &mut self,
        version: Option<Version>,
        status: StatusCode,
        reason: &str,
    ) -> io::Result<()> {
        let version = version.unwrap_or(Version::Http11);
        let body = Bytes::copy_from_slice(reason.as_bytes());
        let mut buf = BytesMut::with_capacity(128 + body.len());
        buf.put(
            format!(
                "{} {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                version.as_str(),
                status.as_u16(),
                status.canonical_reason(),
                body.len()
            )
            .as_bytes(),
        );
        buf.put(body);
        self.io.write_all(&buf).await?;
        self.io.flush().await
    }
}
