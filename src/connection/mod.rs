//! Per-connection request/response state machine.
//!
//! ```text
//!            receive_head            receive_end
//!   Idle ─────────────────▶ ReceivingBody ─────────▶ SendingResponse
//!    ▲                          │                          │
//!    │     complete_response    │ half_close               │ complete_response
//!    └──────(keep-alive)────────┼──────────────────────────┤ (not keep-alive)
//!                               ▼                          ▼
//!                             Closed ◀─────────────────────┘
//! ```
//!
//! The machine does no I/O. The server's connection driver feeds it decoder events
//! and asks it for permission before writing. Every transition checks the current
//! phase and returns a [`ProtocolViolation`] instead of moving when called out of
//! order, so a misbehaving collaborator is reported rather than silently absorbed.

use std::fmt;

use bytes::BytesMut;
use thiserror::Error;

use crate::http::{Request, RequestHead};

/// Where a connection is in its request/response cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for the next request head.
    Idle,
    /// Head received; accumulating body until `end`.
    ReceivingBody,
    /// Request complete; handler running and/or response being written.
    SendingResponse,
    /// No further requests will be read and no further responses written.
    Closed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Idle => "idle",
            Phase::ReceivingBody => "receiving-body",
            Phase::SendingResponse => "sending-response",
            Phase::Closed => "closed",
        })
    }
}

/// An event arrived, or a write was attempted, in a phase that does not allow it.
///
/// This is never a client error: the decoder only produces well-ordered events, so a
/// violation means a bug in the server or its transport. The driver logs it and
/// drops the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{operation} is not allowed while {phase}")]
pub struct ProtocolViolation {
    pub operation: &'static str,
    pub phase: Phase,
}

/// What the driver should do after a half-close from the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalfClose {
    /// No response is owed; close the transport now.
    CloseNow,
    /// A response is in progress; finish it, then close.
    FinishThenClose,
}

/// What the driver should do after a response has been fully written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Wait for the next request on the same transport.
    KeepAlive,
    /// Close the transport; the flush has already completed.
    Close,
}

/// State for one accepted transport stream.
///
/// # Examples
///
/// ```
/// use rivet::connection::{Connection, Disposition, Phase};
/// use rivet::http::{Method, RequestHead, Version};
///
/// let mut conn = Connection::new();
/// conn.receive_head(RequestHead::new(Method::Post, "/echo", Version::Http11)).unwrap();
/// conn.receive_body(b"hi").unwrap();
/// let request = conn.receive_end().unwrap();
/// assert_eq!(&request.body()[..], b"hi");
/// assert_eq!(conn.phase(), Phase::SendingResponse);
///
/// conn.begin_response().unwrap();
/// assert_eq!(conn.complete_response(true).unwrap(), Disposition::KeepAlive);
/// assert_eq!(conn.phase(), Phase::Idle);
/// ```
#[derive(Debug)]
pub struct Connection {
    phase: Phase,
    head: Option<RequestHead>,
    body: BytesMut,
    keep_alive: bool,
    requests_served: u64,
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            head: None,
            body: BytesMut::new(),
            keep_alive: false,
            requests_served: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Whether the transport will be reused after the current response.
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Number of responses completed on this connection.
    pub fn requests_served(&self) -> u64 {
        self.requests_served
    }

    /// `Idle → ReceivingBody`. Resets every per-request accumulator.
    pub fn receive_head(&mut self, head: RequestHead) -> Result<(), ProtocolViolation> {
        self.expect(Phase::Idle, "request head")?;
        self.keep_alive = head.is_keep_alive();
        self.head = Some(head);
        self.body.clear();
        self.phase = Phase::ReceivingBody;
        Ok(())
    }

    /// Appends a body chunk. Only legal in `ReceivingBody`.
    pub fn receive_body(&mut self, chunk: &[u8]) -> Result<(), ProtocolViolation> {
        self.expect(Phase::ReceivingBody, "request body")?;
        self.body.extend_from_slice(chunk);
        Ok(())
    }

    /// `ReceivingBody → SendingResponse`. Yields the finished, immutable request.
    pub fn receive_end(&mut self) -> Result<Request, ProtocolViolation> {
        self.expect(Phase::ReceivingBody, "request end")?;
        let head = self.head.take().ok_or(ProtocolViolation {
            operation: "request end without head",
            phase: self.phase,
        })?;
        let body = self.body.split().freeze();
        self.phase = Phase::SendingResponse;
        Ok(Request::new(head, body))
    }

    /// Checks that a response may be written now.
    pub fn begin_response(&self) -> Result<(), ProtocolViolation> {
        self.expect(Phase::SendingResponse, "response write")
    }

    /// Marks the response as fully handed to the transport.
    ///
    /// `response_keep_alive` is the writer's verdict (it is `false` when the response
    /// itself forced a close). Moves to `Idle` when both sides still want a persistent
    /// connection, otherwise to `Closed`.
    pub fn complete_response(
        &mut self,
        response_keep_alive: bool,
    ) -> Result<Disposition, ProtocolViolation> {
        self.expect(Phase::SendingResponse, "response completion")?;
        self.requests_served += 1;
        if self.keep_alive && response_keep_alive {
            self.phase = Phase::Idle;
            Ok(Disposition::KeepAlive)
        } else {
            self.keep_alive = false;
            self.phase = Phase::Closed;
            Ok(Disposition::Close)
        }
    }

    /// The peer stopped sending.
    pub fn half_close(&mut self) -> HalfClose {
        match self.phase {
            Phase::SendingResponse => {
                self.keep_alive = false;
                HalfClose::FinishThenClose
            }
            Phase::Idle | Phase::ReceivingBody | Phase::Closed => {
                self.close();
                HalfClose::CloseNow
            }
        }
    }

    /// Unconditionally closes, dropping any partial request.
    pub fn close(&mut self) {
        self.phase = Phase::Closed;
        self.keep_alive = false;
        self.head = None;
        self.body.clear();
    }

    fn expect(&self, phase: Phase, operation: &'static str) -> Result<(), ProtocolViolation> {
        if self.phase == phase {
            Ok(())
        } else {
            Err(ProtocolViolation {
                operation,
                phase: self.phase,
            })
        }
    }
}
