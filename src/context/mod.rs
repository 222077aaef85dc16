//! Per-request context handed to every handler.

use std::net::SocketAddr;

use crate::BoxFuture;
use crate::database::{LeaseBroker, Session};
use crate::handler::HandlerError;
use crate::http::Request;

/// Everything a handler may use while producing one response: the decoded request,
/// the peer address and, when the server has a backend, the lease broker.
pub struct Context {
    request: Request,
    broker: Option<LeaseBroker>,
    peer: Option<SocketAddr>,
}

impl Context {
    pub fn new(request: Request, broker: Option<LeaseBroker>, peer: Option<SocketAddr>) -> Self {
        Self {
            request,
            broker,
            peer,
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn broker(&self) -> Option<&LeaseBroker> {
        self.broker.as_ref()
    }

    /// Decodes the request body as JSON. Malformed input is the client's fault and is
    /// reported as `400`.
    pub fn json<T>(&self) -> Result<T, HandlerError>
    where
        T: serde::de::DeserializeOwned,
    {
        self.request.json().map_err(|err| {
            HandlerError::status_with(
                crate::http::StatusCode::BadRequest,
                format!("invalid JSON body: {err}"),
            )
        })
    }

    /// Leases one backend connection for `work`. See [`LeaseBroker::lease`].
    pub async fn lease<T, F>(&self, work: F) -> Result<T, HandlerError>
    where
        F: for<'c> FnOnce(&'c mut Session) -> BoxFuture<'c, Result<T, HandlerError>>,
    {
        let broker = self.broker.as_ref().ok_or(HandlerError::NoBackend)?;
        broker.lease(work).await
    }

    pub fn into_parts(self) -> (Request, Option<LeaseBroker>) {
        (self.request, self.broker)
    }
}
