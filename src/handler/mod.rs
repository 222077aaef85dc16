//! Handler execution contract.
//!
//! A handler receives a [`Context`] and produces either a [`Response`] or a
//! [`HandlerError`]. Errors are turned into responses here, in one place, so every
//! failure maps to the same status for the same cause:
//!
//! | Error                                  | Status |
//! |----------------------------------------|--------|
//! | [`HandlerError::Status`]               | as given |
//! | pool exhausted or not ready            | 503    |
//! | anything else                          | 500    |

use std::future::Future;
use std::sync::Arc;

use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

use crate::BoxFuture;
use crate::context::Context;
use crate::database::{BackendError, PoolError};
use crate::http::{Response, StatusCode};

/// What a handler returns.
pub type HandlerResult = Result<Response, HandlerError>;

/// Type-erased handler stored in the route table and shared across connection tasks.
pub type Handler =
    Arc<dyn Fn(Context) -> BoxFuture<'static, HandlerResult> + Send + Sync + 'static>;

/// Failures a handler can report.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// No pooled connection could be leased.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// The leased connection's unit of work failed.
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("failed to encode response: {0}")]
    Json(#[from] serde_json::Error),

    /// The handler needs a backend but the server was started without one.
    #[error("no backend is configured")]
    NoBackend,

    /// A failure with a status chosen by the handler. `message` is sent to the client.
    #[error("{message}")]
    Status { status: StatusCode, message: String },

    #[error("{0}")]
    Internal(String),
}

impl HandlerError {
    pub fn status_with(status: StatusCode, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Status { status, .. } => *status,
            Self::Pool(PoolError::Exhausted { .. } | PoolError::NotReady(_)) => {
                StatusCode::ServiceUnavailable
            }
            Self::Pool(_)
            | Self::Backend(_)
            | Self::Json(_)
            | Self::NoBackend
            | Self::Internal(_) => StatusCode::InternalServerError,
        }
    }

    /// Renders the error as a JSON `{"error": ...}` body.
    ///
    /// Only handler-chosen messages reach the client; other failures are described by
    /// their status alone.
    pub fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            Self::Status { message, .. } => message,
            _ if status == StatusCode::ServiceUnavailable => "server busy".to_owned(),
            _ => status.canonical_reason().to_ascii_lowercase(),
        };
        Response::json(status, &json!({ "error": message }))
            .unwrap_or_else(|_| Response::text(status, message))
    }
}

/// Erases a concrete async handler into a [`Handler`].
pub fn into_handler<H, Fut>(handler: H) -> Handler
where
    H: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(handler(ctx)))
}

/// The built-in fallback for unregistered routes: `404 {"error":"not found"}`.
pub fn not_found() -> Handler {
    into_handler(|_ctx: Context| async {
        Ok::<_, HandlerError>(Response::json(
            StatusCode::NotFound,
            &json!({ "error": "not found" }),
        )?)
    })
}

/// Runs `handler` exactly once and turns its result into a response.
pub async fn execute(handler: Handler, ctx: Context) -> Response {
    let method = ctx.request().method().clone();
    let path = ctx.request().path().to_owned();

    match handler(ctx).await {
        Ok(response) => response,
        Err(err) => {
            let status = err.status();
            if status.is_server_error() {
                warn!(%method, %path, status = status.as_u16(), error = %err, "handler failed");
            } else {
                debug!(
                    %method,
                    %path,
                    status = status.as_u16(),
                    error = %err,
                    "handler rejected request"
                );
            }
            err.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::database::PoolState;
    use crate::http::{Body, Method, Request, RequestHead, Version};

    fn ctx(path: &str) -> Context {
        Context::new(
            Request::new(RequestHead::new(Method::Get, path, Version::Http11), Bytes::new()),
            None,
            None,
        )
    }

    fn body_json(response: &Response) -> serde_json::Value {
        match response.body_ref() {
            Body::Full(bytes) => serde_json::from_slice(bytes).unwrap(),
            Body::Stream(_) => panic!("expected a full body"),
        }
    }

    #[test]
    fn statuses_are_deterministic() {
        assert_eq!(
            HandlerError::from(PoolError::Exhausted {
                waited: Duration::from_millis(1)
            })
            .status(),
            StatusCode::ServiceUnavailable
        );
        assert_eq!(
            HandlerError::from(PoolError::NotReady(PoolState::Draining)).status(),
            StatusCode::ServiceUnavailable
        );
        assert_eq!(
            HandlerError::from(BackendError::Query("x".into())).status(),
            StatusCode::InternalServerError
        );
        assert_eq!(HandlerError::NoBackend.status(), StatusCode::InternalServerError);
        assert_eq!(
            HandlerError::from(PoolError::Connect(BackendError::Connect("refused".into())))
                .status(),
            StatusCode::InternalServerError
        );
        assert_eq!(
            HandlerError::status_with(StatusCode::Conflict, "taken").status(),
            StatusCode::Conflict
        );
    }

    #[test]
    fn internal_details_are_not_sent() {
        let response =
            HandlerError::Backend(BackendError::Query("secret table".into())).into_response();
        assert_eq!(response.status(), StatusCode::InternalServerError);
        assert_eq!(body_json(&response)["error"], "internal server error");
    }

    #[test]
    fn connect_failure_is_not_reported_as_busy() {
        let response =
            HandlerError::from(PoolError::Connect(BackendError::Connect("refused".into())))
                .into_response();
        assert_eq!(response.status(), StatusCode::InternalServerError);
        assert_eq!(body_json(&response)["error"], "internal server error");
    }

    #[test]
    fn handler_message_is_sent() {
        let response =
            HandlerError::status_with(StatusCode::UnprocessableEntity, "name is required")
                .into_response();
        assert_eq!(body_json(&response)["error"], "name is required");
    }

    #[tokio::test]
    async fn execute_maps_errors_to_responses() {
        let failing = into_handler(|_ctx| async { Err(HandlerError::Internal("boom".into())) });
        let response = execute(failing, ctx("/x")).await;
        assert_eq!(response.status(), StatusCode::InternalServerError);
    }

    #[tokio::test]
    async fn fallback_is_a_successful_404() {
        let response = execute(not_found(), ctx("/missing")).await;
        assert_eq!(response.status(), StatusCode::NotFound);
        assert_eq!(body_json(&response), json!({"error": "not found"}));
    }
}
