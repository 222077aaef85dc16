//! Request routing: map an HTTP method and an exact path to a handler.
//!
//! Matching is exact string equality on both the method and the path (the query
//! string is not part of the path). Each `(method, path)` pair can be registered
//! once; a second registration is a configuration error reported at startup.
//! Anything unregistered resolves to the fallback handler, which by default answers
//! `404 {"error":"not found"}`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::BoxFuture;
use crate::context::Context;
use crate::database::Session;
use crate::handler::{self, Handler, HandlerError, HandlerResult};
use crate::http::{Method, Request};

/// Registration failures.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("route {method} {path} is already registered")]
    Duplicate { method: Method, path: String },
}

/// Dispatches requests to handlers by `(method, path)`.
///
/// ```
/// use rivet::http::{Method, Response, StatusCode};
/// use rivet::router::Router;
///
/// let mut router = Router::new();
/// router
///     .get("/health", |_ctx| async { Ok(Response::text(StatusCode::Ok, "ok")) })
///     .unwrap();
///
/// assert!(router.contains(&Method::Get, "/health"));
/// assert!(router.get("/health", |_ctx| async { Ok(Response::new(StatusCode::Ok)) }).is_err());
/// ```
pub struct Router {
    routes: HashMap<Method, HashMap<String, Handler>>,
    fallback: Handler,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
            fallback: handler::not_found(),
        }
    }

    pub fn get<H, Fut>(&mut self, path: &str, handler: H) -> Result<&mut Self, RouteError>
    where
        H: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.route(Method::Get, path, handler)
    }

    pub fn post<H, Fut>(&mut self, path: &str, handler: H) -> Result<&mut Self, RouteError>
    where
        H: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.route(Method::Post, path, handler)
    }

    pub fn put<H, Fut>(&mut self, path: &str, handler: H) -> Result<&mut Self, RouteError>
    where
        H: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.route(Method::Put, path, handler)
    }

    pub fn delete<H, Fut>(&mut self, path: &str, handler: H) -> Result<&mut Self, RouteError>
    where
        H: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.route(Method::Delete, path, handler)
    }

    pub fn patch<H, Fut>(&mut self, path: &str, handler: H) -> Result<&mut Self, RouteError>
    where
        H: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.route(Method::Patch, path, handler)
    }

    /// Registers a handler for an arbitrary method.
    pub fn route<H, Fut>(
        &mut self,
        method: Method,
        path: &str,
        handler: H,
    ) -> Result<&mut Self, RouteError>
    where
        H: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.insert(method, path, handler::into_handler(handler))
    }

    /// Registers a handler that runs inside a lease: it receives the request and
    /// exclusive use of one backend connection, which is released when it finishes.
    ///
    /// Pool exhaustion is answered with `503` without calling the handler.
    pub fn leased<H>(
        &mut self,
        method: Method,
        path: &str,
        handler: H,
    ) -> Result<&mut Self, RouteError>
    where
        H: for<'c> Fn(Request, &'c mut Session) -> BoxFuture<'c, HandlerResult>
            + Send
            + Sync
            + 'static,
    {
        let handler = Arc::new(handler);
        self.route(method, path, move |ctx: Context| {
            let handler = Arc::clone(&handler);
            async move {
                let (request, broker) = ctx.into_parts();
                let Some(broker) = broker else {
                    return Err(HandlerError::NoBackend);
                };
                broker.lease(move |session| handler(request, session)).await
            }
        })
    }

    /// Replaces the handler used for unregistered routes.
    pub fn fallback<H, Fut>(&mut self, handler: H) -> &mut Self
    where
        H: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.fallback = handler::into_handler(handler);
        self
    }

    fn insert(
        &mut self,
        method: Method,
        path: &str,
        handler: Handler,
    ) -> Result<&mut Self, RouteError> {
        let by_path = self.routes.entry(method.clone()).or_default();
        if by_path.contains_key(path) {
            return Err(RouteError::Duplicate {
                method,
                path: path.to_owned(),
            });
        }
        debug!(%method, path, "route registered");
        by_path.insert(path.to_owned(), handler);
        Ok(self)
    }

    /// Returns the handler for `(method, path)`, or the fallback.
    pub fn resolve(&self, method: &Method, path: &str) -> Handler {
        self.routes
            .get(method)
            .and_then(|by_path| by_path.get(path))
            .unwrap_or(&self.fallback)
            .clone()
    }

    pub fn contains(&self, method: &Method, path: &str) -> bool {
        self.routes
            .get(method)
            .is_some_and(|by_path| by_path.contains_key(path))
    }

    /// Number of registered routes, not counting the fallback.
    pub fn len(&self) -> usize {
        self.routes.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves and runs the handler for `ctx`'s request.
    pub async fn dispatch(&self, ctx: Context) -> crate::http::Response {
        let handler = self.resolve(ctx.request().method(), ctx.request().path());
        handler::execute(handler, ctx).await
    }
}
