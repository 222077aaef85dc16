//! # rivet
//!
//! A small async HTTP/1.x server. Each accepted connection runs an explicit
//! request/response state machine; requests are dispatched by exact
//! method + path to handlers, which can borrow one pooled backend connection for the
//! duration of the request.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rivet::handler::HandlerError;
//! use rivet::http::{Response, StatusCode};
//! use rivet::router::Router;
//! use rivet::server::{App, Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut router = Router::new();
//!     router.get("/api/ping", |_ctx| async {
//!         Ok::<_, HandlerError>(Response::json(StatusCode::Ok, &serde_json::json!({"ok": true}))?)
//!     })?;
//!
//!     let server = Server::bind("127.0.0.1:3000").await?;
//!     server.run(App::new(router)).await?;
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::pin::Pin;

pub mod config;
pub mod connection;
pub mod context;
pub mod database;
pub mod endpoints;
pub mod handler;
pub mod http;
pub mod router;
pub mod server;

/// A heap-allocated, `Send` future borrowing for `'a`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use config::Config;
pub use context::Context;
pub use handler::{HandlerError, HandlerResult};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use router::Router;
pub use server::{App, Server, ServerError};
