//! Database layer: backend boundary, connection pool, and request-scoped leases.
//!
//! - [`Backend`] / [`BackendConnection`]: what a concrete database driver provides:
//!   open a connection, run a query, get rows back.
//! - [`Pool`]: a bounded set of backend connections with an explicit
//!   `stopped → starting → ready → draining → stopped` lifecycle.
//! - [`LeaseBroker`]: hands one pooled connection to one unit of work and always
//!   takes it back.
//! - [`MemoryBackend`]: an in-process backend serving fixed result sets.
//!
//! Rows travel as JSON objects ([`Row`]), so decoding into domain types is plain
//! `serde` (see [`Session::query_as`]).

use thiserror::Error;

use crate::BoxFuture;

pub mod lease;
pub mod memory;
pub mod pool;

pub use lease::{LeaseBroker, Session};
pub use memory::MemoryBackend;
pub use pool::{Pool, PoolConfig, PoolError, PoolState, PoolStats, PooledConnection};

/// One result row, column name → value.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Errors raised by a backend or while decoding its rows.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to connect to backend: {0}")]
    Connect(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("backend connection lost: {0}")]
    Disconnected(String),

    #[error("failed to decode row: {0}")]
    Decode(#[from] serde_json::Error),
}

/// A source of backend connections.
///
/// Implementations own connection establishment and any retry policy; the pool only
/// calls [`connect`](Backend::connect) when it needs another connection.
pub trait Backend: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'_, Result<Box<dyn BackendConnection>, BackendError>>;
}

/// One open backend connection. Used by a single lease at a time.
pub trait BackendConnection: Send + 'static {
    /// Runs `query` and returns every row. Any error marks the connection as
    /// unusable; the pool discards it instead of handing it out again.
    fn run<'a>(&'a mut self, query: &'a str) -> BoxFuture<'a, Result<Vec<Row>, BackendError>>;
}
