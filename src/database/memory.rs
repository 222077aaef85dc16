//! In-process backend that answers a fixed set of queries.
//!
//! Each query string maps to a prepared result set. Queries can be made to fail as
//! if the connection dropped, and connection attempts can be refused, which is all
//! the pool and the broker need to be exercised end to end without a database.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;

use super::{Backend, BackendConnection, BackendError, Row};
use crate::BoxFuture;

/// A cloneable in-memory backend. Clones share counters and availability.
///
/// # Examples
///
/// ```
/// use rivet::database::MemoryBackend;
/// use serde_json::json;
///
/// let backend = MemoryBackend::new()
///     .with_rows("select id, name from categories", json!([{"id": 1, "name": "Park"}]))
///     .with_failure("select broken");
/// assert_eq!(backend.connections_opened(), 0);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    tables: Arc<HashMap<String, Vec<Row>>>,
    failing: Arc<HashSet<String>>,
    latency: Duration,
    opened: Arc<AtomicU64>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the rows returned for `query`. `rows` is a JSON array of objects;
    /// anything that is not an object is skipped.
    #[must_use]
    pub fn with_rows(mut self, query: impl Into<String>, rows: Value) -> Self {
        let rows = match rows {
            Value::Array(items) => items
                .into_iter()
                .filter_map(|item| match item {
                    Value::Object(row) => Some(row),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        };
        Arc::make_mut(&mut self.tables).insert(query.into(), rows);
        self
    }

    /// Makes `query` fail as though the connection was lost mid-flight.
    #[must_use]
    pub fn with_failure(mut self, query: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.failing).insert(query.into());
        self
    }

    /// Delays every query, so handlers genuinely suspend while holding a lease.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// When `false`, new connection attempts fail with [`BackendError::Connect`].
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Connections opened so far, across all clones.
    pub fn connections_opened(&self) -> u64 {
        self.opened.load(Ordering::SeqCst)
    }
}

impl Backend for MemoryBackend {
    fn connect(&self) -> BoxFuture<'_, Result<Box<dyn BackendConnection>, BackendError>> {
        Box::pin(async move {
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(BackendError::Connect("backend unavailable".into()));
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            let conn: Box<dyn BackendConnection> = Box::new(MemoryConnection {
                backend: self.clone(),
            });
            Ok(conn)
        })
    }
}

struct MemoryConnection {
    backend: MemoryBackend,
}

impl BackendConnection for MemoryConnection {
    fn run<'a>(&'a mut self, query: &'a str) -> BoxFuture<'a, Result<Vec<Row>, BackendError>> {
        Box::pin(async move {
            if !self.backend.latency.is_zero() {
                tokio::time::sleep(self.backend.latency).await;
            }
            if self.backend.failing.contains(query) {
                return Err(BackendError::Disconnected(format!(
                    "connection reset while running {query:?}"
                )));
            }
            self.backend
                .tables
                .get(query)
                .cloned()
                .ok_or_else(|| BackendError::Query(format!("unknown query {query:?}")))
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn serves_registered_rows() {
        let backend = MemoryBackend::new().with_rows(
            "select id from t",
            json!([{"id": 1}, {"id": 2}, "not a row"]),
        );
        let mut conn = backend.connect().await.unwrap();
        let rows = conn.run("select id from t").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["id"], 2);
        assert_eq!(backend.connections_opened(), 1);
    }

    #[tokio::test]
    async fn unknown_and_failing_queries_error() {
        let backend = MemoryBackend::new().with_failure("select boom");
        let mut conn = backend.connect().await.unwrap();
        assert!(matches!(
            conn.run("select nope").await,
            Err(BackendError::Query(_))
        ));
        assert!(matches!(
            conn.run("select boom").await,
            Err(BackendError::Disconnected(_))
        ));
    }

    #[tokio::test]
    async fn refuses_connections_when_unavailable() {
        let backend = MemoryBackend::new();
        backend.set_available(false);
        assert!(matches!(
            backend.connect().await,
            Err(BackendError::Connect(_))
        ));
        backend.set_available(true);
        assert!(backend.connect().await.is_ok());
    }
}
