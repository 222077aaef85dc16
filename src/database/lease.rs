//! Request-scoped leases over the connection pool.
//!
//! [`LeaseBroker::lease`] is the only way handlers reach the backend. It acquires a
//! connection, lends it to a unit of work as a `&mut` [`Session`], and takes it back
//! before returning. Because the session is only ever borrowed, the unit of work
//! cannot keep the connection past its own end.

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::{BackendError, Pool, PoolError, PooledConnection, Row};
use crate::BoxFuture;

/// The view of one leased connection given to a unit of work.
#[derive(Debug)]
pub struct Session {
    conn: PooledConnection,
}

impl Session {
    /// Identifier of the underlying pooled connection.
    pub fn connection_id(&self) -> u64 {
        self.conn.id()
    }

    /// Runs `query` and returns the raw rows.
    pub async fn query(&mut self, query: &str) -> Result<Vec<Row>, BackendError> {
        self.conn.run(query).await
    }

    /// Runs `query` and decodes every row into `T`. Zero rows is a valid, empty result.
    ///
    /// A decode failure does not poison the connection; a backend failure does.
    pub async fn query_as<T>(&mut self, query: &str) -> Result<Vec<T>, BackendError>
    where
        T: DeserializeOwned,
    {
        let rows = self.conn.run(query).await?;
        let decoded = rows
            .into_iter()
            .map(|row| serde_json::from_value(Value::Object(row)))
            .collect::<Result<Vec<T>, _>>()?;
        Ok(decoded)
    }

    /// Forces the connection to be discarded when the lease ends, for failures the
    /// backend itself did not report.
    pub fn discard(&mut self) {
        self.conn.mark_poisoned();
    }
}

/// Brokers exclusive, short-lived access to pooled connections.
///
/// Cloning is cheap; every clone shares the same pool.
///
/// # Examples
///
/// ```
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// use rivet::database::{BackendError, LeaseBroker, MemoryBackend, Pool, PoolConfig, PoolError};
/// use serde_json::json;
///
/// #[derive(Debug, thiserror::Error)]
/// enum AppError {
///     #[error(transparent)]
///     Pool(#[from] PoolError),
///     #[error(transparent)]
///     Backend(#[from] BackendError),
/// }
///
/// let backend = MemoryBackend::new().with_rows("select 1 as n", json!([{"n": 1}]));
/// let pool = Pool::new(backend, PoolConfig::default());
/// pool.start().await?;
///
/// let broker = LeaseBroker::new(pool.clone());
/// let rows = broker
///     .lease(|db| Box::pin(async move { Ok::<_, AppError>(db.query("select 1 as n").await?) }))
///     .await?;
///
/// assert_eq!(rows.len(), 1);
/// assert_eq!(pool.stats().in_use, 0);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct LeaseBroker {
    pool: Pool,
}

impl LeaseBroker {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Runs `work` with exclusive use of one pooled connection.
    ///
    /// The connection is released before this returns, whatever `work` does: the
    /// session is dropped right after `work` completes, and if this future is itself
    /// dropped midway the session goes with it. Pool errors are converted into `E`.
    pub async fn lease<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: for<'c> FnOnce(&'c mut Session) -> BoxFuture<'c, Result<T, E>>,
        E: From<PoolError>,
    {
        let conn = self.pool.acquire().await?;
        let mut session = Session { conn };
        let result = work(&mut session).await;
        drop(session);
        result
    }
}
