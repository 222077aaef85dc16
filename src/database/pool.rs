//! Bounded connection pool with an explicit lifecycle.
//!
//! Connections are managed by a [`deadpool`] pool built on [`Pool::start`] and
//! closed on [`Pool::drain`], so the bound, the wait queue and the wait timeout are
//! deadpool's. Around it sits the `stopped → starting → ready → draining` state
//! that gates acquires, plus counters that make leaks and double releases visible.
//! A connection marked poisoned is detached from deadpool when its guard drops, so
//! it is never handed out again.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use deadpool::Runtime;
use deadpool::managed::{self, Manager, Metrics, Object, RecycleResult};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::{Backend, BackendConnection, BackendError, Row};

/// Lifecycle of a [`Pool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Stopped,
    Starting,
    Ready,
    Draining,
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PoolState::Stopped => "stopped",
            PoolState::Starting => "starting",
            PoolState::Ready => "ready",
            PoolState::Draining => "draining",
        })
    }
}

/// Pool sizing and wait policy.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on connections handed out at once.
    pub max_connections: u32,
    /// Connections opened eagerly by [`Pool::start`].
    pub min_connections: u32,
    /// How long [`Pool::acquire`] waits for a free connection.
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// Errors returned by pool operations.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no backend connection became available within {waited:?}")]
    Exhausted { waited: Duration },

    #[error("pool is {0}, not ready")]
    NotReady(PoolState),

    #[error("cannot {action} a pool that is {state}")]
    InvalidTransition {
        action: &'static str,
        state: PoolState,
    },

    #[error("failed to open backend connection: {0}")]
    Connect(#[source] BackendError),

    #[error("invalid pool configuration: {0}")]
    Build(String),
}

/// Counters for leak and double-release detection.
///
/// After every lease has finished, `acquired == released` must hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Guards handed out.
    pub acquired: u64,
    /// Guards returned, healthy or not.
    pub released: u64,
    /// Returned connections that were dropped instead of reused.
    pub discarded: u64,
    /// Connections currently parked in the pool.
    pub idle: usize,
    /// Guards currently outstanding.
    pub in_use: u64,
}

/// A backend connection together with its pool-assigned id.
struct Tracked {
    id: u64,
    conn: Box<dyn BackendConnection>,
}

/// Opens backend connections on deadpool's behalf.
struct BackendManager {
    backend: Arc<dyn Backend>,
    next_id: Arc<AtomicU64>,
}

impl Manager for BackendManager {
    type Type = Tracked;
    type Error = BackendError;

    async fn create(&self) -> Result<Tracked, BackendError> {
        let conn = self.backend.connect().await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(connection = id, "opened backend connection");
        Ok(Tracked { id, conn })
    }

    // Poisoned connections are detached before they get back here.
    async fn recycle(
        &self,
        _conn: &mut Tracked,
        _metrics: &Metrics,
    ) -> RecycleResult<BackendError> {
        Ok(())
    }
}

type Inner = managed::Pool<BackendManager>;

struct Lifecycle {
    state: PoolState,
    inner: Option<Inner>,
}

struct Shared {
    backend: Arc<dyn Backend>,
    config: PoolConfig,
    lifecycle: Mutex<Lifecycle>,
    next_id: Arc<AtomicU64>,
    acquired: AtomicU64,
    released: AtomicU64,
    discarded: AtomicU64,
    returned: Notify,
}

// The pool never holds a lock across an await, so a poisoned lock only means another
// thread panicked mid-update of plain data; the data is still usable.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn state(&self) -> PoolState {
        lock(&self.lifecycle).state
    }

    fn set_state(&self, state: PoolState) {
        lock(&self.lifecycle).state = state;
    }

    fn in_use(&self) -> u64 {
        let released = self.released.load(Ordering::Acquire);
        self.acquired.load(Ordering::Acquire).saturating_sub(released)
    }

    fn ready_inner(&self) -> Result<Inner, PoolError> {
        let lifecycle = lock(&self.lifecycle);
        match (&lifecycle.state, &lifecycle.inner) {
            (PoolState::Ready, Some(inner)) => Ok(inner.clone()),
            (state, _) => Err(PoolError::NotReady(*state)),
        }
    }

    fn build_inner(&self) -> Result<Inner, PoolError> {
        let manager = BackendManager {
            backend: Arc::clone(&self.backend),
            next_id: Arc::clone(&self.next_id),
        };
        managed::Pool::builder(manager)
            .max_size(self.config.max_connections as usize)
            .wait_timeout(Some(self.config.acquire_timeout))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| PoolError::Build(e.to_string()))
    }

    fn release(&self, conn: Object<BackendManager>, poisoned: bool) {
        let id = conn.id;
        if poisoned {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            warn!(connection = id, "discarding unusable backend connection");
            drop(Object::take(conn));
        } else {
            debug!(connection = id, "backend connection returned to pool");
            drop(conn);
        }
        self.released.fetch_add(1, Ordering::AcqRel);
        self.returned.notify_waiters();
    }
}

/// A cloneable handle to a shared connection pool.
///
/// # Examples
///
/// ```
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// use rivet::database::{MemoryBackend, Pool, PoolConfig, PoolState};
///
/// let pool = Pool::new(MemoryBackend::new(), PoolConfig::default());
/// assert_eq!(pool.state(), PoolState::Stopped);
///
/// pool.start().await?;
/// {
///     let conn = pool.acquire().await?;
///     assert_eq!(pool.stats().in_use, 1);
///     drop(conn);
/// }
/// pool.drain().await?;
/// assert_eq!(pool.stats().acquired, pool.stats().released);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Pool {
    shared: Arc<Shared>,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("state", &self.state())
            .field("stats", &self.stats())
            .finish()
    }
}

impl Pool {
    /// Creates a stopped pool. No connection is opened until [`start`](Self::start).
    pub fn new(backend: impl Backend, config: PoolConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                backend: Arc::new(backend),
                config,
                lifecycle: Mutex::new(Lifecycle {
                    state: PoolState::Stopped,
                    inner: None,
                }),
                next_id: Arc::new(AtomicU64::new(0)),
                acquired: AtomicU64::new(0),
                released: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
                returned: Notify::new(),
            }),
        }
    }

    pub fn state(&self) -> PoolState {
        self.shared.state()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> PoolStats {
        let idle = lock(&self.shared.lifecycle)
            .inner
            .as_ref()
            .map_or(0, |inner| usize::try_from(inner.status().available).unwrap_or(0));
        PoolStats {
            acquired: self.shared.acquired.load(Ordering::Acquire),
            released: self.shared.released.load(Ordering::Acquire),
            discarded: self.shared.discarded.load(Ordering::Relaxed),
            idle,
            in_use: self.shared.in_use(),
        }
    }

    /// `stopped → starting → ready`. Opens `min_connections` connections first; if any
    /// of them fails the pool goes back to `stopped` and the error is returned.
    pub async fn start(&self) -> Result<(), PoolError> {
        {
            let mut lifecycle = lock(&self.shared.lifecycle);
            if lifecycle.state != PoolState::Stopped {
                return Err(PoolError::InvalidTransition {
                    action: "start",
                    state: lifecycle.state,
                });
            }
            lifecycle.state = PoolState::Starting;
        }

        let inner = match self.shared.build_inner() {
            Ok(inner) => inner,
            Err(e) => {
                self.shared.set_state(PoolState::Stopped);
                return Err(e);
            }
        };

        let wanted = self
            .shared
            .config
            .min_connections
            .min(self.shared.config.max_connections);
        let mut warm = Vec::with_capacity(wanted as usize);
        for _ in 0..wanted {
            match inner.get().await {
                Ok(conn) => warm.push(conn),
                Err(e) => {
                    drop(warm);
                    inner.close();
                    self.shared.set_state(PoolState::Stopped);
                    return Err(map_get_error(e, self.shared.config.acquire_timeout));
                }
            }
        }
        // Back into the pool as idle connections.
        drop(warm);

        {
            let mut lifecycle = lock(&self.shared.lifecycle);
            lifecycle.inner = Some(inner);
            lifecycle.state = PoolState::Ready;
        }
        info!(
            max_connections = self.shared.config.max_connections,
            warm = wanted,
            "connection pool ready"
        );
        Ok(())
    }

    /// Takes one connection out of the pool.
    ///
    /// Fails immediately with [`PoolError::NotReady`] outside the `ready` state, and with
    /// [`PoolError::Exhausted`] if every connection stays busy for `acquire_timeout`.
    /// An idle connection is reused when available; otherwise a new one is opened.
    pub async fn acquire(&self) -> Result<PooledConnection, PoolError> {
        let inner = self.shared.ready_inner()?;
        let waited = self.shared.config.acquire_timeout;
        let conn = inner.get().await.map_err(|e| {
            let err = map_get_error(e, waited);
            if matches!(err, PoolError::Exhausted { .. }) {
                warn!(?waited, "connection pool exhausted");
            }
            err
        })?;

        // The state may have moved on while this caller was queued.
        if let Err(e) = self.shared.ready_inner() {
            drop(conn);
            return Err(e);
        }

        self.shared.acquired.fetch_add(1, Ordering::AcqRel);
        Ok(PooledConnection {
            conn: Some(conn),
            poisoned: false,
            shared: Arc::clone(&self.shared),
        })
    }

    /// `ready → draining → stopped`.
    ///
    /// New acquires fail from the moment draining begins. Waits until every
    /// outstanding connection has been returned, then closes the idle ones.
    /// Draining an already stopped pool is a no-op.
    pub async fn drain(&self) -> Result<(), PoolError> {
        {
            let mut lifecycle = lock(&self.shared.lifecycle);
            match lifecycle.state {
                PoolState::Stopped => return Ok(()),
                PoolState::Ready => lifecycle.state = PoolState::Draining,
                other => {
                    return Err(PoolError::InvalidTransition {
                        action: "drain",
                        state: other,
                    });
                }
            }
        }
        info!(in_use = self.shared.in_use(), "draining connection pool");

        loop {
            let returned = self.shared.returned.notified();
            if self.shared.in_use() == 0 {
                break;
            }
            returned.await;
        }

        let closed = {
            let mut lifecycle = lock(&self.shared.lifecycle);
            lifecycle.state = PoolState::Stopped;
            lifecycle.inner.take()
        }
        .map_or(0, |inner| {
            let idle = inner.status().size;
            inner.close();
            idle
        });
        info!(closed, "connection pool stopped");
        Ok(())
    }
}

fn map_get_error(err: managed::PoolError<BackendError>, waited: Duration) -> PoolError {
    match err {
        managed::PoolError::Timeout(_) => PoolError::Exhausted { waited },
        managed::PoolError::Backend(e) => PoolError::Connect(e),
        managed::PoolError::Closed => PoolError::NotReady(PoolState::Stopped),
        other => PoolError::Build(other.to_string()),
    }
}

/// Exclusive ownership of one pooled connection.
///
/// Dropping the guard returns the connection to the pool, or discards it if it was
/// marked poisoned. This runs on every exit path, including errors, panics, and
/// cancellation of the future holding the guard, and it runs exactly once.
pub struct PooledConnection {
    conn: Option<Object<BackendManager>>,
    poisoned: bool,
    shared: Arc<Shared>,
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id())
            .field("poisoned", &self.poisoned)
            .finish()
    }
}

impl PooledConnection {
    /// Pool-assigned identifier, stable for the life of the backend connection.
    pub fn id(&self) -> u64 {
        self.conn.as_ref().map_or(0, |conn| conn.id)
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Prevents this connection from being reused after release.
    pub fn mark_poisoned(&mut self) {
        self.poisoned = true;
    }

    /// Runs one query. A backend error poisons the connection.
    pub async fn run(&mut self, query: &str) -> Result<Vec<Row>, BackendError> {
        let Some(tracked) = self.conn.as_mut() else {
            return Err(BackendError::Disconnected(
                "connection already released".into(),
            ));
        };
        let result = tracked.conn.run(query).await;
        if result.is_err() {
            self.poisoned = true;
        }
        result
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.shared.release(conn, self.poisoned);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;
    use crate::database::MemoryBackend;

    fn config(max: u32, min: u32, timeout_ms: u64) -> PoolConfig {
        PoolConfig {
            max_connections: max,
            min_connections: min,
            acquire_timeout: Duration::from_millis(timeout_ms),
        }
    }

    async fn ready_pool(max: u32) -> (Pool, MemoryBackend) {
        let backend = MemoryBackend::new().with_rows("select 1", serde_json::json!([{"n": 1}]));
        let pool = Pool::new(backend.clone(), config(max, 0, 50));
        pool.start().await.unwrap();
        (pool, backend)
    }

    #[tokio::test]
    async fn lifecycle_walks_every_state() {
        let pool = Pool::new(MemoryBackend::new(), config(2, 2, 50));
        assert_eq!(pool.state(), PoolState::Stopped);
        pool.start().await.unwrap();
        assert_eq!(pool.state(), PoolState::Ready);
        assert_eq!(pool.stats().idle, 2);

        pool.drain().await.unwrap();
        assert_eq!(pool.state(), PoolState::Stopped);
        assert_eq!(pool.stats().idle, 0);

        // A stopped pool can be started again.
        pool.start().await.unwrap();
        assert_eq!(pool.state(), PoolState::Ready);
    }

    #[tokio::test]
    async fn acquire_fails_fast_when_not_ready() {
        let pool = Pool::new(MemoryBackend::new(), config(1, 0, 5_000));
        let started = tokio::time::Instant::now();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::NotReady(PoolState::Stopped)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let (pool, _) = ready_pool(1).await;
        let err = pool.start().await.unwrap_err();
        assert!(matches!(
            err,
            PoolError::InvalidTransition {
                action: "start",
                state: PoolState::Ready
            }
        ));
    }

    #[tokio::test]
    async fn failed_warmup_returns_to_stopped() {
        let backend = MemoryBackend::new();
        backend.set_available(false);
        let pool = Pool::new(backend, config(2, 1, 50));
        assert!(matches!(pool.start().await, Err(PoolError::Connect(_))));
        assert_eq!(pool.state(), PoolState::Stopped);
    }

    #[tokio::test]
    async fn exhaustion_is_reported_after_timeout() {
        let (pool, _) = ready_pool(1).await;
        let held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::Exhausted { .. }));
        drop(held);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn released_connection_is_reused() {
        let (pool, backend) = ready_pool(1).await;
        let first = pool.acquire().await.unwrap().id();
        let second = pool.acquire().await.unwrap().id();
        assert_eq!(first, second);
        assert_eq!(backend.connections_opened(), 1);

        let stats = pool.stats();
        assert_eq!(stats.acquired, 2);
        assert_eq!(stats.released, 2);
        assert_eq!(stats.discarded, 0);
        assert_eq!(stats.idle, 1);
    }

    #[tokio::test]
    async fn poisoned_connection_is_replaced() {
        let (pool, backend) = ready_pool(1).await;
        let first = {
            let mut conn = pool.acquire().await.unwrap();
            assert!(conn.run("select nothing").await.is_err());
            assert!(conn.is_poisoned());
            conn.id()
        };
        assert_eq!(pool.stats().discarded, 1);
        assert_eq!(pool.stats().idle, 0);

        let mut conn = pool.acquire().await.unwrap();
        assert_ne!(conn.id(), first);
        assert_eq!(conn.run("select 1").await.unwrap().len(), 1);
        assert_eq!(backend.connections_opened(), 2);
    }

    #[tokio::test]
    async fn drain_waits_for_outstanding_leases() {
        let (pool, _) = ready_pool(2).await;
        let held = pool.acquire().await.unwrap();
        let released = Arc::new(AtomicBool::new(false));

        let drainer = {
            let pool = pool.clone();
            let released = Arc::clone(&released);
            tokio::spawn(async move {
                pool.drain().await.unwrap();
                assert!(released.load(Ordering::SeqCst));
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.state(), PoolState::Draining);
        assert!(matches!(
            pool.acquire().await,
            Err(PoolError::NotReady(PoolState::Draining))
        ));

        released.store(true, Ordering::SeqCst);
        drop(held);
        drainer.await.unwrap();
        assert_eq!(pool.state(), PoolState::Stopped);
        let stats = pool.stats();
        assert_eq!(stats.acquired, stats.released);
    }

    #[tokio::test]
    async fn cancelled_holder_still_releases() {
        let (pool, _) = ready_pool(1).await;
        let task = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let _conn = pool.acquire().await.unwrap();
                std::future::pending::<()>().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.stats().in_use, 1);

        task.abort();
        let _ = task.await;
        let stats = pool.stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.acquired, stats.released);
    }
}
