//! Connection pool implementation.
//!
//! The pool is a bounded resource manager: connections are leased to callers,
//! validated on checkout, returned to an idle queue on release, and reaped
//! when they have been idle too long. A single [`tokio::sync::Semaphore`]
//! bounds the number of connections that may exist at once (idle + leased);
//! a [`Notify`] wakes waiters when an idle connection or a free slot appears.
//!
//! Per ADR-005 (see `mssql-codec`), the pool never keeps itself alive through
//! a leased connection: [`PooledConnection`] holds only a [`Weak`] reference
//! back to the pool, so a caller that forgets to return a connection cannot
//! leak the pool itself.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use mssql_client::{Client, Config, Ready};
use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::lifecycle::ConnectionMetadata;

/// A connection pool for SQL Server.
///
/// The pool manages a set of database connections, providing automatic
/// connection reuse, health checking, and lifecycle management.
pub struct Pool {
    inner: Arc<PoolInner>,
    reaper: Option<JoinHandle<()>>,
}

struct IdleEntry {
    client: Client<Ready>,
    metadata: ConnectionMetadata,
    permit: OwnedSemaphorePermit,
}

struct PoolState {
    idle: VecDeque<IdleEntry>,
    next_id: u64,
}

struct PoolInner {
    pool_config: PoolConfig,
    client_config: Config,
    state: Mutex<PoolState>,
    semaphore: Arc<Semaphore>,
    notify: Notify,
    closed: AtomicBool,
    metrics: MetricsInner,
}

#[derive(Default)]
struct MetricsInner {
    connections_created: AtomicU64,
    connections_closed: AtomicU64,
    checkouts_successful: AtomicU64,
    checkouts_failed: AtomicU64,
    health_checks_performed: AtomicU64,
    health_checks_failed: AtomicU64,
    resets_performed: AtomicU64,
    resets_failed: AtomicU64,
}

impl PoolInner {
    /// Attempt to validate an idle connection with a bounded budget.
    async fn validate(&self, client: &mut Client<Ready>) -> bool {
        self.metrics.health_checks_performed.fetch_add(1, Ordering::Relaxed);
        let query = self.pool_config.health_check_query.clone();
        let check = tokio::time::timeout(
            self.pool_config.connection_timeout,
            client.simple_query(&query),
        )
        .await;
        match check {
            Ok(Ok(())) => true,
            _ => {
                self.metrics.health_checks_failed.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Reset server-side session state before handing a reused connection to
    /// a new caller (closes cursors, clears SET options, drops temp tables).
    ///
    /// The TDS `RESET_CONNECTION` bit is carried on the first packet of the
    /// *next* request sent on a connection, so unlike a plain health check
    /// this can't be done synchronously when the previous caller drops its
    /// lease - it happens here, on checkout, rather than on checkin.
    async fn reset(&self, client: &mut Client<Ready>) -> bool {
        if !self.pool_config.sp_reset_connection {
            return true;
        }
        self.metrics.resets_performed.fetch_add(1, Ordering::Relaxed);
        match tokio::time::timeout(self.pool_config.connection_timeout, client.reset_session())
            .await
        {
            Ok(Ok(())) => true,
            _ => {
                self.metrics.resets_failed.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Open a brand-new connection, retrying transient failures per the
    /// client's configured retry policy.
    async fn connect_new(&self) -> Result<Client<Ready>, PoolError> {
        let retry = self.client_config.retry.clone();
        let mut attempt = 0u32;
        loop {
            match Client::connect(self.client_config.clone()).await {
                Ok(client) => return Ok(client),
                Err(err) if err.is_transient() && retry.should_retry(attempt) => {
                    attempt += 1;
                    tracing::debug!(attempt, error = %err, "transient connection failure, retrying");
                    tokio::time::sleep(retry.backoff_for_attempt(attempt)).await;
                }
                Err(err) => return Err(PoolError::Connect(err)),
            }
        }
    }

    fn next_id(&self) -> u64 {
        let mut state = self.state.lock();
        state.next_id += 1;
        state.next_id
    }

    fn status(&self) -> PoolStatus {
        let idle = self.state.lock().idle.len() as u32;
        let max = self.pool_config.max_connections;
        let available_permits = self.semaphore.available_permits() as u32;
        let total = max.saturating_sub(available_permits);
        PoolStatus {
            available: idle,
            in_use: total.saturating_sub(idle),
            total,
            max,
        }
    }

    fn metrics(&self) -> PoolMetrics {
        PoolMetrics {
            connections_created: self.metrics.connections_created.load(Ordering::Relaxed),
            connections_closed: self.metrics.connections_closed.load(Ordering::Relaxed),
            checkouts_successful: self.metrics.checkouts_successful.load(Ordering::Relaxed),
            checkouts_failed: self.metrics.checkouts_failed.load(Ordering::Relaxed),
            health_checks_performed: self.metrics.health_checks_performed.load(Ordering::Relaxed),
            health_checks_failed: self.metrics.health_checks_failed.load(Ordering::Relaxed),
            resets_performed: self.metrics.resets_performed.load(Ordering::Relaxed),
            resets_failed: self.metrics.resets_failed.load(Ordering::Relaxed),
        }
    }

    /// Drop idle connections that have exceeded `idle_timeout`, never
    /// reaping below `min_connections` idle entries.
    fn reap_idle(&self) {
        let mut state = self.state.lock();
        let floor = self.pool_config.min_connections as usize;
        let idle_timeout = self.pool_config.idle_timeout;
        let mut kept = VecDeque::with_capacity(state.idle.len());
        while let Some(entry) = state.idle.pop_front() {
            let expired = entry.metadata.is_idle_expired(idle_timeout)
                || entry.metadata.is_expired(self.pool_config.max_lifetime);
            if expired && kept.len() + state.idle.len() >= floor {
                self.metrics.connections_closed.fetch_add(1, Ordering::Relaxed);
                drop(entry);
            } else {
                kept.push_back(entry);
            }
        }
        state.idle = kept;
    }
}

impl Pool {
    /// Create a new pool with the given pool and client configuration.
    pub async fn new(pool_config: PoolConfig, client_config: Config) -> Result<Self, PoolError> {
        pool_config.validate()?;

        let semaphore = Arc::new(Semaphore::new(pool_config.max_connections as usize));
        let sweep_interval = pool_config.health_check_interval;

        let inner = Arc::new(PoolInner {
            pool_config,
            client_config,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                next_id: 0,
            }),
            semaphore,
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            metrics: MetricsInner::default(),
        });

        let weak = Arc::downgrade(&inner);
        let reaper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if inner.closed.load(Ordering::Acquire) {
                    break;
                }
                inner.reap_idle();
            }
        });

        Ok(Self {
            inner,
            reaper: Some(reaper),
        })
    }

    /// Start building a pool with a fluent configuration API.
    #[must_use]
    pub fn builder() -> PoolBuilder {
        PoolBuilder::default()
    }

    /// Get a connection from the pool.
    ///
    /// This will either return an existing idle connection or create a new one
    /// if the pool is not at capacity. If all connections are in use and the
    /// pool is at capacity, this will wait until a connection becomes available
    /// or `connection_timeout` elapses.
    pub async fn get(&self) -> Result<PooledConnection, PoolError> {
        let deadline = Instant::now() + self.inner.pool_config.connection_timeout;
        loop {
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(PoolError::PoolClosed);
            }

            if let Some(entry) = self.inner.state.lock().idle.pop_back() {
                let IdleEntry {
                    mut client,
                    mut metadata,
                    permit,
                } = entry;

                if self.inner.pool_config.sp_reset_connection
                    && !self.inner.reset(&mut client).await
                {
                    self.inner.metrics.connections_closed.fetch_add(1, Ordering::Relaxed);
                    drop(permit);
                    continue;
                }

                let should_validate =
                    self.inner.pool_config.test_on_checkout || self.inner.pool_config.test_on_checkin;
                if should_validate && !self.inner.validate(&mut client).await {
                    self.inner.metrics.connections_closed.fetch_add(1, Ordering::Relaxed);
                    drop(permit);
                    continue;
                }

                metadata.mark_checkout();
                self.inner.metrics.checkouts_successful.fetch_add(1, Ordering::Relaxed);
                return Ok(PooledConnection {
                    client: Some(client),
                    metadata,
                    permit: Some(permit),
                    pool: Arc::downgrade(&self.inner),
                });
            }

            match Arc::clone(&self.inner.semaphore).try_acquire_owned() {
                Ok(permit) => {
                    return self.create_leased(permit).await;
                }
                Err(_) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        self.inner.metrics.checkouts_failed.fetch_add(1, Ordering::Relaxed);
                        return Err(PoolError::Timeout);
                    }
                    let wait = tokio::time::sleep(remaining);
                    tokio::select! {
                        _ = self.inner.notify.notified() => {}
                        () = wait => {
                            self.inner.metrics.checkouts_failed.fetch_add(1, Ordering::Relaxed);
                            return Err(PoolError::Timeout);
                        }
                    }
                }
            }
        }
    }

    /// Try to get an idle connection without waiting or creating a new one.
    ///
    /// Returns `Ok(None)` if no idle connection is immediately available.
    pub fn try_get(&self) -> Result<Option<PooledConnection>, PoolError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(PoolError::PoolClosed);
        }

        let Some(entry) = self.inner.state.lock().idle.pop_back() else {
            return Ok(None);
        };
        let IdleEntry {
            client,
            mut metadata,
            permit,
        } = entry;
        metadata.mark_checkout();
        self.inner.metrics.checkouts_successful.fetch_add(1, Ordering::Relaxed);
        Ok(Some(PooledConnection {
            client: Some(client),
            metadata,
            permit: Some(permit),
            pool: Arc::downgrade(&self.inner),
        }))
    }

    async fn create_leased(&self, permit: OwnedSemaphorePermit) -> Result<PooledConnection, PoolError> {
        match self.inner.connect_new().await {
            Ok(client) => {
                let id = self.inner.next_id();
                self.inner.metrics.connections_created.fetch_add(1, Ordering::Relaxed);
                self.inner.metrics.checkouts_successful.fetch_add(1, Ordering::Relaxed);
                let mut metadata = ConnectionMetadata::new(id);
                metadata.mark_checkout();
                Ok(PooledConnection {
                    client: Some(client),
                    metadata,
                    permit: Some(permit),
                    pool: Arc::downgrade(&self.inner),
                })
            }
            Err(err) => {
                self.inner.metrics.checkouts_failed.fetch_add(1, Ordering::Relaxed);
                drop(permit);
                Err(err)
            }
        }
    }

    /// Get the current pool status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        self.inner.status()
    }

    /// Get a snapshot of pool lifecycle metrics.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        self.inner.metrics()
    }

    /// Close the pool.
    ///
    /// Refuses new acquisitions immediately: any caller parked in
    /// [`Pool::get`] is woken and fails with [`PoolError::PoolClosed`], and
    /// every idle connection is dropped right away.
    ///
    /// Connections already leased out are given up to
    /// `pool_config.connection_timeout` to be returned. A returned lease is
    /// never re-admitted to the idle queue once the pool is closed (see
    /// [`PooledConnection`]'s `Drop` impl), so each one is force-closed the
    /// moment its owner drops it; this wait just gives well-behaved callers a
    /// bounded window to finish before `close()` returns. Leases still
    /// outstanding when the deadline passes are abandoned: `close()` returns
    /// anyway, and those connections are still force-closed later, whenever
    /// their owner eventually drops them.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();

        let drained: Vec<_> = {
            let mut state = self.inner.state.lock();
            state.idle.drain(..).collect()
        };
        let closed = drained.len() as u64;
        self.inner
            .metrics
            .connections_closed
            .fetch_add(closed, Ordering::Relaxed);
        drop(drained);

        let deadline = Instant::now() + self.inner.pool_config.connection_timeout;
        let max_connections = self.inner.pool_config.max_connections as usize;
        while self.inner.semaphore.available_permits() < max_connections {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::warn!(
                    "pool closed with leases still outstanding; \
                     they will be force-closed as their owners release them"
                );
                break;
            }
            tokio::select! {
                _ = self.inner.notify.notified() => {}
                () = tokio::time::sleep(remaining) => {}
            }
        }

        tracing::info!("connection pool closed");
    }

    /// Check if the pool is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Get the pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.pool_config
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::Release);
        if let Some(reaper) = self.reaper.take() {
            reaper.abort();
        }
    }
}

/// Fluent builder for [`Pool`].
#[derive(Default)]
pub struct PoolBuilder {
    pool_config: PoolConfig,
    client_config: Option<Config>,
}

impl PoolBuilder {
    /// Set the client configuration used to open new connections.
    #[must_use]
    pub fn client_config(mut self, config: Config) -> Self {
        self.client_config = Some(config);
        self
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_connections(mut self, count: u32) -> Self {
        self.pool_config.max_connections = count;
        self
    }

    /// Set the minimum number of idle connections to retain.
    #[must_use]
    pub fn min_connections(mut self, count: u32) -> Self {
        self.pool_config.min_connections = count;
        self
    }

    /// Set the connection acquisition timeout.
    #[must_use]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.pool_config.connection_timeout = timeout;
        self
    }

    /// Set the idle connection timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.pool_config.idle_timeout = timeout;
        self
    }

    /// Build the pool.
    pub async fn build(self) -> Result<Pool, PoolError> {
        let client_config = self
            .client_config
            .ok_or_else(|| PoolError::Configuration("client_config is required".into()))?;
        Pool::new(self.pool_config, client_config).await
    }
}

/// Status information about the pool.
#[derive(Debug, Clone, Copy)]
pub struct PoolStatus {
    /// Number of idle connections available.
    pub available: u32,
    /// Number of connections currently in use.
    pub in_use: u32,
    /// Total number of connections.
    pub total: u32,
    /// Maximum allowed connections.
    pub max: u32,
}

impl PoolStatus {
    /// Percentage of the pool's capacity currently in use (0.0-100.0).
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.max == 0 {
            return 0.0;
        }
        (f64::from(self.in_use) / f64::from(self.max)) * 100.0
    }
}

/// A snapshot of pool lifecycle counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolMetrics {
    /// Connections opened over the pool's lifetime.
    pub connections_created: u64,
    /// Connections closed (failed validation, reaped, or dropped on shutdown).
    pub connections_closed: u64,
    /// Successful `get`/`try_get` checkouts.
    pub checkouts_successful: u64,
    /// Failed checkouts (timeout or connection errors).
    pub checkouts_failed: u64,
    /// Health checks performed (checkout and, if configured, checkin).
    pub health_checks_performed: u64,
    /// Health checks that failed.
    pub health_checks_failed: u64,
    /// `sp_reset_connection` resets performed on checkin.
    pub resets_performed: u64,
    /// Resets that failed.
    pub resets_failed: u64,
}

impl PoolMetrics {
    /// Fraction of checkouts that succeeded, in `[0.0, 1.0]`.
    #[must_use]
    pub fn checkout_success_rate(&self) -> f64 {
        let total = self.checkouts_successful + self.checkouts_failed;
        if total == 0 {
            return 1.0;
        }
        self.checkouts_successful as f64 / total as f64
    }
}

/// A connection leased from the pool.
///
/// Derefs to [`Client<Ready>`] so queries can be issued directly. When
/// dropped, the connection returns to the idle queue; it is validated and
/// reset (if configured) the next time it is checked out.
pub struct PooledConnection {
    client: Option<Client<Ready>>,
    metadata: ConnectionMetadata,
    permit: Option<OwnedSemaphorePermit>,
    pool: Weak<PoolInner>,
}

impl PooledConnection {
    /// Metadata describing this connection's lifecycle within the pool.
    #[must_use]
    pub fn metadata(&self) -> &ConnectionMetadata {
        &self.metadata
    }

    /// Detach the connection from the pool.
    ///
    /// The connection will not be returned to the pool when dropped, and the
    /// slot it occupied is freed immediately so the pool may open a
    /// replacement. The caller takes ownership of the underlying client.
    pub fn detach(mut self) -> Result<Client<Ready>, PoolError> {
        let client = self.client.take().ok_or(PoolError::PoolClosed)?;
        self.permit.take();
        Ok(client)
    }
}

impl Deref for PooledConnection {
    type Target = Client<Ready>;

    fn deref(&self) -> &Self::Target {
        self.client
            .as_ref()
            .expect("PooledConnection used after detach")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.client
            .as_mut()
            .expect("PooledConnection used after detach")
    }
}

impl Drop for PooledConnection {
    /// Return the connection to the idle queue.
    ///
    /// This is synchronous: validation and `sp_reset_connection` semantics
    /// are applied on the *next* checkout instead, since there's no way to
    /// run the async TDS round-trip a real reset needs from inside `Drop`.
    fn drop(&mut self) {
        let (Some(client), Some(permit)) = (self.client.take(), self.permit.take()) else {
            return;
        };

        let Some(inner) = self.pool.upgrade() else {
            return;
        };

        if inner.closed.load(Ordering::Acquire) {
            inner.metrics.connections_closed.fetch_add(1, Ordering::Relaxed);
            // Wake `Pool::close()`, which may be waiting on outstanding leases
            // to drain before its deadline expires.
            inner.notify.notify_waiters();
            return;
        }

        self.metadata.mark_checkin();
        inner.state.lock().idle.push_back(IdleEntry {
            client,
            metadata: self.metadata.clone(),
            permit,
        });
        inner.notify.notify_waiters();
    }
}
