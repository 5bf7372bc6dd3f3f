use super::{ReactiveConnection, Row, config::ConnectionConfig};
use crate::core::{OrmError, Result, Value};
use async_trait::async_trait;
use futures::future::try_join_all;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Opens physical connections for a pool
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn ReactiveConnection>>;
}

/// Connection pool
///
/// Hands out one connection per session. A connection is owned by exactly
/// one guard at a time, which is what keeps a session's operations strictly
/// sequential.
pub struct ConnectionPool {
    config: ConnectionConfig,
    factory: Arc<dyn ConnectionFactory>,
    available: Arc<Mutex<VecDeque<PooledConnection>>>,
    total_connections: Arc<AtomicUsize>,
}

struct PooledConnection {
    connection: Box<dyn ReactiveConnection>,
    created_at: Instant,
    last_used: Instant,
}

impl PooledConnection {
    fn new(connection: Box<dyn ReactiveConnection>) -> Self {
        let now = Instant::now();
        Self {
            connection,
            created_at: now,
            last_used: now,
        }
    }

    fn returned(connection: Box<dyn ReactiveConnection>, created_at: Instant) -> Self {
        Self {
            connection,
            created_at,
            last_used: Instant::now(),
        }
    }

    fn is_expired(&self, max_lifetime: Option<Duration>) -> bool {
        max_lifetime.is_some_and(|lifetime| self.created_at.elapsed() > lifetime)
    }

    fn is_idle_too_long(&self, idle_timeout: Option<Duration>) -> bool {
        idle_timeout.is_some_and(|timeout| self.last_used.elapsed() > timeout)
    }
}

impl ConnectionPool {
    pub async fn new(config: ConnectionConfig, factory: Arc<dyn ConnectionFactory>) -> Result<Self> {
        config.validate()?;

        let pool = Self {
            config,
            factory,
            available: Arc::new(Mutex::new(VecDeque::new())),
            total_connections: Arc::new(AtomicUsize::new(0)),
        };

        // Pre-create minimum connections
        pool.ensure_min_connections().await?;

        Ok(pool)
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Get a connection from the pool, waiting up to `connect_timeout`.
    pub async fn get_connection(&self) -> Result<PoolGuard> {
        let start = Instant::now();

        loop {
            if let Some(pooled) = self.try_get_available().await {
                return Ok(self.guard(pooled.connection, pooled.created_at));
            }

            if let Some(connection) = self.try_create_connection().await? {
                return Ok(self.guard(connection, Instant::now()));
            }

            if start.elapsed() > self.config.connect_timeout {
                return Err(OrmError::PoolTimeout);
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn guard(&self, connection: Box<dyn ReactiveConnection>, created_at: Instant) -> PoolGuard {
        PoolGuard {
            connection: Some(connection),
            created_at,
            pool: self.available.clone(),
            total_connections: self.total_connections.clone(),
        }
    }

    async fn try_get_available(&self) -> Option<PooledConnection> {
        let mut available = self.available.lock().await;

        let before = available.len();
        available.retain(|pooled| {
            !pooled.is_expired(self.config.max_lifetime)
                && !pooled.is_idle_too_long(self.config.idle_timeout)
        });
        let removed = before - available.len();
        if removed > 0 {
            self.total_connections.fetch_sub(removed, Ordering::SeqCst);
        }

        available.pop_front()
    }

    async fn try_create_connection(&self) -> Result<Option<Box<dyn ReactiveConnection>>> {
        // Reserve the slot before connecting so concurrent callers respect the limit
        let reserved = self
            .total_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |total| {
                (total < self.config.max_connections).then_some(total + 1)
            });
        if reserved.is_err() {
            return Ok(None);
        }

        match self.factory.connect().await {
            Ok(connection) => Ok(Some(connection)),
            Err(e) => {
                self.total_connections.fetch_sub(1, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn ensure_min_connections(&self) -> Result<()> {
        let missing = self
            .config
            .min_connections
            .saturating_sub(self.total_connections.load(Ordering::SeqCst));
        if missing == 0 {
            return Ok(());
        }

        let connections = try_join_all((0..missing).map(|_| self.factory.connect())).await?;

        let mut available = self.available.lock().await;
        for connection in connections {
            available.push_back(PooledConnection::new(connection));
            self.total_connections.fetch_add(1, Ordering::SeqCst);
        }

        Ok(())
    }

    pub async fn stats(&self) -> PoolStats {
        let available = self.available.lock().await;
        let total = self.total_connections.load(Ordering::SeqCst);

        PoolStats {
            total_connections: total,
            available_connections: available.len(),
            active_connections: total.saturating_sub(available.len()),
            max_connections: self.config.max_connections,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolStats {
    pub total_connections: usize,
    pub available_connections: usize,
    pub active_connections: usize,
    pub max_connections: usize,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pool Stats: {}/{} active, {} available, max {}",
            self.active_connections,
            self.total_connections,
            self.available_connections,
            self.max_connections
        )
    }
}

/// RAII guard for pooled connections
///
/// Implements `ReactiveConnection` by delegation and returns the connection
/// to the pool when released or dropped.
pub struct PoolGuard {
    connection: Option<Box<dyn ReactiveConnection>>,
    created_at: Instant,
    pool: Arc<Mutex<VecDeque<PooledConnection>>>,
    total_connections: Arc<AtomicUsize>,
}

impl PoolGuard {
    fn inner(&mut self) -> Result<&mut Box<dyn ReactiveConnection>> {
        self.connection.as_mut().ok_or(OrmError::ConnectionClosed)
    }

    /// Rolls back any open transaction and returns the connection to the pool.
    ///
    /// Prefer this over dropping the guard: rollback is async and cannot run in Drop.
    pub async fn release(mut self) -> Result<()> {
        if let Some(mut connection) = self.connection.take() {
            if connection.is_in_transaction() {
                connection.rollback_transaction().await?;
            }

            let mut pool = self.pool.lock().await;
            pool.push_back(PooledConnection::returned(connection, self.created_at));
        }
        Ok(())
    }
}

#[async_trait]
impl ReactiveConnection for PoolGuard {
    async fn execute(&mut self, sql: &str) -> Result<()> {
        self.inner()?.execute(sql).await
    }

    async fn update(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        self.inner()?.update(sql, params).await
    }

    async fn update_batch(&mut self, sql: &str, params_list: &[Vec<Value>]) -> Result<Vec<u64>> {
        self.inner()?.update_batch(sql, params_list).await
    }

    async fn insert_and_select_identity(&mut self, sql: &str, params: &[Value]) -> Result<Value> {
        self.inner()?.insert_and_select_identity(sql, params).await
    }

    async fn select(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.inner()?.select(sql, params).await
    }

    async fn begin_transaction(&mut self) -> Result<()> {
        self.inner()?.begin_transaction().await
    }

    async fn commit_transaction(&mut self) -> Result<()> {
        self.inner()?.commit_transaction().await
    }

    async fn rollback_transaction(&mut self) -> Result<()> {
        self.inner()?.rollback_transaction().await
    }

    async fn execute_batch(&mut self) -> Result<()> {
        self.inner()?.execute_batch().await
    }

    fn is_in_transaction(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|connection| connection.is_in_transaction())
    }

    /// Closes the physical connection; it does not go back to the pool.
    async fn close(&mut self) -> Result<()> {
        if let Some(mut connection) = self.connection.take() {
            self.total_connections.fetch_sub(1, Ordering::SeqCst);
            connection.close().await?;
        }
        Ok(())
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            if connection.is_in_transaction() {
                log::warn!(
                    "PoolGuard dropped with active transaction; connection discarded. Use release().await."
                );
                self.total_connections.fetch_sub(1, Ordering::SeqCst);
                return;
            }

            if let Ok(mut pool) = self.pool.try_lock() {
                pool.push_back(PooledConnection::returned(connection, self.created_at));
            } else {
                log::warn!("PoolGuard dropped while pool lock busy; connection discarded.");
                self.total_connections.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}
