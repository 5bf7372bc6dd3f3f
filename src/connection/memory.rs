// ============================================================================
// In-Memory Connection
// ============================================================================
//
// A statement journal standing in for a database server. Connections share
// one `MemoryBackend`; statements become visible in the backend journal when
// they run in auto-commit mode or when their transaction commits, and are
// discarded on rollback. DML passed to `update` is buffered per connection
// when a batch size above one is configured.
//
// ============================================================================

use super::pool::ConnectionFactory;
use super::{ConnectionState, ReactiveConnection, Row};
use crate::core::{OrmError, Result, Value};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{Level, event};

/// A statement as it reached the backend
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedStatement {
    pub connection_id: u64,
    pub sql: String,
    pub params: Vec<Value>,
}

/// Shared state behind every `MemoryConnection`
#[derive(Debug)]
pub struct MemoryBackend {
    journal: Mutex<Vec<ExecutedStatement>>,
    failures: Mutex<Vec<String>>,
    select_results: Mutex<HashMap<String, Vec<Row>>>,
    next_identity: AtomicI64,
    next_connection_id: AtomicU64,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self {
            journal: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            select_results: Mutex::new(HashMap::new()),
            next_identity: AtomicI64::new(1),
            next_connection_id: AtomicU64::new(1),
        }
    }
}

impl MemoryBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Opens a connection that buffers up to `batch_size` DML statements.
    pub fn connect(self: &Arc<Self>, batch_size: usize) -> MemoryConnection {
        let id = self.next_connection_id.fetch_add(1, Ordering::SeqCst);
        MemoryConnection::new(id, Arc::clone(self), batch_size)
    }

    /// Every statement that reached the backend, in arrival order.
    pub fn journal(&self) -> Result<Vec<ExecutedStatement>> {
        Ok(self.journal.lock()?.clone())
    }

    /// Journal SQL text only.
    pub fn statements(&self) -> Result<Vec<String>> {
        Ok(self.journal.lock()?.iter().map(|s| s.sql.clone()).collect())
    }

    /// Statements containing `fragment` fail with a connection error.
    pub fn fail_on(&self, fragment: impl Into<String>) -> Result<()> {
        self.failures.lock()?.push(fragment.into());
        Ok(())
    }

    pub fn clear_failures(&self) -> Result<()> {
        self.failures.lock()?.clear();
        Ok(())
    }

    /// Rows returned by `select` for statements containing `fragment`.
    pub fn stub_select(&self, fragment: impl Into<String>, rows: Vec<Row>) -> Result<()> {
        self.select_results.lock()?.insert(fragment.into(), rows);
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        self.journal.lock()?.clear();
        Ok(())
    }

    fn check_failure(&self, sql: &str) -> Result<()> {
        let failures = self.failures.lock()?;
        if let Some(fragment) = failures.iter().find(|f| sql.contains(f.as_str())) {
            return Err(OrmError::Connection(format!(
                "statement rejected ({}): {}",
                fragment, sql
            )));
        }
        Ok(())
    }

    fn append(&self, statements: Vec<ExecutedStatement>) -> Result<()> {
        self.journal.lock()?.extend(statements);
        Ok(())
    }

    fn rows_for(&self, sql: &str) -> Result<Vec<Row>> {
        let results = self.select_results.lock()?;
        Ok(results
            .iter()
            .find(|(fragment, _)| sql.contains(fragment.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default())
    }
}

/// Connection to a `MemoryBackend`
pub struct MemoryConnection {
    id: u64,
    backend: Arc<MemoryBackend>,
    state: ConnectionState,
    batch_size: usize,
    batch: Vec<ExecutedStatement>,
    transaction: Vec<ExecutedStatement>,
}

impl MemoryConnection {
    fn new(id: u64, backend: Arc<MemoryBackend>, batch_size: usize) -> Self {
        Self {
            id,
            backend,
            state: ConnectionState::Active,
            batch_size,
            batch: Vec::new(),
            transaction: Vec::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of statements waiting for `execute_batch`.
    pub fn pending_batch_len(&self) -> usize {
        self.batch.len()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state == ConnectionState::Closed {
            return Err(OrmError::ConnectionClosed);
        }
        Ok(())
    }

    fn statement(&self, sql: &str, params: &[Value]) -> ExecutedStatement {
        ExecutedStatement {
            connection_id: self.id,
            sql: sql.to_string(),
            params: params.to_vec(),
        }
    }

    fn record(&mut self, statement: ExecutedStatement) -> Result<()> {
        self.backend.check_failure(&statement.sql)?;
        if self.state == ConnectionState::InTransaction {
            self.transaction.push(statement);
            Ok(())
        } else {
            self.backend.append(vec![statement])
        }
    }

    fn flush_batch(&mut self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        event!(Level::TRACE, connection = self.id, size = self.batch.len(), "sending statement batch");
        let mut pending = std::mem::take(&mut self.batch).into_iter();
        while let Some(statement) = pending.next() {
            if let Err(e) = self.backend.check_failure(&statement.sql) {
                // the rejected statement and everything after it stay unsent
                self.batch = std::iter::once(statement).chain(pending).collect();
                return Err(e);
            }
            self.record(statement)?;
        }
        Ok(())
    }
}

#[async_trait]
impl ReactiveConnection for MemoryConnection {
    async fn execute(&mut self, sql: &str) -> Result<()> {
        self.ensure_open()?;
        tokio::task::yield_now().await;
        self.flush_batch()?;
        let statement = self.statement(sql, &[]);
        self.record(statement)
    }

    async fn update(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        self.ensure_open()?;
        tokio::task::yield_now().await;
        let statement = self.statement(sql, params);
        if self.batch_size > 1 {
            self.batch.push(statement);
            if self.batch.len() >= self.batch_size {
                self.flush_batch()?;
            }
        } else {
            self.record(statement)?;
        }
        Ok(1)
    }

    async fn update_batch(&mut self, sql: &str, params_list: &[Vec<Value>]) -> Result<Vec<u64>> {
        let mut counts = Vec::with_capacity(params_list.len());
        for params in params_list {
            counts.push(self.update(sql, params).await?);
        }
        Ok(counts)
    }

    async fn insert_and_select_identity(&mut self, sql: &str, params: &[Value]) -> Result<Value> {
        self.ensure_open()?;
        tokio::task::yield_now().await;
        self.flush_batch()?;
        let statement = self.statement(sql, params);
        self.record(statement)?;
        let id = self.backend.next_identity.fetch_add(1, Ordering::SeqCst);
        Ok(Value::Integer(id))
    }

    async fn select(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.ensure_open()?;
        tokio::task::yield_now().await;
        self.flush_batch()?;
        let statement = self.statement(sql, params);
        self.record(statement)?;
        self.backend.rows_for(sql)
    }

    async fn begin_transaction(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.state == ConnectionState::InTransaction {
            return Err(OrmError::IllegalState("Transaction already active".into()));
        }
        tokio::task::yield_now().await;
        self.flush_batch()?;
        self.state = ConnectionState::InTransaction;
        Ok(())
    }

    async fn commit_transaction(&mut self) -> Result<()> {
        if self.state != ConnectionState::InTransaction {
            return Err(OrmError::IllegalState("No active transaction".into()));
        }
        tokio::task::yield_now().await;
        self.flush_batch()?;
        let committed = std::mem::take(&mut self.transaction);
        self.state = ConnectionState::Active;
        self.backend.append(committed)
    }

    async fn rollback_transaction(&mut self) -> Result<()> {
        if self.state != ConnectionState::InTransaction {
            return Err(OrmError::IllegalState("No active transaction".into()));
        }
        tokio::task::yield_now().await;
        self.batch.clear();
        self.transaction.clear();
        self.state = ConnectionState::Active;
        Ok(())
    }

    async fn execute_batch(&mut self) -> Result<()> {
        self.ensure_open()?;
        tokio::task::yield_now().await;
        self.flush_batch()
    }

    fn is_in_transaction(&self) -> bool {
        self.state == ConnectionState::InTransaction
    }

    async fn close(&mut self) -> Result<()> {
        if self.state == ConnectionState::InTransaction {
            self.rollback_transaction().await?;
        }
        self.state = ConnectionState::Closed;
        Ok(())
    }
}

/// Pool factory opening connections on a shared backend
pub struct MemoryConnectionFactory {
    backend: Arc<MemoryBackend>,
    batch_size: usize,
}

impl MemoryConnectionFactory {
    pub fn new(backend: Arc<MemoryBackend>, batch_size: usize) -> Self {
        Self { backend, batch_size }
    }
}

#[async_trait]
impl ConnectionFactory for MemoryConnectionFactory {
    async fn connect(&self) -> Result<Box<dyn ReactiveConnection>> {
        Ok(Box::new(self.backend.connect(self.batch_size)))
    }
}
