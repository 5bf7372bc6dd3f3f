// ============================================================================
// Asynchronous Connection Contract
// ============================================================================
//
// The only surface the write path uses to reach the database. Every method
// is a suspension point. Methods take `&mut self`, so one connection can
// never have two operations in flight: callers chain them with `.await`.
//
// ============================================================================

pub mod config;
pub mod memory;
pub mod pool;

use crate::core::{Result, Value};
use async_trait::async_trait;

pub type Row = Vec<Value>;

#[async_trait]
pub trait ReactiveConnection: Send {
    /// Runs a statement without parameters (DDL, session settings).
    async fn execute(&mut self, sql: &str) -> Result<()>;

    /// Runs one DML statement and returns the affected row count.
    ///
    /// The statement may be buffered into the connection's batch; the count
    /// is then the expected one and errors surface on `execute_batch`.
    async fn update(&mut self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Runs the same DML statement once per parameter set.
    async fn update_batch(&mut self, sql: &str, params_list: &[Vec<Value>]) -> Result<Vec<u64>>;

    /// Runs an insert and returns the identifier the database generated.
    async fn insert_and_select_identity(&mut self, sql: &str, params: &[Value]) -> Result<Value>;

    async fn select(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    async fn begin_transaction(&mut self) -> Result<()>;

    async fn commit_transaction(&mut self) -> Result<()>;

    async fn rollback_transaction(&mut self) -> Result<()>;

    /// Sends any statements buffered by `update`.
    async fn execute_batch(&mut self) -> Result<()>;

    fn is_in_transaction(&self) -> bool;

    async fn close(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Active,
    InTransaction,
    Closed,
}
