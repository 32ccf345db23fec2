//! Capabilities the session layer needs from a SQL Server driver.
//!
//! The session never talks to the network itself. A driver supplies a
//! [`PoolFactory`]; pools mint [`Request`] contexts and begin
//! [`TransactionHandle`]s. All traits are object safe so sessions can hold
//! them behind `Arc<dyn ...>` / `Box<dyn ...>`.

use std::sync::Arc;

use async_trait::async_trait;

use super::config::PoolOptions;
use crate::ast::Value;
use crate::error::DriverError;

/// One result row, column name → value.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Statement kind, derived from the leading keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    Other,
}

impl StatementKind {
    pub fn detect(sql: &str) -> Self {
        let keyword = sql
            .trim_start()
            .split(|c: char| c.is_whitespace() || c == '(')
            .next()
            .unwrap_or_default()
            .to_lowercase();
        match keyword.as_str() {
            "select" | "with" => StatementKind::Select,
            "insert" => StatementKind::Insert,
            "update" => StatementKind::Update,
            "delete" => StatementKind::Delete,
            _ => StatementKind::Other,
        }
    }

    pub fn returns_rows(&self) -> bool {
        matches!(self, StatementKind::Select | StatementKind::Other)
    }
}

/// What a driver hands back for one executed batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawResponse {
    /// Affected-row count per statement in the batch.
    pub rows_affected: Vec<u64>,
    /// Result sets in the order the server produced them.
    pub recordsets: Vec<Vec<Record>>,
}

/// A checked-out unit of work bound to one physical connection.
#[async_trait]
pub trait Request: Send {
    /// Execute `sql` with named parameters (`@P1` → value).
    async fn execute(
        &mut self,
        sql: &str,
        params: &[(String, Value)],
        kind: StatementKind,
    ) -> Result<RawResponse, DriverError>;
}

/// A transaction that has been begun on one physical connection.
///
/// Dropping a handle without commit or rollback must roll the transaction
/// back before its connection is reused.
#[async_trait]
pub trait TransactionHandle: Send {
    /// Mint a request context bound to this transaction.
    fn request(&self) -> Box<dyn Request>;

    async fn commit(self: Box<Self>) -> Result<(), DriverError>;

    async fn rollback(self: Box<Self>) -> Result<(), DriverError>;
}

/// A connection pool for one connection signature.
#[async_trait]
pub trait Pool: Send + Sync {
    /// Mint a new request context. Does not touch the network.
    fn request(&self) -> Box<dyn Request>;

    async fn begin(&self) -> Result<Box<dyn TransactionHandle>, DriverError>;

    async fn close(&self);
}

/// Builds pools from dialect-specific options.
#[async_trait]
pub trait PoolFactory: Send + Sync {
    async fn create(&self, options: &PoolOptions) -> Result<Arc<dyn Pool>, DriverError>;
}
