//! Error types for the compiler and the session layer.

use std::error::Error as StdError;

use thiserror::Error;

/// Malformed descriptor input. Raised synchronously, before any I/O.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("select has neither a table nor a join clause")]
    EmptyTable,

    #[error("pagination requires a non-zero row count (offset {offset})")]
    EmptyPage { offset: u64 },

    #[error("pagination range overflows: offset {offset} + count {count}")]
    PageOverflow { offset: u64, count: u64 },

    #[error("table [{0}] has no columns")]
    NoColumns(String),

    #[error("table [{0}] has more than one identity column")]
    MultipleIdentity(String),

    #[error("statement has {placeholders} placeholder(s) but {bindings} binding(s)")]
    BindingCount { placeholders: usize, bindings: usize },
}

/// Error reported by an injected driver capability.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct DriverError {
    pub message: String,
    /// Server error number, when the driver reports one.
    pub code: Option<u32>,
    #[source]
    pub source: Option<Box<dyn StdError + Send + Sync>>,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            source: None,
        }
    }

    pub fn with_code(mut self, code: u32) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

/// The main error type for adapter operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Compile(#[from] CompileError),

    /// Pool creation or acquisition failed. The registry is left untouched.
    #[error("connection to {signature} failed: {source}")]
    Connection {
        signature: String,
        #[source]
        source: DriverError,
    },

    /// Statement execution failed. The session stays connected.
    #[error("query failed: {source}")]
    Query {
        sql: String,
        #[source]
        source: DriverError,
    },

    #[error("transaction {action} failed: {source}")]
    Transaction {
        action: &'static str,
        #[source]
        source: DriverError,
    },

    #[error("a transaction is already active on this session")]
    TransactionActive,

    #[error("no active transaction")]
    NoTransaction,

    #[error("session has no request context")]
    NotConnected,

    /// A transaction body failed and the rollback issued on its behalf failed too.
    #[error("{cause} (rollback also failed: {rollback})")]
    Rollback {
        #[source]
        cause: Box<Error>,
        rollback: Box<Error>,
    },
}

impl Error {
    pub fn query(sql: &str, source: DriverError) -> Self {
        Self::Query {
            sql: sql.to_string(),
            source,
        }
    }

    /// Driver error code of the underlying failure, if any.
    pub fn code(&self) -> Option<u32> {
        match self {
            Error::Connection { source, .. }
            | Error::Query { source, .. }
            | Error::Transaction { source, .. } => source.code,
            Error::Rollback { cause, .. } => cause.code(),
            _ => None,
        }
    }
}

/// Result type alias for adapter operations.
pub type Result<T> = std::result::Result<T, Error>;
