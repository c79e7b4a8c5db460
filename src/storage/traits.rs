// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use thiserror::Error;

use crate::codec::{Row, SqlValue};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    /// A unique or primary key constraint rejected the write.
    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),
    #[error("Failed to decode column '{column}': {reason}")]
    Decode { column: String, reason: String },
}

/// A parameterized statement. Placeholders follow the dialect of the
/// [`QueryBuilder`](crate::schema::QueryBuilder) that built it.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub args: Vec<SqlValue>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(sql: impl Into<String>, args: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            args,
        }
    }
}

/// Outcome of a write statement (or a transaction of them).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunResult {
    pub rows_affected: u64,
}

/// Capability set the satellite needs from an embedded database driver.
///
/// One implementation per backend; the satellite is generic over this
/// trait and never reaches for driver-specific APIs.
#[async_trait]
pub trait DatabaseAdapter: Send + Sync {
    /// Run a read statement and return every row.
    async fn query(&self, statement: &Statement) -> Result<Vec<Row>, StorageError>;

    /// Run a single write statement.
    async fn run(&self, statement: &Statement) -> Result<RunResult, StorageError>;

    /// Run all statements in one atomic transaction. Either all of them
    /// take effect or none do.
    async fn run_in_transaction(&self, statements: &[Statement]) -> Result<RunResult, StorageError>;
}
