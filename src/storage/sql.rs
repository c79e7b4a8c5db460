// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL database adapter over sqlx's `Any` driver.
//!
//! One adapter serves both SQLite (the usual embedded database) and
//! Postgres. The adapter only executes statements; everything dialect
//! specific in the SQL itself comes from the
//! [`QueryBuilder`](crate::schema::QueryBuilder).
//!
//! ## sqlx Any Driver Quirks
//!
//! The `Any` driver reports values by storage class, so columns are decoded
//! by trying `i64`, `f64`, `String` and `Vec<u8>` in that order. SQLite's
//! dynamic typing means a column declared `TEXT` may still hand back an
//! integer; the decoded [`SqlValue`] always reflects what is stored.
//!
//! ## In-memory SQLite
//!
//! Every connection to `sqlite::memory:` opens a private database, so the
//! pool is pinned to a single connection that never expires.

use async_trait::async_trait;
use sqlx::any::{AnyArguments, AnyPoolOptions, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, AnyPool, Column, Row as _, ValueRef};
use std::sync::Once;
use std::time::Duration;
use tracing::{debug, info};

use super::traits::{DatabaseAdapter, RunResult, Statement, StorageError};
use crate::codec::{Row, SqlValue};
use crate::resilience::retry::{retry, RetryConfig};
use crate::schema::{Dialect, PgBuilder, QueryBuilder, SqliteBuilder};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

pub struct SqlAdapter {
    pool: AnyPool,
    dialect: Dialect,
}

impl SqlAdapter {
    /// Connect with startup-mode retry (fails fast if config is wrong).
    pub async fn connect(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        let dialect = if connection_string.starts_with("sqlite:") {
            Dialect::Sqlite
        } else {
            Dialect::Postgres
        };
        let in_memory = dialect == Dialect::Sqlite && connection_string.contains(":memory:");

        info!(%dialect, in_memory, "Connecting database adapter");

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            let options = if in_memory {
                AnyPoolOptions::new()
                    .max_connections(1)
                    .min_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None)
            } else {
                AnyPoolOptions::new()
                    .max_connections(8)
                    .idle_timeout(Duration::from_secs(300))
            };
            options
                .acquire_timeout(Duration::from_secs(10))
                .connect(connection_string)
                .await
                .map_err(map_sqlx_error)
        })
        .await?;

        let adapter = Self { pool, dialect };

        if dialect == Dialect::Sqlite && !in_memory {
            adapter.enable_wal_mode().await?;
        }

        Ok(adapter)
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Query builder matching this adapter's dialect.
    pub fn query_builder(&self) -> Box<dyn QueryBuilder> {
        match self.dialect {
            Dialect::Sqlite => Box::new(SqliteBuilder),
            Dialect::Postgres => Box::new(PgBuilder),
        }
    }

    /// Close all pooled connections.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Enable WAL (Write-Ahead Logging) mode for SQLite.
    ///
    /// Readers keep working while the single writer commits, which is what
    /// lets introspection queries run next to remote batch application.
    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }
}

fn map_sqlx_error(err: sqlx::Error) -> StorageError {
    match err.as_database_error() {
        Some(db) if db.is_unique_violation() => StorageError::UniqueViolation(db.message().to_string()),
        _ => StorageError::Backend(err.to_string()),
    }
}

fn bind_args<'q>(
    mut query: Query<'q, Any, AnyArguments<'q>>,
    args: &[SqlValue],
) -> Query<'q, Any, AnyArguments<'q>> {
    for arg in args {
        query = match arg {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::Integer(i) => query.bind(*i),
            SqlValue::Real(r) => query.bind(*r),
            SqlValue::Text(s) => query.bind(s.clone()),
            SqlValue::Blob(b) => query.bind(b.clone()),
        };
    }
    query
}

fn decode_any_row(row: &AnyRow) -> Result<Row, StorageError> {
    let mut out = Row::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let name = column.name().to_string();
        let is_null = row
            .try_get_raw(idx)
            .map(|raw| raw.is_null())
            .map_err(|e| StorageError::Decode {
                column: name.clone(),
                reason: e.to_string(),
            })?;

        let value = if is_null {
            SqlValue::Null
        } else if let Ok(i) = row.try_get::<i64, _>(idx) {
            SqlValue::Integer(i)
        } else if let Ok(r) = row.try_get::<f64, _>(idx) {
            SqlValue::Real(r)
        } else if let Ok(s) = row.try_get::<String, _>(idx) {
            SqlValue::Text(s)
        } else if let Ok(b) = row.try_get::<Vec<u8>, _>(idx) {
            SqlValue::Blob(b)
        } else {
            return Err(StorageError::Decode {
                column: name,
                reason: "unsupported column type".to_string(),
            });
        };
        out.insert(name, value);
    }
    Ok(out)
}

#[async_trait]
impl DatabaseAdapter for SqlAdapter {
    async fn query(&self, statement: &Statement) -> Result<Vec<Row>, StorageError> {
        // Reads are idempotent, so transient pool errors are worth a retry.
        let rows = retry("sql_query", &RetryConfig::query(), || async {
            bind_args(sqlx::query(&statement.sql), &statement.args)
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx_error)
        })
        .await?;

        rows.iter().map(decode_any_row).collect()
    }

    async fn run(&self, statement: &Statement) -> Result<RunResult, StorageError> {
        let result = bind_args(sqlx::query(&statement.sql), &statement.args)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(RunResult {
            rows_affected: result.rows_affected(),
        })
    }

    async fn run_in_transaction(&self, statements: &[Statement]) -> Result<RunResult, StorageError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let mut rows_affected = 0;

        for statement in statements {
            let result = bind_args(sqlx::query(&statement.sql), &statement.args)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
            rows_affected += result.rows_affected();
        }

        tx.commit().await.map_err(map_sqlx_error)?;
        debug!(statements = statements.len(), rows_affected, "Transaction committed");

        Ok(RunResult { rows_affected })
    }
}
