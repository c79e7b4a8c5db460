// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Key/value metadata persisted next to the oplog.

use crate::codec::SqlValue;
use crate::schema::{QualifiedTablename, QueryBuilder};
use crate::storage::traits::{DatabaseAdapter, Statement, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MetaKey {
    ClientId,
    LastSentRowId,
    LastAckdRowId,
    /// JSON list of requested shape definitions
    Subscriptions,
}

impl MetaKey {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::ClientId => "clientId",
            Self::LastSentRowId => "lastSentRowId",
            Self::LastAckdRowId => "lastAckdRowId",
            Self::Subscriptions => "subscriptions",
        }
    }
}

pub(crate) async fn get(
    adapter: &dyn DatabaseAdapter,
    builder: &dyn QueryBuilder,
    table: &QualifiedTablename,
    key: MetaKey,
) -> Result<Option<String>, StorageError> {
    let rows = adapter
        .query(&Statement::with_args(
            format!(
                "SELECT value FROM {} WHERE key = {}",
                table,
                builder.make_positional_param(1)
            ),
            vec![SqlValue::Text(key.as_str().to_string())],
        ))
        .await?;
    Ok(rows.into_iter().next().and_then(|mut row| match row.remove("value") {
        Some(SqlValue::Text(v)) => Some(v),
        Some(SqlValue::Integer(i)) => Some(i.to_string()),
        _ => None,
    }))
}

pub(crate) async fn get_rowid(
    adapter: &dyn DatabaseAdapter,
    builder: &dyn QueryBuilder,
    table: &QualifiedTablename,
    key: MetaKey,
) -> Result<i64, StorageError> {
    Ok(get(adapter, builder, table, key)
        .await?
        .and_then(|v| v.parse().ok())
        .unwrap_or(0))
}

pub(crate) fn set(
    builder: &dyn QueryBuilder,
    table: &QualifiedTablename,
    key: MetaKey,
    value: impl Into<String>,
) -> Statement {
    Statement::with_args(
        format!(
            "INSERT INTO {} (key, value) VALUES ({}, {}) ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            table,
            builder.make_positional_param(1),
            builder.make_positional_param(2)
        ),
        vec![
            SqlValue::Text(key.as_str().to_string()),
            SqlValue::Text(value.into()),
        ],
    )
}
