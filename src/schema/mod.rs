// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Table schemas and the dialect-specific query builder.
//!
//! The [`DbSchema`] is the single source of truth for column identity:
//! local writes are filtered against it and incoming changes are validated
//! against it. The [`QueryBuilder`] supplies everything that differs
//! between SQL dialects (placeholder style, column types, default
//! namespace) so the rest of the crate can build statements generically.
//!
//! # Example
//!
//! ```
//! use satellite::schema::{DbSchema, TableSchema, QueryBuilder, SqliteBuilder, PgBuilder};
//!
//! let schema = DbSchema::new("main")
//!     .with_table("items", TableSchema::new(&["id"], &["id", "value"]));
//!
//! assert!(schema.table("items").is_some());
//! assert_eq!(SqliteBuilder.make_positional_param(3), "?");
//! assert_eq!(PgBuilder.make_positional_param(3), "$3");
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec::{Row, SqlValue};

/// A table name qualified by its namespace (schema).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QualifiedTablename {
    pub namespace: String,
    pub tablename: String,
}

impl QualifiedTablename {
    pub fn new(namespace: impl Into<String>, tablename: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            tablename: tablename.into(),
        }
    }
}

impl fmt::Display for QualifiedTablename {
    /// Quoted form, ready to splice into SQL.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}",
            quote_ident(&self.namespace),
            quote_ident(&self.tablename)
        )
    }
}

/// Double-quote an identifier, doubling embedded quotes.
#[must_use]
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Columns of one replicated table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub primary_key: Vec<String>,
    pub columns: Vec<String>,
}

impl TableSchema {
    #[must_use]
    pub fn new(primary_key: &[&str], columns: &[&str]) -> Self {
        Self {
            primary_key: primary_key.iter().map(|c| c.to_string()).collect(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        }
    }

    #[must_use]
    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    #[must_use]
    pub fn is_primary_key(&self, column: &str) -> bool {
        self.primary_key.iter().any(|c| c == column)
    }

    /// Every declared column, taken from `overlay`, then `base`, else NULL.
    ///
    /// Replicated insert and update images are always full rows so a
    /// winning change never leaves columns from a losing one behind.
    #[must_use]
    pub fn full_image(&self, base: &Row, overlay: &Row) -> Row {
        self.columns
            .iter()
            .map(|column| {
                let value = overlay
                    .get(column)
                    .or_else(|| base.get(column))
                    .cloned()
                    .unwrap_or(SqlValue::Null);
                (column.clone(), value)
            })
            .collect()
    }
}

/// Every replicated table the satellite knows about.
#[derive(Debug, Clone, Default)]
pub struct DbSchema {
    namespace: String,
    tables: BTreeMap<String, TableSchema>,
}

impl DbSchema {
    #[must_use]
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            tables: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_table(mut self, tablename: impl Into<String>, table: TableSchema) -> Self {
        self.tables.insert(tablename.into(), table);
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[must_use]
    pub fn table(&self, tablename: &str) -> Option<&TableSchema> {
        self.tables.get(tablename)
    }

    #[must_use]
    pub fn qualified(&self, tablename: &str) -> QualifiedTablename {
        QualifiedTablename::new(&self.namespace, tablename)
    }

    pub fn tablenames(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }
}

/// SQL dialect the builder targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sqlite => write!(f, "SQLite"),
            Self::Postgres => write!(f, "Postgres"),
        }
    }
}

/// Dialect-specific pieces of SQL.
pub trait QueryBuilder: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Namespace used when the configuration does not name one.
    fn default_namespace(&self) -> &'static str;

    /// Placeholder for the 1-based parameter `position`.
    fn make_positional_param(&self, position: usize) -> String;

    /// Column type for 64-bit integers.
    fn big_int_type(&self) -> &'static str;

    /// Column type for binary data.
    fn blob_type(&self) -> &'static str;

    /// Statement creating `namespace` if the dialect has schemas.
    fn create_namespace(&self, namespace: &str) -> Option<String>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteBuilder;

impl QueryBuilder for SqliteBuilder {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn default_namespace(&self) -> &'static str {
        "main"
    }

    fn make_positional_param(&self, _position: usize) -> String {
        "?".to_string()
    }

    fn big_int_type(&self) -> &'static str {
        "INTEGER"
    }

    fn blob_type(&self) -> &'static str {
        "BLOB"
    }

    fn create_namespace(&self, _namespace: &str) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PgBuilder;

impl QueryBuilder for PgBuilder {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn default_namespace(&self) -> &'static str {
        "public"
    }

    fn make_positional_param(&self, position: usize) -> String {
        format!("${}", position)
    }

    fn big_int_type(&self) -> &'static str {
        "BIGINT"
    }

    fn blob_type(&self) -> &'static str {
        "BYTEA"
    }

    fn create_namespace(&self, namespace: &str) -> Option<String> {
        Some(format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(namespace)))
    }
}

/// Comma-separated placeholders `start..start+count` for `builder`.
pub fn placeholders(builder: &dyn QueryBuilder, start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| builder.make_positional_param(i))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("plain"), "\"plain\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_qualified_display() {
        let t = QualifiedTablename::new("main", "items");
        assert_eq!(t.to_string(), "\"main\".\"items\"");
    }

    #[test]
    fn test_placeholders_per_dialect() {
        assert_eq!(placeholders(&SqliteBuilder, 1, 3), "?, ?, ?");
        assert_eq!(placeholders(&PgBuilder, 2, 3), "$2, $3, $4");
        assert_eq!(placeholders(&PgBuilder, 1, 0), "");
    }

    #[test]
    fn test_schema_lookup() {
        let schema = DbSchema::new("main")
            .with_table("items", TableSchema::new(&["id"], &["id", "value"]))
            .with_table("parent", TableSchema::new(&["id"], &["id", "other"]));

        let items = schema.table("items").unwrap();
        assert!(items.has_column("value"));
        assert!(!items.has_column("other"));
        assert!(items.is_primary_key("id"));
        assert!(schema.table("missing").is_none());
        assert_eq!(schema.tablenames().collect::<Vec<_>>(), vec!["items", "parent"]);
        assert_eq!(schema.qualified("items"), QualifiedTablename::new("main", "items"));
    }

    #[test]
    fn test_full_image_fills_every_column() {
        let table = TableSchema::new(&["id"], &["id", "x", "y"]);
        let base: Row = [("id".to_string(), SqlValue::Integer(1)), ("y".to_string(), SqlValue::from("y0"))].into();
        let overlay: Row = [("x".to_string(), SqlValue::from("xa"))].into();

        let image = table.full_image(&base, &overlay);
        assert_eq!(image.get("id"), Some(&SqlValue::Integer(1)));
        assert_eq!(image.get("x"), Some(&SqlValue::from("xa")));
        assert_eq!(image.get("y"), Some(&SqlValue::from("y0")));

        let padded = table.full_image(&Row::new(), &overlay);
        assert_eq!(padded.get("y"), Some(&SqlValue::Null));
        assert_eq!(padded.len(), 3);
    }

    #[test]
    fn test_namespace_creation() {
        assert!(SqliteBuilder.create_namespace("main").is_none());
        assert_eq!(
            PgBuilder.create_namespace("public").unwrap(),
            "CREATE SCHEMA IF NOT EXISTS \"public\""
        );
    }
}
