// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Statements that apply a row image to a user table.

use crate::codec::{Row, SqlValue};
use crate::schema::{placeholders, quote_ident, QualifiedTablename, QueryBuilder, TableSchema};
use crate::storage::traits::Statement;

/// `INSERT .. ON CONFLICT (pk) DO UPDATE` over the columns present in `row`.
///
/// Columns absent from `row` keep their current value on update, so partial
/// update images only touch what they carry.
pub fn upsert_row(
    builder: &dyn QueryBuilder,
    tablename: &QualifiedTablename,
    table: &TableSchema,
    row: &Row,
) -> Statement {
    let columns: Vec<&String> = row.keys().collect();
    let quoted: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    let conflict: Vec<String> = table.primary_key.iter().map(|c| quote_ident(c)).collect();
    let updates: Vec<String> = columns
        .iter()
        .filter(|c| !table.is_primary_key(c))
        .map(|c| format!("{0} = excluded.{0}", quote_ident(c)))
        .collect();

    let on_conflict = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };

    Statement::with_args(
        format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) {}",
            tablename,
            quoted.join(", "),
            placeholders(builder, 1, columns.len()),
            conflict.join(", "),
            on_conflict
        ),
        row.values().cloned().collect(),
    )
}

fn key_predicate(builder: &dyn QueryBuilder, table: &TableSchema, start: usize) -> String {
    table
        .primary_key
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = {}", quote_ident(c), builder.make_positional_param(start + i)))
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn key_args(table: &TableSchema, primary_key: &Row) -> Vec<SqlValue> {
    table
        .primary_key
        .iter()
        .map(|c| primary_key.get(c).cloned().unwrap_or(SqlValue::Null))
        .collect()
}

pub fn delete_row(
    builder: &dyn QueryBuilder,
    tablename: &QualifiedTablename,
    table: &TableSchema,
    primary_key: &Row,
) -> Statement {
    Statement::with_args(
        format!("DELETE FROM {} WHERE {}", tablename, key_predicate(builder, table, 1)),
        key_args(table, primary_key),
    )
}

/// Current image of one row, all declared columns.
pub fn select_row(
    builder: &dyn QueryBuilder,
    tablename: &QualifiedTablename,
    table: &TableSchema,
    primary_key: &Row,
) -> Statement {
    let columns: Vec<String> = table.columns.iter().map(|c| quote_ident(c)).collect();
    Statement::with_args(
        format!(
            "SELECT {} FROM {} WHERE {}",
            columns.join(", "),
            tablename,
            key_predicate(builder, table, 1)
        ),
        key_args(table, primary_key),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{PgBuilder, SqliteBuilder};

    fn table() -> TableSchema {
        TableSchema::new(&["id"], &["id", "value"])
    }

    fn row(values: &[(&str, SqlValue)]) -> Row {
        values.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_upsert_updates_non_key_columns() {
        let stmt = upsert_row(
            &SqliteBuilder,
            &QualifiedTablename::new("main", "items"),
            &table(),
            &row(&[("id", SqlValue::Integer(1)), ("value", SqlValue::Text("a".into()))]),
        );
        assert_eq!(
            stmt.sql,
            "INSERT INTO \"main\".\"items\" (\"id\", \"value\") VALUES (?, ?) ON CONFLICT (\"id\") DO UPDATE SET \"value\" = excluded.\"value\""
        );
        assert_eq!(stmt.args, vec![SqlValue::Integer(1), SqlValue::Text("a".into())]);
    }

    #[test]
    fn test_upsert_of_key_only_row_does_nothing_on_conflict() {
        let stmt = upsert_row(
            &PgBuilder,
            &QualifiedTablename::new("public", "items"),
            &table(),
            &row(&[("id", SqlValue::Integer(1))]),
        );
        assert!(stmt.sql.ends_with("VALUES ($1) ON CONFLICT (\"id\") DO NOTHING"));
    }

    #[test]
    fn test_delete_and_select_bind_key_in_order() {
        let composite = TableSchema::new(&["a", "b"], &["a", "b", "v"]);
        let pk = row(&[("b", SqlValue::Integer(2)), ("a", SqlValue::Integer(1))]);
        let name = QualifiedTablename::new("public", "t");

        let delete = delete_row(&PgBuilder, &name, &composite, &pk);
        assert_eq!(delete.sql, "DELETE FROM \"public\".\"t\" WHERE \"a\" = $1 AND \"b\" = $2");
        assert_eq!(delete.args, vec![SqlValue::Integer(1), SqlValue::Integer(2)]);

        let select = select_row(&PgBuilder, &name, &composite, &pk);
        assert!(select.sql.starts_with("SELECT \"a\", \"b\", \"v\" FROM"));
        assert_eq!(select.args, delete.args);
    }
}
