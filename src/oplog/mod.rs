// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Operation log: replicable entries for committed local writes.
//!
//! Every local insert, update or delete becomes one [`OplogEntry`] with a
//! strictly increasing `rowid`. The entry is written in the same
//! transaction as the user's row mutation and the shadow-tag update, so no
//! intermediate state is ever visible.
//!
//! # Persisted layout
//!
//! ```sql
//! CREATE TABLE "main"."_satellite_oplog" (
//!   rowid INTEGER PRIMARY KEY,   -- monotonic local sequence
//!   namespace TEXT NOT NULL,
//!   tablename TEXT NOT NULL,
//!   optype TEXT NOT NULL,        -- INSERT | UPDATE | DELETE
//!   primary_key TEXT NOT NULL,   -- canonical key, see canonical_primary_key
//!   new_row TEXT,                -- codec envelope
//!   old_row TEXT,                -- codec envelope
//!   timestamp INTEGER NOT NULL,  -- epoch millis
//!   clear_tags TEXT NOT NULL     -- encoded tag set
//! )
//! ```

pub mod statements;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, trace};

use crate::clock::{decode_tags, encode_tags, generate_tag, TagError, TagSet};
use crate::codec::{decode_row, encode_row, CodecError, Row, SqlValue};
use crate::schema::{placeholders, QualifiedTablename, QueryBuilder, DbSchema, TableSchema};
use crate::shadow::{resolve, ShadowTable};
use crate::storage::traits::{DatabaseAdapter, Statement, StorageError};

#[derive(Error, Debug)]
pub enum OplogError {
    #[error("table '{0}' is not part of the replicated schema")]
    UnknownTable(String),
    #[error("table '{table}' change is missing primary key column '{column}'")]
    MissingPrimaryKey { table: String, column: String },
    #[error("unknown optype '{0}'")]
    UnknownOpType(String),
    #[error("oplog row is missing column '{0}'")]
    MissingColumn(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Tags(#[from] TagError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OpType {
    Insert,
    Update,
    Delete,
}

impl OpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpType {
    type Err = OplogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INSERT" => Ok(Self::Insert),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            other => Err(OplogError::UnknownOpType(other.to_string())),
        }
    }
}

/// One replicable mutation.
///
/// Row images and tags are kept in their encoded forms so an entry can be
/// persisted and transmitted without re-encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OplogEntry {
    pub namespace: String,
    pub tablename: String,
    pub optype: OpType,
    /// Monotonic local sequence number
    pub rowid: i64,
    /// Schema-filtered new image (codec envelope)
    pub new_row: String,
    /// Schema-filtered old image for update/delete (codec envelope)
    pub old_row: String,
    /// Canonical primary key
    pub primary_key: String,
    /// Epoch millis
    pub timestamp: i64,
    /// Encoded tag set
    pub clear_tags: String,
}

impl OplogEntry {
    pub fn qualified_tablename(&self) -> QualifiedTablename {
        QualifiedTablename::new(&self.namespace, &self.tablename)
    }

    pub fn new_row(&self) -> Result<Row, CodecError> {
        decode_row(&self.new_row)
    }

    pub fn old_row(&self) -> Result<Row, CodecError> {
        decode_row(&self.old_row)
    }

    pub fn tags(&self) -> Result<TagSet, TagError> {
        decode_tags(&self.clear_tags)
    }
}

/// Canonical string form of a primary key.
///
/// Columns are sorted by name before serialization, so the result never
/// depends on the iteration order of the source map.
///
/// ```
/// use satellite::oplog::canonical_primary_key;
/// use satellite::codec::SqlValue;
/// use std::collections::HashMap;
///
/// let a: HashMap<String, SqlValue> =
///     [("id".into(), SqlValue::Integer(1)), ("tenant".into(), SqlValue::Integer(2))].into();
/// let b: HashMap<String, SqlValue> =
///     [("tenant".into(), SqlValue::Integer(2)), ("id".into(), SqlValue::Integer(1))].into();
///
/// assert_eq!(canonical_primary_key(&a), canonical_primary_key(&b));
/// assert_eq!(canonical_primary_key(&a), r#"{"id":1,"tenant":2}"#);
/// ```
pub fn canonical_primary_key<'a, I>(columns: I) -> String
where
    I: IntoIterator<Item = (&'a String, &'a SqlValue)>,
{
    let sorted: BTreeMap<&str, Value> = columns
        .into_iter()
        .map(|(column, value)| (column.as_str(), value.to_json()))
        .collect();
    // Serializing a map of strings to JSON values cannot fail.
    serde_json::to_string(&sorted).unwrap_or_default()
}

/// Keep only the columns the table declares.
pub fn filter_to_schema(table: &TableSchema, values: &Row) -> Row {
    values
        .iter()
        .filter(|(column, _)| table.has_column(column))
        .map(|(column, value)| (column.clone(), value.clone()))
        .collect()
}

/// Primary key columns drawn from the old image, overridden by the new one.
pub fn primary_key_of(
    tablename: &str,
    table: &TableSchema,
    new_row: &Row,
    old_row: &Row,
) -> Result<Row, OplogError> {
    table
        .primary_key
        .iter()
        .map(|column| {
            new_row
                .get(column)
                .or_else(|| old_row.get(column))
                .map(|value| (column.clone(), value.clone()))
                .ok_or_else(|| OplogError::MissingPrimaryKey {
                    table: tablename.to_string(),
                    column: column.clone(),
                })
        })
        .collect()
}

/// A committed local write waiting to be recorded.
#[derive(Debug, Clone)]
pub struct LocalChange {
    pub tablename: String,
    pub optype: OpType,
    pub timestamp: i64,
    pub new_values: Row,
    pub old_values: Row,
    /// Explicit tags when replaying a change that already carries them
    pub clear_tags: Option<TagSet>,
}

/// The entry for a local change plus the statements that persist it and
/// update the row's shadow tags.
#[derive(Debug, Clone)]
pub struct LocalAppend {
    pub entry: OplogEntry,
    /// Primary key columns of the changed row
    pub primary_key: Row,
    pub statements: Vec<Statement>,
}

/// Captures local mutations as ordered oplog entries.
pub struct OplogEngine {
    schema: Arc<DbSchema>,
    builder: Arc<dyn QueryBuilder>,
    table: QualifiedTablename,
    origin: RwLock<String>,
    last_rowid: AtomicI64,
}

impl OplogEngine {
    pub fn new(schema: Arc<DbSchema>, builder: Arc<dyn QueryBuilder>, table: QualifiedTablename) -> Self {
        Self {
            schema,
            builder,
            table,
            origin: RwLock::new(String::new()),
            last_rowid: AtomicI64::new(0),
        }
    }

    pub fn schema(&self) -> &DbSchema {
        &self.schema
    }

    /// Origin stamped on local tags.
    pub fn origin(&self) -> String {
        self.origin.read().clone()
    }

    pub fn set_origin(&self, origin: impl Into<String>) {
        *self.origin.write() = origin.into();
    }

    /// Highest rowid handed out so far.
    pub fn last_rowid(&self) -> i64 {
        self.last_rowid.load(Ordering::Acquire)
    }

    /// Seed the rowid sequence from the persisted log so rowids keep
    /// increasing across restarts.
    pub async fn load_last_rowid(
        &self,
        adapter: &dyn DatabaseAdapter,
        floor: i64,
    ) -> Result<i64, OplogError> {
        let rows = adapter
            .query(&Statement::new(format!(
                "SELECT MAX(rowid) AS max_rowid FROM {}",
                self.table
            )))
            .await?;
        let persisted = match rows.first().and_then(|r| r.get("max_rowid")) {
            Some(SqlValue::Integer(i)) => *i,
            _ => 0,
        };
        let seeded = persisted.max(floor);
        self.last_rowid.fetch_max(seeded, Ordering::AcqRel);
        debug!(rowid = seeded, "Oplog rowid sequence seeded");
        Ok(seeded)
    }

    /// Record a local change.
    ///
    /// Values are filtered to the table's declared columns. For inserts and
    /// updates the local origin's tag at `timestamp` is merged into the row's
    /// shadow tags and becomes the entry's `clear_tags`; deletes carry the
    /// empty set. Explicit `clear_tags` on the change override both.
    pub fn append_local_change(
        &self,
        shadow: &ShadowTable,
        current_tags: &TagSet,
        change: LocalChange,
    ) -> Result<LocalAppend, OplogError> {
        let table = self
            .schema
            .table(&change.tablename)
            .ok_or_else(|| OplogError::UnknownTable(change.tablename.clone()))?;

        let new_row = filter_to_schema(table, &change.new_values);
        let old_row = match change.optype {
            OpType::Insert => Row::new(),
            OpType::Update | OpType::Delete => filter_to_schema(table, &change.old_values),
        };
        let primary_key = primary_key_of(&change.tablename, table, &new_row, &old_row)?;

        let tags = match (change.clear_tags, change.optype) {
            (Some(explicit), _) => explicit,
            (None, OpType::Delete) => TagSet::new(),
            (None, OpType::Insert | OpType::Update) => {
                std::iter::once(generate_tag(self.origin(), change.timestamp)).collect()
            }
        };

        let rowid = self.last_rowid.fetch_add(1, Ordering::AcqRel) + 1;
        let entry = OplogEntry {
            namespace: self.schema.namespace().to_string(),
            tablename: change.tablename.clone(),
            optype: change.optype,
            rowid,
            new_row: encode_row(&new_row)?,
            old_row: encode_row(&old_row)?,
            primary_key: canonical_primary_key(&primary_key),
            timestamp: change.timestamp,
            clear_tags: encode_tags(&tags),
        };

        let decision = resolve(change.optype, current_tags, &tags);
        let mut statements = vec![self.insert_statement(&entry)];
        statements.extend(shadow.update_statement(
            &entry.qualified_tablename(),
            &entry.primary_key,
            &decision.shadow,
        ));

        trace!(rowid, table = %change.tablename, optype = %change.optype, "Local change appended");
        crate::metrics::record_oplog_append(change.optype.as_str());

        Ok(LocalAppend {
            entry,
            primary_key,
            statements,
        })
    }

    fn insert_statement(&self, entry: &OplogEntry) -> Statement {
        Statement::with_args(
            format!(
                "INSERT INTO {} (rowid, namespace, tablename, optype, primary_key, new_row, old_row, timestamp, clear_tags) VALUES ({})",
                self.table,
                placeholders(self.builder.as_ref(), 1, 9)
            ),
            vec![
                SqlValue::Integer(entry.rowid),
                SqlValue::Text(entry.namespace.clone()),
                SqlValue::Text(entry.tablename.clone()),
                SqlValue::Text(entry.optype.as_str().to_string()),
                SqlValue::Text(entry.primary_key.clone()),
                SqlValue::Text(entry.new_row.clone()),
                SqlValue::Text(entry.old_row.clone()),
                SqlValue::Integer(entry.timestamp),
                SqlValue::Text(entry.clear_tags.clone()),
            ],
        )
    }

    /// Entries with `rowid > after`, oldest first.
    pub async fn entries_after(
        &self,
        adapter: &dyn DatabaseAdapter,
        after: i64,
        limit: usize,
    ) -> Result<Vec<OplogEntry>, OplogError> {
        let statement = Statement::with_args(
            format!(
                "SELECT rowid, namespace, tablename, optype, primary_key, new_row, old_row, timestamp, clear_tags FROM {} WHERE rowid > {} ORDER BY rowid ASC LIMIT {}",
                self.table,
                self.builder.make_positional_param(1),
                limit
            ),
            vec![SqlValue::Integer(after)],
        );
        adapter
            .query(&statement)
            .await?
            .iter()
            .map(entry_from_row)
            .collect()
    }

    /// Drop entries the remote side has acknowledged.
    pub fn compact_statement(&self, acknowledged: i64) -> Statement {
        Statement::with_args(
            format!(
                "DELETE FROM {} WHERE rowid <= {}",
                self.table,
                self.builder.make_positional_param(1)
            ),
            vec![SqlValue::Integer(acknowledged)],
        )
    }
}

fn text_column(row: &Row, column: &str) -> Result<String, OplogError> {
    match row.get(column) {
        Some(SqlValue::Text(s)) => Ok(s.clone()),
        Some(SqlValue::Null) => Ok(String::new()),
        _ => Err(OplogError::MissingColumn(column.to_string())),
    }
}

fn int_column(row: &Row, column: &str) -> Result<i64, OplogError> {
    match row.get(column) {
        Some(SqlValue::Integer(i)) => Ok(*i),
        _ => Err(OplogError::MissingColumn(column.to_string())),
    }
}

/// Rebuild an entry from a persisted oplog row.
pub fn entry_from_row(row: &Row) -> Result<OplogEntry, OplogError> {
    Ok(OplogEntry {
        rowid: int_column(row, "rowid")?,
        namespace: text_column(row, "namespace")?,
        tablename: text_column(row, "tablename")?,
        optype: text_column(row, "optype")?.parse()?,
        primary_key: text_column(row, "primary_key")?,
        new_row: text_column(row, "new_row")?,
        old_row: text_column(row, "old_row")?,
        timestamp: int_column(row, "timestamp")?,
        clear_tags: text_column(row, "clear_tags")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SqliteBuilder;
    use std::collections::HashMap;

    fn engine() -> (OplogEngine, ShadowTable) {
        let schema = Arc::new(
            DbSchema::new("main")
                .with_table("items", TableSchema::new(&["value"], &["value", "other"]))
                .with_table("pair", TableSchema::new(&["id", "tenant"], &["id", "tenant", "v"])),
        );
        let builder: Arc<dyn QueryBuilder> = Arc::new(SqliteBuilder);
        let engine = OplogEngine::new(
            schema,
            builder.clone(),
            QualifiedTablename::new("main", "_satellite_oplog"),
        );
        engine.set_origin("c1");
        let shadow = ShadowTable::new(builder, QualifiedTablename::new("main", "_satellite_shadow"));
        (engine, shadow)
    }

    fn row(values: &[(&str, SqlValue)]) -> Row {
        values.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn change(optype: OpType, new_values: Row, old_values: Row) -> LocalChange {
        LocalChange {
            tablename: "items".into(),
            optype,
            timestamp: 1000,
            new_values,
            old_values,
            clear_tags: None,
        }
    }

    #[test]
    fn test_local_insert_tags_with_local_origin() {
        let (engine, shadow) = engine();
        let append = engine
            .append_local_change(
                &shadow,
                &TagSet::new(),
                change(OpType::Insert, row(&[("value", "a".into())]), Row::new()),
            )
            .unwrap();

        assert_eq!(append.entry.optype, OpType::Insert);
        assert_eq!(append.entry.clear_tags, "c1@1000");
        assert_eq!(append.entry.primary_key, r#"{"value":"a"}"#);
        assert_eq!(append.entry.rowid, 1);
        // oplog insert + shadow upsert
        assert_eq!(append.statements.len(), 2);
    }

    #[test]
    fn test_unknown_columns_are_dropped() {
        let (engine, shadow) = engine();
        let append = engine
            .append_local_change(
                &shadow,
                &TagSet::new(),
                change(
                    OpType::Insert,
                    row(&[("value", "a".into()), ("bogus", SqlValue::Integer(1))]),
                    Row::new(),
                ),
            )
            .unwrap();

        let new_row = append.entry.new_row().unwrap();
        assert!(new_row.contains_key("value"));
        assert!(!new_row.contains_key("bogus"));
    }

    #[test]
    fn test_insert_ignores_old_values() {
        let (engine, shadow) = engine();
        let append = engine
            .append_local_change(
                &shadow,
                &TagSet::new(),
                change(OpType::Insert, row(&[("value", "a".into())]), row(&[("value", "z".into())])),
            )
            .unwrap();
        assert!(append.entry.old_row().unwrap().is_empty());
    }

    #[test]
    fn test_local_delete_defaults_to_empty_tags() {
        let (engine, shadow) = engine();
        let current: TagSet = std::iter::once(generate_tag("c1", 1000)).collect();
        let append = engine
            .append_local_change(
                &shadow,
                &current,
                change(OpType::Delete, Row::new(), row(&[("value", "a".into())])),
            )
            .unwrap();

        assert_eq!(append.entry.clear_tags, "");
        assert_eq!(append.entry.primary_key, r#"{"value":"a"}"#);
        // oplog insert + shadow delete
        assert_eq!(append.statements.len(), 2);
        assert!(append.statements[1].sql.starts_with("DELETE"));
    }

    #[test]
    fn test_explicit_tags_are_preserved_on_replay() {
        let (engine, shadow) = engine();
        let remote: TagSet = [generate_tag("server", 5), generate_tag("c2", 7)].into_iter().collect();
        let mut c = change(OpType::Delete, Row::new(), row(&[("value", "a".into())]));
        c.clear_tags = Some(remote.clone());

        let append = engine.append_local_change(&shadow, &TagSet::new(), c).unwrap();
        assert_eq!(append.entry.tags().unwrap(), remote);
    }

    #[test]
    fn test_rowids_strictly_increase() {
        let (engine, shadow) = engine();
        let mut last = 0;
        for i in 0..10 {
            let append = engine
                .append_local_change(
                    &shadow,
                    &TagSet::new(),
                    change(OpType::Insert, row(&[("value", SqlValue::Integer(i))]), Row::new()),
                )
                .unwrap();
            assert!(append.entry.rowid > last);
            last = append.entry.rowid;
        }
        assert_eq!(engine.last_rowid(), last);
    }

    #[test]
    fn test_unknown_table_rejected() {
        let (engine, shadow) = engine();
        let mut c = change(OpType::Insert, row(&[("value", "a".into())]), Row::new());
        c.tablename = "nope".into();
        assert!(matches!(
            engine.append_local_change(&shadow, &TagSet::new(), c),
            Err(OplogError::UnknownTable(t)) if t == "nope"
        ));
    }

    #[test]
    fn test_missing_primary_key_rejected() {
        let (engine, shadow) = engine();
        let c = change(OpType::Insert, row(&[("other", "x".into())]), Row::new());
        assert!(matches!(
            engine.append_local_change(&shadow, &TagSet::new(), c),
            Err(OplogError::MissingPrimaryKey { column, .. }) if column == "value"
        ));
    }

    #[test]
    fn test_primary_key_merges_old_and_new() {
        let table = TableSchema::new(&["id", "tenant"], &["id", "tenant", "v"]);
        let pk = primary_key_of(
            "pair",
            &table,
            &row(&[("id", SqlValue::Integer(1))]),
            &row(&[("id", SqlValue::Integer(9)), ("tenant", SqlValue::Integer(2))]),
        )
        .unwrap();
        assert_eq!(canonical_primary_key(&pk), r#"{"id":1,"tenant":2}"#);
    }

    #[test]
    fn test_canonical_key_ignores_map_order() {
        let mut a = HashMap::new();
        a.insert("tenant".to_string(), SqlValue::Integer(2));
        a.insert("id".to_string(), SqlValue::Integer(1));
        let b = row(&[("id", SqlValue::Integer(1)), ("tenant", SqlValue::Integer(2))]);
        assert_eq!(canonical_primary_key(&a), canonical_primary_key(&b));
    }

    #[test]
    fn test_canonical_key_keeps_blobs_apart_from_text() {
        let blob = row(&[("id", SqlValue::Blob(vec![0xde, 0xad]))]);
        let text = row(&[("id", SqlValue::Text("\\xdead".into()))]);
        assert_ne!(canonical_primary_key(&blob), canonical_primary_key(&text));
        assert_eq!(canonical_primary_key(&blob), r#"{"id":{"$blob":"dead"}}"#);
    }

    #[test]
    fn test_entry_round_trips_through_persisted_row() {
        let (engine, shadow) = engine();
        let append = engine
            .append_local_change(
                &shadow,
                &TagSet::new(),
                change(OpType::Insert, row(&[("value", "a".into())]), Row::new()),
            )
            .unwrap();
        let insert = &append.statements[0];
        let columns = [
            "rowid", "namespace", "tablename", "optype", "primary_key", "new_row", "old_row",
            "timestamp", "clear_tags",
        ];
        let persisted: Row = columns
            .iter()
            .zip(insert.args.iter())
            .map(|(c, v)| (c.to_string(), v.clone()))
            .collect();
        assert_eq!(entry_from_row(&persisted).unwrap(), append.entry);
    }

    #[test]
    fn test_optype_parse() {
        assert_eq!("UPDATE".parse::<OpType>().unwrap(), OpType::Update);
        assert!("upsert".parse::<OpType>().is_err());
    }
}
