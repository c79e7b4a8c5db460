// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shadow table and causal merge.
//!
//! The shadow table holds one tag set per touched row: the newest tag each
//! origin contributed to the row's current value. Every change, local or
//! remote, goes through [`resolve`] against that set before anything is
//! written, which is what makes replicas converge no matter in which order
//! (or how often) they observe the same changes.
//!
//! # Merge rules
//!
//! | optype          | incoming ⊆ local | result                                      |
//! |-----------------|------------------|---------------------------------------------|
//! | insert / update | yes              | skipped duplicate, nothing written          |
//! | insert / update | no               | tags merged per origin, row written if newer|
//! | delete          | n/a              | tags replaced by incoming, row deleted      |
//!
//! An empty tag set after a delete removes the shadow entry, so a later
//! insert starts from a clean history.

use std::sync::Arc;

use tracing::trace;

use crate::clock::{decode_tags, encode_tags, merge_tag_sets, TagError, TagSet};
use crate::codec::{Row, SqlValue};
use crate::oplog::OpType;
use crate::schema::{placeholders, QualifiedTablename, QueryBuilder};
use crate::storage::traits::{DatabaseAdapter, Statement, StorageError};

/// What a merge did with a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Applied,
    SkippedDuplicate,
}

impl MergeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::SkippedDuplicate => "skipped_duplicate",
        }
    }
}

/// Effect on the visible row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowAction {
    /// Leave the row as it is
    Keep,
    /// Write the incoming image
    Write,
    Delete,
}

/// Effect on the shadow entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShadowUpdate {
    Keep,
    Upsert(TagSet),
    Remove,
}

impl ShadowUpdate {
    /// Tag set the row ends up with, given what it had before.
    pub fn resulting_tags(&self, before: &TagSet) -> TagSet {
        match self {
            Self::Keep => before.clone(),
            Self::Upsert(tags) => tags.clone(),
            Self::Remove => TagSet::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeDecision {
    pub outcome: MergeOutcome,
    pub row: RowAction,
    pub shadow: ShadowUpdate,
}

/// Decide how a change with `incoming` tags applies to a row whose shadow
/// holds `local`.
///
/// Pure: the caller turns the decision into statements. Incoming values win
/// when they causally dominate the local history, or when their newest tag
/// sorts after the local newest by `(timestamp, origin)`. Otherwise only the
/// tags merge and the current value stays.
pub fn resolve(optype: OpType, local: &TagSet, incoming: &TagSet) -> MergeDecision {
    match optype {
        OpType::Delete => MergeDecision {
            outcome: MergeOutcome::Applied,
            row: RowAction::Delete,
            shadow: if incoming.is_empty() {
                ShadowUpdate::Remove
            } else {
                ShadowUpdate::Upsert(incoming.clone())
            },
        },
        OpType::Insert | OpType::Update => {
            if incoming.is_subset(local) {
                return MergeDecision {
                    outcome: MergeOutcome::SkippedDuplicate,
                    row: RowAction::Keep,
                    shadow: ShadowUpdate::Keep,
                };
            }

            let dominates = local.is_subset(incoming);
            let newer = match (incoming.newest(), local.newest()) {
                (Some(theirs), Some(ours)) => theirs.stamp() > ours.stamp(),
                (Some(_), None) => true,
                (None, _) => false,
            };

            MergeDecision {
                outcome: MergeOutcome::Applied,
                row: if dominates || newer {
                    RowAction::Write
                } else {
                    RowAction::Keep
                },
                shadow: ShadowUpdate::Upsert(merge_tag_sets(local, incoming)),
            }
        }
    }
}

/// One persisted shadow row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowEntry {
    pub namespace: String,
    pub tablename: String,
    pub primary_key: String,
    pub tags: String,
}

/// Statements over the persisted shadow table.
pub struct ShadowTable {
    builder: Arc<dyn QueryBuilder>,
    table: QualifiedTablename,
}

impl ShadowTable {
    pub fn new(builder: Arc<dyn QueryBuilder>, table: QualifiedTablename) -> Self {
        Self { builder, table }
    }

    fn key_predicate(&self) -> String {
        format!(
            "namespace = {} AND tablename = {} AND primary_key = {}",
            self.builder.make_positional_param(1),
            self.builder.make_positional_param(2),
            self.builder.make_positional_param(3)
        )
    }

    fn key_args(row: &QualifiedTablename, primary_key: &str) -> Vec<SqlValue> {
        vec![
            SqlValue::Text(row.namespace.clone()),
            SqlValue::Text(row.tablename.clone()),
            SqlValue::Text(primary_key.to_string()),
        ]
    }

    /// Current tags for a row; empty when it has no shadow entry.
    pub async fn load(
        &self,
        adapter: &dyn DatabaseAdapter,
        tablename: &QualifiedTablename,
        primary_key: &str,
    ) -> Result<TagSet, ShadowError> {
        let rows = adapter
            .query(&Statement::with_args(
                format!("SELECT tags FROM {} WHERE {}", self.table, self.key_predicate()),
                Self::key_args(tablename, primary_key),
            ))
            .await?;

        match rows.first().and_then(|r| r.get("tags")) {
            Some(SqlValue::Text(encoded)) => Ok(decode_tags(encoded)?),
            _ => Ok(TagSet::new()),
        }
    }

    /// Statement persisting `update`, or `None` when nothing changes.
    pub fn update_statement(
        &self,
        tablename: &QualifiedTablename,
        primary_key: &str,
        update: &ShadowUpdate,
    ) -> Option<Statement> {
        match update {
            ShadowUpdate::Keep => None,
            ShadowUpdate::Remove => Some(Statement::with_args(
                format!("DELETE FROM {} WHERE {}", self.table, self.key_predicate()),
                Self::key_args(tablename, primary_key),
            )),
            ShadowUpdate::Upsert(tags) => {
                trace!(table = %tablename, primary_key, tags = %encode_tags(tags), "Shadow upsert");
                let mut args = Self::key_args(tablename, primary_key);
                args.push(SqlValue::Text(encode_tags(tags)));
                Some(Statement::with_args(
                    format!(
                        "INSERT INTO {} (namespace, tablename, primary_key, tags) VALUES ({}) \
                         ON CONFLICT (namespace, tablename, primary_key) DO UPDATE SET tags = excluded.tags",
                        self.table,
                        placeholders(self.builder.as_ref(), 1, 4)
                    ),
                    args,
                ))
            }
        }
    }

    /// Every shadow entry, for introspection.
    pub async fn entries(&self, adapter: &dyn DatabaseAdapter) -> Result<Vec<ShadowEntry>, ShadowError> {
        let rows = adapter
            .query(&Statement::new(format!(
                "SELECT namespace, tablename, primary_key, tags FROM {} ORDER BY namespace, tablename, primary_key",
                self.table
            )))
            .await?;
        Ok(rows.iter().map(shadow_entry_from_row).collect())
    }
}

fn text(row: &Row, column: &str) -> String {
    match row.get(column) {
        Some(SqlValue::Text(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

fn shadow_entry_from_row(row: &Row) -> ShadowEntry {
    ShadowEntry {
        namespace: text(row, "namespace"),
        tablename: text(row, "tablename"),
        primary_key: text(row, "primary_key"),
        tags: text(row, "tags"),
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ShadowError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("corrupt shadow tags: {0}")]
    Tags(#[from] TagError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::generate_tag;
    use crate::schema::SqliteBuilder;

    fn tags(pairs: &[(&str, i64)]) -> TagSet {
        pairs.iter().map(|(o, t)| generate_tag(*o, *t)).collect()
    }

    #[test]
    fn test_superset_update_applies_and_merges() {
        let decision = resolve(
            OpType::Update,
            &tags(&[("c1", 1000)]),
            &tags(&[("c1", 1000), ("server", 2000)]),
        );
        assert_eq!(decision.outcome, MergeOutcome::Applied);
        assert_eq!(decision.row, RowAction::Write);
        assert_eq!(
            decision.shadow,
            ShadowUpdate::Upsert(tags(&[("c1", 1000), ("server", 2000)]))
        );
    }

    #[test]
    fn test_echo_is_skipped() {
        let decision = resolve(OpType::Insert, &tags(&[("c1", 1000)]), &tags(&[("c1", 1000)]));
        assert_eq!(decision.outcome, MergeOutcome::SkippedDuplicate);
        assert_eq!(decision.row, RowAction::Keep);
        assert_eq!(decision.shadow, ShadowUpdate::Keep);
    }

    #[test]
    fn test_delete_replaces_tags() {
        let empty = resolve(OpType::Delete, &tags(&[("c1", 1000)]), &TagSet::new());
        assert_eq!(empty.row, RowAction::Delete);
        assert_eq!(empty.shadow, ShadowUpdate::Remove);

        let kept = resolve(OpType::Delete, &tags(&[("c1", 1000)]), &tags(&[("c2", 5)]));
        assert_eq!(kept.outcome, MergeOutcome::Applied);
        assert_eq!(kept.shadow, ShadowUpdate::Upsert(tags(&[("c2", 5)])));
    }

    #[test]
    fn test_delete_is_never_a_duplicate() {
        let decision = resolve(OpType::Delete, &TagSet::new(), &TagSet::new());
        assert_eq!(decision.outcome, MergeOutcome::Applied);
    }

    #[test]
    fn test_insert_after_tombstone_starts_fresh() {
        let after_delete = resolve(OpType::Delete, &tags(&[("c1", 1000)]), &TagSet::new())
            .shadow
            .resulting_tags(&tags(&[("c1", 1000)]));
        let insert = resolve(OpType::Insert, &after_delete, &tags(&[("c1", 3000)]));
        assert_eq!(insert.shadow, ShadowUpdate::Upsert(tags(&[("c1", 3000)])));
    }

    #[test]
    fn test_concurrent_older_change_merges_tags_only() {
        let decision = resolve(OpType::Update, &tags(&[("a", 20)]), &tags(&[("b", 10)]));
        assert_eq!(decision.outcome, MergeOutcome::Applied);
        assert_eq!(decision.row, RowAction::Keep);
        assert_eq!(decision.shadow, ShadowUpdate::Upsert(tags(&[("a", 20), ("b", 10)])));
    }

    #[test]
    fn test_concurrent_changes_commute() {
        let a = tags(&[("a", 10)]);
        let b = tags(&[("b", 10)]);

        let ab = resolve(OpType::Update, &resolve(OpType::Update, &TagSet::new(), &a).shadow.resulting_tags(&TagSet::new()), &b);
        let ba = resolve(OpType::Update, &resolve(OpType::Update, &TagSet::new(), &b).shadow.resulting_tags(&TagSet::new()), &a);

        assert_eq!(ab.shadow, ba.shadow);
        // (10, "b") beats (10, "a"), so only b's write survives either way.
        assert_eq!(ab.row, RowAction::Write);
        assert_eq!(ba.row, RowAction::Keep);
    }

    #[test]
    fn test_update_statements() {
        let shadow = ShadowTable::new(
            Arc::new(SqliteBuilder),
            QualifiedTablename::new("main", "_satellite_shadow"),
        );
        let row = QualifiedTablename::new("main", "items");

        assert!(shadow.update_statement(&row, "{}", &ShadowUpdate::Keep).is_none());

        let upsert = shadow
            .update_statement(&row, r#"{"id":1}"#, &ShadowUpdate::Upsert(tags(&[("c1", 1)])))
            .unwrap();
        assert!(upsert.sql.contains("ON CONFLICT (namespace, tablename, primary_key)"));
        assert_eq!(upsert.args.last(), Some(&SqlValue::Text("c1@1".into())));

        let remove = shadow.update_statement(&row, r#"{"id":1}"#, &ShadowUpdate::Remove).unwrap();
        assert!(remove.sql.starts_with("DELETE FROM \"main\".\"_satellite_shadow\""));
        assert_eq!(remove.args.len(), 3);
    }
}
