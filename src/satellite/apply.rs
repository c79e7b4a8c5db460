// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Applying remote changes through the causal merge.
//!
//! A batch is validated as a whole before anything is written: one bad
//! entry rejects the batch and moves connectivity to `Error`. Valid
//! batches are merged entry by entry against the shadow table and
//! committed in a single transaction under the writer lock.

use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

use tracing::{debug, error};

use crate::clock::{TagSet, MAX_TIMESTAMP};
use crate::codec::Row;
use crate::notifier::{ChangeOrigin, DataChange, SatelliteEvent};
use crate::oplog::statements::{delete_row, upsert_row};
use crate::oplog::{canonical_primary_key, primary_key_of, OpType, OplogEntry};
use crate::schema::{QualifiedTablename, TableSchema};
use crate::shadow::{resolve, MergeOutcome, RowAction};
use crate::shapes::{ShapeError, ShapeStatus};

use super::{ApplyReport, Satellite, SatelliteError};

/// An incoming entry that passed validation.
struct ValidChange<'a> {
    qualified: QualifiedTablename,
    table: &'a TableSchema,
    optype: OpType,
    /// Full new image, key columns included
    row: Row,
    primary_key: Row,
    canonical_key: String,
    tags: TagSet,
    timestamp: i64,
}

fn malformed(entry: &OplogEntry, reason: impl std::fmt::Display) -> SatelliteError {
    SatelliteError::MalformedChange(format!(
        "{}.{} rowid {}: {}",
        entry.namespace, entry.tablename, entry.rowid, reason
    ))
}

impl Satellite {
    fn validate<'a>(&'a self, entry: &OplogEntry) -> Result<ValidChange<'a>, SatelliteError> {
        if entry.namespace != self.schema.namespace() {
            return Err(malformed(entry, "unknown namespace"));
        }
        let table = self
            .schema
            .table(&entry.tablename)
            .ok_or_else(|| malformed(entry, "unknown table"))?;

        let new_row = entry.new_row().map_err(|e| malformed(entry, e))?;
        let old_row = entry.old_row().map_err(|e| malformed(entry, e))?;
        if let Some(column) = new_row.keys().chain(old_row.keys()).find(|c| !table.has_column(c)) {
            return Err(malformed(entry, format!("unknown column '{}'", column)));
        }

        let tags = entry.tags().map_err(|e| malformed(entry, e))?;
        if entry.optype != OpType::Delete && tags.is_empty() {
            return Err(malformed(entry, "insert/update without tags"));
        }
        let in_range = |ts: i64| (0..=MAX_TIMESTAMP).contains(&ts);
        if !in_range(entry.timestamp) || tags.iter().any(|tag| !in_range(tag.timestamp)) {
            return Err(malformed(entry, "timestamp out of range"));
        }

        let primary_key =
            primary_key_of(&entry.tablename, table, &new_row, &old_row).map_err(|e| malformed(entry, e))?;
        // Images are full rows; columns an entry leaves out are NULL.
        let row = match entry.optype {
            OpType::Insert | OpType::Update => table.full_image(&primary_key, &new_row),
            OpType::Delete => new_row,
        };

        Ok(ValidChange {
            qualified: self.schema.qualified(&entry.tablename),
            table,
            optype: entry.optype,
            canonical_key: canonical_primary_key(&primary_key),
            primary_key,
            row,
            timestamp: entry.timestamp.max(tags.max_timestamp().unwrap_or_default()),
            tags,
        })
    }

    /// Merge a batch of remote changes.
    ///
    /// Duplicates are skipped silently. A malformed entry rejects the whole
    /// batch and moves connectivity to `Error`.
    #[tracing::instrument(skip(self, entries), fields(name = %self.name, entries = entries.len()))]
    pub async fn apply_remote_batch(&self, entries: &[OplogEntry]) -> Result<ApplyReport, SatelliteError> {
        match self.apply_entries(entries, ChangeOrigin::Remote, None).await {
            Err(SatelliteError::MalformedChange(reason)) => {
                error!(error = %reason, "Rejected remote batch");
                crate::metrics::record_rejected_batch("malformed");
                self.connectivity.fail(format!("malformed change: {}", reason));
                Err(SatelliteError::MalformedChange(reason))
            }
            other => other,
        }
    }

    /// Merge `entries` in one transaction. With `shape` set, the batch is a
    /// snapshot for that shape and is dropped unless the shape is still
    /// `Active` once the writer lock is held.
    pub(super) async fn apply_entries(
        &self,
        entries: &[OplogEntry],
        origin: ChangeOrigin,
        shape: Option<&str>,
    ) -> Result<ApplyReport, SatelliteError> {
        let started = Instant::now();
        let changes = entries
            .iter()
            .map(|entry| self.validate(entry))
            .collect::<Result<Vec<_>, _>>()?;

        let mut report = ApplyReport::default();
        let mut tables = BTreeSet::new();
        let mut newest = None;

        {
            let _writer = self.writer.lock().await;
            if let Some(key) = shape {
                if self.shapes.status(key) != Some(ShapeStatus::Active) {
                    return Err(ShapeError::Unsubscribed(key.to_string()).into());
                }
            }
            // Tags as they stand after earlier entries of this batch.
            let mut overlay: HashMap<(QualifiedTablename, String), TagSet> = HashMap::new();
            let mut statements = Vec::new();

            for change in changes {
                newest = newest.max(Some(change.timestamp));
                let slot = (change.qualified.clone(), change.canonical_key.clone());
                let local = match overlay.get(&slot) {
                    Some(tags) => tags.clone(),
                    None => {
                        self.shadow
                            .load(self.adapter.as_ref(), &change.qualified, &change.canonical_key)
                            .await?
                    }
                };

                let decision = resolve(change.optype, &local, &change.tags);
                crate::metrics::record_merge(origin.as_str(), decision.outcome.as_str());
                if decision.outcome == MergeOutcome::SkippedDuplicate {
                    debug!(
                        table = %change.qualified,
                        primary_key = %change.canonical_key,
                        "Skipping already observed change"
                    );
                    report.skipped += 1;
                    continue;
                }
                report.applied += 1;

                match decision.row {
                    RowAction::Write => statements.push(upsert_row(
                        self.builder.as_ref(),
                        &change.qualified,
                        change.table,
                        &change.row,
                    )),
                    RowAction::Delete => statements.push(delete_row(
                        self.builder.as_ref(),
                        &change.qualified,
                        change.table,
                        &change.primary_key,
                    )),
                    RowAction::Keep => {}
                }
                statements.extend(self.shadow.update_statement(
                    &change.qualified,
                    &change.canonical_key,
                    &decision.shadow,
                ));

                overlay.insert(slot, decision.shadow.resulting_tags(&local));
                tables.insert(change.qualified);
            }

            if !statements.is_empty() {
                self.adapter.run_in_transaction(&statements).await?;
            }
        }

        if let Some(ts) = newest {
            self.clock.receive(ts);
        }
        crate::metrics::record_apply_latency(origin.as_str(), started.elapsed());

        if report.applied > 0 {
            self.notifier.emit(SatelliteEvent::DataChanged(DataChange {
                origin,
                tables,
                row_count: report.applied,
            }));
        }
        debug!(applied = report.applied, skipped = report.skipped, "Batch merged");
        Ok(report)
    }
}
