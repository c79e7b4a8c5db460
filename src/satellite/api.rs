// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Application-facing API: local writes, queries, shape subscriptions and
//! event subscriptions.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::client::ClientError;
use crate::codec::Row;
use crate::connectivity::ConnectivityStatus;
use crate::notifier::{ChangeOrigin, DataChange, EventKind, SatelliteEvent, SubscriptionToken};
use crate::oplog::statements::{delete_row, select_row, upsert_row};
use crate::oplog::{canonical_primary_key, filter_to_schema, primary_key_of, LocalChange, OpType, OplogEntry};
use crate::schema::{QualifiedTablename, TableSchema};
use crate::shadow::ShadowEntry;
use crate::shapes::{Shape, ShapeDefinition, ShapeError, ShapeHandle, ShapeStatus};
use crate::storage::traits::Statement;

use super::meta::{self, MetaKey};
use super::{Satellite, SatelliteError};

impl Satellite {
    /// Apply a local change and record it for replication.
    ///
    /// The row mutation, its oplog entry and the shadow update commit in
    /// one transaction. `new_values` must carry the primary key (for deletes
    /// it may carry nothing else). Missing `old_values` for updates and
    /// deletes are read from the current row. The recorded entry holds the
    /// full row: columns an update leaves out keep their current value and
    /// columns an insert leaves out are NULL.
    #[tracing::instrument(skip(self, new_values, old_values), fields(name = %self.name))]
    pub async fn write(
        &self,
        tablename: &str,
        optype: OpType,
        new_values: Row,
        old_values: Option<Row>,
    ) -> Result<OplogEntry, SatelliteError> {
        let _timer = crate::metrics::LatencyTimer::new("write");
        let table = self
            .schema
            .table(tablename)
            .ok_or_else(|| SatelliteError::UnknownTable(tablename.to_string()))?;
        let qualified = self.schema.qualified(tablename);
        let new_values = filter_to_schema(table, &new_values);

        let writer = self.writer.lock().await;

        let supplied_old = old_values.map(|old| filter_to_schema(table, &old));
        let key = primary_key_of(tablename, table, &new_values, supplied_old.as_ref().unwrap_or(&Row::new()))?;
        let current = match optype {
            OpType::Insert => None,
            OpType::Update | OpType::Delete => self.current_row(&qualified, table, &key).await?,
        };

        let mut old_values = match optype {
            OpType::Insert => Row::new(),
            OpType::Update | OpType::Delete => supplied_old.or_else(|| current.clone()).unwrap_or_default(),
        };
        if optype != OpType::Insert {
            for (column, value) in &key {
                old_values.entry(column.clone()).or_insert_with(|| value.clone());
            }
        }

        // Insert and update entries carry the whole row so the merge can
        // pick a winner without mixing columns from concurrent changes.
        let new_values = match optype {
            OpType::Delete => Row::new(),
            OpType::Insert => table.full_image(&key, &new_values),
            OpType::Update => {
                let mut image = table.full_image(current.as_ref().unwrap_or(&old_values), &new_values);
                image.extend(key.clone());
                image
            }
        };

        let current_tags = self
            .shadow
            .load(self.adapter.as_ref(), &qualified, &canonical_primary_key(&key))
            .await?;

        let image = new_values.clone();
        let append = self.oplog.append_local_change(
            &self.shadow,
            &current_tags,
            LocalChange {
                tablename: tablename.to_string(),
                optype,
                timestamp: self.clock.tick()?,
                new_values,
                old_values,
                clear_tags: None,
            },
        )?;

        let mut statements = vec![match optype {
            OpType::Delete => delete_row(self.builder.as_ref(), &qualified, table, &append.primary_key),
            OpType::Insert | OpType::Update => upsert_row(self.builder.as_ref(), &qualified, table, &image),
        }];
        statements.extend(append.statements);
        self.adapter.run_in_transaction(&statements).await?;
        drop(writer);

        debug!(rowid = append.entry.rowid, table = %qualified, %optype, "Local write committed");
        self.notifier.emit(SatelliteEvent::DataChanged(DataChange {
            origin: ChangeOrigin::Local,
            tables: BTreeSet::from([qualified]),
            row_count: 1,
        }));
        self.push_notify.notify_one();
        Ok(append.entry)
    }

    async fn current_row(
        &self,
        qualified: &QualifiedTablename,
        table: &TableSchema,
        key: &Row,
    ) -> Result<Option<Row>, SatelliteError> {
        let rows = self
            .adapter
            .query(&select_row(self.builder.as_ref(), qualified, table, key))
            .await?;
        Ok(rows.into_iter().next())
    }

    /// Run a read statement directly against the embedded database.
    pub async fn query(&self, statement: &Statement) -> Result<Vec<Row>, SatelliteError> {
        Ok(self.adapter.query(statement).await?)
    }

    /// Every shadow entry, for introspection.
    pub async fn shadow_entries(&self) -> Result<Vec<ShadowEntry>, SatelliteError> {
        Ok(self.shadow.entries(self.adapter.as_ref()).await?)
    }

    /// Oplog entries not yet compacted, oldest first.
    pub async fn oplog_entries(&self) -> Result<Vec<OplogEntry>, SatelliteError> {
        Ok(self
            .oplog
            .entries_after(self.adapter.as_ref(), 0, i64::MAX as usize)
            .await?)
    }

    /// Subscribe to a shape.
    ///
    /// Returns the live handle when a non-failed shape with the same key
    /// exists. New shapes are persisted and, when connected, requested from
    /// the remote side in the background.
    pub async fn subscribe(self: &Arc<Self>, definition: &ShapeDefinition) -> Result<ShapeHandle, SatelliteError> {
        for tablename in definition.tablenames() {
            if self.schema.table(tablename.trim()).is_none() {
                return Err(SatelliteError::UnknownTable(tablename.to_string()));
            }
        }

        let subscription = self.shapes.subscribe(definition);
        if !subscription.created {
            return Ok(subscription.handle);
        }
        self.persist_subscriptions().await?;

        if self.connectivity.status() == ConnectivityStatus::Connected {
            let this = Arc::clone(self);
            let key = subscription.handle.key.clone();
            tokio::spawn(async move {
                match this.establish_shape(&key).await {
                    Ok(()) => {}
                    Err(SatelliteError::Transport(e)) => this.report_connection_error(e),
                    Err(e) => warn!(key = %key, error = %e, "Shape exchange failed"),
                }
            });
        }
        Ok(subscription.handle)
    }

    /// Request a shape, merge its initial snapshot and mark it synced.
    ///
    /// Holds the shape's lock for the whole exchange. Transport failures
    /// put the shape back to `Requested`; rejections move it to `Error`.
    pub(super) async fn establish_shape(&self, key: &str) -> Result<(), SatelliteError> {
        let Some(_exchange) = self.shapes.lock(key).await else {
            return Ok(());
        };
        if self.shapes.status(key) != Some(ShapeStatus::Requested) {
            return Ok(());
        }
        let Some(definition) = self.shapes.definition(key) else {
            return Ok(());
        };

        self.shapes.transition(key, ShapeStatus::Establishing)?;
        if let Err(e) = self.client.subscribe(key, &definition).await {
            return self.shape_exchange_failed(key, e).await;
        }
        self.shapes.transition(key, ShapeStatus::Active)?;

        let snapshot = match self.client.initial_snapshot(key).await {
            Ok(snapshot) => snapshot,
            Err(e) => return self.shape_exchange_failed(key, e).await,
        };

        match self.apply_entries(&snapshot, ChangeOrigin::Snapshot, Some(key)).await {
            Ok(report) => {
                match self.shapes.transition(key, ShapeStatus::Synced) {
                    Ok(_) => {}
                    // Unsubscribed right after the snapshot committed
                    Err(ShapeError::Unknown(_)) => return Ok(()),
                    Err(e) => return Err(e.into()),
                }
                info!(key = %key, applied = report.applied, skipped = report.skipped, "Shape synced");
                Ok(())
            }
            Err(SatelliteError::Subscription(ShapeError::Unsubscribed(_))) => {
                debug!(key = %key, "Shape went away before its snapshot was applied");
                Ok(())
            }
            Err(SatelliteError::MalformedChange(reason)) => {
                self.shapes.fail(key, format!("malformed snapshot: {}", reason))?;
                self.connectivity.fail(format!("malformed change: {}", reason));
                Err(SatelliteError::MalformedChange(reason))
            }
            Err(e) => {
                let _ = self.shapes.transition(key, ShapeStatus::Requested);
                Err(e)
            }
        }
    }

    async fn shape_exchange_failed(&self, key: &str, err: ClientError) -> Result<(), SatelliteError> {
        match err {
            ClientError::ShapeRejected { reason, .. } => {
                warn!(key = %key, reason = %reason, "Shape rejected");
                self.shapes.fail(key, reason.clone())?;
                self.persist_subscriptions().await?;
                Err(ShapeError::Rejected {
                    key: key.to_string(),
                    reason,
                }
                .into())
            }
            other => {
                let _ = self.shapes.transition(key, ShapeStatus::Requested);
                Err(other.into())
            }
        }
    }

    /// Stop replicating a shape. Rows already applied stay.
    ///
    /// Removal happens under the writer lock, so a snapshot still in flight
    /// either committed before this call or is dropped.
    pub async fn unsubscribe(&self, key: &str) -> Result<(), SatelliteError> {
        {
            let _writer = self.writer.lock().await;
            self.shapes
                .unsubscribe(key)
                .ok_or_else(|| ShapeError::Unknown(key.to_string()))?;
        }
        self.persist_subscriptions().await?;

        if self.connectivity.status() == ConnectivityStatus::Connected {
            if let Err(e) = self.client.unsubscribe(&[key.to_string()]).await {
                warn!(key = %key, error = %e, "Remote unsubscribe failed");
            }
        }
        Ok(())
    }

    /// Point-in-time view of every tracked shape.
    #[must_use]
    pub fn list_all_subscriptions(&self) -> Vec<Shape> {
        self.shapes.list_all_subscriptions()
    }

    /// Handle for an existing shape.
    #[must_use]
    pub fn shape(&self, key: &str) -> Option<ShapeHandle> {
        self.shapes.handle(key)
    }

    async fn persist_subscriptions(&self) -> Result<(), SatelliteError> {
        let definitions: Vec<ShapeDefinition> = self
            .shapes
            .list_all_subscriptions()
            .into_iter()
            .filter(|shape| shape.status != ShapeStatus::Error)
            .map(|shape| shape.definition)
            .collect();
        let encoded = serde_json::to_string(&definitions).map_err(crate::codec::CodecError::from)?;

        let _writer = self.writer.lock().await;
        self.adapter
            .run(&meta::set(
                self.builder.as_ref(),
                &self.tables.meta,
                MetaKey::Subscriptions,
                encoded,
            ))
            .await?;
        Ok(())
    }

    /// Call `listener` on every connectivity transition.
    ///
    /// The current state is available synchronously through
    /// [`connectivity_state`](Self::connectivity_state); it is not replayed.
    pub fn subscribe_to_connectivity_state_changes<F>(&self, listener: F) -> SubscriptionToken
    where
        F: Fn(&SatelliteEvent) + Send + Sync + 'static,
    {
        self.notifier.subscribe(EventKind::ConnectivityStateChanged, listener)
    }

    pub fn subscribe_to_data_changes<F>(&self, listener: F) -> SubscriptionToken
    where
        F: Fn(&SatelliteEvent) + Send + Sync + 'static,
    {
        self.notifier.subscribe(EventKind::DataChanged, listener)
    }

    pub fn subscribe_to_shape_status_changes<F>(&self, listener: F) -> SubscriptionToken
    where
        F: Fn(&SatelliteEvent) + Send + Sync + 'static,
    {
        self.notifier.subscribe(EventKind::ShapeStatusChanged, listener)
    }

    pub fn unsubscribe_listener(&self, token: SubscriptionToken) -> bool {
        self.notifier.unsubscribe(token)
    }
}
