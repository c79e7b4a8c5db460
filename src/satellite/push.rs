// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Outbound push of oplog entries and the background push loop.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::connectivity::ConnectivityStatus;

use super::meta::{self, MetaKey};
use super::{Satellite, SatelliteError};

impl Satellite {
    /// Send every entry after `lastSentRowId`, in rowid order.
    ///
    /// Progress is recorded per batch. Entries stay in the oplog until
    /// acknowledged; a new connection resends from the last acknowledged
    /// rowid. Acknowledged entries are compacted when configured.
    pub async fn push_pending(&self) -> Result<usize, SatelliteError> {
        let _push = self.push_lock.lock().await;
        let batch_size = self.config.push_batch_size.max(1);
        let mut total = 0;

        loop {
            if self.connectivity.status() != ConnectivityStatus::Connected {
                return if total == 0 {
                    Err(SatelliteError::NotConnected)
                } else {
                    Ok(total)
                };
            }

            let after = self.last_sent.load(Ordering::Acquire);
            let entries = self
                .oplog
                .entries_after(self.adapter.as_ref(), after, batch_size)
                .await?;
            let Some(last) = entries.last().map(|e| e.rowid) else {
                break;
            };

            let ack = self.client.send_entries(&entries).await?;
            let acknowledged = ack.last_rowid.min(last);

            let mut statements = vec![meta::set(
                self.builder.as_ref(),
                &self.tables.meta,
                MetaKey::LastSentRowId,
                last.to_string(),
            )];
            let previous_ack = self.last_ackd.load(Ordering::Acquire);
            let newly_acked = if acknowledged > previous_ack {
                statements.push(meta::set(
                    self.builder.as_ref(),
                    &self.tables.meta,
                    MetaKey::LastAckdRowId,
                    acknowledged.to_string(),
                ));
                if self.config.compact_acknowledged {
                    statements.push(self.oplog.compact_statement(acknowledged));
                }
                entries.iter().filter(|e| e.rowid <= acknowledged).count()
            } else {
                0
            };

            {
                let _writer = self.writer.lock().await;
                self.adapter.run_in_transaction(&statements).await?;
            }
            self.last_sent.store(last, Ordering::Release);
            if acknowledged > previous_ack {
                self.last_ackd.store(acknowledged, Ordering::Release);
                if self.config.compact_acknowledged {
                    crate::metrics::record_compacted(newly_acked as u64);
                }
            }

            crate::metrics::record_pushed(entries.len());
            debug!(count = entries.len(), last_sent = last, acknowledged, "Pushed oplog entries");
            total += entries.len();

            if entries.len() < batch_size {
                break;
            }
        }
        Ok(total)
    }

    /// Move the send position back to the last acknowledged rowid.
    pub(super) async fn rewind_to_acknowledged(&self) {
        let _push = self.push_lock.lock().await;
        let acknowledged = self.last_ackd.load(Ordering::Acquire);
        let sent = self.last_sent.swap(acknowledged, Ordering::AcqRel);
        if sent > acknowledged {
            debug!(last_sent = sent, acknowledged, "Resending unacknowledged entries");
        }
    }

    /// Background loop: push on every tick and right after local writes
    /// while connected. Ends when the satellite stops.
    #[tracing::instrument(skip(self), fields(name = %self.name))]
    pub(super) async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.push_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Push loop running");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {}
                _ = self.push_notify.notified() => {}
            }

            if self.connectivity.status() != ConnectivityStatus::Connected {
                continue;
            }
            match self.push_pending().await {
                Ok(_) | Err(SatelliteError::NotConnected) => {}
                Err(SatelliteError::Transport(e)) => self.report_connection_error(e),
                Err(e) => warn!(error = %e, "Push failed"),
            }
        }

        info!("Push loop stopped");
    }
}
