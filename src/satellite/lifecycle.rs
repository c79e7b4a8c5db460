// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Satellite lifecycle: start, connect, reconnect, stop.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::client::ClientError;
use crate::connectivity::ConnectivityStatus;
use crate::shapes::ShapeDefinition;

use super::meta::{self, MetaKey};
use super::{Satellite, SatelliteError};

impl Satellite {
    /// Bring the satellite up.
    ///
    /// 1. Validate the configuration
    /// 2. Apply pending migrations (internal tables first)
    /// 3. Resolve the client id, generating and persisting one if needed
    /// 4. Restore push progress and seed the oplog rowid sequence
    /// 5. Re-register persisted shape subscriptions as `Requested`
    /// 6. Spawn the push loop
    ///
    /// Calling it again once it succeeded is a no-op; after a failure it
    /// starts over.
    #[tracing::instrument(skip(self), fields(name = %self.name))]
    pub async fn start(self: &Arc<Self>) -> Result<(), SatelliteError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.bring_up().await;
        if result.is_err() {
            self.started.store(false, Ordering::Release);
        }
        result
    }

    async fn bring_up(self: &Arc<Self>) -> Result<(), SatelliteError> {
        let startup = Instant::now();
        self.config.validate()?;

        let applied = self.migrator.up().await?;
        debug!(applied, "Migrations complete");

        let client_id = self.resolve_client_id().await?;
        self.oplog.set_origin(&client_id);

        let adapter = self.adapter.as_ref();
        let builder = self.builder.as_ref();
        let last_ackd = meta::get_rowid(adapter, builder, &self.tables.meta, MetaKey::LastAckdRowId).await?;
        let last_sent = meta::get_rowid(adapter, builder, &self.tables.meta, MetaKey::LastSentRowId)
            .await?
            .max(last_ackd);
        // Anything sent but not acknowledged goes out again.
        self.last_ackd.store(last_ackd, Ordering::Release);
        self.last_sent.store(last_ackd, Ordering::Release);
        // Compacted entries are gone from the table, so never seed below
        // what was already sent.
        let rowid = self.oplog.load_last_rowid(adapter, last_sent).await?;

        let restored = self.restore_subscriptions().await?;

        let this = Arc::clone(self);
        *self.run_handle.lock() = Some(tokio::spawn(async move { this.run().await }));

        crate::metrics::record_latency("start", startup.elapsed());
        info!(
            client_id = %client_id,
            rowid,
            last_sent,
            last_ackd,
            shapes = restored,
            "Satellite started"
        );
        Ok(())
    }

    async fn resolve_client_id(&self) -> Result<String, SatelliteError> {
        let persisted = meta::get(
            self.adapter.as_ref(),
            self.builder.as_ref(),
            &self.tables.meta,
            MetaKey::ClientId,
        )
        .await?;

        let client_id = match (&self.config.client_id, &persisted) {
            (Some(configured), _) => configured.clone(),
            (None, Some(existing)) => existing.clone(),
            (None, None) => uuid::Uuid::new_v4().to_string(),
        };

        if persisted.as_deref() != Some(client_id.as_str()) {
            let _writer = self.writer.lock().await;
            self.adapter
                .run(&meta::set(
                    self.builder.as_ref(),
                    &self.tables.meta,
                    MetaKey::ClientId,
                    client_id.clone(),
                ))
                .await?;
        }
        Ok(client_id)
    }

    async fn restore_subscriptions(&self) -> Result<usize, SatelliteError> {
        let Some(encoded) = meta::get(
            self.adapter.as_ref(),
            self.builder.as_ref(),
            &self.tables.meta,
            MetaKey::Subscriptions,
        )
        .await?
        else {
            return Ok(0);
        };

        let definitions: Vec<ShapeDefinition> = match serde_json::from_str(&encoded) {
            Ok(definitions) => definitions,
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable persisted subscriptions");
                return Ok(0);
            }
        };
        for definition in &definitions {
            self.shapes.subscribe(definition);
        }
        Ok(definitions.len())
    }

    /// Connect to the remote side, retrying with backoff.
    ///
    /// Once connected, pending oplog entries are pushed and every shape
    /// still in `Requested` is (re)sent. Already connected is a no-op.
    #[tracing::instrument(skip(self, token), fields(name = %self.name))]
    pub async fn connect(self: &Arc<Self>, token: Option<String>) -> Result<(), SatelliteError> {
        if self.connectivity.status() == ConnectivityStatus::Connected {
            return Ok(());
        }
        *self.auth_token.write() = token.clone();

        self.connectivity
            .connect_with_backoff(self.client.as_ref(), token.as_deref())
            .await?;

        if let Err(e) = self.sync_after_connect().await {
            self.report_connection_error(e);
        }
        Ok(())
    }

    /// Push pending entries and send requested shapes on a fresh connection.
    ///
    /// Entries sent over an earlier connection without an acknowledgement
    /// are sent again.
    pub(super) async fn sync_after_connect(self: &Arc<Self>) -> Result<(), ClientError> {
        self.rewind_to_acknowledged().await;
        match self.push_pending().await {
            Ok(_) | Err(SatelliteError::NotConnected) => {}
            Err(SatelliteError::Transport(e)) => return Err(e),
            Err(e) => warn!(error = %e, "Push after connect failed"),
        }

        for key in self.shapes.requested() {
            match self.establish_shape(&key).await {
                Ok(()) => {}
                Err(SatelliteError::Transport(e)) => return Err(e),
                Err(e) => warn!(key = %key, error = %e, "Shape exchange failed"),
            }
        }
        Ok(())
    }

    /// Drop the connection and cancel any pending reconnect.
    ///
    /// Shapes in flight go back to `Requested` and are resent on the next
    /// connection. An `Error` state is kept.
    pub async fn disconnect(&self) {
        if let Some(handle) = self.reconnect_handle.lock().take() {
            handle.abort();
        }
        self.connectivity.client_disconnect(self.client.as_ref()).await;
        self.shapes.reset_in_flight();
        info!(name = %self.name, "Disconnected");
    }

    /// React to a transport failure on a live connection.
    ///
    /// Transient errors move `Connected → Connecting` and start a background
    /// reconnect; fatal ones move to `Error`.
    pub fn report_connection_error(self: &Arc<Self>, err: ClientError) {
        if err.is_fatal() {
            self.connectivity.fail(err.to_string());
            return;
        }
        if self.connectivity.connection_lost(&err.to_string()) {
            self.shapes.reset_in_flight();
            self.spawn_reconnect();
        }
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.reconnect().await });
        if let Some(previous) = self.reconnect_handle.lock().replace(handle) {
            previous.abort();
        }
    }

    async fn reconnect(self: Arc<Self>) {
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }
            let token = self.auth_token.read().clone();
            if let Err(e) = self
                .connectivity
                .connect_with_backoff(self.client.as_ref(), token.as_deref())
                .await
            {
                debug!(error = %e, "Reconnect ended");
                return;
            }

            match self.sync_after_connect().await {
                Ok(()) => {
                    info!(name = %self.name, "Reconnected");
                    return;
                }
                Err(e) if e.is_fatal() => {
                    self.connectivity.fail(e.to_string());
                    return;
                }
                Err(e) => {
                    if !self.connectivity.connection_lost(&e.to_string()) {
                        return;
                    }
                    self.shapes.reset_in_flight();
                }
            }
        }
    }

    /// Stop background work and disconnect.
    #[tracing::instrument(skip(self), fields(name = %self.name))]
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.disconnect().await;

        let run = self.run_handle.lock().take();
        if let Some(handle) = run {
            if let Err(e) = handle.await {
                warn!(error = %e, "Push loop ended abnormally");
            }
        }
        info!("Satellite stopped");
    }
}
