// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Satellite orchestrator.
//!
//! The [`Satellite`] ties together all components for one embedded
//! database:
//! - Oplog engine capturing local writes
//! - Shadow table causal merge for local and remote changes
//! - Connectivity state machine with backoff
//! - Shape subscription manager
//!
//! # Single writer
//!
//! Every mutation (local write, remote batch, shape snapshot, push
//! bookkeeping) runs under one async writer lock and inside one database
//! transaction. Network calls never hold the writer.
//!
//! # Lifecycle
//!
//! ```text
//! new → start (migrate, load meta, spawn push loop) → connect → … → stop
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! let satellite = Satellite::new("app.db", SatelliteConfig::default(), deps);
//! satellite.start().await?;
//! satellite.connect(Some(token)).await?;
//!
//! satellite
//!     .write("items", OpType::Insert, [("value".to_string(), SqlValue::from("a"))].into(), None)
//!     .await?;
//!
//! let mut shape = satellite.subscribe(&ShapeDefinition::table("items")).await?;
//! shape.synced().await?;
//! ```

mod api;
mod apply;
mod lifecycle;
mod meta;
mod push;
mod registry;
mod types;

pub use registry::SatelliteRegistry;
pub use types::{ApplyReport, SatelliteDeps, SatelliteError};

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex as SyncMutex, RwLock};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::SatelliteClient;
use crate::clock::Clock;
use crate::config::SatelliteConfig;
use crate::connectivity::{ConnectivityState, ConnectivityStateMachine, ConnectivityStatus};
use crate::migrator::{InternalTables, Migrator};
use crate::notifier::EventNotifier;
use crate::oplog::OplogEngine;
use crate::schema::{DbSchema, QueryBuilder};
use crate::shadow::ShadowTable;
use crate::shapes::ShapeManager;
use crate::storage::traits::DatabaseAdapter;

/// Local sync process for one embedded database.
///
/// Always used behind an `Arc`: background tasks (push loop, reconnects,
/// shape exchanges) hold their own reference until [`stop`](Self::stop).
pub struct Satellite {
    pub(super) name: String,
    pub(super) config: SatelliteConfig,

    pub(super) adapter: Arc<dyn DatabaseAdapter>,
    pub(super) builder: Arc<dyn QueryBuilder>,
    pub(super) migrator: Arc<dyn Migrator>,
    pub(super) client: Arc<dyn SatelliteClient>,
    pub(super) schema: Arc<DbSchema>,
    pub(super) tables: InternalTables,

    pub(super) oplog: OplogEngine,
    pub(super) shadow: ShadowTable,
    pub(super) clock: Clock,
    pub(super) notifier: Arc<EventNotifier>,
    pub(super) connectivity: ConnectivityStateMachine,
    pub(super) shapes: ShapeManager,

    /// Single-writer discipline for every database mutation
    pub(super) writer: Mutex<()>,
    /// One push at a time
    pub(super) push_lock: Mutex<()>,
    pub(super) push_notify: Notify,

    pub(super) last_sent: AtomicI64,
    pub(super) last_ackd: AtomicI64,

    /// Token from the last `connect`, reused by background reconnects
    pub(super) auth_token: RwLock<Option<String>>,

    pub(super) started: AtomicBool,
    pub(super) shutdown: CancellationToken,
    pub(super) run_handle: SyncMutex<Option<JoinHandle<()>>>,
    pub(super) reconnect_handle: SyncMutex<Option<JoinHandle<()>>>,
}

impl Satellite {
    /// Create a satellite. Nothing touches the database until
    /// [`start()`](Self::start).
    pub fn new(name: impl Into<String>, config: SatelliteConfig, deps: SatelliteDeps) -> Arc<Self> {
        let schema = Arc::new(deps.schema);
        let tables = InternalTables::from_config(&config);
        let notifier = Arc::new(EventNotifier::new());

        Arc::new(Self {
            name: name.into(),
            oplog: OplogEngine::new(schema.clone(), deps.builder.clone(), tables.oplog.clone()),
            shadow: ShadowTable::new(deps.builder.clone(), tables.shadow.clone()),
            clock: Clock::new(),
            connectivity: ConnectivityStateMachine::new(config.connect_retry(), notifier.clone()),
            shapes: ShapeManager::new(notifier.clone()),
            notifier,
            adapter: deps.adapter,
            builder: deps.builder,
            migrator: deps.migrator,
            client: deps.client,
            schema,
            tables,
            config,
            writer: Mutex::new(()),
            push_lock: Mutex::new(()),
            push_notify: Notify::new(),
            last_sent: AtomicI64::new(0),
            last_ackd: AtomicI64::new(0),
            auth_token: RwLock::new(None),
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            run_handle: SyncMutex::new(None),
            reconnect_handle: SyncMutex::new(None),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &SatelliteConfig {
        &self.config
    }

    #[must_use]
    pub fn schema(&self) -> &DbSchema {
        &self.schema
    }

    /// Origin stamped on local changes.
    #[must_use]
    pub fn client_id(&self) -> String {
        self.oplog.origin()
    }

    #[must_use]
    pub fn notifier(&self) -> &Arc<EventNotifier> {
        &self.notifier
    }

    #[must_use]
    pub fn connectivity_state(&self) -> ConnectivityState {
        self.connectivity.state()
    }

    /// Receiver primed with the current connectivity state.
    #[must_use]
    pub fn connectivity_receiver(&self) -> watch::Receiver<ConnectivityState> {
        self.connectivity.watch()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connectivity.status() == ConnectivityStatus::Connected
    }

    /// Highest rowid sent to the remote side.
    #[must_use]
    pub fn last_sent_rowid(&self) -> i64 {
        self.last_sent.load(Ordering::Acquire)
    }

    /// Highest rowid the remote side acknowledged.
    #[must_use]
    pub fn last_ackd_rowid(&self) -> i64 {
        self.last_ackd.load(Ordering::Acquire)
    }
}
