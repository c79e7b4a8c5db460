// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Satellite
//!
//! A local-first replication engine: keeps an embedded relational database
//! in sync with a remote service under weak connectivity, resolving
//! concurrent edits with per-row causal tags instead of central locking.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Local write                            │
//! │  • Row mutation + oplog entry + shadow tags, one txn       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                   (push loop while connected)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Connectivity + transport                   │
//! │  • Backoff with jitter, cancellable                        │
//! │  • Shape requests and initial snapshots                    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                      (remote batches)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Causal merge                            │
//! │  • Echo suppression (incoming tags ⊆ shadow tags)          │
//! │  • Per-origin tag merge, delete tombstones                 │
//! │  • Applied in one txn under the single writer              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use satellite::{
//!     BundleMigrator, DbSchema, InternalTables, Migration, OpType, Satellite, SatelliteConfig,
//!     SatelliteDeps, SqlAdapter, SqlValue, TableSchema,
//! };
//! # use satellite::SatelliteClient;
//!
//! # async fn example(client: Arc<dyn SatelliteClient>) -> Result<(), Box<dyn std::error::Error>> {
//! let config = SatelliteConfig::default();
//! let adapter = Arc::new(SqlAdapter::connect("sqlite:app.db").await?);
//! let builder: Arc<dyn satellite::QueryBuilder> = adapter.query_builder().into();
//! let migrator = Arc::new(BundleMigrator::new(
//!     adapter.clone(),
//!     builder.clone(),
//!     &InternalTables::from_config(&config),
//!     vec![Migration::new("0001_items", vec!["CREATE TABLE items (value TEXT PRIMARY KEY)".into()])],
//! ));
//!
//! let satellite = Satellite::new("app.db", config, SatelliteDeps {
//!     adapter,
//!     builder,
//!     migrator,
//!     client,
//!     schema: DbSchema::new("main").with_table("items", TableSchema::new(&["value"], &["value"])),
//! });
//! satellite.start().await?;
//! satellite.connect(None).await?;
//!
//! satellite
//!     .write("items", OpType::Insert, [("value".to_string(), SqlValue::from("a"))].into(), None)
//!     .await?;
//!
//! satellite.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`clock`]: Tags, tag sets and the local clock
//! - [`codec`]: Versioned row value codec
//! - [`oplog`]: Local change capture
//! - [`shadow`]: Shadow tags and the causal merge
//! - [`connectivity`]: Connection state machine with backoff
//! - [`shapes`]: Partial-replication subscriptions
//! - [`satellite`]: The [`Satellite`] orchestrating all components
//! - [`storage`]: Database adapter trait and the sqlx implementation
//! - [`migrator`]: Schema migrations

pub mod client;
pub mod clock;
pub mod codec;
pub mod config;
pub mod connectivity;
pub mod metrics;
pub mod migrator;
pub mod notifier;
pub mod oplog;
pub mod resilience;
pub mod satellite;
pub mod schema;
pub mod shadow;
pub mod shapes;
pub mod storage;

pub use client::{Ack, ClientError, SatelliteClient};
pub use clock::{
    decode_tags, encode_tags, generate_tag, merge_tag_set, Clock, ClockOverflow, Tag, TagError, TagSet,
};
pub use codec::{decode_row, encode_row, CodecError, Row, SqlValue};
pub use config::{ConfigError, SatelliteConfig};
pub use connectivity::{ConnectivityError, ConnectivityState, ConnectivityStatus};
pub use metrics::LatencyTimer;
pub use migrator::{BundleMigrator, InternalTables, Migration, MigrationError, Migrator};
pub use notifier::{ChangeOrigin, DataChange, EventKind, EventNotifier, SatelliteEvent, SubscriptionToken};
pub use oplog::{canonical_primary_key, OpType, OplogEntry};
pub use resilience::retry::RetryConfig;
pub use satellite::{ApplyReport, Satellite, SatelliteDeps, SatelliteError, SatelliteRegistry};
pub use schema::{DbSchema, PgBuilder, QualifiedTablename, QueryBuilder, SqliteBuilder, TableSchema};
pub use shadow::{MergeOutcome, ShadowEntry};
pub use shapes::{Shape, ShapeDefinition, ShapeError, ShapeHandle, ShapeStatus};
pub use storage::sql::SqlAdapter;
pub use storage::traits::{DatabaseAdapter, Statement, StorageError};
