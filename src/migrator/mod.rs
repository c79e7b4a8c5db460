// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Schema migrations.
//!
//! [`BundleMigrator`] applies an ordered list of migrations, always starting
//! with the internal one that creates the oplog, shadow and meta tables.
//! Each migration runs in one transaction together with the row recording
//! its version, so a crash never leaves a half-applied migration behind.
//! Running `up()` twice is harmless: applied versions are skipped, and a
//! concurrent duplicate trips the migrations table's primary key, which is
//! read as "already applied" once the version is confirmed recorded. Any
//! other unique violation fails the migration.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use crate::codec::SqlValue;
use crate::config::SatelliteConfig;
use crate::schema::{QualifiedTablename, QueryBuilder};
use crate::storage::traits::{DatabaseAdapter, Statement, StorageError};

/// Version of the internal tables migration.
pub const INTERNAL_MIGRATION_VERSION: &str = "0000_satellite_internal";

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("migration {version} failed: {source}")]
    Failed {
        version: String,
        #[source]
        source: StorageError,
    },
    #[error("could not read applied migrations: {0}")]
    Bookkeeping(#[source] StorageError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub version: String,
    pub statements: Vec<String>,
}

impl Migration {
    pub fn new(version: impl Into<String>, statements: Vec<String>) -> Self {
        Self {
            version: version.into(),
            statements,
        }
    }
}

#[async_trait]
pub trait Migrator: Send + Sync {
    /// Apply pending migrations. Returns how many were applied.
    async fn up(&self) -> Result<usize, MigrationError>;
}

/// Names of the internal tables, resolved against a namespace.
#[derive(Debug, Clone)]
pub struct InternalTables {
    pub oplog: QualifiedTablename,
    pub shadow: QualifiedTablename,
    pub meta: QualifiedTablename,
    pub migrations: QualifiedTablename,
}

impl InternalTables {
    pub fn from_config(config: &SatelliteConfig) -> Self {
        let ns = config.namespace.as_str();
        Self {
            oplog: QualifiedTablename::new(ns, &config.oplog_table),
            shadow: QualifiedTablename::new(ns, &config.shadow_table),
            meta: QualifiedTablename::new(ns, &config.meta_table),
            migrations: QualifiedTablename::new(ns, &config.migrations_table),
        }
    }
}

/// DDL for the oplog, shadow and meta tables.
pub fn internal_migration(builder: &dyn QueryBuilder, tables: &InternalTables) -> Migration {
    let int = builder.big_int_type();
    let mut statements: Vec<String> = builder
        .create_namespace(&tables.oplog.namespace)
        .into_iter()
        .collect();

    statements.push(format!(
        "CREATE TABLE IF NOT EXISTS {} (\
         rowid {int} PRIMARY KEY, \
         namespace TEXT NOT NULL, \
         tablename TEXT NOT NULL, \
         optype TEXT NOT NULL, \
         primary_key TEXT NOT NULL, \
         new_row TEXT, \
         old_row TEXT, \
         timestamp {int} NOT NULL, \
         clear_tags TEXT NOT NULL)",
        tables.oplog
    ));
    statements.push(format!(
        "CREATE TABLE IF NOT EXISTS {} (\
         namespace TEXT NOT NULL, \
         tablename TEXT NOT NULL, \
         primary_key TEXT NOT NULL, \
         tags TEXT NOT NULL, \
         PRIMARY KEY (namespace, tablename, primary_key))",
        tables.shadow
    ));
    statements.push(format!(
        "CREATE TABLE IF NOT EXISTS {} (key TEXT PRIMARY KEY, value TEXT)",
        tables.meta
    ));

    Migration::new(INTERNAL_MIGRATION_VERSION, statements)
}

pub struct BundleMigrator {
    adapter: Arc<dyn DatabaseAdapter>,
    builder: Arc<dyn QueryBuilder>,
    table: QualifiedTablename,
    migrations: Vec<Migration>,
}

impl BundleMigrator {
    /// `migrations` are the application's own, in order; the internal
    /// migration is prepended.
    pub fn new(
        adapter: Arc<dyn DatabaseAdapter>,
        builder: Arc<dyn QueryBuilder>,
        tables: &InternalTables,
        migrations: Vec<Migration>,
    ) -> Self {
        let mut bundle = vec![internal_migration(builder.as_ref(), tables)];
        bundle.extend(migrations);
        Self {
            adapter,
            builder,
            table: tables.migrations.clone(),
            migrations: bundle,
        }
    }

    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    async fn ensure_table(&self) -> Result<(), MigrationError> {
        let mut statements: Vec<Statement> = self
            .builder
            .create_namespace(&self.table.namespace)
            .into_iter()
            .map(Statement::new)
            .collect();
        statements.push(Statement::new(format!(
            "CREATE TABLE IF NOT EXISTS {} (version TEXT PRIMARY KEY, applied_at {} NOT NULL)",
            self.table,
            self.builder.big_int_type()
        )));
        self.adapter
            .run_in_transaction(&statements)
            .await
            .map_err(MigrationError::Bookkeeping)?;
        Ok(())
    }

    async fn applied(&self) -> Result<Vec<String>, MigrationError> {
        let rows = self
            .adapter
            .query(&Statement::new(format!("SELECT version FROM {}", self.table)))
            .await
            .map_err(MigrationError::Bookkeeping)?;
        Ok(rows
            .into_iter()
            .filter_map(|mut row| match row.remove("version") {
                Some(SqlValue::Text(v)) => Some(v),
                _ => None,
            })
            .collect())
    }

    async fn apply(&self, migration: &Migration) -> Result<bool, MigrationError> {
        let mut statements: Vec<Statement> = migration
            .statements
            .iter()
            .map(|sql| Statement::new(sql.clone()))
            .collect();
        statements.push(Statement::with_args(
            format!(
                "INSERT INTO {} (version, applied_at) VALUES ({}, {})",
                self.table,
                self.builder.make_positional_param(1),
                self.builder.make_positional_param(2)
            ),
            vec![
                SqlValue::Text(migration.version.clone()),
                SqlValue::Integer(crate::clock::now_millis()),
            ],
        ));

        match self.adapter.run_in_transaction(&statements).await {
            Ok(_) => Ok(true),
            Err(StorageError::UniqueViolation(reason)) => {
                if self.applied().await?.contains(&migration.version) {
                    debug!(version = %migration.version, "Migration already applied");
                    return Ok(false);
                }
                Err(MigrationError::Failed {
                    version: migration.version.clone(),
                    source: StorageError::UniqueViolation(reason),
                })
            }
            Err(source) => Err(MigrationError::Failed {
                version: migration.version.clone(),
                source,
            }),
        }
    }
}

#[async_trait]
impl Migrator for BundleMigrator {
    async fn up(&self) -> Result<usize, MigrationError> {
        self.ensure_table().await?;
        let applied = self.applied().await?;

        let mut count = 0;
        for migration in &self.migrations {
            if applied.contains(&migration.version) {
                continue;
            }
            if self.apply(migration).await? {
                info!(version = %migration.version, "Migration applied");
                count += 1;
            }
        }

        crate::metrics::record_migrations(count);
        Ok(count)
    }
}
