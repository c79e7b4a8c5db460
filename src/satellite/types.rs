// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the satellite orchestrator.

use std::sync::Arc;

use thiserror::Error;

use crate::client::{ClientError, SatelliteClient};
use crate::clock::ClockOverflow;
use crate::codec::CodecError;
use crate::config::ConfigError;
use crate::connectivity::ConnectivityError;
use crate::migrator::{MigrationError, Migrator};
use crate::oplog::OplogError;
use crate::schema::{DbSchema, QueryBuilder};
use crate::shadow::ShadowError;
use crate::shapes::ShapeError;
use crate::storage::traits::{DatabaseAdapter, StorageError};

/// Errors surfaced by a [`Satellite`](super::Satellite).
///
/// Conflicting and duplicate changes are resolved by the merge and never
/// show up here.
#[derive(Error, Debug)]
pub enum SatelliteError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("connectivity error: {0}")]
    Connectivity(String),
    #[error("connection attempt cancelled")]
    ConnectionCancelled,
    #[error("connection failed permanently: {0}")]
    ConnectionFatal(String),
    #[error("schema migration failed: {0}")]
    SchemaMigration(#[from] MigrationError),
    #[error("malformed change: {0}")]
    MalformedChange(String),
    #[error(transparent)]
    Subscription(#[from] ShapeError),
    #[error("table '{0}' is not part of the replicated schema")]
    UnknownTable(String),
    #[error("invalid state transition: {0}")]
    InvalidTransition(String),
    #[error("not connected")]
    NotConnected,
    #[error(transparent)]
    Transport(#[from] ClientError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Clock(#[from] ClockOverflow),
}

impl From<ConnectivityError> for SatelliteError {
    fn from(err: ConnectivityError) -> Self {
        match err {
            ConnectivityError::Cancelled => Self::ConnectionCancelled,
            ConnectivityError::Fatal(reason) => Self::ConnectionFatal(reason),
            invalid @ ConnectivityError::InvalidTransition { .. } => {
                Self::InvalidTransition(invalid.to_string())
            }
            exhausted @ ConnectivityError::Exhausted { .. } => Self::Connectivity(exhausted.to_string()),
        }
    }
}

impl From<OplogError> for SatelliteError {
    fn from(err: OplogError) -> Self {
        match err {
            OplogError::UnknownTable(table) => Self::UnknownTable(table),
            OplogError::Codec(e) => Self::Codec(e),
            OplogError::Storage(e) => Self::Storage(e),
            other => Self::MalformedChange(other.to_string()),
        }
    }
}

impl From<ShadowError> for SatelliteError {
    fn from(err: ShadowError) -> Self {
        match err {
            ShadowError::Storage(e) => Self::Storage(e),
            ShadowError::Tags(e) => Self::MalformedChange(format!("corrupt shadow tags: {}", e)),
        }
    }
}

/// Counts from applying a batch of changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: usize,
    pub skipped: usize,
}

/// Collaborators a satellite is built from.
#[derive(Clone)]
pub struct SatelliteDeps {
    pub adapter: Arc<dyn DatabaseAdapter>,
    pub builder: Arc<dyn QueryBuilder>,
    pub migrator: Arc<dyn Migrator>,
    pub client: Arc<dyn SatelliteClient>,
    pub schema: DbSchema,
}
