// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Transport collaborator.
//!
//! The satellite talks to the remote service only through
//! [`SatelliteClient`]. Framing, authentication and the wire protocol live
//! behind it.

use async_trait::async_trait;
use thiserror::Error;

use crate::oplog::OplogEntry;
use crate::shapes::ShapeDefinition;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Worth retrying with backoff (network, handshake timeout)
    #[error("transient transport failure: {0}")]
    Transient(String),
    /// Retrying cannot help (authentication, protocol mismatch)
    #[error("fatal transport failure: {0}")]
    Fatal(String),
    #[error("shape {key} rejected: {reason}")]
    ShapeRejected { key: String, reason: String },
}

impl ClientError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Acknowledgement for a batch of sent entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    /// Highest rowid the remote side has durably received
    pub last_rowid: i64,
}

#[async_trait]
pub trait SatelliteClient: Send + Sync {
    /// Open the connection and complete the handshake.
    async fn connect(&self, token: Option<&str>) -> Result<(), ClientError>;

    async fn close(&self);

    /// Send entries in rowid order.
    async fn send_entries(&self, entries: &[OplogEntry]) -> Result<Ack, ClientError>;

    /// Ask the remote side to start replicating a shape. Resolves once the
    /// request is acknowledged.
    async fn subscribe(&self, key: &str, definition: &ShapeDefinition) -> Result<(), ClientError>;

    /// Rows currently matching an acknowledged shape.
    async fn initial_snapshot(&self, key: &str) -> Result<Vec<OplogEntry>, ClientError>;

    async fn unsubscribe(&self, keys: &[String]) -> Result<(), ClientError>;
}
