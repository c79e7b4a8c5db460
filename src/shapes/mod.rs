// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Partial-replication subscriptions ("shapes").
//!
//! A shape is keyed by the SHA-256 of its normalized definition, so two
//! definitions that differ only in select order or whitespace share a key
//! and a subscription.
//!
//! # Status progression
//!
//! ```text
//! Requested ──▶ Establishing ──▶ Active ──▶ Synced
//!     ▲              │              │
//!     └──────────────┴──────────────┘  (connection lost before sync)
//!
//! any ──rejected──▶ Error
//! ```
//!
//! Each shape carries its own async lock; the orchestrator holds it for the
//! whole request/snapshot exchange so transitions on one key never race,
//! while different keys progress concurrently.

use std::fmt;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::notifier::{EventNotifier, SatelliteEvent};

/// One table (optionally filtered) in a shape.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShapeSelect {
    pub tablename: String,
    #[serde(default, rename = "where", skip_serializing_if = "Option::is_none")]
    pub where_clause: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShapeDefinition {
    pub selects: Vec<ShapeSelect>,
}

impl ShapeDefinition {
    /// Whole-table shape.
    pub fn table(tablename: impl Into<String>) -> Self {
        Self::default().with_table(tablename)
    }

    #[must_use]
    pub fn with_table(mut self, tablename: impl Into<String>) -> Self {
        self.selects.push(ShapeSelect {
            tablename: tablename.into(),
            where_clause: None,
        });
        self
    }

    #[must_use]
    pub fn with_filter(mut self, tablename: impl Into<String>, where_clause: impl Into<String>) -> Self {
        self.selects.push(ShapeSelect {
            tablename: tablename.into(),
            where_clause: Some(where_clause.into()),
        });
        self
    }

    /// Trimmed, sorted and deduplicated copy.
    pub fn normalized(&self) -> Self {
        let mut selects: Vec<ShapeSelect> = self
            .selects
            .iter()
            .map(|s| ShapeSelect {
                tablename: s.tablename.trim().to_string(),
                where_clause: s
                    .where_clause
                    .as_deref()
                    .map(str::trim)
                    .filter(|w| !w.is_empty())
                    .map(str::to_string),
            })
            .collect();
        selects.sort();
        selects.dedup();
        Self { selects }
    }

    /// Deterministic key of the normalized definition.
    pub fn key(&self) -> String {
        // Struct fields serialize in declaration order, so this is canonical.
        let canonical = serde_json::to_vec(&self.normalized()).unwrap_or_default();
        hex::encode(Sha256::digest(&canonical))
    }

    pub fn tablenames(&self) -> impl Iterator<Item = &str> {
        self.selects.iter().map(|s| s.tablename.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShapeStatus {
    Requested,
    Establishing,
    Active,
    Synced,
    Error,
}

impl ShapeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Establishing => "establishing",
            Self::Active => "active",
            Self::Synced => "synced",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ShapeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_valid(from: ShapeStatus, to: ShapeStatus) -> bool {
    use ShapeStatus::*;
    matches!(
        (from, to),
        (Requested, Establishing)
            | (Establishing, Active)
            | (Active, Synced)
            | (Establishing, Requested)
            | (Active, Requested)
            | (Requested | Establishing | Active, Error)
    )
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShapeError {
    #[error("shape {key} rejected: {reason}")]
    Rejected { key: String, reason: String },
    #[error("shape {0} was unsubscribed")]
    Unsubscribed(String),
    #[error("unknown shape {0}")]
    Unknown(String),
    #[error("shape {key}: invalid transition {from} -> {to}")]
    InvalidTransition {
        key: String,
        from: ShapeStatus,
        to: ShapeStatus,
    },
}

/// Point-in-time view of a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shape {
    pub key: String,
    pub definition: ShapeDefinition,
    pub status: ShapeStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ShapeState {
    status: ShapeStatus,
    error: Option<String>,
}

struct ShapeSlot {
    definition: ShapeDefinition,
    state: watch::Sender<ShapeState>,
    exchange: Arc<Mutex<()>>,
}

impl ShapeSlot {
    fn new(definition: ShapeDefinition) -> Self {
        let (state, _) = watch::channel(ShapeState {
            status: ShapeStatus::Requested,
            error: None,
        });
        Self {
            definition,
            state,
            exchange: Arc::new(Mutex::new(())),
        }
    }

    fn snapshot(&self, key: &str) -> Shape {
        Shape {
            key: key.to_string(),
            definition: self.definition.clone(),
            status: self.state.borrow().status,
        }
    }

    fn handle(&self, key: &str) -> ShapeHandle {
        ShapeHandle {
            key: key.to_string(),
            state: self.state.subscribe(),
        }
    }
}

/// Caller-side view of one subscription.
#[derive(Debug, Clone)]
pub struct ShapeHandle {
    pub key: String,
    state: watch::Receiver<ShapeState>,
}

impl ShapeHandle {
    pub fn status(&self) -> ShapeStatus {
        self.state.borrow().status
    }

    /// Wait until the initial snapshot has been merged.
    pub async fn synced(&mut self) -> Result<(), ShapeError> {
        let state = self
            .state
            .wait_for(|s| matches!(s.status, ShapeStatus::Synced | ShapeStatus::Error))
            .await
            .map_err(|_| ShapeError::Unsubscribed(self.key.clone()))?
            .clone();

        match state.status {
            ShapeStatus::Synced => Ok(()),
            _ => Err(ShapeError::Rejected {
                key: self.key.clone(),
                reason: state.error.unwrap_or_default(),
            }),
        }
    }
}

/// Outcome of [`ShapeManager::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    pub handle: ShapeHandle,
    /// False when an existing subscription was reused
    pub created: bool,
}

pub struct ShapeManager {
    shapes: DashMap<String, ShapeSlot>,
    notifier: Arc<EventNotifier>,
}

impl ShapeManager {
    pub fn new(notifier: Arc<EventNotifier>) -> Self {
        Self {
            shapes: DashMap::new(),
            notifier,
        }
    }

    /// Register a shape, or return the live one with the same key.
    ///
    /// A shape in `Error` is replaced by a fresh `Requested` one.
    pub fn subscribe(&self, definition: &ShapeDefinition) -> Subscription {
        let normalized = definition.normalized();
        let key = normalized.key();

        let subscription = match self.shapes.entry(key.clone()) {
            Entry::Occupied(existing) if existing.get().state.borrow().status != ShapeStatus::Error => {
                debug!(key = %key, "Reusing existing shape subscription");
                return Subscription {
                    handle: existing.get().handle(&key),
                    created: false,
                };
            }
            Entry::Occupied(mut failed) => {
                failed.insert(ShapeSlot::new(normalized));
                Subscription {
                    handle: failed.get().handle(&key),
                    created: true,
                }
            }
            Entry::Vacant(vacant) => {
                let slot = vacant.insert(ShapeSlot::new(normalized));
                Subscription {
                    handle: slot.handle(&key),
                    created: true,
                }
            }
        };

        info!(key = %key, "Shape requested");
        crate::metrics::set_active_shapes(self.shapes.len());
        self.announce(&key, ShapeStatus::Requested);
        subscription
    }

    /// Lock a shape for a request/snapshot exchange.
    pub async fn lock(&self, key: &str) -> Option<OwnedMutexGuard<()>> {
        let exchange = self.shapes.get(key).map(|slot| slot.exchange.clone())?;
        Some(exchange.lock_owned().await)
    }

    pub fn status(&self, key: &str) -> Option<ShapeStatus> {
        self.shapes.get(key).map(|slot| slot.state.borrow().status)
    }

    pub fn definition(&self, key: &str) -> Option<ShapeDefinition> {
        self.shapes.get(key).map(|slot| slot.definition.clone())
    }

    pub fn handle(&self, key: &str) -> Option<ShapeHandle> {
        self.shapes.get(key).map(|slot| slot.handle(key))
    }

    /// Move a shape to `to`. Returns `Ok(false)` when already there.
    pub fn transition(&self, key: &str, to: ShapeStatus) -> Result<bool, ShapeError> {
        self.set_state(key, to, None)
    }

    /// Move a shape to `Error`.
    pub fn fail(&self, key: &str, reason: impl Into<String>) -> Result<bool, ShapeError> {
        self.set_state(key, ShapeStatus::Error, Some(reason.into()))
    }

    fn set_state(&self, key: &str, to: ShapeStatus, error: Option<String>) -> Result<bool, ShapeError> {
        let changed = {
            let slot = self
                .shapes
                .get(key)
                .ok_or_else(|| ShapeError::Unknown(key.to_string()))?;
            let mut outcome = Ok(false);
            slot.state.send_if_modified(|state| {
                if state.status == to {
                    return false;
                }
                if !is_valid(state.status, to) {
                    outcome = Err(ShapeError::InvalidTransition {
                        key: key.to_string(),
                        from: state.status,
                        to,
                    });
                    return false;
                }
                *state = ShapeState { status: to, error };
                outcome = Ok(true);
                true
            });
            outcome?
        };

        if changed {
            debug!(key = %key, status = %to, "Shape transition");
            crate::metrics::record_shape_transition(to.as_str());
            self.announce(key, to);
        }
        Ok(changed)
    }

    /// Stop tracking a shape. Rows already applied stay.
    pub fn unsubscribe(&self, key: &str) -> Option<Shape> {
        let (key, slot) = self.shapes.remove(key)?;
        info!(key = %key, "Shape unsubscribed");
        crate::metrics::set_active_shapes(self.shapes.len());
        Some(slot.snapshot(&key))
    }

    /// Snapshot of every tracked shape, ordered by key.
    pub fn list_all_subscriptions(&self) -> Vec<Shape> {
        let mut shapes: Vec<Shape> = self
            .shapes
            .iter()
            .map(|entry| entry.value().snapshot(entry.key()))
            .collect();
        shapes.sort_by(|a, b| a.key.cmp(&b.key));
        shapes
    }

    /// Keys of shapes still waiting to be sent.
    pub fn requested(&self) -> Vec<String> {
        self.keys_with(|s| s == ShapeStatus::Requested)
    }

    /// Push every in-flight shape back to `Requested` so it is resent on the
    /// next connection.
    pub fn reset_in_flight(&self) {
        for key in self.keys_with(|s| matches!(s, ShapeStatus::Establishing | ShapeStatus::Active)) {
            let _ = self.transition(&key, ShapeStatus::Requested);
        }
    }

    fn keys_with(&self, predicate: impl Fn(ShapeStatus) -> bool) -> Vec<String> {
        let mut keys: Vec<String> = self
            .shapes
            .iter()
            .filter(|entry| predicate(entry.value().state.borrow().status))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    fn announce(&self, key: &str, status: ShapeStatus) {
        self.notifier.emit(SatelliteEvent::ShapeStatusChanged {
            key: key.to_string(),
            status,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::EventKind;
    use parking_lot::Mutex as SyncMutex;

    fn manager() -> (ShapeManager, Arc<EventNotifier>) {
        let notifier = Arc::new(EventNotifier::new());
        (ShapeManager::new(notifier.clone()), notifier)
    }

    #[test]
    fn test_key_ignores_select_order_and_whitespace() {
        let a = ShapeDefinition::table("items").with_filter("parent", "id > 1");
        let b = ShapeDefinition::default()
            .with_filter("parent", "  id > 1 ")
            .with_table("items")
            .with_table("items");
        assert_eq!(a.key(), b.key());
        assert_eq!(a.key().len(), 64);
        assert_ne!(a.key(), ShapeDefinition::table("items").key());
    }

    #[test]
    fn test_key_ignores_json_field_order() {
        let a: ShapeDefinition =
            serde_json::from_str(r#"{"selects":[{"tablename":"items","where":"x = 1"}]}"#).unwrap();
        let b: ShapeDefinition =
            serde_json::from_str(r#"{"selects":[{"where":"x = 1","tablename":"items"}]}"#).unwrap();
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_subscribe_dedups_live_shape() {
        let (shapes, _) = manager();
        let first = shapes.subscribe(&ShapeDefinition::table("items"));
        let second = shapes.subscribe(&ShapeDefinition::table("items"));

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.handle.key, second.handle.key);
        assert_eq!(shapes.list_all_subscriptions().len(), 1);
    }

    #[test]
    fn test_failed_shape_is_replaced_on_resubscribe() {
        let (shapes, _) = manager();
        let first = shapes.subscribe(&ShapeDefinition::table("items"));
        shapes.fail(&first.handle.key, "no such table").unwrap();

        let again = shapes.subscribe(&ShapeDefinition::table("items"));
        assert!(again.created);
        assert_eq!(shapes.status(&again.handle.key), Some(ShapeStatus::Requested));
    }

    #[test]
    fn test_status_progression_and_events() {
        let (shapes, notifier) = manager();
        let seen = Arc::new(SyncMutex::new(Vec::new()));
        let sink = seen.clone();
        notifier.subscribe(EventKind::ShapeStatusChanged, move |e| {
            if let SatelliteEvent::ShapeStatusChanged { status, .. } = e {
                sink.lock().push(*status);
            }
        });

        let key = shapes.subscribe(&ShapeDefinition::table("items")).handle.key;
        shapes.transition(&key, ShapeStatus::Establishing).unwrap();
        shapes.transition(&key, ShapeStatus::Active).unwrap();
        shapes.transition(&key, ShapeStatus::Synced).unwrap();

        assert!(matches!(
            shapes.transition(&key, ShapeStatus::Establishing),
            Err(ShapeError::InvalidTransition { .. })
        ));
        assert_eq!(
            *seen.lock(),
            vec![
                ShapeStatus::Requested,
                ShapeStatus::Establishing,
                ShapeStatus::Active,
                ShapeStatus::Synced
            ]
        );
    }

    #[test]
    fn test_unsubscribe_then_list_is_empty() {
        let (shapes, _) = manager();
        let key = shapes.subscribe(&ShapeDefinition::table("items")).handle.key;
        let removed = shapes.unsubscribe(&key).unwrap();
        assert_eq!(removed.key, key);
        assert!(shapes.list_all_subscriptions().is_empty());
        assert!(shapes.unsubscribe(&key).is_none());
        assert_eq!(shapes.transition(&key, ShapeStatus::Establishing), Err(ShapeError::Unknown(key)));
    }

    #[test]
    fn test_reset_in_flight() {
        let (shapes, _) = manager();
        let key = shapes.subscribe(&ShapeDefinition::table("items")).handle.key;
        shapes.transition(&key, ShapeStatus::Establishing).unwrap();
        assert!(shapes.requested().is_empty());

        shapes.reset_in_flight();
        assert_eq!(shapes.requested(), vec![key]);
    }

    #[tokio::test]
    async fn test_handle_resolves_on_sync() {
        let (shapes, _) = manager();
        let mut handle = shapes.subscribe(&ShapeDefinition::table("items")).handle;
        let key = handle.key.clone();
        shapes.transition(&key, ShapeStatus::Establishing).unwrap();
        shapes.transition(&key, ShapeStatus::Active).unwrap();
        shapes.transition(&key, ShapeStatus::Synced).unwrap();
        handle.synced().await.unwrap();
        assert_eq!(handle.status(), ShapeStatus::Synced);
    }

    #[tokio::test]
    async fn test_handle_reports_rejection_and_unsubscribe() {
        let (shapes, _) = manager();
        let mut rejected = shapes.subscribe(&ShapeDefinition::table("items")).handle;
        shapes.fail(&rejected.key, "not allowed").unwrap();
        assert_eq!(
            rejected.synced().await,
            Err(ShapeError::Rejected {
                key: rejected.key.clone(),
                reason: "not allowed".into()
            })
        );

        let mut dropped = shapes.subscribe(&ShapeDefinition::table("other")).handle;
        shapes.unsubscribe(&dropped.key);
        assert_eq!(dropped.synced().await, Err(ShapeError::Unsubscribed(dropped.key.clone())));
    }

    #[tokio::test]
    async fn test_exchange_lock_is_per_key() {
        let (shapes, _) = manager();
        let a = shapes.subscribe(&ShapeDefinition::table("a")).handle.key;
        let b = shapes.subscribe(&ShapeDefinition::table("b")).handle.key;

        let _held = shapes.lock(&a).await.unwrap();
        // A different key is not blocked.
        let _other = shapes.lock(&b).await.unwrap();
        assert!(shapes.lock("missing").await.is_none());
    }
}
