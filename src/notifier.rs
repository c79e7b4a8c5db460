// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Typed event bus.
//!
//! Listeners register per [`EventKind`] and get a [`SubscriptionToken`] back
//! for cancellation. Events are delivered synchronously, in emission order
//! for each kind. There is no ordering across kinds.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::trace;

use crate::connectivity::ConnectivityState;
use crate::schema::QualifiedTablename;
use crate::shapes::ShapeStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ConnectivityStateChanged,
    ShapeStatusChanged,
    DataChanged,
}

/// Where applied data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote,
    Snapshot,
}

impl ChangeOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
            Self::Snapshot => "snapshot",
        }
    }
}

/// Rows changed by one committed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChange {
    pub origin: ChangeOrigin,
    pub tables: BTreeSet<QualifiedTablename>,
    pub row_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SatelliteEvent {
    ConnectivityStateChanged(ConnectivityState),
    ShapeStatusChanged { key: String, status: ShapeStatus },
    DataChanged(DataChange),
}

impl SatelliteEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ConnectivityStateChanged(_) => EventKind::ConnectivityStateChanged,
            Self::ShapeStatusChanged { .. } => EventKind::ShapeStatusChanged,
            Self::DataChanged(_) => EventKind::DataChanged,
        }
    }
}

pub type Listener = Arc<dyn Fn(&SatelliteEvent) + Send + Sync>;

/// Handle returned by [`EventNotifier::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken {
    kind: EventKind,
    id: u64,
}

#[derive(Default)]
pub struct EventNotifier {
    next_id: AtomicU64,
    listeners: DashMap<EventKind, Vec<(u64, Listener)>>,
}

impl EventNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> SubscriptionToken
    where
        F: Fn(&SatelliteEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        SubscriptionToken { kind, id }
    }

    /// Returns false if the token was already cancelled.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let Some(mut listeners) = self.listeners.get_mut(&token.kind) else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|(id, _)| *id != token.id);
        before != listeners.len()
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.get(&kind).map(|l| l.len()).unwrap_or(0)
    }

    pub fn emit(&self, event: SatelliteEvent) {
        // Snapshot first so listeners may (un)subscribe while being called.
        let listeners: Vec<Listener> = match self.listeners.get(&event.kind()) {
            Some(entries) => entries.iter().map(|(_, l)| l.clone()).collect(),
            None => return,
        };
        trace!(kind = ?event.kind(), listeners = listeners.len(), "Emitting event");
        for listener in listeners {
            listener(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn data_event(rows: usize) -> SatelliteEvent {
        SatelliteEvent::DataChanged(DataChange {
            origin: ChangeOrigin::Local,
            tables: BTreeSet::new(),
            row_count: rows,
        })
    }

    #[test]
    fn test_delivery_in_emission_order() {
        let notifier = EventNotifier::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        notifier.subscribe(EventKind::DataChanged, move |e| {
            if let SatelliteEvent::DataChanged(change) = e {
                sink.lock().push(change.row_count);
            }
        });

        for i in 0..5 {
            notifier.emit(data_event(i));
        }
        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_only_matching_kind_is_delivered() {
        let notifier = EventNotifier::new();
        let count = Arc::new(AtomicU64::new(0));
        let c = count.clone();
        notifier.subscribe(EventKind::ShapeStatusChanged, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        notifier.emit(data_event(1));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let notifier = EventNotifier::new();
        let count = Arc::new(AtomicU64::new(0));
        let c = count.clone();
        let token = notifier.subscribe(EventKind::DataChanged, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        notifier.emit(data_event(1));
        assert!(notifier.unsubscribe(token));
        assert!(!notifier.unsubscribe(token));
        notifier.emit(data_event(1));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(notifier.listener_count(EventKind::DataChanged), 0);
    }

    #[test]
    fn test_listener_may_unsubscribe_itself() {
        let notifier = Arc::new(EventNotifier::new());
        let token_slot: Arc<Mutex<Option<SubscriptionToken>>> = Arc::new(Mutex::new(None));
        let n = notifier.clone();
        let slot = token_slot.clone();
        let token = notifier.subscribe(EventKind::DataChanged, move |_| {
            if let Some(t) = *slot.lock() {
                n.unsubscribe(t);
            }
        });
        *token_slot.lock() = Some(token);

        notifier.emit(data_event(1));
        assert_eq!(notifier.listener_count(EventKind::DataChanged), 0);
    }
}
