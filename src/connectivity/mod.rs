// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Connectivity state machine with cancellable backoff.
//!
//! # States
//!
//! ```text
//!                 connect_with_backoff
//!  Disconnected ───────────────────────▶ Connecting ──▶ Connected
//!       ▲                                 │    ▲             │
//!       │          client_disconnect      │    │ transient   │
//!       └─────────────────────────────────┘    └─────────────┘
//!
//!  any ──fatal──▶ Error ──connect_with_backoff──▶ Connecting
//! ```
//!
//! The current state lives in a `watch` channel so a late observer reads it
//! synchronously without replay. Every accepted transition also emits one
//! [`SatelliteEvent::ConnectivityStateChanged`] on the bus.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{ClientError, SatelliteClient};
use crate::notifier::{EventNotifier, SatelliteEvent};
use crate::resilience::retry::{Backoff, RetryConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectivityStatus {
    fn gauge_value(self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::Connecting => 1,
            Self::Connected => 2,
            Self::Error => 3,
        }
    }
}

impl fmt::Display for ConnectivityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectivityState {
    pub status: ConnectivityStatus,
    pub last_error: Option<String>,
}

impl ConnectivityState {
    fn new(status: ConnectivityStatus) -> Self {
        Self {
            status,
            last_error: None,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectivityError {
    #[error("invalid connectivity transition {from} -> {to}")]
    InvalidTransition {
        from: ConnectivityStatus,
        to: ConnectivityStatus,
    },
    #[error("connection attempt cancelled")]
    Cancelled,
    #[error("connection failed permanently: {0}")]
    Fatal(String),
    #[error("gave up after {attempts} attempts: {last_error}")]
    Exhausted { attempts: usize, last_error: String },
}

fn is_valid(from: ConnectivityStatus, to: ConnectivityStatus) -> bool {
    use ConnectivityStatus::*;
    matches!(
        (from, to),
        (Disconnected, Connecting)
            | (Connecting, Connected)
            | (Connecting, Disconnected)
            | (Connected, Connecting)
            | (Connected, Disconnected)
            | (Error, Connecting)
            | (_, Error)
    )
}

pub struct ConnectivityStateMachine {
    state: watch::Sender<ConnectivityState>,
    notifier: Arc<EventNotifier>,
    retry: RetryConfig,
    /// Cancels the connect loop currently running, if any
    pending: Mutex<Option<CancellationToken>>,
    /// Serializes transition + emit so events leave in transition order
    emit_lock: Mutex<()>,
}

impl ConnectivityStateMachine {
    pub fn new(retry: RetryConfig, notifier: Arc<EventNotifier>) -> Self {
        let (state, _) = watch::channel(ConnectivityState::new(ConnectivityStatus::Disconnected));
        Self {
            state,
            notifier,
            retry,
            pending: Mutex::new(None),
            emit_lock: Mutex::new(()),
        }
    }

    pub fn state(&self) -> ConnectivityState {
        self.state.borrow().clone()
    }

    pub fn status(&self) -> ConnectivityStatus {
        self.state.borrow().status
    }

    /// Receiver primed with the current state.
    pub fn watch(&self) -> watch::Receiver<ConnectivityState> {
        self.state.subscribe()
    }

    /// Move to `to`. Returns `Ok(false)` when already there.
    pub fn transition(
        &self,
        to: ConnectivityStatus,
        last_error: Option<String>,
    ) -> Result<bool, ConnectivityError> {
        let _ordered = self.emit_lock.lock();
        let mut outcome = Ok(false);
        self.state.send_if_modified(|current| {
            if current.status == to {
                return false;
            }
            if !is_valid(current.status, to) {
                outcome = Err(ConnectivityError::InvalidTransition {
                    from: current.status,
                    to,
                });
                return false;
            }
            debug!(from = %current.status, to = %to, "Connectivity transition");
            *current = ConnectivityState {
                status: to,
                last_error: last_error.clone(),
            };
            outcome = Ok(true);
            true
        });

        if let Ok(true) = outcome {
            crate::metrics::set_connectivity_status(to.gauge_value());
            self.notifier
                .emit(SatelliteEvent::ConnectivityStateChanged(self.state()));
        }
        outcome
    }

    /// Enter `Error`, recording why.
    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        error!(error = %reason, "Connectivity failed");
        // (_, Error) is always valid
        let _ = self.transition(ConnectivityStatus::Error, Some(reason));
    }

    fn arm(&self) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(previous) = self.pending.lock().replace(token.clone()) {
            previous.cancel();
        }
        token
    }

    /// Cancel the running connect loop, if any.
    pub fn cancel_pending(&self) {
        if let Some(token) = self.pending.lock().take() {
            token.cancel();
        }
    }

    /// Connect, retrying transient failures on the configured backoff.
    ///
    /// Cancelled by [`client_disconnect`](Self::client_disconnect) or by a
    /// newer call at any await point. Fatal failures and exhausted retries
    /// leave the machine in `Error`.
    pub async fn connect_with_backoff(
        &self,
        client: &dyn SatelliteClient,
        token: Option<&str>,
    ) -> Result<(), ConnectivityError> {
        let cancel = self.arm();
        self.transition(ConnectivityStatus::Connecting, None)?;

        let mut backoff = Backoff::new(&self.retry);
        loop {
            let attempt = tokio::select! {
                _ = cancel.cancelled() => return Err(ConnectivityError::Cancelled),
                result = client.connect(token) => result,
            };

            match attempt {
                Ok(()) => {
                    if cancel.is_cancelled() {
                        client.close().await;
                        return Err(ConnectivityError::Cancelled);
                    }
                    self.transition(ConnectivityStatus::Connected, None)?;
                    info!(attempts = backoff.attempts() + 1, "Connected");
                    return Ok(());
                }
                Err(ClientError::Fatal(reason)) => {
                    crate::metrics::record_reconnect_attempt("fatal");
                    self.fail(reason.clone());
                    return Err(ConnectivityError::Fatal(reason));
                }
                Err(err) => {
                    crate::metrics::record_reconnect_attempt("transient");
                    let Some(delay) = backoff.next_delay() else {
                        let attempts = backoff.attempts() + 1;
                        self.fail(format!("gave up after {} attempts: {}", attempts, err));
                        return Err(ConnectivityError::Exhausted {
                            attempts,
                            last_error: err.to_string(),
                        });
                    };
                    warn!(
                        attempt = backoff.attempts(),
                        error = %err,
                        "Connection attempt failed. Retrying in {:?}",
                        delay
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ConnectivityError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Drop to `Disconnected` immediately, cancel any pending retry and close
    /// the transport. `Error` is kept; only a new connect leaves it.
    pub async fn client_disconnect(&self, client: &dyn SatelliteClient) {
        self.cancel_pending();
        if self.status() != ConnectivityStatus::Error {
            let _ = self.transition(ConnectivityStatus::Disconnected, None);
        }
        client.close().await;
    }

    /// A live connection dropped with a transient error.
    ///
    /// Returns true when the caller should start reconnecting.
    pub fn connection_lost(&self, reason: &str) -> bool {
        if self.status() != ConnectivityStatus::Connected {
            return false;
        }
        warn!(error = %reason, "Connection lost");
        matches!(
            self.transition(ConnectivityStatus::Connecting, Some(reason.to_string())),
            Ok(true)
        )
    }
}
