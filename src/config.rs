// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for a satellite.
//!
//! # Example
//!
//! ```
//! use satellite::SatelliteConfig;
//!
//! // Minimal config (uses defaults)
//! let config = SatelliteConfig::default();
//! assert_eq!(config.oplog_table, "_satellite_oplog");
//! assert_eq!(config.backoff_initial_ms, 1000);
//!
//! // Tuned reconnect schedule
//! let config = SatelliteConfig {
//!     backoff_initial_ms: 500,
//!     backoff_max_ms: 4_000,
//!     max_connect_attempts: Some(10),
//!     ..Default::default()
//! };
//! assert_eq!(config.connect_retry().max_retries, Some(10));
//! ```

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::resilience::retry::RetryConfig;

/// A configuration value outside its usable range.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("backoff_factor must be a finite number >= 1.0, got {0}")]
    BackoffFactor(f64),
    #[error("backoff_jitter must be within [0, 1], got {0}")]
    BackoffJitter(f64),
    #[error("backoff_max_ms ({max}) is below backoff_initial_ms ({initial})")]
    BackoffRange { initial: u64, max: u64 },
    #[error("push_interval_ms must be positive")]
    PushInterval,
}

/// Configuration for a satellite.
///
/// All fields have sensible defaults, so an empty document deserializes to
/// [`SatelliteConfig::default()`].
#[derive(Debug, Clone, Deserialize)]
pub struct SatelliteConfig {
    /// Namespace (schema) holding the replicated and internal tables
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Internal table names
    #[serde(default = "default_oplog_table")]
    pub oplog_table: String,
    #[serde(default = "default_shadow_table")]
    pub shadow_table: String,
    #[serde(default = "default_meta_table")]
    pub meta_table: String,
    #[serde(default = "default_migrations_table")]
    pub migrations_table: String,

    /// Origin used for local tags. Generated and persisted on first start
    /// when unset.
    #[serde(default)]
    pub client_id: Option<String>,

    /// Reconnect backoff
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_backoff_jitter")]
    pub backoff_jitter: f64,

    /// Failed attempts before giving up (None = retry forever)
    #[serde(default)]
    pub max_connect_attempts: Option<usize>,

    /// Outbound push settings
    #[serde(default = "default_push_interval_ms")]
    pub push_interval_ms: u64,
    #[serde(default = "default_push_batch_size")]
    pub push_batch_size: usize,

    /// Delete oplog entries once the remote side acknowledges them
    #[serde(default = "default_compact_acknowledged")]
    pub compact_acknowledged: bool,
}

fn default_namespace() -> String { "main".to_string() }
fn default_oplog_table() -> String { "_satellite_oplog".to_string() }
fn default_shadow_table() -> String { "_satellite_shadow".to_string() }
fn default_meta_table() -> String { "_satellite_meta".to_string() }
fn default_migrations_table() -> String { "_satellite_migrations".to_string() }
fn default_backoff_initial_ms() -> u64 { 1000 }
fn default_backoff_factor() -> f64 { 2.0 }
fn default_backoff_max_ms() -> u64 { 10_000 }
fn default_backoff_jitter() -> f64 { 0.1 }
fn default_push_interval_ms() -> u64 { 100 }
fn default_push_batch_size() -> usize { 100 }
fn default_compact_acknowledged() -> bool { true }

impl Default for SatelliteConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            oplog_table: default_oplog_table(),
            shadow_table: default_shadow_table(),
            meta_table: default_meta_table(),
            migrations_table: default_migrations_table(),
            client_id: None,
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_factor: default_backoff_factor(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_jitter: default_backoff_jitter(),
            max_connect_attempts: None,
            push_interval_ms: default_push_interval_ms(),
            push_batch_size: default_push_batch_size(),
            compact_acknowledged: default_compact_acknowledged(),
        }
    }
}

impl SatelliteConfig {
    /// Reject values the reconnect and push loops cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(ConfigError::BackoffFactor(self.backoff_factor));
        }
        if !(0.0..=1.0).contains(&self.backoff_jitter) {
            return Err(ConfigError::BackoffJitter(self.backoff_jitter));
        }
        if self.backoff_max_ms < self.backoff_initial_ms {
            return Err(ConfigError::BackoffRange {
                initial: self.backoff_initial_ms,
                max: self.backoff_max_ms,
            });
        }
        if self.push_interval_ms == 0 {
            return Err(ConfigError::PushInterval);
        }
        Ok(())
    }

    /// Backoff schedule for the connectivity state machine.
    #[must_use]
    pub fn connect_retry(&self) -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(self.backoff_initial_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms),
            factor: self.backoff_factor,
            jitter: self.backoff_jitter,
            max_retries: self.max_connect_attempts,
        }
    }

    #[must_use]
    pub fn push_interval(&self) -> Duration {
        Duration::from_millis(self.push_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: SatelliteConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.namespace, "main");
        assert_eq!(config.shadow_table, "_satellite_shadow");
        assert_eq!(config.meta_table, "_satellite_meta");
        assert_eq!(config.migrations_table, "_satellite_migrations");
        assert!(config.client_id.is_none());
        assert_eq!(config.push_batch_size, 100);
        assert!(config.compact_acknowledged);
    }

    #[test]
    fn test_connect_retry_mirrors_backoff_fields() {
        let config: SatelliteConfig = serde_json::from_str(
            r#"{"backoff_initial_ms": 250, "backoff_max_ms": 2000, "backoff_jitter": 0.0, "max_connect_attempts": 4}"#,
        )
        .unwrap();
        let retry = config.connect_retry();
        assert_eq!(retry.initial_delay, Duration::from_millis(250));
        assert_eq!(retry.max_delay, Duration::from_secs(2));
        assert_eq!(retry.factor, 2.0);
        assert_eq!(retry.jitter, 0.0);
        assert_eq!(retry.max_retries, Some(4));
    }

    #[test]
    fn test_validate_rejects_unusable_backoff() {
        assert_eq!(SatelliteConfig::default().validate(), Ok(()));

        let negative: SatelliteConfig = serde_json::from_str(r#"{"backoff_factor": -2.0}"#).unwrap();
        assert_eq!(negative.validate(), Err(ConfigError::BackoffFactor(-2.0)));

        let shrinking = SatelliteConfig { backoff_factor: 0.5, ..Default::default() };
        assert!(matches!(shrinking.validate(), Err(ConfigError::BackoffFactor(_))));

        let nan = SatelliteConfig { backoff_factor: f64::NAN, ..Default::default() };
        assert!(matches!(nan.validate(), Err(ConfigError::BackoffFactor(_))));

        let jitter = SatelliteConfig { backoff_jitter: 1.5, ..Default::default() };
        assert_eq!(jitter.validate(), Err(ConfigError::BackoffJitter(1.5)));

        let range = SatelliteConfig { backoff_initial_ms: 500, backoff_max_ms: 100, ..Default::default() };
        assert_eq!(range.validate(), Err(ConfigError::BackoffRange { initial: 500, max: 100 }));

        let interval = SatelliteConfig { push_interval_ms: 0, ..Default::default() };
        assert_eq!(interval.validate(), Err(ConfigError::PushInterval));
    }
}
