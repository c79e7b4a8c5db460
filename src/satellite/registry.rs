// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Registry of running satellites, keyed by database name.
//!
//! An explicit object handed to whoever needs lookups; there is no global.
//! Starting a satellite (which may retry its connection for a long time)
//! only holds a gate for that one name, so lookups and other names never
//! wait on it.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::info;

use crate::config::SatelliteConfig;

use super::{Satellite, SatelliteDeps, SatelliteError};

#[derive(Default)]
pub struct SatelliteRegistry {
    satellites: Mutex<HashMap<String, Arc<Satellite>>>,
    /// Serializes concurrent starts of the same name
    starting: DashMap<String, Arc<Mutex<()>>>,
}

impl SatelliteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the running satellite for `name`, or start and connect a new
    /// one. The satellite is only registered once both succeed.
    pub async fn ensure_started(
        &self,
        name: &str,
        config: SatelliteConfig,
        deps: SatelliteDeps,
        token: Option<String>,
    ) -> Result<Arc<Satellite>, SatelliteError> {
        if let Some(existing) = self.get(name).await {
            return Ok(existing);
        }

        let gate = self.starting.entry(name.to_string()).or_default().clone();
        let _starting = gate.lock().await;
        // Another caller may have finished while we waited.
        if let Some(existing) = self.get(name).await {
            return Ok(existing);
        }

        let satellite = Satellite::new(name, config, deps);
        let started = match satellite.start().await {
            Ok(()) => satellite.connect(token).await,
            Err(e) => Err(e),
        };
        if let Err(e) = started {
            satellite.stop().await;
            return Err(e);
        }

        self.satellites
            .lock()
            .await
            .insert(name.to_string(), satellite.clone());
        info!(name, "Satellite registered");
        Ok(satellite)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Satellite>> {
        self.satellites.lock().await.get(name).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.satellites.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Stop and remove one satellite. Returns false if none was registered.
    pub async fn stop(&self, name: &str) -> bool {
        let removed = self.satellites.lock().await.remove(name);
        match removed {
            Some(satellite) => {
                satellite.stop().await;
                true
            }
            None => false,
        }
    }

    pub async fn stop_all(&self) {
        let drained: Vec<Arc<Satellite>> = self.satellites.lock().await.drain().map(|(_, s)| s).collect();
        for satellite in drained {
            satellite.stop().await;
        }
    }
}
