//! Sink for the last known truck position of a closed connection.

use std::sync::{Mutex, PoisonError};

use anyhow::Result;
use async_trait::async_trait;

use crate::protocol::GeolocationUpdate;

/// Durable storage for geolocation snapshots.
#[async_trait]
pub trait GeolocationStore: Send + Sync + std::fmt::Debug {
    /// Persist one snapshot.
    async fn save(&self, update: &GeolocationUpdate) -> Result<()>;
}

/// Writes snapshots to the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingGeolocationStore;

#[async_trait]
impl GeolocationStore for LoggingGeolocationStore {
    async fn save(&self, update: &GeolocationUpdate) -> Result<()> {
        log::info!(
            "[Server] Last location for truck {} (tenant {}): {}, {}",
            update.truck_id,
            update.tenant_id,
            update.current_location.latitude,
            update.current_location.longitude
        );
        Ok(())
    }
}

/// Keeps snapshots in memory.
#[derive(Debug, Default)]
pub struct InMemoryGeolocationStore {
    saved: Mutex<Vec<GeolocationUpdate>>,
}

impl InMemoryGeolocationStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every saved snapshot in save order.
    pub fn saved(&self) -> Vec<GeolocationUpdate> {
        self.saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Most recent snapshot for a truck.
    pub fn latest(&self, truck_id: &str) -> Option<GeolocationUpdate> {
        self.saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .find(|u| u.truck_id == truck_id)
            .cloned()
    }
}

#[async_trait]
impl GeolocationStore for InMemoryGeolocationStore {
    async fn save(&self, update: &GeolocationUpdate) -> Result<()> {
        self.saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(update.clone());
        Ok(())
    }
}
