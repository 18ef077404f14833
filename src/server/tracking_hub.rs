//! Live tracking hub: last known position per connection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{bail, Result};
use async_trait::async_trait;

use super::hub::{string_arg, Hub, HubContext};
use super::registry::ConnectionRegistry;
use super::store::GeolocationStore;
use crate::protocol::{methods, GeolocationUpdate, Invocation};

/// Receives truck positions; persists the last one when a driver leaves.
///
/// Positions are not re-broadcast. Tenant groups exist for tenant-scoped
/// pushes.
#[derive(Debug)]
pub struct LiveTrackingHub {
    connections: Arc<ConnectionRegistry>,
    locations: Mutex<HashMap<String, Option<GeolocationUpdate>>>,
    store: Arc<dyn GeolocationStore>,
}

impl LiveTrackingHub {
    /// Hub that persists each connection's last location into `store`.
    pub fn new(store: Arc<dyn GeolocationStore>) -> Self {
        Self {
            connections: Arc::new(ConnectionRegistry::new()),
            locations: Mutex::new(HashMap::new()),
            store,
        }
    }

    fn locations(&self) -> std::sync::MutexGuard<'_, HashMap<String, Option<GeolocationUpdate>>> {
        self.locations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Last position reported on a connection.
    pub fn last_known(&self, connection_id: &str) -> Option<GeolocationUpdate> {
        self.locations().get(connection_id).cloned().flatten()
    }

    /// Number of connections being tracked.
    pub fn tracked_connections(&self) -> usize {
        self.locations().len()
    }
}

#[async_trait]
impl Hub for LiveTrackingHub {
    fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    async fn on_connected(&self, ctx: &HubContext) {
        self.locations()
            .insert(ctx.connection_id().to_string(), None);
    }

    async fn on_disconnected(&self, ctx: &HubContext) {
        let last = self.locations().remove(ctx.connection_id()).flatten();
        let Some(update) = last else {
            log::debug!(
                "[Server] Connection {} left without a location",
                ctx.connection_id()
            );
            return;
        };

        if let Err(e) = self.store.save(&update).await {
            log::error!(
                "[Server] Failed to persist last location of truck {}: {e:#}",
                update.truck_id
            );
        }
    }

    async fn invoke(&self, ctx: &HubContext, invocation: Invocation) -> Result<()> {
        match invocation.target.as_str() {
            methods::SEND_GEOLOCATION_DATA => {
                let Some(payload) = invocation.arguments.into_iter().next() else {
                    log::warn!("[Server] SendGeolocationData without payload");
                    return Ok(());
                };
                match serde_json::from_value::<GeolocationUpdate>(payload) {
                    Ok(update) => {
                        log::debug!(
                            "[Server] Location from truck {} (tenant {}): {}, {}",
                            update.truck_id,
                            update.tenant_id,
                            update.current_location.latitude,
                            update.current_location.longitude
                        );
                        self.locations()
                            .insert(ctx.connection_id().to_string(), Some(update));
                    }
                    Err(e) => log::warn!("[Server] Invalid geolocation payload: {e}"),
                }
                Ok(())
            }
            methods::REGISTER_TENANT => {
                ctx.add_to_group(string_arg(&invocation, 0)?);
                Ok(())
            }
            methods::UNREGISTER_TENANT => {
                ctx.remove_from_group(string_arg(&invocation, 0)?);
                Ok(())
            }
            other => bail!("unknown method {other}"),
        }
    }
}
