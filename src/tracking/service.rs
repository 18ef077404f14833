//! Tracking hub facade.

use std::sync::Arc;

use tokio::sync::{watch, Mutex};

use crate::client::HubClient;
use crate::protocol::{methods, GeolocationUpdate};
use crate::transport::HubError;

/// Connection state as seen by tracking consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackingState {
    /// Not connected; location updates are dropped.
    #[default]
    Disconnected,
    /// `connect()` in progress.
    Connecting,
    /// Updates are being sent.
    Connected,
}

/// Publishes truck positions to the live tracking hub.
#[derive(Debug)]
pub struct TrackingService {
    hub: Arc<dyn HubClient>,
    state: watch::Sender<TrackingState>,
    /// Serializes `connect()` between the tracker pump and lifecycle calls.
    connecting: Mutex<()>,
}

impl TrackingService {
    /// Wrap a hub client pointed at the live tracking hub.
    pub fn new(hub: Arc<dyn HubClient>) -> Self {
        let (state, _) = watch::channel(TrackingState::Disconnected);
        Self {
            hub,
            state,
            connecting: Mutex::new(()),
        }
    }

    /// Current state. A socket the hub has lost reads as `Disconnected`.
    pub fn state(&self) -> TrackingState {
        self.observe_hub();
        *self.state.borrow()
    }

    // Socket loss happens inside the hub client, so fold it in on read.
    fn observe_hub(&self) {
        let lost = self.state.send_if_modified(|state| {
            if *state == TrackingState::Connected && !self.hub.is_connected() {
                *state = TrackingState::Disconnected;
                true
            } else {
                false
            }
        });
        if lost {
            log::warn!("[Tracking] Hub connection lost");
        }
    }

    /// Observe state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<TrackingState> {
        self.state.subscribe()
    }

    /// Whether updates will currently be sent.
    pub fn is_connected(&self) -> bool {
        self.state() == TrackingState::Connected && self.hub.is_connected()
    }

    /// Connect to the hub. No-op when already connected.
    ///
    /// # Errors
    ///
    /// Propagates the hub connect error; state returns to `Disconnected`.
    pub async fn connect(&self) -> Result<(), HubError> {
        let _guard = self.connecting.lock().await;
        if self.is_connected() {
            log::debug!("[Tracking] Already connected");
            return Ok(());
        }

        self.state.send_replace(TrackingState::Connecting);
        match self.hub.connect().await {
            Ok(()) => {
                self.state.send_replace(TrackingState::Connected);
                log::info!("[Tracking] Connected");
                Ok(())
            }
            Err(e) => {
                self.state.send_replace(TrackingState::Disconnected);
                log::error!("[Tracking] Connection failed: {e}");
                Err(e)
            }
        }
    }

    /// Disconnect from the hub.
    pub async fn disconnect(&self) {
        self.hub.disconnect().await;
        self.state.send_replace(TrackingState::Disconnected);
        log::info!("[Tracking] Disconnected");
    }

    /// Send `SendGeolocationData`. Dropped with a warning when not connected.
    ///
    /// Returns `true` when the update was handed to the hub.
    pub fn send_location_update(&self, update: &GeolocationUpdate) -> bool {
        if !self.is_connected() {
            log::warn!("[Tracking] Cannot send location - not connected");
            return false;
        }

        let payload = match serde_json::to_value(update) {
            Ok(payload) => payload,
            Err(e) => {
                log::error!("[Tracking] Failed to encode location: {e}");
                return false;
            }
        };

        match self.hub.send(methods::SEND_GEOLOCATION_DATA, vec![payload]) {
            Ok(()) => {
                log::debug!(
                    "[Tracking] Location sent: {}, {}",
                    update.current_location.latitude,
                    update.current_location.longitude
                );
                true
            }
            Err(e) => {
                log::error!("[Tracking] Failed to send location: {e}");
                false
            }
        }
    }
}
