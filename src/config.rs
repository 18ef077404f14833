//! Configuration loading and persistence.
//!
//! `config.json` in the config directory holds endpoints and the driver
//! profile. The session identity is loaded alongside it from
//! `credentials.json` and is never written back into `config.json`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::{fs, path::PathBuf};

use crate::constants::{
    DEFAULT_BIND_ADDR, DISTANCE_FILTER_METERS, HUB_ROUTE_PREFIX, LIVE_TRACKING_HUB, MESSAGING_HUB,
};
use crate::credentials::Credentials;
use crate::tracking::{DriverProfile, NominatimGeocoder, NoopGeocoder, ReverseGeocoder};

const CONFIG_FILE: &str = "config.json";

/// Configuration for the fleet-hub binary.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Base URL of the hub server, without the `/hubs` prefix.
    pub server_url: String,
    /// Address `fleet-hub serve` binds to.
    pub bind_addr: String,
    /// Nominatim-compatible reverse geocoder; empty disables geocoding.
    pub geocoder_url: String,
    /// Minimum displacement between published fixes, in meters.
    pub distance_filter_meters: f64,
    /// Truck assigned to this device.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truck_id: Option<String>,
    /// Display number of the truck.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truck_number: Option<String>,
    /// Display name of the driver(s).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drivers_name: Option<String>,
    /// Session identity - NOT serialized (lives in `credentials.json`).
    #[serde(skip)]
    pub credentials: Credentials,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: format!("http://{DEFAULT_BIND_ADDR}"),
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            geocoder_url: "https://nominatim.openstreetmap.org".to_string(),
            distance_filter_meters: DISTANCE_FILTER_METERS,
            truck_id: None,
            truck_number: None,
            drivers_name: None,
            credentials: Credentials::default(),
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `FLEET_CONFIG_DIR` overrides the platform config dir
    /// (`~/.config/fleet-hub` on Linux).
    pub fn config_dir() -> Result<PathBuf> {
        let dir = match std::env::var("FLEET_CONFIG_DIR") {
            Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => dirs::config_dir()
                .context("Could not determine config directory")?
                .join("fleet-hub"),
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration and credentials, with environment overrides.
    pub fn load() -> Result<Self> {
        let dir = Self::config_dir()?;
        let mut config = Self::load_from(&dir).unwrap_or_else(|e| {
            log::warn!("Using default config: {e:#}");
            Self::default()
        });
        config.apply_env_overrides();
        config.credentials = Credentials::load()?;
        Ok(config)
    }

    /// Read `config.json` from `dir`. A missing file yields the defaults.
    pub fn load_from(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Malformed {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(server_url) = std::env::var("FLEET_SERVER_URL") {
            self.server_url = server_url;
        }
        if let Ok(bind_addr) = std::env::var("FLEET_BIND_ADDR") {
            self.bind_addr = bind_addr;
        }
        if let Ok(geocoder_url) = std::env::var("FLEET_GEOCODER_URL") {
            self.geocoder_url = geocoder_url;
        }
        if let Ok(truck_id) = std::env::var("FLEET_TRUCK_ID") {
            self.truck_id = Some(truck_id);
        }
        if let Ok(meters) = std::env::var("FLEET_DISTANCE_FILTER_METERS") {
            if let Ok(meters) = meters.parse::<f64>() {
                self.distance_filter_meters = meters;
            }
        }
    }

    /// Persists the current configuration to disk.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_dir()?)
    }

    /// Write `config.json` into `dir` (credentials excluded).
    pub fn save_to(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let path = dir.join(CONFIG_FILE);
        fs::write(&path, serde_json::to_string_pretty(self)?)?;

        #[cfg(unix)]
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// URL of a hub served by `server_url`.
    pub fn hub_url(&self, hub: &str) -> String {
        format!(
            "{}{HUB_ROUTE_PREFIX}/{hub}",
            self.server_url.trim_end_matches('/')
        )
    }

    /// URL of the live tracking hub.
    pub fn tracking_hub_url(&self) -> String {
        self.hub_url(LIVE_TRACKING_HUB)
    }

    /// URL of the chat hub.
    pub fn messaging_hub_url(&self) -> String {
        self.hub_url(MESSAGING_HUB)
    }

    /// Profile attached to every published position.
    pub fn driver_profile(&self) -> DriverProfile {
        DriverProfile {
            truck_id: self.truck_id.clone().unwrap_or_default(),
            truck_number: self.truck_number.clone(),
            drivers_name: self.drivers_name.clone(),
        }
    }

    /// Reverse geocoder for the configured endpoint.
    pub fn geocoder(&self) -> Result<Arc<dyn ReverseGeocoder>> {
        if self.geocoder_url.is_empty() {
            return Ok(Arc::new(NoopGeocoder));
        }
        Ok(Arc::new(NominatimGeocoder::new(self.geocoder_url.clone())?))
    }
}
