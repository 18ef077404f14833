//! Live truck tracking (client side).
//!
//! [`TrackingService`] owns the connection state toward the live tracking
//! hub; [`LocationTracker`] turns device fixes into `SendGeolocationData`
//! invocations through it.

// Rust guideline compliant 2026-02

pub mod filter;
pub mod geocode;
pub mod service;
pub mod tracker;

pub use filter::{haversine_meters, DistanceFilter};
pub use geocode::{NominatimGeocoder, NoopGeocoder, ReverseGeocoder};
pub use service::{TrackingService, TrackingState};
pub use tracker::{
    ChannelLocationSource, DriverProfile, LocationFix, LocationSource, LocationTracker,
    PermissionStatus, TrackerStatus,
};
