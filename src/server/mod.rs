//! Server-side hubs.
//!
//! The server speaks the same frame protocol as [`crate::transport`] from
//! the opposite role: it answers negotiate, accepts the handshake, pings
//! idle clients and routes invocations to a [`Hub`].
//!
//! # Modules
//!
//! - [`endpoint`] - axum routes and the [`HubServer`] host
//! - [`hub`] - [`Hub`] trait and per-call [`HubContext`]
//! - [`registry`] - connections and groups of one hub
//! - [`tracking_hub`] - last known truck position per connection
//! - [`messaging_hub`] - chat presence and message fan-out
//! - [`store`] - persistence of final positions

// Rust guideline compliant 2026-02

pub mod endpoint;
pub mod hub;
pub mod messaging_hub;
pub mod registry;
mod session;
pub mod store;
pub mod tracking_hub;

pub use endpoint::{HubServer, HubServerBuilder};
pub use hub::{Hub, HubContext};
pub use messaging_hub::MessagingHub;
pub use registry::ConnectionRegistry;
pub use store::{GeolocationStore, InMemoryGeolocationStore, LoggingGeolocationStore};
pub use tracking_hub::LiveTrackingHub;
