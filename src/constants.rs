//! Application-wide constants for fleet-hub.
//!
//! Timeouts, polling windows and thresholds live here so the transport,
//! the services and the server agree on them.
//!
//! # Categories
//!
//! - **Timeouts**: HTTP and socket shutdown limits
//! - **Connect polling**: how long `connect()` waits for the handshake
//! - **Server**: keep-alive cadence and route layout
//! - **Tracking**: location filtering

use std::time::Duration;

// ============================================================================
// Timeouts
// ============================================================================

/// HTTP client request timeout for negotiate and geocoding calls.
///
/// Negotiate is a single small POST; anything slower than this is treated
/// as a failed connect attempt.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How long `disconnect()` waits for the session task to close the socket.
pub const SESSION_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Connect polling
// ============================================================================

/// Interval between state checks while `connect()` waits for the handshake.
pub const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Number of state checks before `connect()` gives up (≈5 s total).
pub const CONNECT_POLL_ATTEMPTS: u32 = 50;

// ============================================================================
// Server
// ============================================================================

/// Keep-alive ping cadence on server-side connections.
///
/// Matches the default keep-alive of the hub protocol so idle proxies do
/// not drop otherwise quiet tracking sockets.
pub const SERVER_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// How long a server connection may take to send its handshake request.
pub const SERVER_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// How long a negotiated connection token stays claimable by an upgrade.
pub const NEGOTIATE_TOKEN_TTL: Duration = Duration::from_secs(30);

/// Route prefix under which hubs are mounted.
pub const HUB_ROUTE_PREFIX: &str = "/hubs";

/// Hub name of the live tracking hub.
pub const LIVE_TRACKING_HUB: &str = "live-tracking";

/// Hub name of the messaging hub.
pub const MESSAGING_HUB: &str = "chat";

/// Default bind address for `fleet-hub serve`.
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:7000";

// ============================================================================
// Tracking
// ============================================================================

/// Minimum displacement between published location fixes, in meters.
pub const DISTANCE_FILTER_METERS: f64 = 50.0;

/// Minimum gap between tracker reconnect attempts after a failure.
pub const TRACKING_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Mean Earth radius used by the haversine distance, in meters.
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Message ids remembered per conversation for de-duplication.
pub const SEEN_MESSAGES_PER_CONVERSATION: usize = 512;

/// Capacity of the broadcast channels that fan out hub events.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;
