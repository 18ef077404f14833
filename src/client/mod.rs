//! Hub client abstraction.
//!
//! Domain services depend on [`HubClient`] rather than on the concrete
//! transport, so a different implementation (a platform SDK, a test
//! double) can be chosen when the services are composed.
//!
//! ```text
//! TrackingService ──┐
//!                   ├──► Arc<dyn HubClient> ──► HubConnection (transport)
//! MessagingService ─┘
//! ```

// Rust guideline compliant 2026-02

mod registry;
#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use serde_json::Value;

use crate::transport::{ConnectionState, HubError};

pub use registry::{Handler, HandlerRegistry};

/// Minimal hub surface used by the domain services.
#[async_trait]
pub trait HubClient: Send + Sync + std::fmt::Debug {
    /// Register (or replace) the handler for a server → client method.
    fn on(&self, method: &str, handler: Handler);

    /// Send an invocation that carries an id; returns the id.
    ///
    /// Queued when not connected.
    fn invoke(&self, method: &str, arguments: Vec<Value>) -> Result<String, HubError>;

    /// Send a fire-and-forget invocation. Queued when not connected.
    fn send(&self, method: &str, arguments: Vec<Value>) -> Result<(), HubError>;

    /// Negotiate, open the socket and wait for the handshake.
    ///
    /// # Errors
    ///
    /// Returns the negotiate/handshake failure or a connect timeout.
    async fn connect(&self) -> Result<(), HubError>;

    /// Close the session. Safe from any state.
    async fn disconnect(&self);

    /// Current lifecycle state.
    fn state(&self) -> ConnectionState;

    /// Whether the handshake has completed and the socket is open.
    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }
}
