//! Server-side hub trait and per-call context.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;

use super::registry::ConnectionRegistry;
use crate::protocol::{Frame, Invocation};

/// A hub served under `/hubs/{name}`.
///
/// Implementations must tolerate `on_disconnected` for a connection whose
/// `on_connected` ran but which never invoked anything.
#[async_trait]
pub trait Hub: Send + Sync + std::fmt::Debug {
    /// Connections of this hub; the server adds and removes entries.
    fn connections(&self) -> &Arc<ConnectionRegistry>;

    /// A client finished the handshake.
    async fn on_connected(&self, _ctx: &HubContext) {}

    /// The client's socket is gone. Runs exactly once per connection.
    async fn on_disconnected(&self, _ctx: &HubContext) {}

    /// A client invoked a hub method.
    ///
    /// # Errors
    ///
    /// Unknown methods and malformed arguments. The server logs the error
    /// and keeps the connection open.
    async fn invoke(&self, ctx: &HubContext, invocation: Invocation) -> Result<()>;
}

/// Caller identity plus access to the hub's connections.
#[derive(Debug, Clone)]
pub struct HubContext {
    connection_id: String,
    tenant_id: Option<String>,
    connections: Arc<ConnectionRegistry>,
}

impl HubContext {
    /// Context for one connection.
    pub fn new(
        connection_id: impl Into<String>,
        tenant_id: Option<String>,
        connections: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            tenant_id,
            connections,
        }
    }

    /// Id issued by negotiate.
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Tenant sent in the negotiate `X-Tenant` header.
    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    /// Join `group`.
    pub fn add_to_group(&self, group: &str) {
        self.connections.add_to_group(group, &self.connection_id);
    }

    /// Leave `group`.
    pub fn remove_from_group(&self, group: &str) {
        self.connections.remove_from_group(group, &self.connection_id);
    }

    /// Invoke `target` on every member of `group`.
    pub fn send_to_group(&self, group: &str, target: &str, arguments: Vec<Value>) -> usize {
        self.connections
            .send_to_group(group, &invocation(target, arguments), None)
    }

    /// Invoke `target` on every member of `group` except the caller.
    pub fn send_to_others_in_group(
        &self,
        group: &str,
        target: &str,
        arguments: Vec<Value>,
    ) -> usize {
        self.connections.send_to_group(
            group,
            &invocation(target, arguments),
            Some(&self.connection_id),
        )
    }

    /// Invoke `target` on the caller only.
    pub fn send_to_caller(&self, target: &str, arguments: Vec<Value>) -> bool {
        self.connections
            .send_to_connection(&self.connection_id, &invocation(target, arguments))
    }
}

fn invocation(target: &str, arguments: Vec<Value>) -> Frame {
    Frame::Invocation(Invocation::fire_and_forget(target, arguments))
}

/// Positional string argument.
pub(crate) fn string_arg<'a>(invocation: &'a Invocation, index: usize) -> Result<&'a str> {
    invocation
        .arguments
        .get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| {
            anyhow!(
                "{}: argument {index} must be a string",
                invocation.target
            )
        })
}

/// Positional boolean argument.
pub(crate) fn bool_arg(invocation: &Invocation, index: usize) -> Result<bool> {
    invocation
        .arguments
        .get(index)
        .and_then(Value::as_bool)
        .ok_or_else(|| anyhow!("{}: argument {index} must be a boolean", invocation.target))
}
