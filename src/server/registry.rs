//! Live connections of one hub and their group memberships.

use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};

use tokio::sync::mpsc::UnboundedSender;

use crate::protocol::Frame;

#[derive(Debug)]
struct ClientHandle {
    tenant_id: Option<String>,
    writer: UnboundedSender<String>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    connections: HashMap<String, ClientHandle>,
    groups: HashMap<String, HashSet<String>>,
}

/// Writers of every connected client plus named groups.
///
/// Each writer feeds the connection's single writer task, so frames sent
/// to one connection keep their order.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    inner: RwLock<RegistryInner>,
}

impl ConnectionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a connection. Replaces any previous writer with the same id.
    pub fn add(
        &self,
        connection_id: &str,
        tenant_id: Option<String>,
        writer: UnboundedSender<String>,
    ) {
        self.write()
            .connections
            .insert(connection_id.to_string(), ClientHandle { tenant_id, writer });
    }

    /// Drop a connection and all of its group memberships.
    pub fn remove(&self, connection_id: &str) {
        let mut inner = self.write();
        inner.connections.remove(connection_id);
        inner.groups.retain(|_, members| {
            members.remove(connection_id);
            !members.is_empty()
        });
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.read().connections.len()
    }

    /// Whether no client is connected.
    pub fn is_empty(&self) -> bool {
        self.read().connections.is_empty()
    }

    /// Tenant announced at negotiate time.
    pub fn tenant_of(&self, connection_id: &str) -> Option<String> {
        self.read()
            .connections
            .get(connection_id)
            .and_then(|c| c.tenant_id.clone())
    }

    /// Add a connection to a group. Unknown connections are ignored.
    pub fn add_to_group(&self, group: &str, connection_id: &str) -> bool {
        let mut inner = self.write();
        if !inner.connections.contains_key(connection_id) {
            return false;
        }
        inner
            .groups
            .entry(group.to_string())
            .or_default()
            .insert(connection_id.to_string());
        true
    }

    /// Remove a connection from a group; empty groups disappear.
    pub fn remove_from_group(&self, group: &str, connection_id: &str) {
        let mut inner = self.write();
        if let Some(members) = inner.groups.get_mut(group) {
            members.remove(connection_id);
            if members.is_empty() {
                inner.groups.remove(group);
            }
        }
    }

    /// Sorted member ids of a group.
    pub fn group_members(&self, group: &str) -> Vec<String> {
        let mut members: Vec<String> = self
            .read()
            .groups
            .get(group)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    /// Queue a frame for one connection. `false` if it is gone.
    pub fn send_to_connection(&self, connection_id: &str, frame: &Frame) -> bool {
        let Some(encoded) = encode_or_log(frame) else {
            return false;
        };
        let inner = self.read();
        match inner.connections.get(connection_id) {
            Some(client) => client.writer.send(encoded).is_ok(),
            None => false,
        }
    }

    /// Queue a frame for every member of a group, optionally skipping one
    /// connection. Returns how many writers accepted it.
    pub fn send_to_group(&self, group: &str, frame: &Frame, except: Option<&str>) -> usize {
        let inner = self.read();
        let Some(members) = inner.groups.get(group) else {
            return 0;
        };
        let Some(encoded) = encode_or_log(frame) else {
            return 0;
        };
        members
            .iter()
            .filter(|id| Some(id.as_str()) != except)
            .filter_map(|id| inner.connections.get(id))
            .filter(|client| client.writer.send(encoded.clone()).is_ok())
            .count()
    }
}

fn encode_or_log(frame: &Frame) -> Option<String> {
    frame
        .encode()
        .map_err(|e| log::error!("[Server] Dropping unencodable frame: {e:#}"))
        .ok()
}
