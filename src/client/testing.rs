//! In-memory [`HubClient`] for service unit tests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use super::{Handler, HandlerRegistry, HubClient};
use crate::transport::{ConnectionState, HubError};

/// One recorded outbound invocation.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SentInvocation {
    pub method: String,
    pub arguments: Vec<Value>,
    pub invocation_id: Option<String>,
}

/// Hub client that records sends and lets tests push server invocations.
#[derive(Debug, Default)]
pub(crate) struct RecordingHub {
    state: Mutex<ConnectionState>,
    sent: Mutex<Vec<SentInvocation>>,
    handlers: HandlerRegistry,
    next_id: AtomicU64,
    pub fail_connect: AtomicBool,
}

impl RecordingHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a server → client invocation.
    pub fn push(&self, method: &str, arguments: &[Value]) -> bool {
        self.handlers.dispatch(method, arguments)
    }

    pub fn sent(&self) -> Vec<SentInvocation> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_methods(&self) -> Vec<String> {
        self.sent().into_iter().map(|s| s.method).collect()
    }

    pub fn registered(&self) -> Vec<String> {
        self.handlers.methods()
    }

    /// Simulate socket loss without going through `disconnect()`.
    pub fn drop_connection(&self) {
        *self.state.lock().unwrap() = ConnectionState::Disconnected;
    }
}

#[async_trait]
impl HubClient for RecordingHub {
    fn on(&self, method: &str, handler: Handler) {
        self.handlers.register(method, handler);
    }

    fn invoke(&self, method: &str, arguments: Vec<Value>) -> Result<String, HubError> {
        let id = (self.next_id.fetch_add(1, Ordering::SeqCst) + 1).to_string();
        self.sent.lock().unwrap().push(SentInvocation {
            method: method.to_string(),
            arguments,
            invocation_id: Some(id.clone()),
        });
        Ok(id)
    }

    fn send(&self, method: &str, arguments: Vec<Value>) -> Result<(), HubError> {
        self.sent.lock().unwrap().push(SentInvocation {
            method: method.to_string(),
            arguments,
            invocation_id: None,
        });
        Ok(())
    }

    async fn connect(&self) -> Result<(), HubError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            *self.state.lock().unwrap() = ConnectionState::Failed;
            return Err(HubError::Negotiate("HTTP 401 Unauthorized".into()));
        }
        *self.state.lock().unwrap() = ConnectionState::Connected;
        Ok(())
    }

    async fn disconnect(&self) {
        *self.state.lock().unwrap() = ConnectionState::Disconnected;
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }
}
