//! Client transport session for the JSON hub protocol.
//!
//! # Architecture
//!
//! ```text
//! HubConnection (long-lived, Arc-shared)
//!     │
//!     ├── connect()  ── negotiate (HTTP POST) ── spawn session task ── poll state
//!     │
//!     ├── send()/invoke() ──► Outbox ──┬── pending queue (no live socket)
//!     │                                └── live writer channel ──► session task
//!     │
//!     └── session task (one per connect attempt)
//!             ├── WsWriter: handshake, flushed outbox, live sends, ping echo
//!             └── WsReader: handshake response, then frame dispatch to handlers
//! ```
//!
//! # State machine
//!
//! ```text
//! Disconnected ─► Negotiating ─► Handshaking ─► Connected ─► Disconnected
//!                      │               │
//!                      └──── Failed ◄──┘
//! ```
//!
//! All socket writes happen on the session task. The state flag is an
//! atomic so guard checks from arbitrary tasks are lock-free.

// Rust guideline compliant 2026-02

mod connection;
pub mod negotiate;
mod outbox;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

pub use connection::{HubConnection, HubConnectionBuilder};
pub use negotiate::NegotiateResponse;
pub use outbox::Outbox;

/// Lifecycle state of a hub connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ConnectionState {
    /// No session; sends are queued.
    #[default]
    Disconnected = 0,
    /// Negotiate request in flight.
    Negotiating = 1,
    /// Socket opening or handshake in progress.
    Handshaking = 2,
    /// Handshake accepted; frames flow both ways.
    Connected = 3,
    /// Negotiate or handshake failed. A new `connect()` may be attempted.
    Failed = 4,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Negotiating,
            2 => Self::Handshaking,
            3 => Self::Connected,
            4 => Self::Failed,
            _ => Self::Disconnected,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Negotiating => "negotiating",
            Self::Handshaking => "handshaking",
            Self::Connected => "connected",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Connection state readable from any task without locking.
#[derive(Debug, Default)]
pub struct SharedConnectionState {
    state: AtomicU8,
}

impl SharedConnectionState {
    /// Create new shared state (Disconnected).
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Current state.
    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Replace the state.
    pub fn set(&self, new_state: ConnectionState) {
        self.state.store(new_state as u8, Ordering::Release);
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.get() == ConnectionState::Connected
    }
}

/// Errors surfaced by the transport session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    /// Negotiate request failed (network, non-2xx, bad body, missing token).
    Negotiate(String),
    /// Server rejected the handshake or the first frame was unusable.
    Handshake(String),
    /// Socket could not be opened or failed mid-session.
    Transport(String),
    /// An invocation could not be encoded; nothing was sent or queued.
    Encode(String),
    /// Connected state not reached within the polling window.
    ConnectTimeout,
    /// Session ended before it became usable.
    Closed(Option<String>),
}

impl std::fmt::Display for HubError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Negotiate(msg) => write!(f, "Negotiate failed: {msg}"),
            Self::Handshake(msg) => write!(f, "Handshake failed: {msg}"),
            Self::Transport(msg) => write!(f, "Transport error: {msg}"),
            Self::Encode(msg) => write!(f, "Failed to encode invocation: {msg}"),
            Self::ConnectTimeout => write!(f, "Timed out waiting for hub connection"),
            Self::Closed(Some(reason)) => write!(f, "Connection closed: {reason}"),
            Self::Closed(None) => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for HubError {}
