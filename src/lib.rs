//! Fleet Hub - real-time hub protocol engine for fleet tracking and chat.
//!
//! This crate implements a SignalR-compatible JSON hub protocol from both
//! roles: a client that keeps one persistent socket per hub, and a server
//! that routes invocations to hub implementations.
//!
//! # Architecture
//!
//! ```text
//! protocol ──► ws ──► transport ──► client ──┬──► tracking  (driver device → live-tracking hub)
//!                                            └──► messaging (chat ⇄ chat hub)
//! server (axum) ── same frames, opposite role
//! ```
//!
//! # Modules
//!
//! - [`protocol`] - frame codec and invocation payloads
//! - [`ws`] - WebSocket client wrapper
//! - [`transport`] - [`HubConnection`]: negotiate, handshake, read loop, send queue
//! - [`client`] - [`HubClient`] trait and handler registry
//! - [`tracking`] - location publisher
//! - [`messaging`] - chat service, conversation cache and timeline
//! - [`server`] - hub server, live tracking and messaging hubs
//! - [`config`] / [`credentials`] - configuration and session identity

// Rust guideline compliant 2026-02

pub mod client;
pub mod config;
pub mod constants;
pub mod credentials;
pub mod messaging;
pub mod protocol;
pub mod server;
pub mod tracking;
pub mod transport;
pub mod ws;

// Re-export commonly used types
pub use client::HubClient;
pub use config::Config;
pub use credentials::{Credentials, CredentialsProvider, SessionCredentials};
pub use messaging::{ChatTimeline, ConversationState, MessagingService};
pub use server::{HubServer, LiveTrackingHub, MessagingHub};
pub use tracking::{LocationTracker, TrackingService};
pub use transport::{ConnectionState, HubConnection, HubError};
