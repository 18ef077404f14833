//! HTTP surface of the hubs: negotiate and WebSocket upgrade.
//!
//! ```text
//! POST /hubs/{hub}/negotiate?negotiateVersion=1   ──► { connectionId, connectionToken, ... }
//! GET  /hubs/{hub}?id={connectionToken}  (upgrade) ──► session::run
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::hub::Hub;
use super::session::{self, PendingConnection, SessionSettings};
use crate::constants::{
    HUB_ROUTE_PREFIX, NEGOTIATE_TOKEN_TTL, SERVER_HANDSHAKE_TIMEOUT, SERVER_KEEPALIVE_INTERVAL,
};
use crate::transport::negotiate::TENANT_HEADER;

/// Builder for [`HubServer`].
#[derive(Debug)]
pub struct HubServerBuilder {
    hubs: HashMap<String, Arc<dyn Hub>>,
    keepalive_interval: Duration,
    handshake_timeout: Duration,
    token_ttl: Duration,
}

impl Default for HubServerBuilder {
    fn default() -> Self {
        Self {
            hubs: HashMap::new(),
            keepalive_interval: SERVER_KEEPALIVE_INTERVAL,
            handshake_timeout: SERVER_HANDSHAKE_TIMEOUT,
            token_ttl: NEGOTIATE_TOKEN_TTL,
        }
    }
}

impl HubServerBuilder {
    /// Serve `hub` under `/hubs/{name}`.
    #[must_use]
    pub fn hub(mut self, name: impl Into<String>, hub: Arc<dyn Hub>) -> Self {
        self.hubs.insert(name.into(), hub);
        self
    }

    /// Interval between server Ping frames.
    #[must_use]
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// How long a fresh socket may take to send its handshake.
    #[must_use]
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// How long a negotiated token may wait for its upgrade.
    #[must_use]
    pub fn token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    /// Finish configuration.
    pub fn build(self) -> Arc<HubServer> {
        Arc::new(HubServer {
            hubs: self.hubs,
            pending: Mutex::new(HashMap::new()),
            token_ttl: self.token_ttl,
            settings: SessionSettings {
                keepalive_interval: self.keepalive_interval,
                handshake_timeout: self.handshake_timeout,
            },
            shutdown: CancellationToken::new(),
        })
    }
}

/// Hosts a set of hubs over HTTP + WebSocket.
#[derive(Debug)]
pub struct HubServer {
    hubs: HashMap<String, Arc<dyn Hub>>,
    /// Negotiated but not yet claimed, keyed by connection token.
    pending: Mutex<HashMap<String, PendingConnection>>,
    token_ttl: Duration,
    settings: SessionSettings,
    shutdown: CancellationToken,
}

#[derive(Debug, Deserialize)]
struct ConnectQuery {
    id: Option<String>,
}

impl HubServer {
    /// Start configuring a server.
    pub fn builder() -> HubServerBuilder {
        HubServerBuilder::default()
    }

    /// Names of the hosted hubs, sorted.
    pub fn hub_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.hubs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Negotiated tokens not yet used by a socket and not yet expired.
    pub fn pending_connections(&self) -> usize {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        self.prune_expired(&mut pending);
        pending.len()
    }

    /// Token cancelled by [`HubServer::shutdown`].
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop accepting requests and close every open socket.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Axum router with both endpoints.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route(
                &format!("{HUB_ROUTE_PREFIX}/{{hub}}/negotiate"),
                post(negotiate_handler),
            )
            .route(&format!("{HUB_ROUTE_PREFIX}/{{hub}}"), get(connect_handler))
            .with_state(Arc::clone(self))
    }

    /// Bind `addr` and serve until [`HubServer::shutdown`].
    pub async fn bind(self: Arc<Self>, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until [`HubServer::shutdown`].
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let local: SocketAddr = listener.local_addr()?;
        log::info!(
            "[Server] Listening on http://{local} (hubs: {})",
            self.hub_names().join(", ")
        );

        let shutdown = self.shutdown.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .context("Hub server failed")?;

        log::info!("[Server] Stopped");
        Ok(())
    }

    fn issue(&self, hub: &str, tenant_id: Option<String>) -> (String, String) {
        let connection_id = uuid::Uuid::new_v4().to_string();
        let connection_token = uuid::Uuid::new_v4().to_string();
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        self.prune_expired(&mut pending);
        pending.insert(
            connection_token.clone(),
            PendingConnection {
                hub: hub.to_string(),
                connection_id: connection_id.clone(),
                tenant_id,
                issued_at: Instant::now(),
            },
        );
        (connection_id, connection_token)
    }

    fn claim(&self, hub: &str, token: &str) -> Option<PendingConnection> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        self.prune_expired(&mut pending);
        if pending.get(token)?.hub != hub {
            return None;
        }
        pending.remove(token)
    }

    fn prune_expired(&self, pending: &mut HashMap<String, PendingConnection>) {
        let before = pending.len();
        pending.retain(|_, entry| entry.issued_at.elapsed() < self.token_ttl);
        let expired = before - pending.len();
        if expired > 0 {
            log::debug!("[Server] Dropped {expired} unclaimed connection token(s)");
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

async fn negotiate_handler(
    State(server): State<Arc<HubServer>>,
    Path(hub): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !server.hubs.contains_key(&hub) {
        return StatusCode::NOT_FOUND.into_response();
    }
    if bearer_token(&headers).is_none() {
        log::warn!("[Server] Negotiate for {hub} without bearer token");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let tenant_id = headers
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string);
    let (connection_id, connection_token) = server.issue(&hub, tenant_id);
    log::debug!("[Server] Negotiated {connection_id} on {hub}");

    Json(json!({
        "connectionId": connection_id,
        "connectionToken": connection_token,
        "negotiateVersion": 1,
        "availableTransports": [
            { "transport": "WebSockets", "transferFormats": ["Text"] }
        ]
    }))
    .into_response()
}

async fn connect_handler(
    State(server): State<Arc<HubServer>>,
    Path(hub_name): Path<String>,
    Query(query): Query<ConnectQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(hub) = server.hubs.get(&hub_name).cloned() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(pending) = query
        .id
        .as_deref()
        .and_then(|token| server.claim(&hub_name, token))
    else {
        log::warn!("[Server] Upgrade for {hub_name} with unknown connection token");
        return StatusCode::NOT_FOUND.into_response();
    };

    let settings = server.settings;
    let shutdown = server.shutdown.clone();
    ws.on_upgrade(move |socket| session::run(socket, hub, pending, settings, shutdown))
}
