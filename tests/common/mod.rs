//! Shared helpers for integration tests.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use fleet_hub::server::{HubServer, InMemoryGeolocationStore, LiveTrackingHub, MessagingHub};
use fleet_hub::HubConnection;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Poll interval used by test connections.
pub const FAST_POLL: Duration = Duration::from_millis(20);

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

/// A real hub server on an ephemeral port.
pub struct TestServer {
    pub base_url: String,
    pub server: Arc<HubServer>,
    pub messaging: Arc<MessagingHub>,
    pub tracking: Arc<LiveTrackingHub>,
    pub store: Arc<InMemoryGeolocationStore>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(Duration::from_secs(15)).await
    }

    pub async fn start_with(keepalive: Duration) -> Self {
        let store = Arc::new(InMemoryGeolocationStore::new());
        let messaging = Arc::new(MessagingHub::new());
        let tracking = Arc::new(LiveTrackingHub::new(store.clone()));
        let server = HubServer::builder()
            .hub("chat", messaging.clone())
            .hub("live-tracking", tracking.clone())
            .keepalive_interval(keepalive)
            .build();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(Arc::clone(&server).serve(listener));

        Self {
            base_url,
            server,
            messaging,
            tracking,
            store,
        }
    }

    pub fn hub_url(&self, hub: &str) -> String {
        format!("{}/hubs/{hub}", self.base_url)
    }

    pub fn connection(&self, hub: &str, tenant: &str) -> HubConnection {
        HubConnection::builder(self.hub_url(hub))
            .access_token("test-token")
            .tenant_id(tenant)
            .poll_interval(FAST_POLL)
            .build()
            .unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.shutdown();
    }
}

/// How the scripted hub answers the handshake.
#[derive(Debug, Clone)]
pub enum Handshake {
    Accept,
    Reject(String),
    /// Never answer.
    Silent,
}

#[derive(Clone)]
struct ScriptState {
    handshake: Handshake,
    received: UnboundedSender<String>,
    push: Arc<Mutex<Option<UnboundedReceiver<String>>>>,
}

/// Single-connection hub that records every text message it receives and
/// writes whatever the test pushes.
pub struct ScriptedHub {
    pub hub_url: String,
    pub received: UnboundedReceiver<String>,
    pub push: UnboundedSender<String>,
}

impl ScriptedHub {
    pub async fn start(handshake: Handshake) -> Self {
        let (received_tx, received) = mpsc::unbounded_channel();
        let (push, push_rx) = mpsc::unbounded_channel();
        let state = ScriptState {
            handshake,
            received: received_tx,
            push: Arc::new(Mutex::new(Some(push_rx))),
        };

        let app = Router::new()
            .route("/hubs/test/negotiate", post(scripted_negotiate))
            .route("/hubs/test", get(scripted_upgrade))
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let hub_url = format!("http://{}/hubs/test", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            hub_url,
            received,
            push,
        }
    }

    pub fn connection(&self) -> HubConnection {
        HubConnection::builder(&self.hub_url)
            .access_token("test-token")
            .tenant_id("tenant-1")
            .poll_interval(FAST_POLL)
            .build()
            .unwrap()
    }

    /// Next text message from the client.
    pub async fn next_message(&mut self) -> String {
        within(self.received.recv()).await.expect("scripted hub closed")
    }
}

async fn scripted_negotiate() -> impl IntoResponse {
    Json(json!({
        "connectionId": "scripted-connection",
        "connectionToken": "scripted-token",
        "negotiateVersion": 1
    }))
}

async fn scripted_upgrade(
    State(state): State<ScriptState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_script(socket, state))
}

async fn run_script(socket: WebSocket, state: ScriptState) {
    let (mut sink, mut stream) = socket.split();

    let Some(Ok(Message::Text(handshake))) = stream.next().await else {
        return;
    };
    let _ = state.received.send(handshake.as_str().to_string());

    match state.handshake {
        Handshake::Accept => {
            let _ = sink.send(Message::Text("{}\u{1e}".into())).await;
        }
        Handshake::Reject(error) => {
            let response = format!("{}\u{1e}", json!({ "error": error }));
            let _ = sink.send(Message::Text(response.into())).await;
            let _ = sink.send(Message::Close(None)).await;
            return;
        }
        Handshake::Silent => {
            // Hold the socket open without answering.
            while stream.next().await.is_some() {}
            return;
        }
    }

    let Some(mut push) = state.push.lock().unwrap().take() else {
        return;
    };

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let _ = state.received.send(text.as_str().to_string());
                }
                Some(Ok(_)) => {}
                _ => break,
            },
            outgoing = push.recv() => match outgoing {
                Some(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }
}

/// Await `future` or panic after [`WAIT`].
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(WAIT, future)
        .await
        .expect("timed out")
}

/// Poll `condition` until it holds or [`WAIT`] passes.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    within(async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
}
