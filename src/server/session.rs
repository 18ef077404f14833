//! One accepted hub socket, server side.
//!
//! ```text
//! handshake ──► registry.add ──► on_connected ──► read loop ──► registry.remove ──► on_disconnected
//!                    │                               │
//!                    └── writer task ◄── mpsc ◄──────┘ (completions, group pushes, pings)
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio_util::sync::CancellationToken;

use super::hub::{Hub, HubContext};
use crate::constants::SESSION_SHUTDOWN_TIMEOUT;
use crate::protocol::framing::{PROTOCOL_NAME, PROTOCOL_VERSION};
use crate::protocol::{decode, Frame};

/// Timing knobs for accepted sockets.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SessionSettings {
    pub keepalive_interval: Duration,
    pub handshake_timeout: Duration,
}

/// Identity issued by negotiate and claimed by the socket.
#[derive(Debug, Clone)]
pub(crate) struct PendingConnection {
    pub hub: String,
    pub connection_id: String,
    pub tenant_id: Option<String>,
    pub issued_at: Instant,
}

type Sink = SplitSink<WebSocket, Message>;
type Stream = SplitStream<WebSocket>;

/// Serve one socket until either side closes or the server shuts down.
pub(crate) async fn run(
    socket: WebSocket,
    hub: Arc<dyn Hub>,
    pending: PendingConnection,
    settings: SessionSettings,
    shutdown: CancellationToken,
) {
    let connection_id = pending.connection_id.clone();
    let (mut sink, mut stream) = socket.split();

    let trailing = match tokio::time::timeout(
        settings.handshake_timeout,
        accept_handshake(&mut sink, &mut stream),
    )
    .await
    {
        Ok(Ok(trailing)) => trailing,
        Ok(Err(reason)) => {
            log::warn!("[Server] Handshake rejected for {connection_id}: {reason}");
            let response = Frame::HandshakeResponse {
                error: Some(reason),
            };
            match response.encode() {
                Ok(text) => {
                    if sink.send(Message::Text(text.into())).await.is_ok() {
                        let _ = sink.send(Message::Close(None)).await;
                    }
                }
                Err(e) => log::error!("[Server] Failed to encode handshake rejection: {e:#}"),
            }
            return;
        }
        Err(_) => {
            log::warn!("[Server] Handshake timed out for {connection_id}");
            let _ = sink.send(Message::Close(None)).await;
            return;
        }
    };

    let connections = Arc::clone(hub.connections());
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    connections.add(&connection_id, pending.tenant_id.clone(), tx);
    let ctx = HubContext::new(&connection_id, pending.tenant_id, Arc::clone(&connections));

    let writer_cancel = CancellationToken::new();
    let mut writer = tokio::spawn(write_loop(
        sink,
        rx,
        settings.keepalive_interval,
        writer_cancel.clone(),
    ));

    log::info!("[Server] {} connected to {}", connection_id, pending.hub);
    hub.on_connected(&ctx).await;

    let mut open = true;
    for frame in trailing {
        if !handle_frame(hub.as_ref(), &ctx, frame).await {
            open = false;
            break;
        }
    }
    if open {
        read_loop(hub.as_ref(), &ctx, &mut stream, &shutdown).await;
    }

    connections.remove(&connection_id);
    hub.on_disconnected(&ctx).await;
    log::info!("[Server] {} disconnected from {}", connection_id, pending.hub);

    // Registry entry is gone, so the writer drains what is queued and exits.
    if tokio::time::timeout(SESSION_SHUTDOWN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        writer_cancel.cancel();
        writer.abort();
    }
}

/// Read and validate the handshake; returns frames that followed it in
/// the same message.
async fn accept_handshake(sink: &mut Sink, stream: &mut Stream) -> Result<Vec<Frame>, String> {
    let text = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => break text,
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Binary(_))) => return Err("binary handshake not supported".into()),
            Some(Ok(Message::Close(_))) | None => return Err("socket closed".into()),
            Some(Err(e)) => return Err(format!("socket error: {e}")),
        }
    };

    let mut frames = decode(text.as_str()).into_iter();
    match frames.next() {
        Some(Ok(Frame::HandshakeRequest { protocol, version })) => {
            if protocol != PROTOCOL_NAME {
                return Err(format!("The protocol '{protocol}' is not supported."));
            }
            if version != PROTOCOL_VERSION {
                return Err(format!(
                    "The server does not support version {version} of the '{protocol}' protocol."
                ));
            }
        }
        Some(Ok(other)) => return Err(format!("expected handshake request, got {other:?}")),
        Some(Err(e)) => return Err(format!("invalid handshake: {e}")),
        None => return Err("empty handshake".into()),
    }

    let ack = Frame::HandshakeResponse { error: None }
        .encode()
        .map_err(|e| format!("failed to encode handshake ack: {e:#}"))?;
    sink.send(Message::Text(ack.into()))
        .await
        .map_err(|e| format!("failed to acknowledge handshake: {e}"))?;

    Ok(frames
        .filter_map(|frame| match frame {
            Ok(frame) => Some(frame),
            Err(e) => {
                log::warn!("[Server] Dropping malformed frame: {e}");
                None
            }
        })
        .collect())
}

async fn read_loop(
    hub: &dyn Hub,
    ctx: &HubContext,
    stream: &mut Stream,
    shutdown: &CancellationToken,
) {
    loop {
        let message = tokio::select! {
            () = shutdown.cancelled() => {
                let close = Frame::Close {
                    error: Some("Server is shutting down".into()),
                };
                hub.connections().send_to_connection(ctx.connection_id(), &close);
                return;
            }
            message = stream.next() => message,
        };

        let text = match message {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(_))) => {
                log::warn!("[Server] Binary message from {} ignored", ctx.connection_id());
                continue;
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => return,
            Some(Err(e)) => {
                log::debug!("[Server] Socket error on {}: {e}", ctx.connection_id());
                return;
            }
        };

        for frame in decode(text.as_str()) {
            match frame {
                Ok(frame) => {
                    if !handle_frame(hub, ctx, frame).await {
                        return;
                    }
                }
                Err(e) => log::warn!("[Server] Dropping malformed frame: {e}"),
            }
        }
    }
}

/// Returns `false` when the client asked to close.
async fn handle_frame(hub: &dyn Hub, ctx: &HubContext, frame: Frame) -> bool {
    match frame {
        Frame::Invocation(invocation) => {
            let invocation_id = invocation.invocation_id.clone();
            let target = invocation.target.clone();
            let error = match hub.invoke(ctx, invocation).await {
                Ok(()) => None,
                Err(e) => {
                    log::warn!(
                        "[Server] {} invocation from {} failed: {e:#}",
                        target,
                        ctx.connection_id()
                    );
                    Some(format!("{e:#}"))
                }
            };
            if let Some(invocation_id) = invocation_id {
                hub.connections().send_to_connection(
                    ctx.connection_id(),
                    &Frame::Completion {
                        invocation_id,
                        error,
                    },
                );
            }
            true
        }
        Frame::Ping | Frame::Completion { .. } => true,
        Frame::Close { .. } => false,
        Frame::HandshakeRequest { .. } | Frame::HandshakeResponse { .. } => {
            log::warn!("[Server] Unexpected handshake from {}", ctx.connection_id());
            true
        }
    }
}

async fn write_loop(
    mut sink: Sink,
    mut rx: UnboundedReceiver<String>,
    keepalive_interval: Duration,
    cancel: CancellationToken,
) {
    let ping = match Frame::Ping.encode() {
        Ok(ping) => ping,
        Err(e) => {
            log::error!("[Server] Failed to encode keep-alive: {e:#}");
            return;
        }
    };
    let mut keepalive = tokio::time::interval(keepalive_interval);
    keepalive.tick().await;

    loop {
        let text = tokio::select! {
            () = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(text) => text,
                None => break,
            },
            _ = keepalive.tick() => ping.clone(),
        };
        if let Err(e) = sink.send(Message::Text(text.into())).await {
            log::debug!("[Server] Write failed: {e}");
            return;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
}
