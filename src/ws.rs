//! Client-side hub socket.
//!
//! The hub protocol only ever travels as WebSocket text, so the halves
//! returned by [`connect`] speak in hub terms: [`HubSocketWriter`] writes
//! encoded frame text, [`HubSocketReader`] yields [`SocketEvent`]s with
//! binary payloads and close details already reduced to what the session
//! task logs. Nothing else in the crate touches `tokio-tungstenite`.
//!
//! ```text
//! hub URL ──socket_url()──► ws(s)://…/hubs/x?id=<token>
//!                                   │ connect(url, token, tenant)
//!                    ┌──────────────┴──────────────┐
//!             HubSocketWriter                HubSocketReader
//!              send_text / close              next_event
//! ```

// Rust guideline compliant 2026-02

use anyhow::{Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::transport::negotiate::TENANT_HEADER;

type Socket = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Something the server sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// A text message holding one or more encoded frames.
    Text(String),
    /// A binary message; never part of the JSON protocol.
    NonText {
        /// Payload size in bytes.
        len: usize,
    },
    /// The server closed the socket.
    Closed {
        /// Close code and reason, formatted for logs.
        description: String,
    },
}

/// Write half of a hub socket.
#[derive(Debug)]
pub struct HubSocketWriter {
    sink: SplitSink<Socket, Message>,
}

impl HubSocketWriter {
    /// Write one text message.
    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.sink
            .send(Message::Text(text.to_owned()))
            .await
            .context("Hub socket write failed")
    }

    /// Send a close frame and shut the sink.
    pub async fn close(&mut self) -> Result<()> {
        self.sink
            .send(Message::Close(None))
            .await
            .context("Hub socket close frame failed")?;
        self.sink.close().await.context("Hub socket shutdown failed")
    }
}

/// Read half of a hub socket.
#[derive(Debug)]
pub struct HubSocketReader {
    stream: SplitStream<Socket>,
}

impl HubSocketReader {
    /// Next event, or `None` once the stream has ended.
    ///
    /// WebSocket ping/pong is answered by tungstenite and never surfaces.
    pub async fn next_event(&mut self) -> Option<Result<SocketEvent>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(anyhow::anyhow!("Hub socket read failed: {e}"))),
            };
            let event = match message {
                Message::Text(text) => SocketEvent::Text(text),
                Message::Binary(data) => SocketEvent::NonText { len: data.len() },
                Message::Close(frame) => SocketEvent::Closed {
                    description: describe_close(frame.as_ref()),
                },
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            };
            return Some(Ok(event));
        }
    }
}

fn describe_close(frame: Option<&CloseFrame<'_>>) -> String {
    match frame {
        Some(frame) if frame.reason.is_empty() => format!("code {}", u16::from(frame.code)),
        Some(frame) => format!("code {}: {}", u16::from(frame.code), frame.reason),
        None => "no close code".to_owned(),
    }
}

/// Open the hub socket at `url`, sending the same bearer token and tenant
/// header as negotiate.
pub async fn connect(
    url: &str,
    access_token: &str,
    tenant_id: &str,
) -> Result<(HubSocketWriter, HubSocketReader)> {
    let mut request = url
        .into_client_request()
        .with_context(|| format!("Invalid hub socket URL: {url}"))?;

    let headers = request.headers_mut();
    headers.insert(
        "Authorization",
        HeaderValue::from_str(&format!("Bearer {access_token}"))
            .context("Access token is not a valid header value")?,
    );
    if !tenant_id.is_empty() {
        headers.insert(
            TENANT_HEADER,
            HeaderValue::from_str(tenant_id).context("Tenant id is not a valid header value")?,
        );
    }

    let (socket, _response) = tokio_tungstenite::connect_async(request)
        .await
        .with_context(|| format!("Hub socket upgrade failed for {url}"))?;
    let (sink, stream) = socket.split();
    Ok((HubSocketWriter { sink }, HubSocketReader { stream }))
}

/// Socket endpoint for a hub: `http`→`ws`, `https`→`wss`, `id=<token>`
/// appended to any existing query.
pub fn socket_url(hub_url: &str, connection_token: &str) -> Result<String> {
    let mut url = Url::parse(hub_url).with_context(|| format!("Invalid hub URL: {hub_url}"))?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => anyhow::bail!("Unsupported hub URL scheme: {other}"),
    };
    if url.scheme() != scheme {
        // http(s) and ws(s) are all "special" schemes, so this cannot fail.
        let _ = url.set_scheme(scheme);
    }
    url.query_pairs_mut().append_pair("id", connection_token);
    Ok(url.into())
}
