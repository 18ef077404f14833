//! Long-lived hub connection with one socket session per connect attempt.
//!
//! `HubConnection` is cheap to clone (it wraps an `Arc`) and safe to share
//! between services. Each successful `connect()` spawns a session task that
//! owns both socket halves; callers never touch the socket directly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::negotiate;
use super::{ConnectionState, HubError, Outbox, SharedConnectionState};
use crate::client::{Handler, HandlerRegistry, HubClient};
use crate::constants;
use crate::protocol::{self, Frame, Invocation};
use crate::ws::{self, HubSocketReader, HubSocketWriter, SocketEvent};

/// Encoded keep-alive, echoed for every server Ping.
const PING_FRAME: &str = "{\"type\":6}\u{1e}";

/// Builder for [`HubConnection`].
pub struct HubConnectionBuilder {
    hub_url: String,
    access_token: String,
    tenant_id: String,
    http: Option<reqwest::Client>,
    poll_interval: Duration,
    poll_attempts: u32,
}

impl std::fmt::Debug for HubConnectionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubConnectionBuilder")
            .field("hub_url", &self.hub_url)
            .field("tenant_id", &self.tenant_id)
            .field("poll_interval", &self.poll_interval)
            .field("poll_attempts", &self.poll_attempts)
            .finish_non_exhaustive()
    }
}

impl HubConnectionBuilder {
    /// Start a builder for the hub at `hub_url` (http/https or ws/wss).
    pub fn new(hub_url: impl Into<String>) -> Self {
        Self {
            hub_url: hub_url.into(),
            access_token: String::new(),
            tenant_id: String::new(),
            http: None,
            poll_interval: constants::CONNECT_POLL_INTERVAL,
            poll_attempts: constants::CONNECT_POLL_ATTEMPTS,
        }
    }

    /// Bearer token for negotiate and the socket upgrade.
    #[must_use]
    pub fn access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = token.into();
        self
    }

    /// Tenant id sent as `X-Tenant`.
    #[must_use]
    pub fn tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = tenant_id.into();
        self
    }

    /// Use a pre-configured HTTP client for negotiate.
    #[must_use]
    pub fn http_client(mut self, client: reqwest::Client) -> Self {
        self.http = Some(client);
        self
    }

    /// Interval between state checks while `connect()` waits.
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Number of state checks before `connect()` times out.
    #[must_use]
    pub fn poll_attempts(mut self, attempts: u32) -> Self {
        self.poll_attempts = attempts;
        self
    }

    /// Build the connection. Nothing is opened until `connect()`.
    ///
    /// # Errors
    ///
    /// Returns an error if the default HTTP client cannot be created.
    pub fn build(self) -> anyhow::Result<HubConnection> {
        let http = match self.http {
            Some(client) => client,
            None => reqwest::Client::builder()
                .timeout(constants::HTTP_REQUEST_TIMEOUT)
                .build()
                .context("Failed to build HTTP client")?,
        };

        Ok(HubConnection {
            shared: Arc::new(Shared {
                hub_url: self.hub_url,
                access_token: self.access_token,
                tenant_id: self.tenant_id,
                http,
                state: SharedConnectionState::new(),
                outbox: Outbox::new(),
                handlers: HandlerRegistry::new(),
                next_invocation_id: AtomicU64::new(1),
                last_error: Mutex::new(None),
                connection_id: Mutex::new(None),
                session: Mutex::new(None),
                generation: AtomicU64::new(0),
                connect_lock: tokio::sync::Mutex::new(()),
                poll_interval: self.poll_interval,
                poll_attempts: self.poll_attempts,
            }),
        })
    }
}

/// Running socket session.
struct Session {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Shared {
    hub_url: String,
    access_token: String,
    tenant_id: String,
    http: reqwest::Client,
    state: Arc<SharedConnectionState>,
    outbox: Outbox,
    handlers: HandlerRegistry,
    next_invocation_id: AtomicU64,
    last_error: Mutex<Option<HubError>>,
    connection_id: Mutex<Option<String>>,
    session: Mutex<Option<Session>>,
    /// Bumped by `disconnect()`; a connect attempt that sees it change gives up.
    generation: AtomicU64,
    connect_lock: tokio::sync::Mutex<()>,
    poll_interval: Duration,
    poll_attempts: u32,
}

impl Shared {
    /// Record a fatal negotiate/handshake error unless the session was abandoned.
    fn record_failure(&self, cancel: &CancellationToken, error: HubError) {
        if cancel.is_cancelled() {
            return;
        }
        log::warn!("[Hub] {} ({})", error, self.hub_url);
        *lock(&self.last_error) = Some(error);
        self.state.set(ConnectionState::Failed);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// A client connection to one hub endpoint.
#[derive(Clone)]
pub struct HubConnection {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for HubConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubConnection")
            .field("hub_url", &self.shared.hub_url)
            .field("state", &self.shared.state.get())
            .field("pending", &self.shared.outbox.pending_len())
            .finish_non_exhaustive()
    }
}

impl HubConnection {
    /// Start building a connection to `hub_url`.
    pub fn builder(hub_url: impl Into<String>) -> HubConnectionBuilder {
        HubConnectionBuilder::new(hub_url)
    }

    /// Hub URL this connection targets.
    pub fn hub_url(&self) -> &str {
        &self.shared.hub_url
    }

    /// Current lifecycle state (lock-free).
    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    /// Whether the handshake has completed.
    pub fn is_connected(&self) -> bool {
        self.shared.state.is_connected()
    }

    /// Most recent negotiate, handshake, close or timeout error.
    pub fn last_error(&self) -> Option<HubError> {
        lock(&self.shared.last_error).clone()
    }

    /// Connection id issued by the last successful negotiate.
    pub fn connection_id(&self) -> Option<String> {
        lock(&self.shared.connection_id).clone()
    }

    /// Frames queued while no session is attached.
    pub fn pending_sends(&self) -> usize {
        self.shared.outbox.pending_len()
    }

    /// Register or replace the handler for a server → client method.
    ///
    /// Handlers survive `disconnect()` and apply to later sessions.
    pub fn on(&self, method: &str, handler: Handler) {
        self.shared.handlers.register(method, handler);
    }

    /// Fire-and-forget invocation: written now if connected, queued otherwise.
    pub fn send(&self, method: &str, arguments: Vec<Value>) -> Result<(), HubError> {
        self.enqueue(Invocation::fire_and_forget(method, arguments))
    }

    /// Invocation with the next per-connection id (starting at `"1"`).
    ///
    /// Returns the id. Completions are not awaited.
    pub fn invoke(&self, method: &str, arguments: Vec<Value>) -> Result<String, HubError> {
        let id = self
            .shared
            .next_invocation_id
            .fetch_add(1, Ordering::Relaxed)
            .to_string();
        self.enqueue(Invocation::with_id(method, arguments, id.clone()))?;
        Ok(id)
    }

    fn enqueue(&self, invocation: Invocation) -> Result<(), HubError> {
        let target = invocation.target.clone();
        let text = Frame::Invocation(invocation)
            .encode()
            .map_err(|e| HubError::Encode(format!("{target}: {e:#}")))?;
        if self.shared.outbox.push(text) {
            log::trace!("[Hub] Sent {target}");
        } else {
            log::debug!(
                "[Hub] Queued {target} until connected ({} pending)",
                self.shared.outbox.pending_len()
            );
        }
        Ok(())
    }

    /// Negotiate, open the socket and wait for the handshake.
    ///
    /// Returns immediately when already connected. Concurrent callers are
    /// serialized; the second one sees the first one's result.
    ///
    /// # Errors
    ///
    /// - [`HubError::Negotiate`] when negotiate fails
    /// - [`HubError::Handshake`] / [`HubError::Transport`] when the socket
    ///   or handshake fails
    /// - [`HubError::ConnectTimeout`] when the handshake does not finish
    ///   within the polling window
    /// - [`HubError::Closed`] when `disconnect()` or the server ended the
    ///   attempt first
    pub async fn connect(&self) -> Result<(), HubError> {
        let _connecting = self.shared.connect_lock.lock().await;
        if self.shared.state.is_connected() {
            return Ok(());
        }

        let generation = self.shared.generation.load(Ordering::Acquire);
        let stale = lock(&self.shared.session).take();
        if let Some(stale) = stale {
            shutdown_session(stale).await;
        }
        *lock(&self.shared.last_error) = None;

        log::info!("[Hub] Connecting to {}", self.shared.hub_url);
        self.shared.state.set(ConnectionState::Negotiating);

        let negotiated = match negotiate::negotiate(
            &self.shared.http,
            &self.shared.hub_url,
            &self.shared.access_token,
            &self.shared.tenant_id,
        )
        .await
        {
            Ok(negotiated) => negotiated,
            Err(e) => return Err(self.fail_attempt(generation, e)),
        };

        let url = match ws::socket_url(&self.shared.hub_url, &negotiated.connection_token) {
            Ok(url) => url,
            Err(e) => return Err(self.fail_attempt(generation, HubError::Negotiate(format!("{e:#}")))),
        };

        {
            let mut session = lock(&self.shared.session);
            if self.shared.generation.load(Ordering::Acquire) != generation {
                log::debug!("[Hub] Connect abandoned by disconnect during negotiate");
                return Err(HubError::Closed(None));
            }
            *lock(&self.shared.connection_id) = Some(negotiated.connection_id);
            self.shared.state.set(ConnectionState::Handshaking);

            let cancel = CancellationToken::new();
            let task = tokio::spawn(run_session(
                Arc::clone(&self.shared),
                url,
                cancel.clone(),
            ));
            *session = Some(Session { cancel, task });
        }

        self.wait_until_connected(generation).await
    }

    fn fail_attempt(&self, generation: u64, error: HubError) -> HubError {
        if self.shared.generation.load(Ordering::Acquire) == generation {
            log::warn!("[Hub] {} ({})", error, self.shared.hub_url);
            *lock(&self.shared.last_error) = Some(error.clone());
            self.shared.state.set(ConnectionState::Failed);
        }
        error
    }

    async fn wait_until_connected(&self, generation: u64) -> Result<(), HubError> {
        for _ in 0..self.shared.poll_attempts {
            tokio::time::sleep(self.shared.poll_interval).await;

            if self.shared.generation.load(Ordering::Acquire) != generation {
                return Err(HubError::Closed(None));
            }

            match self.shared.state.get() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Failed => {
                    return Err(self
                        .last_error()
                        .unwrap_or_else(|| HubError::Handshake("unknown failure".into())));
                }
                ConnectionState::Disconnected => {
                    return Err(self.last_error().unwrap_or(HubError::Closed(None)));
                }
                ConnectionState::Negotiating | ConnectionState::Handshaking => {}
            }
        }

        log::warn!(
            "[Hub] Handshake with {} not completed after {} checks",
            self.shared.hub_url,
            self.shared.poll_attempts
        );
        let session = lock(&self.shared.session).take();
        if let Some(session) = session {
            shutdown_session(session).await;
        }
        self.shared.state.set(ConnectionState::Disconnected);
        *lock(&self.shared.last_error) = Some(HubError::ConnectTimeout);
        Err(HubError::ConnectTimeout)
    }

    /// Close the session from any state.
    ///
    /// Abandons a handshake in progress, closes the socket (errors are
    /// ignored), and discards queued sends. Sends already accepted by a
    /// live session are written before the close. Registered handlers
    /// are kept.
    pub async fn disconnect(&self) {
        let session = {
            let mut session = lock(&self.shared.session);
            self.shared.generation.fetch_add(1, Ordering::AcqRel);
            session.take()
        };

        if let Some(session) = session {
            shutdown_session(session).await;
            log::info!("[Hub] Disconnected from {}", self.shared.hub_url);
        }

        self.shared.outbox.clear();
        *lock(&self.shared.connection_id) = None;
        self.shared.state.set(ConnectionState::Disconnected);
    }
}

#[async_trait]
impl HubClient for HubConnection {
    fn on(&self, method: &str, handler: Handler) {
        HubConnection::on(self, method, handler);
    }

    fn invoke(&self, method: &str, arguments: Vec<Value>) -> Result<String, HubError> {
        HubConnection::invoke(self, method, arguments)
    }

    fn send(&self, method: &str, arguments: Vec<Value>) -> Result<(), HubError> {
        HubConnection::send(self, method, arguments)
    }

    async fn connect(&self) -> Result<(), HubError> {
        HubConnection::connect(self).await
    }

    async fn disconnect(&self) {
        HubConnection::disconnect(self).await;
    }

    fn state(&self) -> ConnectionState {
        HubConnection::state(self)
    }
}

/// Cancel a session and wait briefly for it to close its socket.
async fn shutdown_session(session: Session) {
    session.cancel.cancel();
    let abort = session.task.abort_handle();
    match tokio::time::timeout(constants::SESSION_SHUTDOWN_TIMEOUT, session.task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::warn!("[Hub] Session task ended abnormally: {e}"),
        Err(_elapsed) => {
            log::warn!("[Hub] Session task did not stop in time, aborting");
            abort.abort();
        }
    }
}

/// Why a connected session ended.
enum SessionExit {
    /// `disconnect()` or a connect timeout cancelled the session.
    Cancelled,
    /// Server sent a Close frame.
    ServerClosed(Option<String>),
    /// Socket error or close without a Close frame.
    SocketLost {
        reason: String,
        /// Frame taken from the writer channel but not written.
        unsent: Vec<String>,
    },
}

/// Body of the session task: open, handshake, flush, read loop, teardown.
async fn run_session(shared: Arc<Shared>, url: String, cancel: CancellationToken) {
    let opened = tokio::select! {
        () = cancel.cancelled() => return,
        result = ws::connect(&url, &shared.access_token, &shared.tenant_id) => result,
    };
    let (mut writer, mut reader) = match opened {
        Ok(halves) => halves,
        Err(e) => {
            shared.record_failure(&cancel, HubError::Transport(format!("{e:#}")));
            return;
        }
    };

    let handshake = tokio::select! {
        () = cancel.cancelled() => {
            close_quietly(&mut writer).await;
            return;
        }
        result = perform_handshake(&mut writer, &mut reader) => result,
    };
    let trailing = match handshake {
        Ok(frames) => frames,
        Err(e) => {
            shared.record_failure(&cancel, e);
            close_quietly(&mut writer).await;
            return;
        }
    };

    let (live_tx, mut live_rx) = mpsc::unbounded_channel();
    let backlog = shared.outbox.attach(live_tx);
    let flushed = backlog.len();
    if let Err(unsent) = flush_backlog(&mut writer, backlog).await {
        shared.outbox.detach(unsent, Some(&mut live_rx));
        shared.record_failure(
            &cancel,
            HubError::Transport("socket failed while flushing queued sends".into()),
        );
        return;
    }

    if cancel.is_cancelled() {
        shared.outbox.detach(Vec::new(), Some(&mut live_rx));
        close_quietly(&mut writer).await;
        return;
    }
    shared.state.set(ConnectionState::Connected);
    log::info!(
        "[Hub] Connected to {} ({} queued sends flushed)",
        shared.hub_url,
        flushed
    );

    let mut early_exit = None;
    for frame in trailing {
        if let Some(exit) = handle_frame(&shared, &mut writer, frame).await {
            early_exit = Some(exit);
            break;
        }
    }
    let exit = match early_exit {
        Some(exit) => exit,
        None => read_loop(&shared, &mut writer, &mut reader, &mut live_rx, &cancel).await,
    };

    match exit {
        SessionExit::Cancelled => {
            shared.outbox.detach(Vec::new(), None);
            write_accepted(&mut writer, &mut live_rx).await;
            close_quietly(&mut writer).await;
        }
        SessionExit::ServerClosed(error) => {
            shared.outbox.detach(Vec::new(), Some(&mut live_rx));
            match &error {
                Some(reason) => log::warn!("[Hub] Server closed connection: {reason}"),
                None => log::info!("[Hub] Server closed connection"),
            }
            close_quietly(&mut writer).await;
            if !cancel.is_cancelled() {
                if error.is_some() {
                    *lock(&shared.last_error) = Some(HubError::Closed(error));
                }
                shared.state.set(ConnectionState::Disconnected);
            }
        }
        SessionExit::SocketLost { reason, unsent } => {
            shared.outbox.detach(unsent, Some(&mut live_rx));
            log::warn!("[Hub] Connection to {} lost: {reason}", shared.hub_url);
            if !cancel.is_cancelled() {
                shared.state.set(ConnectionState::Disconnected);
            }
        }
    }
}

/// Send the handshake request and validate the single response message.
///
/// Returns frames that followed the handshake response in the same message.
async fn perform_handshake(
    writer: &mut HubSocketWriter,
    reader: &mut HubSocketReader,
) -> Result<Vec<Frame>, HubError> {
    writer
        .send_text(&protocol::encode_handshake_request())
        .await
        .map_err(|e| HubError::Transport(format!("{e:#}")))?;

    let text = match reader.next_event().await {
        Some(Ok(SocketEvent::Text(text))) => text,
        Some(Ok(SocketEvent::NonText { .. })) => {
            return Err(HubError::Handshake("handshake response was not text".into()));
        }
        Some(Ok(SocketEvent::Closed { description })) => {
            return Err(HubError::Handshake(format!(
                "socket closed during handshake ({description})"
            )));
        }
        Some(Err(e)) => return Err(HubError::Transport(format!("{e:#}"))),
        None => {
            return Err(HubError::Handshake(
                "socket ended before handshake response".into(),
            ));
        }
    };

    let mut frames = protocol::decode(&text).into_iter();
    match frames.next() {
        Some(Ok(Frame::HandshakeResponse { error: None })) => {}
        Some(Ok(Frame::HandshakeResponse { error: Some(error) })) => {
            return Err(HubError::Handshake(error));
        }
        Some(Ok(other)) => {
            return Err(HubError::Handshake(format!(
                "expected handshake response, got {other:?}"
            )));
        }
        Some(Err(e)) => return Err(HubError::Handshake(format!("{e:#}"))),
        None => return Err(HubError::Handshake("empty handshake response".into())),
    }

    log::debug!("[Hub] Handshake accepted");
    Ok(frames
        .filter_map(|decoded| match decoded {
            Ok(frame) => Some(frame),
            Err(e) => {
                log::warn!("[Hub] Dropping undecodable frame: {e:#}");
                None
            }
        })
        .collect())
}

/// Write the queued backlog in order. On failure, returns what was not written.
async fn flush_backlog(writer: &mut HubSocketWriter, backlog: Vec<String>) -> Result<(), Vec<String>> {
    let mut frames = backlog.into_iter();
    while let Some(frame) = frames.next() {
        if let Err(e) = writer.send_text(&frame).await {
            log::warn!("[Hub] Failed to flush queued send: {e:#}");
            let mut unsent = vec![frame];
            unsent.extend(frames);
            return Err(unsent);
        }
    }
    Ok(())
}

async fn read_loop(
    shared: &Shared,
    writer: &mut HubSocketWriter,
    reader: &mut HubSocketReader,
    live_rx: &mut mpsc::UnboundedReceiver<String>,
    cancel: &CancellationToken,
) -> SessionExit {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return SessionExit::Cancelled,

            Some(text) = live_rx.recv() => {
                if let Err(e) = writer.send_text(&text).await {
                    return SessionExit::SocketLost {
                        reason: format!("{e:#}"),
                        unsent: vec![text],
                    };
                }
            }

            event = reader.next_event() => match event {
                Some(Ok(SocketEvent::Text(text))) => {
                    for decoded in protocol::decode(&text) {
                        match decoded {
                            Ok(frame) => {
                                if let Some(exit) = handle_frame(shared, writer, frame).await {
                                    return exit;
                                }
                            }
                            Err(e) => log::warn!("[Hub] Dropping undecodable frame: {e:#}"),
                        }
                    }
                }
                Some(Ok(SocketEvent::NonText { len })) => {
                    log::debug!("[Hub] Ignoring {len} byte binary message");
                }
                Some(Ok(SocketEvent::Closed { description })) => {
                    return SessionExit::SocketLost {
                        reason: format!("socket closed ({description})"),
                        unsent: Vec::new(),
                    };
                }
                Some(Err(e)) => {
                    return SessionExit::SocketLost {
                        reason: format!("{e:#}"),
                        unsent: Vec::new(),
                    };
                }
                None => {
                    return SessionExit::SocketLost {
                        reason: "stream ended".into(),
                        unsent: Vec::new(),
                    };
                }
            },
        }
    }
}

/// Act on one decoded frame. Returns `Some` when the session must end.
async fn handle_frame(shared: &Shared, writer: &mut HubSocketWriter, frame: Frame) -> Option<SessionExit> {
    match frame {
        Frame::Invocation(invocation) => {
            if !shared
                .handlers
                .dispatch(&invocation.target, &invocation.arguments)
            {
                log::debug!("[Hub] No handler for {}, dropping", invocation.target);
            }
            None
        }
        Frame::Ping => match writer.send_text(PING_FRAME).await {
            Ok(()) => None,
            Err(e) => Some(SessionExit::SocketLost {
                reason: format!("{e:#}"),
                unsent: Vec::new(),
            }),
        },
        Frame::Close { error } => Some(SessionExit::ServerClosed(error)),
        Frame::Completion {
            invocation_id,
            error: None,
        } => {
            log::trace!("[Hub] Completion for invocation {invocation_id}");
            None
        }
        Frame::Completion {
            invocation_id,
            error: Some(error),
        } => {
            log::warn!("[Hub] Invocation {invocation_id} failed on the server: {error}");
            None
        }
        Frame::HandshakeRequest { .. } | Frame::HandshakeResponse { .. } => {
            log::debug!("[Hub] Ignoring handshake frame after handshake");
            None
        }
    }
}

/// Write sends that were handed to this session before it was cancelled,
/// so a disconnect cannot overtake them.
async fn write_accepted(
    writer: &mut HubSocketWriter,
    live_rx: &mut mpsc::UnboundedReceiver<String>,
) {
    let mut written = 0usize;
    while let Ok(text) = live_rx.try_recv() {
        if let Err(e) = writer.send_text(&text).await {
            log::debug!("[Hub] Dropping sends accepted before disconnect: {e:#}");
            return;
        }
        written += 1;
    }
    if written > 0 {
        log::debug!("[Hub] Wrote {written} sends accepted before disconnect");
    }
}

async fn close_quietly(writer: &mut HubSocketWriter) {
    if let Err(e) = writer.close().await {
        log::debug!("[Hub] Ignoring close error: {e:#}");
    }
}
