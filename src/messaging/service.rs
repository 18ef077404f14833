//! Chat hub facade shared by the whole session.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, watch};

use crate::client::HubClient;
use crate::constants::EVENT_CHANNEL_CAPACITY;
use crate::credentials::CredentialsProvider;
use crate::protocol::{methods, ChatMessage, MessageReadNotification, TypingIndicator};
use crate::transport::HubError;

/// Connection state as seen by chat consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessagingState {
    /// Not connected; presence signals are dropped.
    #[default]
    Disconnected,
    /// `connect()` in progress.
    Connecting,
    /// Registered with the hub.
    Connected,
}

/// Messaging service: one hub connection, three event streams.
///
/// Every server push is delivered to every current subscriber at least
/// once. Subscribers de-duplicate by message id.
#[derive(Debug)]
pub struct MessagingService {
    hub: Arc<dyn HubClient>,
    credentials: Arc<dyn CredentialsProvider>,
    state: watch::Sender<MessagingState>,
    messages: broadcast::Sender<ChatMessage>,
    typing: broadcast::Sender<TypingIndicator>,
    read_receipts: broadcast::Sender<MessageReadNotification>,
}

impl MessagingService {
    /// Wrap a hub client pointed at the messaging hub.
    pub fn new(hub: Arc<dyn HubClient>, credentials: Arc<dyn CredentialsProvider>) -> Self {
        let (state, _) = watch::channel(MessagingState::Disconnected);
        let (messages, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (typing, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (read_receipts, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            hub,
            credentials,
            state,
            messages,
            typing,
            read_receipts,
        }
    }

    /// Current state.
    pub fn state(&self) -> MessagingState {
        *self.state.borrow()
    }

    /// Observe state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<MessagingState> {
        self.state.subscribe()
    }

    /// Whether the service is registered and the socket is open.
    pub fn is_connected(&self) -> bool {
        self.state() == MessagingState::Connected && self.hub.is_connected()
    }

    /// New chat messages pushed by the server.
    pub fn subscribe_messages(&self) -> broadcast::Receiver<ChatMessage> {
        self.messages.subscribe()
    }

    /// Typing indicators pushed by the server.
    pub fn subscribe_typing(&self) -> broadcast::Receiver<TypingIndicator> {
        self.typing.subscribe()
    }

    /// Read receipts pushed by the server.
    pub fn subscribe_read_receipts(&self) -> broadcast::Receiver<MessageReadNotification> {
        self.read_receipts.subscribe()
    }

    /// Connect and register tenant and user. No-op when already connected.
    ///
    /// `RegisterTenant` is sent before `RegisterUser`, each only when the
    /// id is non-empty, and both before the service reports `Connected`.
    ///
    /// # Errors
    ///
    /// Propagates the hub connect error; state returns to `Disconnected`.
    pub async fn connect(&self) -> Result<(), HubError> {
        if self.is_connected() {
            return Ok(());
        }

        self.state.send_replace(MessagingState::Connecting);
        self.register_handlers();

        if let Err(e) = self.hub.connect().await {
            self.state.send_replace(MessagingState::Disconnected);
            log::error!("[Messaging] Connection failed: {e}");
            return Err(e);
        }

        let registration = self.register_identity();
        if let Err(e) = registration {
            self.state.send_replace(MessagingState::Disconnected);
            log::error!("[Messaging] Registration failed: {e}");
            return Err(e);
        }

        self.state.send_replace(MessagingState::Connected);
        log::info!("[Messaging] Connected");
        Ok(())
    }

    fn register_identity(&self) -> Result<(), HubError> {
        let tenant_id = self.credentials.tenant_id().unwrap_or_default();
        if !tenant_id.is_empty() {
            self.hub
                .send(methods::REGISTER_TENANT, vec![Value::from(tenant_id)])?;
        }
        let user_id = self.credentials.user_id().unwrap_or_default();
        if !user_id.is_empty() {
            self.hub
                .send(methods::REGISTER_USER, vec![Value::from(user_id)])?;
        }
        Ok(())
    }

    fn register_handlers(&self) {
        let messages = self.messages.clone();
        self.hub.on(
            methods::RECEIVE_MESSAGE,
            Arc::new(move |args: &[Value]| {
                let Some(payload) = args.first() else {
                    log::debug!("[Messaging] ReceiveMessage without arguments");
                    return;
                };
                match serde_json::from_value::<ChatMessage>(payload.clone()) {
                    Ok(message) => {
                        if messages.send(message).is_err() {
                            log::trace!("[Messaging] No message subscribers");
                        }
                    }
                    Err(e) => log::error!("[Messaging] Error parsing message: {e}"),
                }
            }),
        );

        let typing = self.typing.clone();
        self.hub.on(
            methods::TYPING_INDICATOR,
            Arc::new(move |args: &[Value]| {
                let Some(payload) = args.first() else {
                    return;
                };
                match serde_json::from_value::<TypingIndicator>(payload.clone()) {
                    Ok(indicator) => {
                        if typing.send(indicator).is_err() {
                            log::trace!("[Messaging] No typing subscribers");
                        }
                    }
                    Err(e) => log::error!("[Messaging] Error parsing typing indicator: {e}"),
                }
            }),
        );

        let read_receipts = self.read_receipts.clone();
        self.hub.on(
            methods::MESSAGE_READ,
            Arc::new(move |args: &[Value]| {
                if let Some(notification) = MessageReadNotification::from_arguments(args) {
                    if read_receipts.send(notification).is_err() {
                        log::trace!("[Messaging] No read receipt subscribers");
                    }
                }
            }),
        );
    }

    /// Disconnect from the hub.
    pub async fn disconnect(&self) {
        self.hub.disconnect().await;
        self.state.send_replace(MessagingState::Disconnected);
        log::info!("[Messaging] Disconnected");
    }

    /// Join a conversation group. Dropped when not connected.
    pub fn join_conversation(&self, conversation_id: &str) -> bool {
        if !self.is_connected() {
            log::warn!("[Messaging] Cannot join conversation - not connected");
            return false;
        }
        self.guarded_send(
            methods::JOIN_CONVERSATION,
            vec![Value::from(conversation_id)],
        )
    }

    /// Leave a conversation group. Dropped when not connected.
    pub fn leave_conversation(&self, conversation_id: &str) -> bool {
        self.is_connected()
            && self.guarded_send(
                methods::LEAVE_CONVERSATION,
                vec![Value::from(conversation_id)],
            )
    }

    /// Announce typing started/stopped. Dropped when not connected.
    pub fn send_typing_indicator(&self, conversation_id: &str, is_typing: bool) -> bool {
        self.is_connected()
            && self.guarded_send(
                methods::SEND_TYPING_INDICATOR,
                vec![Value::from(conversation_id), Value::from(is_typing)],
            )
    }

    /// Mark a message read as the signed-in user. Dropped when not
    /// connected or when no user id is known.
    pub fn mark_as_read(&self, conversation_id: &str, message_id: &str) -> bool {
        if !self.is_connected() {
            return false;
        }
        let Some(user_id) = self.credentials.user_id() else {
            return false;
        };
        self.guarded_send(
            methods::MARK_AS_READ,
            vec![
                Value::from(conversation_id),
                Value::from(message_id),
                Value::from(user_id),
            ],
        )
    }

    fn guarded_send(&self, method: &str, arguments: Vec<Value>) -> bool {
        match self.hub.send(method, arguments) {
            Ok(()) => true,
            Err(e) => {
                log::error!("[Messaging] Failed to send {method}: {e}");
                false
            }
        }
    }
}
