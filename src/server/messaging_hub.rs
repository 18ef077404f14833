//! Chat hub: tenant, user and conversation groups.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;

use super::hub::{bool_arg, string_arg, Hub, HubContext};
use super::registry::ConnectionRegistry;
use crate::protocol::{methods, ChatMessage, Frame, Invocation, TypingIndicator};

/// Group holding every connection of a tenant.
pub fn tenant_group(tenant_id: &str) -> String {
    format!("tenant:{tenant_id}")
}

/// Group holding every connection of a user.
pub fn user_group(user_id: &str) -> String {
    format!("user:{user_id}")
}

/// Group holding the participants viewing a conversation.
pub fn conversation_group(conversation_id: &str) -> String {
    format!("conversation:{conversation_id}")
}

/// Routes chat presence signals and pushes new messages.
///
/// Message creation itself happens in the REST layer, which hands the
/// stored message to [`MessagingHub::publish_message`].
#[derive(Debug)]
pub struct MessagingHub {
    connections: Arc<ConnectionRegistry>,
    users: Mutex<HashMap<String, String>>,
}

impl Default for MessagingHub {
    fn default() -> Self {
        Self::new()
    }
}

impl MessagingHub {
    /// Hub with no connections.
    pub fn new() -> Self {
        Self {
            connections: Arc::new(ConnectionRegistry::new()),
            users: Mutex::new(HashMap::new()),
        }
    }

    fn users(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.users.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// User registered on a connection.
    pub fn user_of(&self, connection_id: &str) -> Option<String> {
        self.users().get(connection_id).cloned()
    }

    /// Push `ReceiveMessage` to everyone in the message's conversation.
    ///
    /// Returns the number of connections reached.
    pub fn publish_message(&self, message: &ChatMessage) -> usize {
        let payload = match serde_json::to_value(message) {
            Ok(payload) => payload,
            Err(e) => {
                log::error!("[Server] Failed to encode message {}: {e}", message.id);
                return 0;
            }
        };
        let frame = Frame::Invocation(Invocation::fire_and_forget(
            methods::RECEIVE_MESSAGE,
            vec![payload],
        ));
        let reached = self.connections.send_to_group(
            &conversation_group(&message.conversation_id),
            &frame,
            None,
        );
        log::debug!(
            "[Server] Message {} delivered to {reached} connection(s)",
            message.id
        );
        reached
    }

    /// Push `ReceiveMessage` to every connection of one user, e.g. for a
    /// conversation the user has not opened.
    pub fn notify_user(&self, user_id: &str, message: &ChatMessage) -> usize {
        let Ok(payload) = serde_json::to_value(message) else {
            return 0;
        };
        let frame = Frame::Invocation(Invocation::fire_and_forget(
            methods::RECEIVE_MESSAGE,
            vec![payload],
        ));
        self.connections
            .send_to_group(&user_group(user_id), &frame, None)
    }

    fn caller_user(&self, ctx: &HubContext) -> String {
        self.user_of(ctx.connection_id()).unwrap_or_default()
    }
}

#[async_trait]
impl Hub for MessagingHub {
    fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    async fn on_disconnected(&self, ctx: &HubContext) {
        self.users().remove(ctx.connection_id());
    }

    async fn invoke(&self, ctx: &HubContext, invocation: Invocation) -> Result<()> {
        match invocation.target.as_str() {
            methods::REGISTER_TENANT => {
                ctx.add_to_group(&tenant_group(string_arg(&invocation, 0)?));
            }
            methods::UNREGISTER_TENANT => {
                ctx.remove_from_group(&tenant_group(string_arg(&invocation, 0)?));
            }
            methods::REGISTER_USER => {
                let user_id = string_arg(&invocation, 0)?;
                ctx.add_to_group(&user_group(user_id));
                self.users()
                    .insert(ctx.connection_id().to_string(), user_id.to_string());
            }
            methods::JOIN_CONVERSATION => {
                ctx.add_to_group(&conversation_group(string_arg(&invocation, 0)?));
            }
            methods::LEAVE_CONVERSATION => {
                ctx.remove_from_group(&conversation_group(string_arg(&invocation, 0)?));
            }
            methods::SEND_TYPING_INDICATOR => {
                let conversation_id = string_arg(&invocation, 0)?;
                let indicator = TypingIndicator {
                    conversation_id: conversation_id.to_string(),
                    user_id: self.caller_user(ctx),
                    is_typing: bool_arg(&invocation, 1)?,
                };
                ctx.send_to_others_in_group(
                    &conversation_group(conversation_id),
                    methods::TYPING_INDICATOR,
                    vec![serde_json::to_value(&indicator)?],
                );
            }
            methods::MARK_AS_READ => {
                let conversation_id = string_arg(&invocation, 0)?;
                let message_id = string_arg(&invocation, 1)?;
                let reader = match invocation.arguments.get(2).and_then(Value::as_str) {
                    Some(user_id) => user_id.to_string(),
                    None => self.caller_user(ctx),
                };
                ctx.send_to_others_in_group(
                    &conversation_group(conversation_id),
                    methods::MESSAGE_READ,
                    vec![Value::from(message_id), Value::from(reader)],
                );
            }
            other => bail!("unknown method {other}"),
        }
        Ok(())
    }
}
