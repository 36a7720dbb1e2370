//! Named push-event subscriptions and the matching client emissions.

use std::sync::{Arc, Mutex, MutexGuard};

use shared::{
    domain::{ConversationId, Message, MessageId, TypingSignal, UserId},
    protocol::{ClientRequest, ServerEvent},
};
use tracing::{debug, trace, warn};

use crate::{
    error::TransportError,
    transport::{FrameSink, LinkStatus, ReconnectPolicy, SocketConnector, TransportSession},
};

type Handler<T> = Arc<dyn Fn(T) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    new_message: Option<Handler<Message>>,
    message_updated: Option<Handler<Message>>,
    message_deleted: Option<Handler<(ConversationId, MessageId)>>,
    user_online: Option<Handler<UserId>>,
    user_offline: Option<Handler<UserId>>,
    online_users: Option<Handler<Vec<UserId>>>,
    typing: Option<Handler<TypingSignal>>,
}

/// One slot per event; decoding happens here so a bad frame never reaches a handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Mutex<Handlers>,
}

impl HandlerRegistry {
    fn handlers(&self) -> MutexGuard<'_, Handlers> {
        self.handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn dispatch(&self, event: ServerEvent) {
        // Handlers run outside the lock so they may re-register.
        match event {
            ServerEvent::NewMessage { message } => {
                let handler = self.handlers().new_message.clone();
                invoke(handler, "new_message", message);
            }
            ServerEvent::MessageUpdated { message } => {
                let handler = self.handlers().message_updated.clone();
                invoke(handler, "message_updated", message);
            }
            ServerEvent::MessageDeleted {
                message_id,
                conversation_id,
            } => {
                let handler = self.handlers().message_deleted.clone();
                invoke(handler, "message_deleted", (conversation_id, message_id));
            }
            ServerEvent::UserOnline { user_id } => {
                let handler = self.handlers().user_online.clone();
                invoke(handler, "user_online", user_id);
            }
            ServerEvent::UserOffline { user_id } => {
                let handler = self.handlers().user_offline.clone();
                invoke(handler, "user_offline", user_id);
            }
            ServerEvent::OnlineUsers { user_ids } => {
                let handler = self.handlers().online_users.clone();
                invoke(handler, "online_users", user_ids);
            }
            ServerEvent::Typing {
                conversation_id,
                user_id,
            } => {
                let handler = self.handlers().typing.clone();
                invoke(
                    handler,
                    "typing",
                    TypingSignal {
                        conversation_id,
                        user_id,
                    },
                );
            }
        }
    }
}

fn invoke<T>(handler: Option<Handler<T>>, event: &'static str, payload: T) {
    match handler {
        Some(handler) => handler(payload),
        None => trace!(event, "router: no subscriber, event dropped"),
    }
}

impl FrameSink for HandlerRegistry {
    fn deliver(&self, frame: &str) {
        match serde_json::from_str::<ServerEvent>(frame) {
            Ok(event) => self.dispatch(event),
            Err(err) => warn!("router: dropping malformed server event: {err}"),
        }
    }
}

pub struct EventRouter {
    session: Arc<TransportSession>,
    registry: Arc<HandlerRegistry>,
}

impl EventRouter {
    pub fn new(connector: Arc<dyn SocketConnector>, policy: ReconnectPolicy) -> Self {
        let registry = Arc::new(HandlerRegistry::default());
        let session = TransportSession::new(connector, registry.clone(), policy);
        Self { session, registry }
    }

    pub fn session(&self) -> &Arc<TransportSession> {
        &self.session
    }

    pub async fn connect(&self, credential: Option<&str>) {
        self.session.connect(credential).await;
    }

    pub fn disconnect(&self) {
        self.session.disconnect();
    }

    pub fn status(&self) -> LinkStatus {
        self.session.status()
    }

    pub fn on_new_message(&self, handler: impl Fn(Message) + Send + Sync + 'static) {
        self.registry.handlers().new_message = Some(Arc::new(handler));
    }

    pub fn on_message_updated(&self, handler: impl Fn(Message) + Send + Sync + 'static) {
        self.registry.handlers().message_updated = Some(Arc::new(handler));
    }

    pub fn on_message_deleted(
        &self,
        handler: impl Fn((ConversationId, MessageId)) + Send + Sync + 'static,
    ) {
        self.registry.handlers().message_deleted = Some(Arc::new(handler));
    }

    pub fn on_user_online(&self, handler: impl Fn(UserId) + Send + Sync + 'static) {
        self.registry.handlers().user_online = Some(Arc::new(handler));
    }

    pub fn on_user_offline(&self, handler: impl Fn(UserId) + Send + Sync + 'static) {
        self.registry.handlers().user_offline = Some(Arc::new(handler));
    }

    pub fn on_online_users(&self, handler: impl Fn(Vec<UserId>) + Send + Sync + 'static) {
        self.registry.handlers().online_users = Some(Arc::new(handler));
    }

    pub fn on_typing(&self, handler: impl Fn(TypingSignal) + Send + Sync + 'static) {
        self.registry.handlers().typing = Some(Arc::new(handler));
    }

    pub fn off_new_message(&self) {
        self.registry.handlers().new_message = None;
    }

    pub fn off_message_updates(&self) {
        let mut handlers = self.registry.handlers();
        handlers.message_updated = None;
        handlers.message_deleted = None;
    }

    pub fn off_presence(&self) {
        let mut handlers = self.registry.handlers();
        handlers.user_online = None;
        handlers.user_offline = None;
        handlers.online_users = None;
    }

    pub fn off_typing(&self) {
        self.registry.handlers().typing = None;
    }

    pub fn off_all(&self) {
        *self.registry.handlers() = Handlers::default();
    }

    fn emit_advisory(&self, request: ClientRequest) {
        if let Err(err) = self.session.emit(&request) {
            debug!(event = request.name(), "router: emission dropped: {err}");
        }
    }

    pub fn join_conversation(&self, conversation_id: &ConversationId) {
        self.session.set_active_room(Some(conversation_id.clone()));
        self.emit_advisory(ClientRequest::JoinConversation {
            conversation_id: conversation_id.clone(),
        });
    }

    pub fn leave_conversation(&self, conversation_id: &ConversationId) {
        if self.session.active_room().as_ref() == Some(conversation_id) {
            self.session.set_active_room(None);
        }
        self.emit_advisory(ClientRequest::LeaveConversation {
            conversation_id: conversation_id.clone(),
        });
    }

    /// Leaves `from` and joins `to` as one transition, so at most one room is
    /// ever joined.
    pub fn switch_conversation(&self, from: Option<&ConversationId>, to: Option<&ConversationId>) {
        if from.is_some() && from == to {
            return;
        }
        if let Some(previous) = from {
            self.leave_conversation(previous);
        }
        match to {
            Some(next) => self.join_conversation(next),
            None => self.session.set_active_room(None),
        }
    }

    /// The only emission whose delivery failure is reported; the sender
    /// learns of success through its own `new_message` echo.
    pub fn send_message(
        &self,
        conversation_id: &ConversationId,
        text: &str,
    ) -> Result<(), TransportError> {
        self.session.emit(&ClientRequest::SendMessage {
            conversation_id: conversation_id.clone(),
            content: text.to_string(),
        })
    }

    pub fn set_typing(&self, conversation_id: &ConversationId, is_typing: bool) {
        self.emit_advisory(ClientRequest::Typing {
            conversation_id: conversation_id.clone(),
            is_typing,
        });
    }

    pub fn mark_as_read(&self, conversation_id: &ConversationId) {
        self.emit_advisory(ClientRequest::MarkAsRead {
            conversation_id: conversation_id.clone(),
        });
    }
}

#[cfg(test)]
#[path = "tests/router_tests.rs"]
mod tests;
