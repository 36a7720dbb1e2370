use serde::{Deserialize, Serialize};

use crate::domain::{ConversationId, Message, MessageId, UserId};

/// Frames the client pushes over the socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientRequest {
    JoinConversation {
        conversation_id: ConversationId,
    },
    LeaveConversation {
        conversation_id: ConversationId,
    },
    SendMessage {
        conversation_id: ConversationId,
        content: String,
    },
    Typing {
        conversation_id: ConversationId,
        is_typing: bool,
    },
    MarkAsRead {
        conversation_id: ConversationId,
    },
}

impl ClientRequest {
    pub fn name(&self) -> &'static str {
        match self {
            ClientRequest::JoinConversation { .. } => "join_conversation",
            ClientRequest::LeaveConversation { .. } => "leave_conversation",
            ClientRequest::SendMessage { .. } => "send_message",
            ClientRequest::Typing { .. } => "typing",
            ClientRequest::MarkAsRead { .. } => "mark_as_read",
        }
    }
}

/// Frames the server pushes over the socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    NewMessage {
        message: Message,
    },
    MessageUpdated {
        message: Message,
    },
    MessageDeleted {
        message_id: MessageId,
        conversation_id: ConversationId,
    },
    UserOnline {
        user_id: UserId,
    },
    UserOffline {
        user_id: UserId,
    },
    OnlineUsers {
        user_ids: Vec<UserId>,
    },
    Typing {
        conversation_id: ConversationId,
        user_id: UserId,
    },
}

/// `{ data: T }` wrapper used by every REST response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataEnvelope<T> {
    pub data: T,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditMessageRequest {
    pub content: String,
}
