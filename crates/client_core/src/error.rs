use shared::domain::{ConversationId, MessageId};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("socket is not connected")]
    NotConnected,
    #[error("socket link closed while sending {0}")]
    LinkClosed(&'static str),
}

/// Rejections raised before any upload is attempted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("file is {size_bytes} bytes, the limit is {limit_bytes} bytes")]
    TooLarge { size_bytes: u64, limit_bytes: u64 },
    #[error("unsupported media type '{0}', only images and videos can be sent")]
    UnsupportedType(String),
    #[error("file is empty")]
    Empty,
    #[error("an upload is already in progress")]
    UploadInFlight,
    #[error("no file attached")]
    NothingAttached,
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("no conversation is open")]
    NoActiveConversation,
    #[error("conversation {0} is not open")]
    ConversationNotOpen(ConversationId),
    #[error("message {0} is not in the open conversation")]
    UnknownMessage(MessageId),
    #[error("message {0} was deleted")]
    MessageDeleted(MessageId),
    #[error("message text must not be empty")]
    EmptyMessage,
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("failed to send message: {0}")]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Api(#[from] anyhow::Error),
}
