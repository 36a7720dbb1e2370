//! Client core for one-to-one conversations: a reconnecting socket session,
//! named push-event routing, REST calls, and the view state a chat page renders.

pub mod api;
pub mod composer;
pub mod config;
pub mod controller;
pub mod conversations;
pub mod error;
pub mod router;
pub mod timeline;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use api::{MediaUpload, MessagingApi, RestApi};
pub use composer::{Composer, TypingNotifier};
pub use config::{load_settings, ClientSettings};
pub use controller::{ChatController, ChatEvent};
pub use conversations::ConversationStore;
pub use error::{ChatError, MediaError, TransportError};
pub use router::EventRouter;
pub use timeline::MessageTimeline;
pub use transport::{
    LinkStatus, ReconnectPolicy, SocketConnector, SocketLink, TransportSession,
    WebSocketConnector,
};
