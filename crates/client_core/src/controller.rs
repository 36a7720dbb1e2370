//! Page-level orchestration: owns the conversation list, the open timeline
//! and the composer, and wires them to the router and the REST seam.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, Weak},
};

use shared::domain::{
    Conversation, ConversationId, Message, MessageId, PresenceFact, TypingSignal, UserId,
};
use tokio::{sync::broadcast, time::Instant};
use tracing::{debug, info, warn};

use crate::{
    api::{MediaUpload, MessagingApi, RestApi},
    composer::Composer,
    config::ClientSettings,
    conversations::ConversationStore,
    error::ChatError,
    router::EventRouter,
    timeline::MessageTimeline,
    transport::{LinkStatus, ReconnectPolicy, SocketConnector, WebSocketConnector},
};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum ChatEvent {
    ConversationsChanged,
    TimelineChanged { conversation_id: ConversationId },
    Presence(PresenceFact),
    Typing(TypingSignal),
    /// Short user-facing message about a failed action.
    Notice(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ActiveConversation {
    id: ConversationId,
    generation: u64,
}

struct ChatView {
    me: Option<UserId>,
    conversations: ConversationStore,
    timeline: MessageTimeline,
    active: Option<ActiveConversation>,
    generation: u64,
    /// In-flight read calls per conversation.
    pending_reads: HashMap<ConversationId, usize>,
    peer_typing: HashMap<ConversationId, (UserId, Instant)>,
}

impl ChatView {
    fn new(timeline_window: usize) -> Self {
        Self {
            me: None,
            conversations: ConversationStore::new(),
            timeline: MessageTimeline::new(timeline_window),
            active: None,
            generation: 0,
            pending_reads: HashMap::new(),
            peer_typing: HashMap::new(),
        }
    }

    fn begin_pending_read(&mut self, conversation_id: &ConversationId) {
        *self.pending_reads.entry(conversation_id.clone()).or_default() += 1;
    }

    fn finish_pending_read(&mut self, conversation_id: &ConversationId) {
        if let Some(count) = self.pending_reads.get_mut(conversation_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.pending_reads.remove(conversation_id);
            }
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| active.generation == generation)
    }

    fn is_open(&self, conversation_id: &ConversationId) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| &active.id == conversation_id)
    }

    fn apply_conversations(&mut self, conversations: Vec<Conversation>) {
        self.conversations.replace_all(conversations);
        // A read still in flight wins over a list fetched before it landed.
        for conversation_id in self.pending_reads.keys() {
            self.conversations.optimistic_zero_unread(conversation_id);
        }
    }
}

/// State shared with router callbacks; holds no reference back to the router.
struct ChatCore {
    api: Arc<dyn MessagingApi>,
    view: Mutex<ChatView>,
    events: broadcast::Sender<ChatEvent>,
    typing_expiry: std::time::Duration,
}

impl ChatCore {
    fn view(&self) -> MutexGuard<'_, ChatView> {
        self.view
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: ChatEvent) {
        let _ = self.events.send(event);
    }

    fn notice(&self, text: impl Into<String>) {
        self.emit(ChatEvent::Notice(text.into()));
    }

    async fn refresh_conversations(&self) -> anyhow::Result<()> {
        let conversations = self.api.list_conversations().await?;
        let count = conversations.len();
        self.view().apply_conversations(conversations);
        debug!(count, "chat: conversation list refreshed");
        self.emit(ChatEvent::ConversationsChanged);
        Ok(())
    }

    fn on_new_message(self: &Arc<Self>, router: &Weak<EventRouter>, message: Message) {
        let (is_open, known, appended) = {
            let mut view = self.view();
            let is_open = view.is_open(&message.conversation_id);
            let me = view.me.clone();
            let known = view
                .conversations
                .record_incoming(&message, is_open, me.as_ref());
            let appended = is_open && view.timeline.append_if_absent(message.clone());
            let sender = message.sender.id();
            if view
                .peer_typing
                .get(&message.conversation_id)
                .is_some_and(|(user_id, _)| user_id == sender)
            {
                view.peer_typing.remove(&message.conversation_id);
            }
            (is_open, known, appended)
        };

        if appended {
            self.emit(ChatEvent::TimelineChanged {
                conversation_id: message.conversation_id.clone(),
            });
            if let Some(router) = router.upgrade() {
                router.mark_as_read(&message.conversation_id);
            }
        }
        if known {
            self.emit(ChatEvent::ConversationsChanged);
        } else {
            info!(
                conversation_id = %message.conversation_id,
                "chat: message for an unknown conversation, reloading list"
            );
            let core = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(err) = core.refresh_conversations().await {
                    warn!("chat: conversation reload failed: {err:#}");
                }
            });
        }
        debug!(
            message_id = %message.id,
            conversation_id = %message.conversation_id,
            is_open,
            "chat: new message"
        );
    }

    fn on_message_updated(&self, message: Message) {
        let conversation_id = message.conversation_id.clone();
        let changed = {
            let mut view = self.view();
            let changed = view.timeline.apply_server_update(message.clone());
            let merged = view.timeline.get(&message.id).cloned();
            view.conversations
                .refresh_preview(merged.as_ref().unwrap_or(&message));
            changed
        };
        if changed {
            self.emit(ChatEvent::TimelineChanged { conversation_id });
        }
        self.emit(ChatEvent::ConversationsChanged);
    }

    fn on_message_deleted(&self, conversation_id: ConversationId, message_id: MessageId) {
        {
            let mut view = self.view();
            if !view.is_open(&conversation_id) || view.timeline.soft_delete(&message_id).is_none() {
                return;
            }
            if let Some(deleted) = view.timeline.get(&message_id).cloned() {
                view.conversations.refresh_preview(&deleted);
            }
        }
        debug!(message_id = %message_id, conversation_id = %conversation_id, "chat: message deleted remotely");
        self.emit(ChatEvent::TimelineChanged { conversation_id });
        self.emit(ChatEvent::ConversationsChanged);
    }

    fn on_typing(&self, signal: TypingSignal) {
        {
            let mut view = self.view();
            if view.me.as_ref() == Some(&signal.user_id) {
                return;
            }
            let expires_at = Instant::now() + self.typing_expiry;
            view.peer_typing.insert(
                signal.conversation_id.clone(),
                (signal.user_id.clone(), expires_at),
            );
        }
        self.emit(ChatEvent::Typing(signal));
    }
}

pub struct ChatController {
    settings: ClientSettings,
    core: Arc<ChatCore>,
    router: Arc<EventRouter>,
    composer: Mutex<Composer>,
}

impl ChatController {
    /// REST and WebSocket backends built from `settings`.
    pub fn new(settings: ClientSettings) -> Self {
        let api = Arc::new(RestApi::new(settings.api_base_url.clone()));
        let connector = Arc::new(WebSocketConnector::new(settings.socket_url.clone()));
        Self::new_with_dependencies(settings, api, connector)
    }

    pub fn new_with_dependencies(
        settings: ClientSettings,
        api: Arc<dyn MessagingApi>,
        connector: Arc<dyn SocketConnector>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let router = Arc::new(EventRouter::new(
            connector,
            ReconnectPolicy::from_settings(&settings),
        ));
        let composer = Composer::with_limits(
            router.clone(),
            settings.typing_idle(),
            settings.max_media_bytes,
        );
        let core = Arc::new(ChatCore {
            api,
            view: Mutex::new(ChatView::new(settings.timeline_window)),
            events,
            typing_expiry: settings.typing_expiry(),
        });
        Self {
            settings,
            core,
            router,
            composer: Mutex::new(composer),
        }
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.router
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ChatEvent> {
        self.core.events.subscribe()
    }

    pub fn connection_status(&self) -> LinkStatus {
        self.router.status()
    }

    pub fn composer(&self) -> MutexGuard<'_, Composer> {
        self.composer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.core.view().conversations.list().to_vec()
    }

    pub fn total_unread(&self) -> u32 {
        self.core.view().conversations.total_unread()
    }

    pub fn timeline(&self) -> Vec<Message> {
        self.core.view().timeline.messages().to_vec()
    }

    pub fn selected(&self) -> Option<ConversationId> {
        self.core.view().active.as_ref().map(|active| active.id.clone())
    }

    /// True while a peer's typing signal for `conversation_id` has not expired.
    pub fn is_peer_typing(&self, conversation_id: &ConversationId) -> bool {
        let mut view = self.core.view();
        match view.peer_typing.get(conversation_id) {
            Some((_, expires_at)) if *expires_at > Instant::now() => true,
            Some(_) => {
                view.peer_typing.remove(conversation_id);
                false
            }
            None => false,
        }
    }

    /// Subscribes to push events, opens the socket and loads the list.
    pub async fn mount(
        &self,
        credential: Option<&str>,
        me: Option<UserId>,
    ) -> Result<(), ChatError> {
        info!(user_id = ?me, "chat: mounting");
        self.core.view().me = me;
        self.core
            .api
            .set_credential(credential.map(str::to_string))
            .await;
        self.subscribe();
        self.router.connect(credential).await;
        self.load_conversations().await
    }

    fn subscribe(&self) {
        let weak_router = Arc::downgrade(&self.router);
        let core = Arc::clone(&self.core);
        self.router
            .on_new_message(move |message| core.on_new_message(&weak_router, message));

        let core = Arc::clone(&self.core);
        self.router
            .on_message_updated(move |message| core.on_message_updated(message));

        let core = Arc::clone(&self.core);
        self.router.on_message_deleted(move |(conversation_id, message_id)| {
            core.on_message_deleted(conversation_id, message_id)
        });

        let core = Arc::clone(&self.core);
        self.router.on_user_online(move |user_id| {
            core.emit(ChatEvent::Presence(PresenceFact::Online(user_id)))
        });
        let core = Arc::clone(&self.core);
        self.router.on_user_offline(move |user_id| {
            core.emit(ChatEvent::Presence(PresenceFact::Offline(user_id)))
        });
        let core = Arc::clone(&self.core);
        self.router.on_online_users(move |user_ids| {
            core.emit(ChatEvent::Presence(PresenceFact::Snapshot(user_ids)))
        });

        let core = Arc::clone(&self.core);
        self.router.on_typing(move |signal| core.on_typing(signal));
    }

    /// Leaves the open room, drops every subscription and closes the socket.
    pub fn unmount(&self) {
        self.composer().reset();
        let previous = {
            let mut view = self.core.view();
            view.generation += 1;
            view.timeline.clear();
            view.peer_typing.clear();
            view.active.take().map(|active| active.id)
        };
        self.router.switch_conversation(previous.as_ref(), None);
        self.router.off_all();
        self.router.disconnect();
        info!("chat: unmounted");
    }

    pub async fn load_conversations(&self) -> Result<(), ChatError> {
        if let Err(err) = self.core.refresh_conversations().await {
            warn!("chat: loading conversations failed: {err:#}");
            self.core.notice("Could not load conversations");
            return Err(err.into());
        }
        Ok(())
    }

    /// Background re-fetch after an optimistic change; failures are only logged.
    pub async fn reconcile_conversations(&self) {
        if let Err(err) = self.core.refresh_conversations().await {
            warn!("chat: conversation reconcile failed: {err:#}");
        }
    }

    /// Opens `conversation_id`: switches rooms, loads recent history and
    /// marks it read. A page that resolves after a later selection is dropped.
    pub async fn select_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<(), ChatError> {
        let (previous, generation) = {
            let mut view = self.core.view();
            view.generation += 1;
            let generation = view.generation;
            let previous = view
                .active
                .replace(ActiveConversation {
                    id: conversation_id.clone(),
                    generation,
                })
                .map(|active| active.id);
            if previous.as_ref() != Some(conversation_id) {
                view.timeline.reset(Some(conversation_id.clone()));
            }
            (previous, generation)
        };

        if previous.as_ref() != Some(conversation_id) {
            let mut composer = self.composer();
            composer.stop_typing();
            composer.reset();
        }
        self.router
            .switch_conversation(previous.as_ref(), Some(conversation_id));
        info!(conversation_id = %conversation_id, generation, "chat: conversation selected");
        self.core.emit(ChatEvent::TimelineChanged {
            conversation_id: conversation_id.clone(),
        });

        let previous_unread = self.begin_read(conversation_id);
        let (loaded, read) = tokio::join!(
            self.load_recent(conversation_id, generation),
            self.finish_read(conversation_id, previous_unread),
        );
        loaded.and(read)
    }

    async fn load_recent(
        &self,
        conversation_id: &ConversationId,
        generation: u64,
    ) -> Result<(), ChatError> {
        match self.core.api.list_messages(conversation_id).await {
            Ok(page) => {
                let applied = {
                    let mut view = self.core.view();
                    view.is_current(generation)
                        && view.timeline.load_recent(conversation_id, page)
                };
                if applied {
                    self.core.emit(ChatEvent::TimelineChanged {
                        conversation_id: conversation_id.clone(),
                    });
                } else {
                    debug!(conversation_id = %conversation_id, generation, "chat: stale history page dropped");
                }
                Ok(())
            }
            Err(err) => {
                warn!(conversation_id = %conversation_id, "chat: loading messages failed: {err:#}");
                if self.core.view().is_current(generation) {
                    self.core.notice("Could not load messages");
                }
                Err(err.into())
            }
        }
    }

    /// Zeroes the unread badge immediately, then confirms over REST.
    pub async fn mark_as_read(&self, conversation_id: &ConversationId) -> Result<(), ChatError> {
        let previous_unread = self.begin_read(conversation_id);
        self.finish_read(conversation_id, previous_unread).await
    }

    fn begin_read(&self, conversation_id: &ConversationId) -> Option<u32> {
        let previous = {
            let mut view = self.core.view();
            view.begin_pending_read(conversation_id);
            view.conversations.optimistic_zero_unread(conversation_id)
        };
        if previous.is_some_and(|count| count > 0) {
            self.core.emit(ChatEvent::ConversationsChanged);
        }
        self.router.mark_as_read(conversation_id);
        previous
    }

    async fn finish_read(
        &self,
        conversation_id: &ConversationId,
        previous_unread: Option<u32>,
    ) -> Result<(), ChatError> {
        let result = self.core.api.mark_conversation_read(conversation_id).await;
        self.core.view().finish_pending_read(conversation_id);
        if let Err(err) = result {
            warn!(conversation_id = %conversation_id, "chat: mark as read failed: {err:#}");
            if let Some(count) = previous_unread {
                self.core
                    .view()
                    .conversations
                    .restore_unread(conversation_id, count);
                self.core.emit(ChatEvent::ConversationsChanged);
            }
            self.core.notice("Could not mark conversation as read");
            self.reconcile_conversations().await;
            return Err(err.into());
        }
        self.reconcile_conversations().await;
        Ok(())
    }

    fn active_conversation(&self) -> Result<ConversationId, ChatError> {
        self.selected().ok_or(ChatError::NoActiveConversation)
    }

    /// Updates the draft and drives the typing indicator for the open conversation.
    pub fn keystroke(&self, text: impl Into<String>) {
        let mut composer = self.composer();
        match self.selected() {
            Some(conversation_id) => composer.keystroke(&conversation_id, text),
            None => composer.set_draft(text),
        }
    }

    /// Sends the draft over the socket. The message reaches the timeline only
    /// through its `new_message` echo; on failure the draft is put back as typed.
    pub fn send_message(&self) -> Result<(), ChatError> {
        let conversation_id = self.active_conversation()?;
        let text = {
            let mut composer = self.composer();
            let text = composer
                .take_draft_for_send()
                .ok_or(ChatError::EmptyMessage)?;
            composer.stop_typing();
            text
        };

        if let Err(err) = self.router.send_message(&conversation_id, text.trim()) {
            warn!(conversation_id = %conversation_id, "chat: send failed: {err}");
            self.composer().restore_draft(text);
            self.core.notice(format!("Message not sent: {err}"));
            return Err(err.into());
        }
        debug!(conversation_id = %conversation_id, "chat: message emitted");
        Ok(())
    }

    /// Validates and stages a file; rejected files never reach the network.
    pub fn attach_media(&self, upload: MediaUpload) -> Result<(), ChatError> {
        if let Err(err) = self.composer().attach(upload) {
            self.core.notice(err.to_string());
            return Err(err.into());
        }
        Ok(())
    }

    /// Uploads the staged file with an optional caption and appends the
    /// stored message. Only one upload may run at a time.
    pub async fn send_media(&self, caption: Option<String>) -> Result<Message, ChatError> {
        let conversation_id = self.active_conversation()?;
        let upload = match self.composer().begin_upload() {
            Ok(upload) => upload,
            Err(err) => {
                self.core.notice(err.to_string());
                return Err(err.into());
            }
        };
        info!(
            conversation_id = %conversation_id,
            filename = %upload.filename,
            size_bytes = upload.size_bytes(),
            "chat: uploading media"
        );

        let result = self
            .core
            .api
            .send_media(&conversation_id, caption.as_deref(), upload)
            .await;
        self.composer().finish_upload();

        match result {
            Ok(message) => {
                let appended = {
                    let mut view = self.core.view();
                    let me = view.me.clone();
                    let is_open = view.is_open(&message.conversation_id);
                    view.conversations
                        .record_incoming(&message, is_open, me.as_ref());
                    view.timeline.append_if_absent(message.clone())
                };
                if appended {
                    self.core.emit(ChatEvent::TimelineChanged {
                        conversation_id: message.conversation_id.clone(),
                    });
                }
                self.core.emit(ChatEvent::ConversationsChanged);
                Ok(message)
            }
            Err(err) => {
                warn!(conversation_id = %conversation_id, "chat: media upload failed: {err:#}");
                self.core.notice("Could not send the file");
                Err(err.into())
            }
        }
    }

    pub async fn edit_message(&self, message_id: &MessageId, text: &str) -> Result<(), ChatError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        self.check_editable(message_id)?;

        match self.core.api.edit_message(message_id, text).await {
            Ok(updated) => {
                let edited = {
                    let mut view = self.core.view();
                    let body = updated.content.as_deref().unwrap_or(text);
                    let replaced = view.timeline.replace(message_id, body);
                    let current = view.timeline.get(message_id).cloned();
                    if let Some(current) = &current {
                        view.conversations.refresh_preview(current);
                    }
                    current.filter(|_| replaced)
                };
                if let Some(edited) = edited {
                    self.core.emit(ChatEvent::TimelineChanged {
                        conversation_id: edited.conversation_id,
                    });
                    self.core.emit(ChatEvent::ConversationsChanged);
                }
                Ok(())
            }
            Err(err) => {
                warn!(message_id = %message_id, "chat: edit failed: {err:#}");
                self.core.notice("Could not edit the message");
                Err(err.into())
            }
        }
    }

    fn check_editable(&self, message_id: &MessageId) -> Result<(), ChatError> {
        let view = self.core.view();
        match view.timeline.get(message_id) {
            None => Err(ChatError::UnknownMessage(message_id.clone())),
            Some(message) if message.is_deleted => {
                Err(ChatError::MessageDeleted(message_id.clone()))
            }
            Some(_) => Ok(()),
        }
    }

    /// Hides the message at once. A failed server delete is reported but the
    /// message stays deleted locally.
    pub async fn delete_message(&self, message_id: &MessageId) -> Result<(), ChatError> {
        let conversation_id = {
            let mut view = self.core.view();
            let Some(conversation_id) = view
                .timeline
                .get(message_id)
                .map(|message| message.conversation_id.clone())
            else {
                return Err(ChatError::UnknownMessage(message_id.clone()));
            };
            if view.timeline.soft_delete(message_id).is_none() {
                return Err(ChatError::MessageDeleted(message_id.clone()));
            }
            if let Some(deleted) = view.timeline.get(message_id).cloned() {
                view.conversations.refresh_preview(&deleted);
            }
            conversation_id
        };
        self.core.emit(ChatEvent::TimelineChanged { conversation_id });
        self.core.emit(ChatEvent::ConversationsChanged);

        if let Err(err) = self.core.api.delete_message(message_id).await {
            warn!(message_id = %message_id, "chat: server delete failed, keeping local deletion: {err:#}");
            self.core.notice("Could not delete the message on the server");
            return Err(err.into());
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/controller_tests.rs"]
mod tests;
