use std::collections::HashSet;

use chrono::Utc;
use shared::domain::{ConversationId, Message, MessageId};
use tracing::{debug, trace};

pub const DEFAULT_TIMELINE_WINDOW: usize = 50;

/// The newest messages of the open conversation, oldest first.
///
/// Every mutation is keyed by message id so REST pages and socket pushes can
/// land in either order with the same result.
#[derive(Debug, Clone)]
pub struct MessageTimeline {
    conversation_id: Option<ConversationId>,
    messages: Vec<Message>,
    window: usize,
    tombstones: HashSet<MessageId>,
}

impl Default for MessageTimeline {
    fn default() -> Self {
        Self::new(DEFAULT_TIMELINE_WINDOW)
    }
}

impl MessageTimeline {
    pub fn new(window: usize) -> Self {
        Self {
            conversation_id: None,
            messages: Vec::new(),
            window: window.max(1),
            tombstones: HashSet::new(),
        }
    }

    pub fn conversation_id(&self) -> Option<&ConversationId> {
        self.conversation_id.as_ref()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn get(&self, message_id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.id == message_id)
    }

    fn get_mut(&mut self, message_id: &MessageId) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| &m.id == message_id)
    }

    pub fn contains(&self, message_id: &MessageId) -> bool {
        self.get(message_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Points the window at another conversation (or none) and empties it.
    /// Tombstones are kept: message ids are global, and a local deletion must
    /// survive switching away and back.
    pub fn reset(&mut self, conversation_id: Option<ConversationId>) {
        self.conversation_id = conversation_id;
        self.messages.clear();
    }

    /// Drops everything, tombstones included. Used when the page unmounts.
    pub fn clear(&mut self) {
        self.reset(None);
        self.tombstones.clear();
    }

    fn is_open(&self, conversation_id: &ConversationId) -> bool {
        self.conversation_id.as_ref() == Some(conversation_id)
    }

    /// Applies a fetched page. Entries already held win over the page, since
    /// the page may predate an edit or delete applied here; a page entry only
    /// upgrades one that is not yet edited or deleted.
    pub fn load_recent(&mut self, conversation_id: &ConversationId, page: Vec<Message>) -> bool {
        if !self.is_open(conversation_id) {
            debug!(conversation_id = %conversation_id, "timeline: dropping page for a conversation that is not open");
            return false;
        }

        let mut page = page;
        page.sort_by_key(|m| m.created_at);
        for message in page {
            if !self.upgrade_existing(&message) {
                self.insert_if_absent(message);
            }
        }
        self.trim();
        true
    }

    /// `false` when the id is not held yet.
    fn upgrade_existing(&mut self, incoming: &Message) -> bool {
        let Some(existing) = self.get_mut(&incoming.id) else {
            return false;
        };
        if existing.is_deleted {
            return true;
        }
        if incoming.is_deleted {
            let at = incoming.deleted_at.unwrap_or_else(Utc::now);
            existing.mark_deleted(at);
            self.tombstones.insert(incoming.id.clone());
        } else if incoming.is_edited && !existing.is_edited {
            existing.content = incoming.content.clone();
            existing.media = incoming.media.clone();
            existing.is_edited = true;
        }
        true
    }

    /// Idempotent insert; `false` when the id is already present or the
    /// message belongs to another conversation.
    pub fn append_if_absent(&mut self, message: Message) -> bool {
        if !self.is_open(&message.conversation_id) {
            trace!(message_id = %message.id, "timeline: ignoring message for another conversation");
            return false;
        }
        let message_id = message.id.clone();
        if !self.insert_if_absent(message) {
            trace!(message_id = %message_id, "timeline: duplicate delivery suppressed");
            return false;
        }
        self.trim();
        self.contains(&message_id)
    }

    fn insert_if_absent(&mut self, mut message: Message) -> bool {
        if self.contains(&message.id) {
            return false;
        }
        if self.tombstones.contains(&message.id) && !message.is_deleted {
            message.mark_deleted(Utc::now());
        }
        let index = self
            .messages
            .partition_point(|existing| existing.created_at <= message.created_at);
        self.messages.insert(index, message);
        true
    }

    fn trim(&mut self) {
        if self.messages.len() > self.window {
            let excess = self.messages.len() - self.window;
            self.messages.drain(..excess);
        }
    }

    /// Body replacement after a confirmed edit. Deleted messages are final.
    pub fn replace(&mut self, message_id: &MessageId, new_body: &str) -> bool {
        match self.get_mut(message_id) {
            Some(message) if !message.is_deleted => {
                message.content = Some(new_body.to_string());
                message.is_edited = true;
                true
            }
            _ => false,
        }
    }

    /// Marks the message deleted ahead of server confirmation and returns the
    /// snapshot it replaced. `None` if unknown or already deleted.
    pub fn soft_delete(&mut self, message_id: &MessageId) -> Option<Message> {
        self.tombstones.insert(message_id.clone());
        let message = self.get_mut(message_id)?;
        if message.is_deleted {
            return None;
        }
        let previous = message.clone();
        message.mark_deleted(Utc::now());
        Some(previous)
    }

    /// Merges a server-side edit or delete of an existing message.
    pub fn apply_server_update(&mut self, update: Message) -> bool {
        if !self.is_open(&update.conversation_id) {
            return false;
        }
        if update.is_deleted {
            self.tombstones.insert(update.id.clone());
        }
        let Some(existing) = self.get_mut(&update.id) else {
            return false;
        };
        if existing.is_deleted {
            return false;
        }
        let created_at = existing.created_at;
        *existing = update;
        existing.created_at = created_at;
        if existing.is_deleted {
            let at = existing.deleted_at.unwrap_or_else(Utc::now);
            existing.mark_deleted(at);
        }
        true
    }
}

#[cfg(test)]
#[path = "tests/timeline_tests.rs"]
mod tests;
