use shared::domain::{Conversation, ConversationId, Message, UserId};
use tracing::debug;

/// Ordered conversation summaries as last loaded, plus local optimistic edits.
#[derive(Debug, Default, Clone)]
pub struct ConversationStore {
    conversations: Vec<Conversation>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn get(&self, conversation_id: &ConversationId) -> Option<&Conversation> {
        self.conversations.iter().find(|c| &c.id == conversation_id)
    }

    fn get_mut(&mut self, conversation_id: &ConversationId) -> Option<&mut Conversation> {
        self.conversations
            .iter_mut()
            .find(|c| &c.id == conversation_id)
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    pub fn total_unread(&self) -> u32 {
        self.conversations.iter().map(|c| c.unread_count).sum()
    }

    /// Server truth replaces everything, optimistic edits included.
    pub fn replace_all(&mut self, conversations: Vec<Conversation>) {
        self.conversations = conversations;
    }

    /// Returns the count it replaced so a failed read call can put it back.
    pub fn optimistic_zero_unread(&mut self, conversation_id: &ConversationId) -> Option<u32> {
        let conversation = self.get_mut(conversation_id)?;
        let previous = conversation.unread_count;
        conversation.unread_count = 0;
        debug!(conversation_id = %conversation_id, previous, "conversations: unread zeroed optimistically");
        Some(previous)
    }

    /// Reverts an optimistic reset. Counts that grew since are kept.
    pub fn restore_unread(&mut self, conversation_id: &ConversationId, count: u32) {
        if let Some(conversation) = self.get_mut(conversation_id) {
            conversation.unread_count = conversation.unread_count.max(count);
        }
    }

    /// Folds a pushed message into its summary and moves that summary to the
    /// top. Unread only grows for conversations the user is not looking at.
    /// Returns false when the conversation is unknown and a reload is needed.
    pub fn record_incoming(&mut self, message: &Message, is_open: bool, me: Option<&UserId>) -> bool {
        let Some(index) = self
            .conversations
            .iter()
            .position(|c| c.id == message.conversation_id)
        else {
            return false;
        };

        let mut conversation = self.conversations.remove(index);
        let last_at = conversation
            .last_message
            .as_ref()
            .and_then(|preview| preview.created_at);
        if last_at.map_or(true, |last| message.created_at >= last) {
            conversation.last_message = Some(message.preview());
            conversation.updated_at = Some(message.created_at);
        }
        // A redelivered message carries the preview's own timestamp.
        let is_newer = last_at.map_or(true, |last| message.created_at > last);
        let from_me = me.is_some_and(|me| message.sender.id() == me);
        if is_newer && !is_open && !from_me {
            conversation.unread_count = conversation.unread_count.saturating_add(1);
        }
        self.conversations.insert(0, conversation);
        true
    }

    /// Keeps the preview in step with an edit or delete of the latest message.
    pub fn refresh_preview(&mut self, message: &Message) {
        if let Some(conversation) = self.get_mut(&message.conversation_id) {
            let matches_latest = conversation
                .last_message
                .as_ref()
                .and_then(|preview| preview.created_at)
                .is_some_and(|last| last == message.created_at);
            if matches_latest {
                conversation.last_message = Some(message.preview());
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/conversations_tests.rs"]
mod tests;
