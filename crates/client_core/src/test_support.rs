//! In-memory doubles for the socket and REST seams.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use shared::{
    domain::{Conversation, ConversationId, Message, MessageId, UserId, UserRef},
    protocol::{ClientRequest, ServerEvent},
};
use tokio::sync::{mpsc, Notify};

use crate::{
    api::{MediaUpload, MessagingApi},
    transport::{FrameSink, SocketConnector, SocketLink},
};

pub fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
}

pub fn message(id: &str, conversation_id: &str, sender: &str, content: &str, t: i64) -> Message {
    Message {
        id: MessageId::from(id),
        conversation_id: ConversationId::from(conversation_id),
        sender: UserRef::Id(UserId::from(sender)),
        content: Some(content.to_string()),
        media: None,
        is_deleted: false,
        deleted_at: None,
        is_edited: false,
        created_at: at(t),
    }
}

pub fn conversation(id: &str, user1: &str, user2: &str, unread: u32) -> Conversation {
    Conversation {
        id: ConversationId::from(id),
        user_id1: UserRef::Id(UserId::from(user1)),
        user_id2: UserRef::Id(UserId::from(user2)),
        unread_count: unread,
        last_message: None,
        updated_at: None,
    }
}

/// Polls `condition` while letting background tasks run; paused clocks auto-advance.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Server side of one in-memory link.
pub struct ServerEnd {
    pub to_client: mpsc::UnboundedSender<String>,
    pub from_client: mpsc::UnboundedReceiver<String>,
}

impl ServerEnd {
    pub fn push(&self, event: &ServerEvent) {
        let frame = serde_json::to_string(event).expect("encode server event");
        let _ = self.to_client.send(frame);
    }

    pub fn push_raw(&self, frame: &str) {
        let _ = self.to_client.send(frame.to_string());
    }

    /// Every frame the client has sent so far, decoded.
    pub fn drain(&mut self) -> Vec<ClientRequest> {
        let mut requests = Vec::new();
        while let Ok(frame) = self.from_client.try_recv() {
            requests.push(serde_json::from_str(&frame).expect("decode client frame"));
        }
        requests
    }
}

#[derive(Default)]
pub struct MemoryConnector {
    failures_remaining: Mutex<u32>,
    credentials: Mutex<Vec<Option<String>>>,
    ends: Mutex<VecDeque<ServerEnd>>,
}

impl MemoryConnector {
    pub fn failing_first(failures: u32) -> Self {
        Self {
            failures_remaining: Mutex::new(failures),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.credentials.lock().unwrap().len()
    }

    pub fn credentials(&self) -> Vec<Option<String>> {
        self.credentials.lock().unwrap().clone()
    }

    pub fn links(&self) -> usize {
        self.ends.lock().unwrap().len()
    }

    /// Removes the oldest established link's server end.
    pub fn take_end(&self) -> ServerEnd {
        self.ends
            .lock()
            .unwrap()
            .pop_front()
            .expect("no link established")
    }
}

#[async_trait]
impl SocketConnector for MemoryConnector {
    async fn connect(&self, credential: Option<&str>) -> Result<SocketLink> {
        self.credentials
            .lock()
            .unwrap()
            .push(credential.map(str::to_string));
        {
            let mut failures = self.failures_remaining.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(anyhow!("connection refused"));
            }
        }
        let (outbound, from_client) = mpsc::unbounded_channel();
        let (to_client, inbound) = mpsc::unbounded_channel();
        self.ends.lock().unwrap().push_back(ServerEnd {
            to_client,
            from_client,
        });
        Ok(SocketLink { outbound, inbound })
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub frames: Mutex<Vec<String>>,
}

impl FrameSink for RecordingSink {
    fn deliver(&self, frame: &str) {
        self.frames.lock().unwrap().push(frame.to_string());
    }
}

/// Scripted REST backend. Calls to gated operations park until `release()`.
#[derive(Default)]
pub struct MockApi {
    pub conversations: Mutex<Vec<Conversation>>,
    pub messages: Mutex<Vec<Message>>,
    pub media_reply: Mutex<Option<Message>>,
    pub fail_conversations: Mutex<bool>,
    pub fail_messages: Mutex<bool>,
    pub fail_edit: Mutex<bool>,
    pub fail_delete: Mutex<bool>,
    pub fail_read: Mutex<bool>,
    pub fail_media: Mutex<bool>,
    pub gate_messages: Mutex<bool>,
    pub gate_media: Mutex<bool>,
    pub gate: Arc<Notify>,
    pub calls: Mutex<Vec<String>>,
}

impl MockApi {
    pub fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    pub fn release(&self) {
        self.gate.notify_one();
    }

    pub fn set(flag: &Mutex<bool>, value: bool) {
        *flag.lock().unwrap() = value;
    }

    fn flag(flag: &Mutex<bool>) -> bool {
        *flag.lock().unwrap()
    }
}

#[async_trait]
impl MessagingApi for MockApi {
    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        self.record("list_conversations");
        if Self::flag(&self.fail_conversations) {
            return Err(anyhow!("conversations unavailable"));
        }
        Ok(self.conversations.lock().unwrap().clone())
    }

    async fn list_messages(&self, conversation_id: &ConversationId) -> Result<Vec<Message>> {
        self.record(format!("list_messages:{conversation_id}"));
        let gated = Self::flag(&self.gate_messages);
        if gated {
            self.gate.notified().await;
        }
        if Self::flag(&self.fail_messages) {
            return Err(anyhow!("messages unavailable"));
        }
        Ok(self
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| &m.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    async fn send_media(
        &self,
        conversation_id: &ConversationId,
        content: Option<&str>,
        upload: MediaUpload,
    ) -> Result<Message> {
        self.record(format!(
            "send_media:{conversation_id}:{}:{}",
            content.unwrap_or_default(),
            upload.filename
        ));
        if Self::flag(&self.gate_media) {
            self.gate.notified().await;
        }
        if Self::flag(&self.fail_media) {
            return Err(anyhow!("upload rejected"));
        }
        self.media_reply
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow!("no media reply scripted"))
    }

    async fn edit_message(&self, message_id: &MessageId, content: &str) -> Result<Message> {
        self.record(format!("edit_message:{message_id}:{content}"));
        if Self::flag(&self.fail_edit) {
            return Err(anyhow!("edit rejected"));
        }
        let mut edited = self
            .messages
            .lock()
            .unwrap()
            .iter()
            .find(|m| &m.id == message_id)
            .cloned()
            .ok_or_else(|| anyhow!("message not found"))?;
        edited.content = Some(content.to_string());
        edited.is_edited = true;
        Ok(edited)
    }

    async fn delete_message(&self, message_id: &MessageId) -> Result<()> {
        self.record(format!("delete_message:{message_id}"));
        if Self::flag(&self.fail_delete) {
            return Err(anyhow!("delete rejected"));
        }
        Ok(())
    }

    async fn mark_conversation_read(&self, conversation_id: &ConversationId) -> Result<()> {
        self.record(format!("mark_read:{conversation_id}"));
        if Self::flag(&self.fail_read) {
            return Err(anyhow!("read receipt rejected"));
        }
        if let Some(conversation) = self
            .conversations
            .lock()
            .unwrap()
            .iter_mut()
            .find(|c| &c.id == conversation_id)
        {
            conversation.unread_count = 0;
        }
        Ok(())
    }
}
