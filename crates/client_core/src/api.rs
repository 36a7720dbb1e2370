//! REST seam for conversations and messages.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{multipart, Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::{Conversation, ConversationId, Message, MessageId},
    error::{ApiError, ApiException},
    protocol::{DataEnvelope, EditMessageRequest},
};
use tokio::sync::RwLock;
use tracing::warn;

/// A file staged for `POST /messages/media`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaUpload {
    pub filename: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl MediaUpload {
    pub fn size_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }
}

#[async_trait]
pub trait MessagingApi: Send + Sync {
    /// Bearer credential for subsequent calls; backends without auth ignore it.
    async fn set_credential(&self, _credential: Option<String>) {}
    async fn list_conversations(&self) -> Result<Vec<Conversation>>;
    async fn list_messages(&self, conversation_id: &ConversationId) -> Result<Vec<Message>>;
    async fn send_media(
        &self,
        conversation_id: &ConversationId,
        content: Option<&str>,
        upload: MediaUpload,
    ) -> Result<Message>;
    async fn edit_message(&self, message_id: &MessageId, content: &str) -> Result<Message>;
    async fn delete_message(&self, message_id: &MessageId) -> Result<()>;
    async fn mark_conversation_read(&self, conversation_id: &ConversationId) -> Result<()>;
}

pub struct RestApi {
    http: Client,
    base_url: String,
    credential: RwLock<Option<String>>,
}

impl RestApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credential: RwLock::new(None),
        }
    }

    async fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match self.credential.read().await.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn execute(&self, request: RequestBuilder) -> Result<Response> {
        let response = self.authorized(request).await.send().await?;
        ensure_success(response).await
    }

    async fn fetch_list<T: DeserializeOwned>(&self, path: &str, what: &str) -> Result<Vec<T>> {
        let envelope: DataEnvelope<Vec<serde_json::Value>> = self
            .execute(self.http.get(format!("{}{path}", self.base_url)))
            .await?
            .json()
            .await
            .with_context(|| format!("invalid {what} list payload"))?;
        Ok(decode_entries(envelope.data, what))
    }
}

async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let error = ApiError::from_response(status.as_u16(), &body);
    Err(ApiException::from(error).into())
}

/// Keeps the entries that decode; a single malformed entry must not blank the list.
fn decode_entries<T: DeserializeOwned>(values: Vec<serde_json::Value>, what: &str) -> Vec<T> {
    values
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<T>(value) {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!("api: skipping malformed {what} entry: {err}");
                None
            }
        })
        .collect()
}

#[async_trait]
impl MessagingApi for RestApi {
    async fn set_credential(&self, credential: Option<String>) {
        *self.credential.write().await = credential;
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        self.fetch_list("/conversations", "conversation").await
    }

    async fn list_messages(&self, conversation_id: &ConversationId) -> Result<Vec<Message>> {
        self.fetch_list(&format!("/conversations/{conversation_id}/messages"), "message")
            .await
    }

    async fn send_media(
        &self,
        conversation_id: &ConversationId,
        content: Option<&str>,
        upload: MediaUpload,
    ) -> Result<Message> {
        let file = multipart::Part::bytes(upload.bytes)
            .file_name(upload.filename)
            .mime_str(&upload.mime_type)
            .with_context(|| format!("invalid mime type '{}'", upload.mime_type))?;
        let mut form = multipart::Form::new().text("conversationId", conversation_id.0.clone());
        if let Some(content) = content.filter(|c| !c.trim().is_empty()) {
            form = form.text("content", content.to_string());
        }
        let form = form.part("file", file);

        let envelope: DataEnvelope<Message> = self
            .execute(
                self.http
                    .post(format!("{}/messages/media", self.base_url))
                    .multipart(form),
            )
            .await?
            .json()
            .await
            .context("invalid media message payload")?;
        Ok(envelope.data)
    }

    async fn edit_message(&self, message_id: &MessageId, content: &str) -> Result<Message> {
        let envelope: DataEnvelope<Message> = self
            .execute(
                self.http
                    .patch(format!("{}/messages/{message_id}", self.base_url))
                    .json(&EditMessageRequest {
                        content: content.to_string(),
                    }),
            )
            .await?
            .json()
            .await
            .context("invalid edited message payload")?;
        Ok(envelope.data)
    }

    async fn delete_message(&self, message_id: &MessageId) -> Result<()> {
        self.execute(
            self.http
                .delete(format!("{}/messages/{message_id}", self.base_url)),
        )
        .await?;
        Ok(())
    }

    async fn mark_conversation_read(&self, conversation_id: &ConversationId) -> Result<()> {
        self.execute(
            self.http
                .post(format!("{}/conversations/{conversation_id}/read", self.base_url)),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
