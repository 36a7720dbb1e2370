use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ConversationId);
id_newtype!(MessageId);

/// Body shown in place of a soft-deleted message.
pub const DELETED_MESSAGE_PLACEHOLDER: &str = "This message was deleted";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    #[serde(rename = "_id", alias = "id")]
    pub id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

/// A participant or sender, populated by the server or left as a bare id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserRef {
    Summary(UserSummary),
    Id(UserId),
}

impl UserRef {
    pub fn id(&self) -> &UserId {
        match self {
            UserRef::Summary(summary) => &summary.id,
            UserRef::Id(id) => id,
        }
    }

    pub fn display_name(&self) -> &str {
        match self {
            UserRef::Summary(summary) => summary.name.as_deref().unwrap_or(summary.id.as_str()),
            UserRef::Id(id) => id.as_str(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaRef {
    pub url: String,
    pub kind: MediaKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMessagePreview {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<UserRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    #[serde(rename = "_id", alias = "id")]
    pub id: ConversationId,
    pub user_id1: UserRef,
    pub user_id2: UserRef,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<LastMessagePreview>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Conversation {
    /// The participant that is not `me`. Falls back to `user_id2` when
    /// `me` is neither participant.
    pub fn peer(&self, me: &UserId) -> &UserRef {
        if self.user_id1.id() == me {
            &self.user_id2
        } else if self.user_id2.id() == me {
            &self.user_id1
        } else {
            &self.user_id2
        }
    }

    pub fn has_participant(&self, user_id: &UserId) -> bool {
        self.user_id1.id() == user_id || self.user_id2.id() == user_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    Sent,
    Edited,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "_id", alias = "id")]
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender: UserRef,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaRef>,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_edited: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn state(&self) -> MessageState {
        if self.is_deleted {
            MessageState::Deleted
        } else if self.is_edited {
            MessageState::Edited
        } else {
            MessageState::Sent
        }
    }

    /// Text to render; the placeholder once deleted.
    pub fn display_body(&self) -> &str {
        if self.is_deleted {
            DELETED_MESSAGE_PLACEHOLDER
        } else {
            self.content.as_deref().unwrap_or_default()
        }
    }

    pub fn mark_deleted(&mut self, at: DateTime<Utc>) {
        self.is_deleted = true;
        self.deleted_at.get_or_insert(at);
        self.content = Some(DELETED_MESSAGE_PLACEHOLDER.to_string());
        self.media = None;
    }

    pub fn preview(&self) -> LastMessagePreview {
        LastMessagePreview {
            content: Some(self.display_body().to_string()),
            sender: Some(self.sender.clone()),
            created_at: Some(self.created_at),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingSignal {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceFact {
    Online(UserId),
    Offline(UserId),
    Snapshot(Vec<UserId>),
}
