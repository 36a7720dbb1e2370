//! Draft text, pending attachment and the typing-indicator debounce.

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use shared::domain::ConversationId;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::{api::MediaUpload, error::MediaError, router::EventRouter};

pub const DEFAULT_TYPING_IDLE: Duration = Duration::from_millis(1_500);
pub const DEFAULT_MAX_MEDIA_BYTES: u64 = 50 * 1024 * 1024;

const ALLOWED_MEDIA_PREFIXES: [&str; 2] = ["image/", "video/"];

pub trait TypingNotifier: Send + Sync {
    fn set_typing(&self, conversation_id: &ConversationId, is_typing: bool);
}

impl TypingNotifier for EventRouter {
    fn set_typing(&self, conversation_id: &ConversationId, is_typing: bool) {
        EventRouter::set_typing(self, conversation_id, is_typing);
    }
}

pub fn validate_media(upload: &MediaUpload, max_bytes: u64) -> Result<(), MediaError> {
    if upload.bytes.is_empty() {
        return Err(MediaError::Empty);
    }
    if upload.size_bytes() > max_bytes {
        return Err(MediaError::TooLarge {
            size_bytes: upload.size_bytes(),
            limit_bytes: max_bytes,
        });
    }
    let mime = upload.mime_type.to_ascii_lowercase();
    if !ALLOWED_MEDIA_PREFIXES
        .iter()
        .any(|prefix| mime.starts_with(prefix))
    {
        return Err(MediaError::UnsupportedType(upload.mime_type.clone()));
    }
    Ok(())
}

#[derive(Default)]
struct TypingState {
    conversation_id: Option<ConversationId>,
    is_typing: bool,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

pub struct Composer {
    notifier: Arc<dyn TypingNotifier>,
    idle: Duration,
    max_media_bytes: u64,
    draft: String,
    attachment: Option<MediaUpload>,
    uploading: bool,
    emoji_picker_open: bool,
    typing: Arc<Mutex<TypingState>>,
}

fn lock_typing(typing: &Mutex<TypingState>) -> MutexGuard<'_, TypingState> {
    typing.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Composer {
    pub fn new(notifier: Arc<dyn TypingNotifier>) -> Self {
        Self::with_limits(notifier, DEFAULT_TYPING_IDLE, DEFAULT_MAX_MEDIA_BYTES)
    }

    pub fn with_limits(
        notifier: Arc<dyn TypingNotifier>,
        idle: Duration,
        max_media_bytes: u64,
    ) -> Self {
        Self {
            notifier,
            idle,
            max_media_bytes,
            draft: String::new(),
            attachment: None,
            uploading: false,
            emoji_picker_open: false,
            typing: Arc::new(Mutex::new(TypingState::default())),
        }
    }

    pub fn draft(&self) -> &str {
        &self.draft
    }

    pub fn set_draft(&mut self, text: impl Into<String>) {
        self.draft = text.into();
    }

    /// Empties the draft and returns it exactly as typed, so a failed send can
    /// put it back untouched. Callers trim before sending. `None` when blank.
    pub fn take_draft_for_send(&mut self) -> Option<String> {
        if self.draft.trim().is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.draft))
    }

    /// Puts a failed send back unless the user has started a new draft.
    pub fn restore_draft(&mut self, text: String) -> bool {
        if !self.draft.trim().is_empty() {
            return false;
        }
        self.draft = text;
        true
    }

    pub fn is_emoji_picker_open(&self) -> bool {
        self.emoji_picker_open
    }

    pub fn toggle_emoji_picker(&mut self) -> bool {
        self.emoji_picker_open = !self.emoji_picker_open;
        self.emoji_picker_open
    }

    pub fn insert_emoji(&mut self, emoji: &str) {
        self.draft.push_str(emoji);
        self.emoji_picker_open = false;
    }

    pub fn attachment(&self) -> Option<&MediaUpload> {
        self.attachment.as_ref()
    }

    /// Validates before staging, so a bad file never reaches the network.
    pub fn attach(&mut self, upload: MediaUpload) -> Result<(), MediaError> {
        validate_media(&upload, self.max_media_bytes)?;
        self.attachment = Some(upload);
        Ok(())
    }

    pub fn clear_attachment(&mut self) {
        self.attachment = None;
    }

    pub fn is_uploading(&self) -> bool {
        self.uploading
    }

    /// Hands out the staged file and blocks further submissions until
    /// `finish_upload`.
    pub fn begin_upload(&mut self) -> Result<MediaUpload, MediaError> {
        if self.uploading {
            return Err(MediaError::UploadInFlight);
        }
        let upload = self.attachment.take().ok_or(MediaError::NothingAttached)?;
        self.uploading = true;
        Ok(upload)
    }

    pub fn finish_upload(&mut self) {
        self.uploading = false;
    }

    pub fn is_typing(&self) -> bool {
        lock_typing(&self.typing).is_typing
    }

    /// Records input for `conversation_id`: one `typing=true` per burst, and
    /// `typing=false` once input has been idle for the configured gap.
    pub fn keystroke(&mut self, conversation_id: &ConversationId, text: impl Into<String>) {
        self.draft = text.into();

        let mut emissions = Vec::new();
        let mut typing = lock_typing(&self.typing);
        if typing.is_typing && typing.conversation_id.as_ref() != Some(conversation_id) {
            if let Some(previous) = typing.conversation_id.take() {
                emissions.push((previous, false));
            }
            typing.is_typing = false;
        }
        if !typing.is_typing {
            typing.is_typing = true;
            typing.conversation_id = Some(conversation_id.clone());
            emissions.push((conversation_id.clone(), true));
        }

        typing.generation += 1;
        let generation = typing.generation;
        if let Some(timer) = typing.timer.take() {
            timer.abort();
        }
        let state = Arc::clone(&self.typing);
        let notifier = Arc::clone(&self.notifier);
        let idle = self.idle;
        typing.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            let expired = {
                let mut typing = lock_typing(&state);
                if typing.generation != generation || !typing.is_typing {
                    return;
                }
                typing.is_typing = false;
                typing.timer = None;
                typing.conversation_id.take()
            };
            if let Some(conversation_id) = expired {
                trace!(conversation_id = %conversation_id, "composer: typing idle");
                notifier.set_typing(&conversation_id, false);
            }
        }));
        drop(typing);

        for (conversation_id, is_typing) in emissions {
            self.notifier.set_typing(&conversation_id, is_typing);
        }
    }

    /// Cancels the timer and reports `typing=false` if a burst was active.
    pub fn stop_typing(&mut self) {
        if let Some(conversation_id) = self.clear_typing() {
            self.notifier.set_typing(&conversation_id, false);
        }
    }

    /// Cancels the timer without emitting anything.
    pub fn cancel_typing(&mut self) {
        self.clear_typing();
    }

    fn clear_typing(&mut self) -> Option<ConversationId> {
        let mut typing = lock_typing(&self.typing);
        typing.generation += 1;
        if let Some(timer) = typing.timer.take() {
            timer.abort();
        }
        let was_typing = std::mem::take(&mut typing.is_typing);
        let conversation_id = typing.conversation_id.take();
        conversation_id.filter(|_| was_typing)
    }

    /// Resets everything tied to the open conversation.
    pub fn reset(&mut self) {
        self.cancel_typing();
        self.draft.clear();
        self.attachment = None;
        self.emoji_picker_open = false;
    }
}

impl Drop for Composer {
    fn drop(&mut self) {
        self.cancel_typing();
    }
}

#[cfg(test)]
#[path = "tests/composer_tests.rs"]
mod tests;
