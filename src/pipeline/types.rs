//! Shared types for the forwarding pipeline.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{DeliveryError, MediaError};

// ── Inbound envelope ────────────────────────────────────────────────

/// One inbound message, as seen by the pipeline.
///
/// Platform adapters convert their native updates into this struct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Chat the message was posted in (any id encoding).
    pub source_id: i64,
    /// Platform message id, unique within the source chat.
    pub message_id: i64,
    /// Present iff the message is one item of a multi-item post.
    pub group_id: Option<String>,
    pub sender_id: i64,
    /// Message text or media caption; may be empty.
    pub text: String,
    pub media: Option<MediaRef>,
    pub is_reply: bool,
    /// Author of the replied-to message, when the platform exposes it.
    pub replied_sender_id: Option<i64>,
}

impl MessageEnvelope {
    /// Build a plain text envelope (no media, not a reply).
    pub fn text(source_id: i64, message_id: i64, sender_id: i64, text: impl Into<String>) -> Self {
        Self {
            source_id,
            message_id,
            group_id: None,
            sender_id,
            text: text.into(),
            media: None,
            is_reply: false,
            replied_sender_id: None,
        }
    }

    pub fn with_media(mut self, media: MediaRef) -> Self {
        self.media = Some(media);
        self
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn as_reply_to(mut self, replied_sender_id: Option<i64>) -> Self {
        self.is_reply = true;
        self.replied_sender_id = replied_sender_id;
        self
    }

    /// Content classification used by the kind filters.
    pub fn content_kind(&self) -> ContentKind {
        match &self.media {
            None => ContentKind::Text,
            Some(media) => match media.effective_kind() {
                MediaKind::Photo => ContentKind::Photo,
                MediaKind::Video => ContentKind::Video,
                MediaKind::Document => ContentKind::Document,
                MediaKind::Audio => ContentKind::Audio,
            },
        }
    }

    pub fn has_text(&self) -> bool {
        !self.text.trim().is_empty()
    }
}

// ── Media ───────────────────────────────────────────────────────────

/// Platform media kind, as declared by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
    Document,
    Audio,
}

impl MediaKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Photo => "photo",
            Self::Video => "video",
            Self::Document => "document",
            Self::Audio => "audio",
        }
    }
}

/// Opaque reference to media attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub kind: MediaKind,
    /// Platform handle used to fetch the bytes.
    pub handle: String,
    pub mime_type: Option<String>,
    pub file_name: Option<String>,
    /// Platform-provided preview image, if any.
    pub thumbnail_handle: Option<String>,
}

impl MediaRef {
    pub fn new(kind: MediaKind, handle: impl Into<String>) -> Self {
        Self {
            kind,
            handle: handle.into(),
            mime_type: None,
            file_name: None,
            thumbnail_handle: None,
        }
    }

    pub fn with_mime_type(mut self, mime: impl Into<String>) -> Self {
        self.mime_type = Some(mime.into());
        self
    }

    pub fn with_thumbnail(mut self, handle: impl Into<String>) -> Self {
        self.thumbnail_handle = Some(handle.into());
        self
    }

    /// Kind after looking at the underlying media type: a document whose
    /// MIME type is `video/*` is a video.
    pub fn effective_kind(&self) -> MediaKind {
        match self.kind {
            MediaKind::Document
                if self
                    .mime_type
                    .as_deref()
                    .is_some_and(|m| m.to_ascii_lowercase().starts_with("video/")) =>
            {
                MediaKind::Video
            }
            kind => kind,
        }
    }
}

/// Coarse content classification for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Photo,
    Video,
    Document,
    Audio,
    /// No media at all.
    Text,
}

// ── Outbound ────────────────────────────────────────────────────────

/// A resolved media item ready to upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundItem {
    pub kind: MediaKind,
    pub body: Vec<u8>,
    pub thumbnail: Option<Vec<u8>>,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
}

impl OutboundItem {
    /// File name to upload under, falling back to a per-kind default.
    pub fn upload_name(&self) -> String {
        if let Some(name) = self.file_name.as_deref().filter(|n| !n.is_empty()) {
            return name.to_string();
        }
        match self.kind {
            MediaKind::Photo => "photo.jpg",
            MediaKind::Video => "video.mp4",
            MediaKind::Document => "file",
            MediaKind::Audio => "audio.mp3",
        }
        .to_string()
    }
}

// ── Collaborator traits ─────────────────────────────────────────────

/// Platform send primitive.
#[async_trait]
pub trait OutboundSender: Send + Sync {
    /// Send one or more media items as a single post with `caption`.
    async fn send_items(
        &self,
        destination: i64,
        items: Vec<OutboundItem>,
        caption: &str,
    ) -> Result<(), DeliveryError>;

    /// Send a plain text message.
    async fn send_text(&self, destination: i64, text: &str) -> Result<(), DeliveryError>;
}

/// Fetches media bytes for outbound re-upload.
#[async_trait]
pub trait MediaResolver: Send + Sync {
    async fn fetch_media(&self, media: &MediaRef) -> Result<Vec<u8>, MediaError>;

    /// Best-effort preview image; `None` is never an error.
    async fn thumbnail(&self, media: &MediaRef, body: &[u8]) -> Option<Vec<u8>>;
}
