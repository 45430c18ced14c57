//! Telegram channel: long-polls the Bot API for updates and delivers posts.
//!
//! Inbound, updates become [`InboundEvent`]s: channel posts and chat
//! messages are converted to [`MessageEnvelope`]s, admin commands sent in a
//! private chat are surfaced separately. Outbound, the channel implements
//! the pipeline's [`OutboundSender`], [`MediaResolver`] and [`BatchCopier`]
//! seams on top of the same HTTP client.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use reqwest::multipart::{Form, Part};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use crate::error::{ChannelError, DeliveryError, MediaError};
use crate::pipeline::batch::BatchCopier;
use crate::pipeline::types::{
    MediaKind, MediaRef, MediaResolver, MessageEnvelope, OutboundItem, OutboundSender,
};

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;
/// Maximum caption length on media posts.
const TELEGRAM_MAX_CAPTION_LENGTH: usize = 1024;
/// sendMediaGroup accepts 2..=10 items.
const MEDIA_GROUP_LIMIT: usize = 10;
/// Bot API refuses getFile downloads above this size.
const MAX_DOWNLOAD_BYTES: u64 = 20 * 1024 * 1024;
/// Long-poll timeout passed to getUpdates, in seconds.
const POLL_TIMEOUT_SECS: u64 = 30;
const POLL_BACKOFF: Duration = Duration::from_secs(5);

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Something that arrived from the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// A post or message to run through the forwarding engine.
    Message(MessageEnvelope),
    /// An admin command from a private chat.
    Command {
        chat_id: i64,
        sender_id: i64,
        text: String,
    },
}

pub type EventStream = Pin<Box<dyn Stream<Item = InboundEvent> + Send>>;

/// Telegram channel: connects to the Bot API via long-polling.
#[derive(Clone)]
pub struct TelegramChannel {
    bot_token: SecretString,
    admin_ids: Vec<i64>,
    client: reqwest::Client,
    api_base: String,
}

impl TelegramChannel {
    pub fn new(bot_token: SecretString, admin_ids: Vec<i64>) -> Self {
        Self {
            bot_token,
            admin_ids,
            client: reqwest::Client::new(),
            api_base: DEFAULT_API_BASE.to_string(),
        }
    }

    /// Point the channel at another Bot API server (self-hosted or test).
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.api_base,
            self.bot_token.expose_secret()
        )
    }

    fn file_url(&self, file_path: &str) -> String {
        format!(
            "{}/file/bot{}/{file_path}",
            self.api_base,
            self.bot_token.expose_secret()
        )
    }

    /// Verify the token with `getMe`.
    pub async fn health_check(&self) -> Result<(), ChannelError> {
        let resp = self
            .client
            .get(self.api_url("getMe"))
            .send()
            .await
            .map_err(|e| ChannelError::StartupFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ChannelError::StartupFailed {
                name: "telegram".into(),
                reason: format!("getMe returned {}", resp.status()),
            })
        }
    }

    /// Start long-polling and return the stream of inbound events.
    ///
    /// The poll task ends when the returned stream is dropped.
    pub fn start(&self) -> EventStream {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let channel = self.clone();

        tokio::spawn(async move {
            let mut offset: i64 = 0;

            info!("Telegram channel listening for updates...");

            loop {
                let body = serde_json::json!({
                    "offset": offset,
                    "timeout": POLL_TIMEOUT_SECS,
                    "allowed_updates": ["message", "channel_post"]
                });

                let resp = match channel
                    .client
                    .post(channel.api_url("getUpdates"))
                    .json(&body)
                    .send()
                    .await
                {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("Telegram poll error: {e}");
                        tokio::time::sleep(POLL_BACKOFF).await;
                        continue;
                    }
                };

                let data: Value = match resp.json().await {
                    Ok(d) => d,
                    Err(e) => {
                        warn!("Telegram parse error: {e}");
                        tokio::time::sleep(POLL_BACKOFF).await;
                        continue;
                    }
                };

                let Some(results) = data.get("result").and_then(Value::as_array) else {
                    let description = data
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    warn!(description, "Telegram getUpdates returned no result");
                    tokio::time::sleep(POLL_BACKOFF).await;
                    continue;
                };

                for update in results {
                    // Advance offset past this update
                    if let Some(uid) = update.get("update_id").and_then(Value::as_i64) {
                        offset = uid + 1;
                    }

                    let Some(event) = parse_update(update, &channel.admin_ids) else {
                        continue;
                    };

                    if tx.send(event).is_err() {
                        info!("Telegram listener channel closed");
                        return;
                    }
                }
            }
        });

        Box::pin(UnboundedReceiverStream::new(rx))
    }

    /// POST a Bot API call and map a failure onto a delivery error.
    async fn call(
        &self,
        destination: i64,
        request: reqwest::RequestBuilder,
    ) -> Result<Value, DeliveryError> {
        let resp = request.send().await.map_err(|e| DeliveryError::Transient {
            destination,
            reason: e.to_string(),
            retry_after: None,
        })?;

        let status = resp.status().as_u16();
        let body: Value = resp.json().await.unwrap_or(Value::Null);

        if (200..300).contains(&status) && body.get("ok").and_then(Value::as_bool) != Some(false) {
            return Ok(body);
        }
        Err(classify_failure(destination, status, &body))
    }

    async fn send_message_chunk(&self, destination: i64, text: &str) -> Result<(), DeliveryError> {
        let body = serde_json::json!({
            "chat_id": destination,
            "text": text,
        });
        self.call(
            destination,
            self.client.post(self.api_url("sendMessage")).json(&body),
        )
        .await?;
        Ok(())
    }

    /// Send one media item, optionally captioned.
    async fn send_single(
        &self,
        destination: i64,
        item: OutboundItem,
        caption: Option<&str>,
    ) -> Result<(), DeliveryError> {
        let (method, field) = single_method(item.kind);
        let name = item.upload_name();

        let mut form = Form::new()
            .text("chat_id", destination.to_string())
            .part(field, media_part(item.body, &name));

        if let Some(thumb) = item.thumbnail {
            if item.kind != MediaKind::Photo {
                form = form.part("thumbnail", Part::bytes(thumb).file_name("thumb.jpg"));
            }
        }
        if item.kind == MediaKind::Video {
            form = form.text("supports_streaming", "true");
        }
        if let Some(cap) = caption.filter(|c| !c.is_empty()) {
            form = form.text("caption", cap.to_string());
        }

        self.call(
            destination,
            self.client.post(self.api_url(method)).multipart(form),
        )
        .await?;
        debug!(destination, method, file = %name, "Telegram media sent");
        Ok(())
    }

    /// Send 2..=10 items as one media group.
    async fn send_group(
        &self,
        destination: i64,
        items: Vec<OutboundItem>,
        caption: Option<&str>,
    ) -> Result<(), DeliveryError> {
        let descriptors = media_group_descriptors(&items, caption);

        let mut form = Form::new()
            .text("chat_id", destination.to_string())
            .text("media", descriptors.to_string());

        for (i, item) in items.into_iter().enumerate() {
            let name = item.upload_name();
            form = form.part(format!("file{i}"), media_part(item.body, &name));
            if let Some(thumb) = item.thumbnail {
                if item.kind != MediaKind::Photo {
                    form = form.part(
                        format!("thumb{i}"),
                        Part::bytes(thumb).file_name(format!("thumb{i}.jpg")),
                    );
                }
            }
        }

        self.call(
            destination,
            self.client.post(self.api_url("sendMediaGroup")).multipart(form),
        )
        .await?;
        Ok(())
    }
}

// ── Pipeline seams ──────────────────────────────────────────────────

#[async_trait]
impl OutboundSender for TelegramChannel {
    async fn send_items(
        &self,
        destination: i64,
        items: Vec<OutboundItem>,
        caption: &str,
    ) -> Result<(), DeliveryError> {
        // Captions over the media limit go out as a follow-up text message.
        let (media_caption, trailing_text) =
            if caption_too_long(caption) {
                (None, Some(caption))
            } else {
                (Some(caption), None)
            };

        let mut items = items;
        let mut first_chunk = true;
        while !items.is_empty() {
            let rest = items.split_off(items.len().min(MEDIA_GROUP_LIMIT));
            let chunk = std::mem::replace(&mut items, rest);
            let chunk_caption = if first_chunk { media_caption } else { None };
            first_chunk = false;

            if chunk.len() == 1 {
                let item = chunk.into_iter().next().ok_or_else(|| DeliveryError::Permanent {
                    destination,
                    reason: "empty media chunk".into(),
                })?;
                self.send_single(destination, item, chunk_caption).await?;
            } else {
                self.send_group(destination, chunk, chunk_caption).await?;
            }
        }

        if let Some(text) = trailing_text {
            self.send_text(destination, text).await?;
        }
        Ok(())
    }

    async fn send_text(&self, destination: i64, text: &str) -> Result<(), DeliveryError> {
        for chunk in split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH) {
            self.send_message_chunk(destination, &chunk).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl MediaResolver for TelegramChannel {
    async fn fetch_media(&self, media: &MediaRef) -> Result<Vec<u8>, MediaError> {
        let handle = media.handle.clone();
        let download_failed = |reason: String| MediaError::DownloadFailed {
            handle: handle.clone(),
            reason,
        };

        let resp = self
            .client
            .post(self.api_url("getFile"))
            .json(&serde_json::json!({ "file_id": media.handle }))
            .send()
            .await
            .map_err(|e| download_failed(e.to_string()))?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| download_failed(e.to_string()))?;

        if !status.is_success() {
            let description = body
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if status.as_u16() == 400 {
                return Err(MediaError::NotFound { handle });
            }
            return Err(download_failed(format!("getFile {status}: {description}")));
        }

        let file = body.get("result").cloned().unwrap_or(Value::Null);
        if let Some(size) = file.get("file_size").and_then(Value::as_u64) {
            if size > MAX_DOWNLOAD_BYTES {
                return Err(MediaError::TooLarge { handle, size });
            }
        }
        let Some(file_path) = file.get("file_path").and_then(Value::as_str) else {
            return Err(MediaError::NotFound { handle });
        };

        let resp = self
            .client
            .get(self.file_url(file_path))
            .send()
            .await
            .map_err(|e| download_failed(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(download_failed(format!("download returned {}", resp.status())));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| download_failed(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    async fn thumbnail(&self, media: &MediaRef, _body: &[u8]) -> Option<Vec<u8>> {
        let handle = media.thumbnail_handle.as_deref()?;
        let thumb = MediaRef::new(MediaKind::Photo, handle);
        match self.fetch_media(&thumb).await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                debug!(handle, error = %e, "Thumbnail unavailable, sending without");
                None
            }
        }
    }
}

#[async_trait]
impl BatchCopier for TelegramChannel {
    async fn copy_message(
        &self,
        from_chat: i64,
        message_id: i64,
        to_chat: i64,
    ) -> Result<(), DeliveryError> {
        let body = serde_json::json!({
            "chat_id": to_chat,
            "from_chat_id": from_chat,
            "message_id": message_id,
        });
        self.call(
            to_chat,
            self.client.post(self.api_url("copyMessage")).json(&body),
        )
        .await?;
        Ok(())
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Convert one `getUpdates` entry into an event.
///
/// Returns `None` for update types the forwarder does not handle.
fn parse_update(update: &Value, admin_ids: &[i64]) -> Option<InboundEvent> {
    let message = update
        .get("message")
        .or_else(|| update.get("channel_post"))?;

    let chat = message.get("chat")?;
    let chat_id = chat.get("id").and_then(Value::as_i64)?;
    let message_id = message.get("message_id").and_then(Value::as_i64)?;
    let sender_id = author_id(message).unwrap_or(chat_id);

    let text = message
        .get("text")
        .or_else(|| message.get("caption"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let is_private = chat.get("type").and_then(Value::as_str) == Some("private");
    if is_private && text.trim_start().starts_with('/') && admin_ids.contains(&sender_id) {
        return Some(InboundEvent::Command {
            chat_id,
            sender_id,
            text,
        });
    }

    let mut envelope = MessageEnvelope::text(chat_id, message_id, sender_id, text);
    envelope.media = parse_media(message);
    envelope.group_id = message
        .get("media_group_id")
        .and_then(Value::as_str)
        .map(String::from);
    if let Some(parent) = message.get("reply_to_message") {
        envelope = envelope.as_reply_to(author_id(parent));
    }

    Some(InboundEvent::Message(envelope))
}

/// User author, or the chat a channel/anonymous-admin post was sent as.
fn author_id(message: &Value) -> Option<i64> {
    message
        .get("from")
        .and_then(|f| f.get("id"))
        .or_else(|| message.get("sender_chat").and_then(|c| c.get("id")))
        .and_then(Value::as_i64)
}

fn parse_media(message: &Value) -> Option<MediaRef> {
    if let Some(sizes) = message.get("photo").and_then(Value::as_array) {
        // Sizes are ordered smallest first.
        let largest = sizes
            .iter()
            .max_by_key(|s| s.get("file_size").and_then(Value::as_u64).unwrap_or(0))
            .or_else(|| sizes.last())?;
        let file_id = largest.get("file_id").and_then(Value::as_str)?;
        return Some(MediaRef::new(MediaKind::Photo, file_id));
    }

    let (kind, object) = [
        ("video", MediaKind::Video),
        ("animation", MediaKind::Video),
        ("document", MediaKind::Document),
        ("audio", MediaKind::Audio),
        ("voice", MediaKind::Audio),
    ]
    .into_iter()
    .find_map(|(field, kind)| message.get(field).map(|obj| (kind, obj)))?;

    let file_id = object.get("file_id").and_then(Value::as_str)?;
    let mut media = MediaRef::new(kind, file_id);
    media.mime_type = object
        .get("mime_type")
        .and_then(Value::as_str)
        .map(String::from);
    media.file_name = object
        .get("file_name")
        .and_then(Value::as_str)
        .map(String::from);
    media.thumbnail_handle = object
        .get("thumbnail")
        .or_else(|| object.get("thumb"))
        .and_then(|t| t.get("file_id"))
        .and_then(Value::as_str)
        .map(String::from);
    Some(media)
}

/// Bot API method and form field for a single item of `kind`.
fn single_method(kind: MediaKind) -> (&'static str, &'static str) {
    match kind {
        MediaKind::Photo => ("sendPhoto", "photo"),
        MediaKind::Video => ("sendVideo", "video"),
        MediaKind::Document => ("sendDocument", "document"),
        MediaKind::Audio => ("sendAudio", "audio"),
    }
}

fn media_part(body: Vec<u8>, name: &str) -> Part {
    Part::bytes(body).file_name(name.to_string())
}

/// The `media` JSON array for sendMediaGroup. Files are attached as
/// `file{i}` and thumbnails as `thumb{i}`; the caption rides on the first item.
fn media_group_descriptors(items: &[OutboundItem], caption: Option<&str>) -> Value {
    let entries: Vec<Value> = items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let mut entry = serde_json::json!({
                "type": item.kind.label(),
                "media": format!("attach://file{i}"),
            });
            if item.thumbnail.is_some() && item.kind != MediaKind::Photo {
                entry["thumbnail"] = Value::String(format!("attach://thumb{i}"));
            }
            if item.kind == MediaKind::Video {
                entry["supports_streaming"] = Value::Bool(true);
            }
            if i == 0 {
                if let Some(cap) = caption.filter(|c| !c.is_empty()) {
                    entry["caption"] = Value::String(cap.to_string());
                }
            }
            entry
        })
        .collect();
    Value::Array(entries)
}

/// Map an unsuccessful Bot API response to a delivery error.
///
/// Flood control (429) and server errors are transient; everything else
/// (bad chat id, bot not a member, malformed request) is permanent.
fn classify_failure(destination: i64, status: u16, body: &Value) -> DeliveryError {
    let description = body
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or("no description");
    let reason = format!("HTTP {status}: {description}");

    if status == 429 || status >= 500 {
        let retry_after = body
            .get("parameters")
            .and_then(|p| p.get("retry_after"))
            .and_then(Value::as_u64)
            .map(Duration::from_secs);
        DeliveryError::Transient {
            destination,
            reason,
            retry_after,
        }
    } else {
        DeliveryError::Permanent {
            destination,
            reason,
        }
    }
}

/// Telegram measures caption length in UTF-16 code units.
fn caption_too_long(caption: &str) -> bool {
    caption.encode_utf16().count() > TELEGRAM_MAX_CAPTION_LENGTH
}

/// Split a message into chunks that fit Telegram's character limit.
/// Tries to split on newlines, then spaces, then hard-cuts.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        // Never cut inside a multi-byte character.
        let mut limit = max_len;
        while !remaining.is_char_boundary(limit) {
            limit -= 1;
        }

        // Find a good split point
        let chunk = &remaining[..limit];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .unwrap_or(limit);

        // Don't split at position 0 (infinite loop guard)
        let split_at = if split_at == 0 { limit } else { split_at };

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

// ── Tests ───────────────────────────────────────────────────────────
