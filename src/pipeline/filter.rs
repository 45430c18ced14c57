//! Per-task content filters.
//!
//! Runs once per (task, message) pair, short-circuiting at the first drop:
//! 1. own messages (non-replies) when the task blocks them
//! 2. non-replies when the task forwards replies only
//! 3. blocked content kinds
//! 4. replies to the task owner
//! 5. blacklist phrases
//! 6. whitelist phrases
//!
//! Kind blocks are checked before the blacklist, and the blacklist before
//! the whitelist, so the drop reason for a message caught by several
//! filters is stable.

use tracing::debug;

use crate::pipeline::types::{ContentKind, MessageEnvelope};
use crate::tasks::model::{FilterConfig, Task};

/// Why a message was dropped for a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    OwnMessage,
    NotAReply,
    BlockedKind(ContentKind),
    ReplyToOwner,
    Blacklisted { phrase: String },
    NotWhitelisted,
}

impl DropReason {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::OwnMessage => "own_message",
            Self::NotAReply => "not_a_reply",
            Self::BlockedKind(_) => "blocked_kind",
            Self::ReplyToOwner => "reply_to_owner",
            Self::Blacklisted { .. } => "blacklisted",
            Self::NotWhitelisted => "not_whitelisted",
        }
    }
}

/// Keep/drop outcome of the filter stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterDecision {
    Keep,
    Drop(DropReason),
}

impl FilterDecision {
    pub fn is_keep(&self) -> bool {
        matches!(self, Self::Keep)
    }
}

/// Evaluate a task's filters against a message.
pub fn evaluate_task(task: &Task, message: &MessageEnvelope) -> FilterDecision {
    let decision = evaluate(
        &task.filters,
        message,
        task.owner_id,
        task.block_own_messages,
    );
    if let FilterDecision::Drop(ref reason) = decision {
        debug!(
            task = %task.label,
            source = message.source_id,
            message_id = message.message_id,
            reason = reason.label(),
            "Message dropped by filter"
        );
    }
    decision
}

/// Evaluate a filter configuration against a message.
pub fn evaluate(
    filters: &FilterConfig,
    message: &MessageEnvelope,
    owner_id: i64,
    block_own: bool,
) -> FilterDecision {
    if block_own && message.sender_id == owner_id && !message.is_reply {
        return FilterDecision::Drop(DropReason::OwnMessage);
    }

    if filters.only_replies && !message.is_reply {
        return FilterDecision::Drop(DropReason::NotAReply);
    }

    let kind = message.content_kind();
    let kind_blocked = match kind {
        ContentKind::Photo => filters.block_photos,
        ContentKind::Video => filters.block_videos,
        ContentKind::Document => filters.block_documents,
        ContentKind::Text => filters.block_text,
        ContentKind::Audio => false,
    };
    if kind_blocked {
        return FilterDecision::Drop(DropReason::BlockedKind(kind));
    }

    if filters.block_replies_to_owner
        && message.is_reply
        && message.replied_sender_id == Some(owner_id)
    {
        return FilterDecision::Drop(DropReason::ReplyToOwner);
    }

    let text = message.text.to_lowercase();

    if let Some(phrase) = first_match(&filters.blacklist, &text) {
        return FilterDecision::Drop(DropReason::Blacklisted {
            phrase: phrase.to_string(),
        });
    }

    let mut whitelist = filters
        .whitelist
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .peekable();
    if whitelist.peek().is_some() && !whitelist.any(|p| text.contains(&p.to_lowercase())) {
        return FilterDecision::Drop(DropReason::NotWhitelisted);
    }

    FilterDecision::Keep
}

/// First non-blank phrase occurring in already lower-cased `text`.
fn first_match<'a>(phrases: &'a [String], text: &str) -> Option<&'a str> {
    phrases
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .find(|p| text.contains(&p.to_lowercase()))
}
