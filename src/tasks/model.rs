//! Forwarding task model.
//!
//! Tasks arrive from the store as a loosely-shaped [`TaskRecord`] (textual
//! phrase lists, `find => replace` lines). [`Task::from_record`] validates
//! and normalizes them once, at load time, so the pipeline only ever sees
//! typed configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ConfigError;

/// Separator between the find and replace halves of a replace rule.
pub const REPLACE_SEPARATOR: &str = "=>";

/// Offset applied by the platform to mark channel/supergroup ids (`-100…`).
const CHANNEL_ID_OFFSET: i64 = 1_000_000_000_000;

/// Normalize a chat id to its canonical form.
///
/// Channel ids appear both marked (`-1001234567890`) and bare
/// (`1234567890`). The canonical form is the bare id; every other id
/// passes through unchanged.
pub fn canonical_chat_id(raw: i64) -> i64 {
    if raw < -CHANNEL_ID_OFFSET {
        // Same as `-raw - OFFSET`, without negating `raw`.
        -CHANNEL_ID_OFFSET - raw
    } else {
        raw
    }
}

/// Build the marked (`-100…`) form of a bare channel id.
///
/// `None` when the id is too large to carry the marker.
pub fn marked_channel_id(bare: i64) -> Option<i64> {
    CHANNEL_ID_OFFSET.checked_add(bare).map(|marked| -marked)
}

// ── Status ──────────────────────────────────────────────────────────

/// Whether a task is currently forwarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Active,
    Stopped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Stopped => "stopped",
        }
    }

    /// The other status (used by the toggle command).
    pub fn toggled(&self) -> Self {
        match self {
            Self::Active => Self::Stopped,
            Self::Stopped => Self::Active,
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "stopped" => Ok(Self::Stopped),
            other => Err(ConfigError::InvalidValue {
                key: "status".into(),
                message: format!("unknown task status '{other}'"),
            }),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Filter / modification config ────────────────────────────────────

/// Per-task keep/drop configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterConfig {
    /// Drop when any phrase occurs (case-insensitive).
    pub blacklist: Vec<String>,
    /// When non-empty, keep only if some phrase occurs (case-insensitive).
    pub whitelist: Vec<String>,
    pub block_photos: bool,
    pub block_videos: bool,
    pub block_documents: bool,
    /// Block messages that carry text but no media.
    pub block_text: bool,
    /// Drop replies whose parent was written by the task owner.
    pub block_replies_to_owner: bool,
    /// Forward only messages that are replies.
    pub only_replies: bool,
}

/// A literal `find => replace` substitution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaceRule {
    pub find: String,
    pub replace: String,
}

impl ReplaceRule {
    /// Parse one `find => replace` line. Both halves are trimmed.
    pub fn parse(line: &str) -> Result<Self, ConfigError> {
        let Some((find, replace)) = line.split_once(REPLACE_SEPARATOR) else {
            return Err(ConfigError::MalformedReplaceRule {
                rule: line.to_string(),
                reason: format!("missing '{REPLACE_SEPARATOR}' separator"),
            });
        };

        let find = find.trim();
        if find.is_empty() {
            return Err(ConfigError::MalformedReplaceRule {
                rule: line.to_string(),
                reason: "empty find text".into(),
            });
        }

        Ok(Self {
            find: find.to_string(),
            replace: replace.trim().to_string(),
        })
    }

    /// Encode back to the stored textual form.
    pub fn encode(&self) -> String {
        format!("{} {REPLACE_SEPARATOR} {}", self.find, self.replace)
    }
}

/// Per-task text rewriting configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModificationConfig {
    /// Lines to drop (exact match after trimming).
    pub remove_lines: Vec<String>,
    /// Applied in declared order.
    pub replace_rules: Vec<ReplaceRule>,
    pub beautify: bool,
    pub footer: Option<String>,
}

// ── Task ────────────────────────────────────────────────────────────

/// A validated forwarding rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    /// Unique per owner; stats are keyed by this label.
    pub label: String,
    pub owner_id: i64,
    pub status: TaskStatus,
    /// Ordered, de-duplicated by canonical id.
    pub sources: Vec<i64>,
    /// Ordered; duplicates each get their own delivery attempt.
    pub destinations: Vec<i64>,
    pub filters: FilterConfig,
    pub modifications: ModificationConfig,
    /// Minimum spacing between two single-message dispatches of this task.
    pub delay: Duration,
    pub block_own_messages: bool,
}

impl Task {
    /// Validate a raw store record.
    ///
    /// Malformed replace rules are skipped (logged); a missing label or an
    /// unknown status rejects the whole record.
    pub fn from_record(record: TaskRecord) -> Result<Self, ConfigError> {
        let label = record.label.trim().to_string();
        if label.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "label".into(),
                message: "task label must not be empty".into(),
            });
        }

        let status: TaskStatus = record.status.parse()?;

        let mut sources: Vec<i64> = Vec::with_capacity(record.source_ids.len());
        for id in record.source_ids {
            let canonical = canonical_chat_id(id);
            if !sources.iter().any(|s| canonical_chat_id(*s) == canonical) {
                sources.push(id);
            }
        }

        let filters = FilterConfig {
            blacklist: parse_phrase_list(&record.filters.blacklist),
            whitelist: parse_phrase_list(&record.filters.whitelist),
            block_photos: record.filters.block_photos,
            block_videos: record.filters.block_videos,
            block_documents: record.filters.block_documents,
            block_text: record.filters.block_text,
            block_replies_to_owner: record.filters.block_replies_to_owner,
            only_replies: record.filters.only_replies,
        };

        let modifications = ModificationConfig {
            remove_lines: parse_phrase_list(&record.modifications.remove_lines),
            replace_rules: parse_replace_rules(&label, &record.modifications.replace_rules),
            beautify: record.modifications.beautify,
            footer: record
                .modifications
                .footer
                .filter(|f| !f.trim().is_empty()),
        };

        Ok(Self {
            label,
            owner_id: record.owner_id,
            status,
            sources,
            destinations: record.destination_ids,
            filters,
            modifications,
            delay: Duration::from_secs(record.delay_secs),
            block_own_messages: record.filters.block_own_messages,
        })
    }

    /// Encode back to the stored record shape.
    pub fn to_record(&self) -> TaskRecord {
        TaskRecord {
            label: self.label.clone(),
            owner_id: self.owner_id,
            status: self.status.as_str().to_string(),
            source_ids: self.sources.clone(),
            destination_ids: self.destinations.clone(),
            filters: FilterRecord {
                blacklist: self.filters.blacklist.join("\n"),
                whitelist: self.filters.whitelist.join("\n"),
                block_photos: self.filters.block_photos,
                block_videos: self.filters.block_videos,
                block_documents: self.filters.block_documents,
                block_text: self.filters.block_text,
                block_own_messages: self.block_own_messages,
                block_replies_to_owner: self.filters.block_replies_to_owner,
                only_replies: self.filters.only_replies,
            },
            modifications: ModificationRecord {
                remove_lines: self.modifications.remove_lines.join("\n"),
                replace_rules: self
                    .modifications
                    .replace_rules
                    .iter()
                    .map(ReplaceRule::encode)
                    .collect::<Vec<_>>()
                    .join("\n"),
                beautify: self.modifications.beautify,
                footer: self.modifications.footer.clone(),
            },
            delay_secs: self.delay.as_secs(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == TaskStatus::Active
    }

    /// Whether `chat_id` is one of this task's sources (any id encoding).
    pub fn has_source(&self, chat_id: i64) -> bool {
        let wanted = canonical_chat_id(chat_id);
        self.sources.iter().any(|s| canonical_chat_id(*s) == wanted)
    }
}

// ── Raw record ──────────────────────────────────────────────────────

/// Task as stored: phrase lists and replace rules are newline-separated text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskRecord {
    pub label: String,
    pub owner_id: i64,
    pub status: String,
    pub source_ids: Vec<i64>,
    pub destination_ids: Vec<i64>,
    pub filters: FilterRecord,
    pub modifications: ModificationRecord,
    pub delay_secs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterRecord {
    pub blacklist: String,
    pub whitelist: String,
    pub block_photos: bool,
    pub block_videos: bool,
    pub block_documents: bool,
    pub block_text: bool,
    pub block_own_messages: bool,
    pub block_replies_to_owner: bool,
    pub only_replies: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModificationRecord {
    pub remove_lines: String,
    pub replace_rules: String,
    pub beautify: bool,
    pub footer: Option<String>,
}

// ── Parsing helpers ─────────────────────────────────────────────────

/// Split a newline-separated phrase list, dropping blank entries.
pub fn parse_phrase_list(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}

/// Parse newline-separated replace rules, skipping malformed ones.
fn parse_replace_rules(label: &str, text: &str) -> Vec<ReplaceRule> {
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|line| match ReplaceRule::parse(line) {
            Ok(rule) => Some(rule),
            Err(e) => {
                warn!(task = %label, error = %e, "Skipping replace rule");
                None
            }
        })
        .collect()
}
