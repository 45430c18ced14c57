//! Album aggregation.
//!
//! Multi-item posts arrive as separate messages sharing a group id. The
//! aggregator buffers them per group and emits one [`FlushedAlbum`] once
//! the quiescence window has elapsed, so each destination receives the
//! album as a single post.
//!
//! Per group: `Empty → Buffering → Flushing → Closed`. Each open group owns
//! exactly one timer task. The timer removes the entry and marks the group
//! closed in one critical section under the same lock that appends take,
//! so an envelope is either part of the flush or rejected as
//! [`Admission::Late`]; it is never dropped silently.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::ConfigError;
use crate::pipeline::types::MessageEnvelope;
use crate::tasks::model::Task;

/// Default quiescence window.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(4);
/// Default cap on a window stretched by [`AlbumWindowPolicy::ExtendOnArrival`].
pub const DEFAULT_MAX_WINDOW: Duration = Duration::from_secs(10);
/// How many flushed group ids are remembered for late-arrival detection.
const CLOSED_CAPACITY: usize = 4096;

// ── Configuration ───────────────────────────────────────────────────

/// How later members affect the flush deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlbumWindowPolicy {
    /// Flush at `first_arrival + window`.
    #[default]
    FixedFromFirst,
    /// Each arrival pushes the deadline to `arrival + window`, capped at
    /// `first_arrival + max_window`.
    ExtendOnArrival,
}

impl std::str::FromStr for AlbumWindowPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" | "fixed_from_first" => Ok(Self::FixedFromFirst),
            "extend" | "extend_on_arrival" => Ok(Self::ExtendOnArrival),
            other => Err(ConfigError::InvalidValue {
                key: "FORWARDER_ALBUM_POLICY".into(),
                message: format!("unknown policy '{other}' (expected 'fixed' or 'extend')"),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AlbumConfig {
    pub window: Duration,
    pub max_window: Duration,
    pub policy: AlbumWindowPolicy,
}

impl Default for AlbumConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            max_window: DEFAULT_MAX_WINDOW,
            policy: AlbumWindowPolicy::default(),
        }
    }
}

// ── Public types ────────────────────────────────────────────────────

/// Result of offering an envelope to the aggregator.
#[derive(Debug)]
pub enum Admission {
    /// First member of a new group; a flush is scheduled.
    Opened,
    /// Appended to an open group.
    Buffered,
    /// The group was already flushed (or the envelope has no group id).
    /// The caller should forward it on its own.
    Late {
        envelope: MessageEnvelope,
        tasks: Vec<Task>,
    },
}

/// One flushed group, split per task.
#[derive(Debug, Clone)]
pub struct FlushedAlbum {
    pub group_id: String,
    pub source_id: i64,
    /// Each task with the members it kept, sorted by message id.
    pub per_task: Vec<(Task, Vec<MessageEnvelope>)>,
}

/// Text of the first member (in the given order) with a non-blank body.
pub fn caption_source(members: &[MessageEnvelope]) -> &str {
    members
        .iter()
        .find(|m| m.has_text())
        .map(|m| m.text.as_str())
        .unwrap_or("")
}

// ── State ───────────────────────────────────────────────────────────

type TaskKey = (i64, String);

fn task_key(task: &Task) -> TaskKey {
    (task.owner_id, task.label.clone())
}

struct Member {
    envelope: MessageEnvelope,
    kept_by: Vec<TaskKey>,
}

struct AlbumEntry {
    source_id: i64,
    members: Vec<Member>,
    /// In order of first appearance.
    tasks: Vec<Task>,
    first_arrival: Instant,
    deadline: Instant,
    timer: Option<AbortHandle>,
}

impl AlbumEntry {
    fn into_flushed(self, group_id: String) -> FlushedAlbum {
        let mut members = self.members;
        members.sort_by_key(|m| m.envelope.message_id);

        let per_task = self
            .tasks
            .into_iter()
            .map(|task| {
                let key = task_key(&task);
                let kept: Vec<MessageEnvelope> = members
                    .iter()
                    .filter(|m| m.kept_by.contains(&key))
                    .map(|m| m.envelope.clone())
                    .collect();
                (task, kept)
            })
            .filter(|(_, kept)| !kept.is_empty())
            .collect();

        FlushedAlbum {
            group_id,
            source_id: self.source_id,
            per_task,
        }
    }
}

#[derive(Default)]
struct AlbumState {
    open: HashMap<String, AlbumEntry>,
    closed: HashSet<String>,
    closed_order: VecDeque<String>,
}

impl AlbumState {
    fn mark_closed(&mut self, group_id: &str) {
        if self.closed.insert(group_id.to_string()) {
            self.closed_order.push_back(group_id.to_string());
        }
        while self.closed_order.len() > CLOSED_CAPACITY {
            if let Some(oldest) = self.closed_order.pop_front() {
                self.closed.remove(&oldest);
            }
        }
    }

    /// Remove an open group and mark it closed in one step.
    fn close(&mut self, group_id: &str) -> Option<AlbumEntry> {
        let entry = self.open.remove(group_id)?;
        self.mark_closed(group_id);
        Some(entry)
    }
}

// ── Aggregator ──────────────────────────────────────────────────────

/// Buffers grouped envelopes and emits one flush per group.
pub struct AlbumAggregator {
    config: AlbumConfig,
    state: Arc<Mutex<AlbumState>>,
    flush_tx: mpsc::UnboundedSender<FlushedAlbum>,
}

impl AlbumAggregator {
    /// Create an aggregator and the receiver its flushes are delivered on.
    pub fn new(config: AlbumConfig) -> (Self, mpsc::UnboundedReceiver<FlushedAlbum>) {
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();
        let aggregator = Self {
            config,
            state: Arc::new(Mutex::new(AlbumState::default())),
            flush_tx,
        };
        (aggregator, flush_rx)
    }

    pub fn config(&self) -> &AlbumConfig {
        &self.config
    }

    /// Offer an envelope kept by `tasks`.
    pub async fn admit(&self, envelope: MessageEnvelope, tasks: Vec<Task>) -> Admission {
        let Some(group_id) = envelope.group_id.clone() else {
            return Admission::Late { envelope, tasks };
        };

        let mut state = self.state.lock().await;

        if state.closed.contains(&group_id) {
            warn!(
                group = %group_id,
                message_id = envelope.message_id,
                "Album member arrived after flush"
            );
            return Admission::Late { envelope, tasks };
        }

        let now = Instant::now();
        let kept_by: Vec<TaskKey> = tasks.iter().map(task_key).collect();

        if let Some(entry) = state.open.get_mut(&group_id) {
            for task in tasks {
                if !entry.tasks.iter().any(|t| task_key(t) == task_key(&task)) {
                    entry.tasks.push(task);
                }
            }
            entry.members.push(Member { envelope, kept_by });

            if self.config.policy == AlbumWindowPolicy::ExtendOnArrival {
                let cap = entry.first_arrival + self.config.max_window.max(self.config.window);
                let extended = (now + self.config.window).min(cap);
                if extended > entry.deadline {
                    entry.deadline = extended;
                }
            }

            debug!(group = %group_id, members = entry.members.len(), "Album member buffered");
            return Admission::Buffered;
        }

        let deadline = now + self.config.window;
        let source_id = envelope.source_id;
        state.open.insert(
            group_id.clone(),
            AlbumEntry {
                source_id,
                members: vec![Member { envelope, kept_by }],
                tasks,
                first_arrival: now,
                deadline,
                timer: None,
            },
        );

        let handle = tokio::spawn(flush_after_deadline(
            Arc::clone(&self.state),
            self.flush_tx.clone(),
            group_id.clone(),
            deadline,
        ));
        if let Some(entry) = state.open.get_mut(&group_id) {
            entry.timer = Some(handle.abort_handle());
        }

        debug!(group = %group_id, source = source_id, "Album opened");
        Admission::Opened
    }

    /// Number of groups still buffering.
    pub async fn open_groups(&self) -> usize {
        self.state.lock().await.open.len()
    }

    /// Flush every open group immediately. Used on shutdown.
    ///
    /// Returns the number of groups flushed.
    pub async fn drain(&self) -> usize {
        let drained: Vec<(String, AlbumEntry)> = {
            let mut state = self.state.lock().await;
            let ids: Vec<String> = state.open.keys().cloned().collect();
            ids.into_iter()
                .filter_map(|id| state.close(&id).map(|entry| (id, entry)))
                .collect()
        };

        let count = drained.len();
        for (group_id, mut entry) in drained {
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
            emit(&self.flush_tx, entry.into_flushed(group_id));
        }

        if count > 0 {
            info!(groups = count, "Drained pending albums");
        }
        count
    }
}

/// Timer body: one per group. Sleeps until the group's deadline, rechecking
/// in case the deadline moved, then closes and emits the group.
async fn flush_after_deadline(
    state: Arc<Mutex<AlbumState>>,
    flush_tx: mpsc::UnboundedSender<FlushedAlbum>,
    group_id: String,
    mut deadline: Instant,
) {
    loop {
        tokio::time::sleep_until(deadline).await;

        let entry = {
            let mut state = state.lock().await;
            let Some(current) = state.open.get(&group_id).map(|e| e.deadline) else {
                return;
            };
            if current > Instant::now() {
                deadline = current;
                continue;
            }
            state.close(&group_id)
        };

        if let Some(entry) = entry {
            debug!(
                group = %group_id,
                members = entry.members.len(),
                waited_ms = entry.first_arrival.elapsed().as_millis() as u64,
                "Album window elapsed"
            );
            emit(&flush_tx, entry.into_flushed(group_id));
        }
        return;
    }
}

fn emit(flush_tx: &mpsc::UnboundedSender<FlushedAlbum>, album: FlushedAlbum) {
    let group_id = album.group_id.clone();
    if flush_tx.send(album).is_err() {
        warn!(group = %group_id, "Album consumer gone; flush dropped");
    }
}
