//! In-memory collaborators for pipeline unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::{DatabaseError, DeliveryError, MediaError};
use crate::pipeline::types::{MediaRef, MediaResolver, OutboundItem, OutboundSender};
use crate::store::{StatsSink, TaskStats, TaskStore};
use crate::tasks::model::{Task, TaskStatus};

pub fn make_task(label: &str, sources: Vec<i64>, destinations: Vec<i64>) -> Task {
    Task {
        label: label.into(),
        owner_id: 1,
        status: TaskStatus::Active,
        sources,
        destinations,
        filters: Default::default(),
        modifications: Default::default(),
        delay: Duration::ZERO,
        block_own_messages: false,
    }
}

// ── Task store ──────────────────────────────────────────────────────

/// Task store over a Vec; counts source lookups and can be switched off.
#[derive(Default)]
pub struct MemoryTaskStore {
    pub tasks: Mutex<Vec<Task>>,
    pub lookups: AtomicUsize,
    pub offline: AtomicBool,
    /// label -> (delivered, failed)
    pub stats: Mutex<HashMap<(i64, String), (u64, u64)>>,
}

impl MemoryTaskStore {
    pub fn with_tasks(tasks: Vec<Task>) -> Self {
        Self {
            tasks: Mutex::new(tasks),
            ..Default::default()
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> Result<(), DatabaseError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(DatabaseError::Query("store offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn active_tasks_for_source(&self, source_id: i64) -> Result<Vec<Task>, DatabaseError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        Ok(self
            .tasks
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.is_active() && t.has_source(source_id))
            .cloned()
            .collect())
    }

    async fn list_tasks_for_owner(&self, owner_id: i64) -> Result<Vec<Task>, DatabaseError> {
        self.check_online()?;
        let mut tasks: Vec<Task> = self
            .tasks
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.owner_id == owner_id)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.label.cmp(&b.label));
        Ok(tasks)
    }

    async fn get_task(&self, owner_id: i64, label: &str) -> Result<Option<Task>, DatabaseError> {
        self.check_online()?;
        Ok(self
            .tasks
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.owner_id == owner_id && t.label == label)
            .cloned())
    }

    async fn upsert_task(&self, task: &Task) -> Result<(), DatabaseError> {
        let mut tasks = self.tasks.lock().unwrap();
        tasks.retain(|t| !(t.owner_id == task.owner_id && t.label == task.label));
        tasks.push(task.clone());
        Ok(())
    }

    async fn set_status(
        &self,
        owner_id: i64,
        label: &str,
        status: TaskStatus,
    ) -> Result<bool, DatabaseError> {
        let mut tasks = self.tasks.lock().unwrap();
        match tasks
            .iter_mut()
            .find(|t| t.owner_id == owner_id && t.label == label)
        {
            Some(task) => {
                task.status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_task(&self, owner_id: i64, label: &str) -> Result<bool, DatabaseError> {
        let mut tasks = self.tasks.lock().unwrap();
        let before = tasks.len();
        tasks.retain(|t| !(t.owner_id == owner_id && t.label == label));
        Ok(tasks.len() < before)
    }

    async fn get_stats(
        &self,
        owner_id: i64,
        label: &str,
    ) -> Result<Option<TaskStats>, DatabaseError> {
        Ok(self
            .stats
            .lock()
            .unwrap()
            .get(&(owner_id, label.to_string()))
            .map(|&(delivered, failed)| TaskStats {
                owner_id,
                label: label.to_string(),
                delivered,
                failed,
                updated_at: chrono::Utc::now(),
            }))
    }
}

#[async_trait]
impl StatsSink for MemoryTaskStore {
    async fn record_stat(
        &self,
        owner_id: i64,
        label: &str,
        success: bool,
    ) -> Result<(), DatabaseError> {
        let mut stats = self.stats.lock().unwrap();
        let entry = stats.entry((owner_id, label.to_string())).or_default();
        if success {
            entry.0 += 1;
        } else {
            entry.1 += 1;
        }
        Ok(())
    }
}

// ── Stats ───────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryStats {
    pub records: Mutex<Vec<(String, bool)>>,
}

impl MemoryStats {
    pub fn records(&self) -> Vec<(String, bool)> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl StatsSink for MemoryStats {
    async fn record_stat(
        &self,
        _owner_id: i64,
        label: &str,
        success: bool,
    ) -> Result<(), DatabaseError> {
        self.records.lock().unwrap().push((label.to_string(), success));
        Ok(())
    }
}

// ── Sender / resolver ───────────────────────────────────────────────

/// One call made against [`RecordingSender`].
#[derive(Debug, Clone)]
pub struct SentPost {
    pub destination: i64,
    /// `None` for `send_text`.
    pub items: Option<Vec<OutboundItem>>,
    pub caption: String,
    pub at: Instant,
}

/// Records every send; destinations in `failing` get a permanent error.
#[derive(Default)]
pub struct RecordingSender {
    pub sent: Mutex<Vec<SentPost>>,
    pub failing: HashSet<i64>,
}

impl RecordingSender {
    pub fn failing_for(destinations: &[i64]) -> Self {
        Self {
            failing: destinations.iter().copied().collect(),
            ..Default::default()
        }
    }

    pub fn sent(&self) -> Vec<SentPost> {
        self.sent.lock().unwrap().clone()
    }

    fn record(
        &self,
        destination: i64,
        items: Option<Vec<OutboundItem>>,
        caption: &str,
    ) -> Result<(), DeliveryError> {
        self.sent.lock().unwrap().push(SentPost {
            destination,
            items,
            caption: caption.to_string(),
            at: Instant::now(),
        });
        if self.failing.contains(&destination) {
            return Err(DeliveryError::Permanent {
                destination,
                reason: "chat not found".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl OutboundSender for RecordingSender {
    async fn send_items(
        &self,
        destination: i64,
        items: Vec<OutboundItem>,
        caption: &str,
    ) -> Result<(), DeliveryError> {
        self.record(destination, Some(items), caption)
    }

    async fn send_text(&self, destination: i64, text: &str) -> Result<(), DeliveryError> {
        self.record(destination, None, text)
    }
}

/// Returns the handle's bytes; handles in `missing` fail to resolve.
#[derive(Default)]
pub struct StaticResolver {
    pub missing: HashSet<String>,
    pub fetches: AtomicUsize,
}

impl StaticResolver {
    pub fn missing(handles: &[&str]) -> Self {
        Self {
            missing: handles.iter().map(|h| h.to_string()).collect(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl MediaResolver for StaticResolver {
    async fn fetch_media(&self, media: &MediaRef) -> Result<Vec<u8>, MediaError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.missing.contains(&media.handle) {
            return Err(MediaError::NotFound {
                handle: media.handle.clone(),
            });
        }
        Ok(media.handle.as_bytes().to_vec())
    }

    async fn thumbnail(&self, media: &MediaRef, _body: &[u8]) -> Option<Vec<u8>> {
        media
            .thumbnail_handle
            .as_ref()
            .filter(|h| !self.missing.contains(*h))
            .map(|h| h.as_bytes().to_vec())
    }
}
