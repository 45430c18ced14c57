//! Store traits: the persistence seams the engine depends on.
//!
//! The engine only reads tasks and writes delivery counters; task writes
//! come from the command surface and startup seeding.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::tasks::model::{Task, TaskStatus};

/// Delivery counters for one task, keyed by (owner, label).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStats {
    pub owner_id: i64,
    pub label: String,
    pub delivered: u64,
    pub failed: u64,
    pub updated_at: DateTime<Utc>,
}

/// Task persistence.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Active tasks that list `source_id` (any id encoding) as a source.
    async fn active_tasks_for_source(&self, source_id: i64) -> Result<Vec<Task>, DatabaseError>;

    /// All tasks owned by `owner_id`, ordered by label.
    async fn list_tasks_for_owner(&self, owner_id: i64) -> Result<Vec<Task>, DatabaseError>;

    async fn get_task(&self, owner_id: i64, label: &str) -> Result<Option<Task>, DatabaseError>;

    /// Insert or replace the task keyed by (owner, label).
    async fn upsert_task(&self, task: &Task) -> Result<(), DatabaseError>;

    /// Returns `false` when no such task exists.
    async fn set_status(
        &self,
        owner_id: i64,
        label: &str,
        status: TaskStatus,
    ) -> Result<bool, DatabaseError>;

    /// Returns `false` when no such task exists.
    async fn delete_task(&self, owner_id: i64, label: &str) -> Result<bool, DatabaseError>;

    async fn get_stats(&self, owner_id: i64, label: &str)
    -> Result<Option<TaskStats>, DatabaseError>;
}

/// Receives per-destination delivery outcomes.
///
/// Implementations must tolerate concurrent increments for the same task.
#[async_trait]
pub trait StatsSink: Send + Sync {
    async fn record_stat(
        &self,
        owner_id: i64,
        label: &str,
        success: bool,
    ) -> Result<(), DatabaseError>;
}
