//! Source chat → active tasks lookup.
//!
//! Thin layer over [`TaskStore::active_tasks_for_source`] with an optional
//! cache keyed by canonical chat id. Every task write made through the
//! command surface must call [`TaskMatcher::invalidate`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::DatabaseError;
use crate::store::TaskStore;
use crate::tasks::model::{Task, canonical_chat_id};

pub struct TaskMatcher {
    store: Arc<dyn TaskStore>,
    cache: Option<Mutex<HashMap<i64, Vec<Task>>>>,
}

impl TaskMatcher {
    /// Uncached matcher: every lookup hits the store.
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store, cache: None }
    }

    pub fn with_cache(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            cache: Some(Mutex::new(HashMap::new())),
        }
    }

    /// Active tasks whose sources include `source_id` (either id encoding).
    pub async fn active_tasks_for_source(&self, source_id: i64) -> Result<Vec<Task>, DatabaseError> {
        let key = canonical_chat_id(source_id);

        if let Some(cache) = &self.cache {
            if let Some(hit) = lock(cache).get(&key) {
                return Ok(hit.clone());
            }
        }

        let tasks: Vec<Task> = self
            .store
            .active_tasks_for_source(source_id)
            .await?
            .into_iter()
            .filter(|t| t.is_active() && t.has_source(source_id))
            .collect();

        debug!(source = source_id, matched = tasks.len(), "Task lookup");

        if let Some(cache) = &self.cache {
            lock(cache).insert(key, tasks.clone());
        }
        Ok(tasks)
    }

    /// Drop all cached lookups.
    pub fn invalidate(&self) {
        if let Some(cache) = &self.cache {
            lock(cache).clear();
            debug!("Task cache invalidated");
        }
    }
}

/// Poisoning is ignored; a stale entry is only ever a cache miss away.
fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
