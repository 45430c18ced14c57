//! Startup seeding from a JSON file of task records.

use std::path::Path;

use tracing::{info, warn};

use crate::error::{ConfigError, Error};
use crate::store::TaskStore;
use crate::tasks::model::{Task, TaskRecord};

/// Upsert every valid record in `path`; returns how many were written.
///
/// Invalid records are skipped with a warning. An unreadable file or
/// malformed JSON fails the whole seed.
pub async fn seed_from_file(store: &dyn TaskStore, path: &Path) -> Result<usize, Error> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(ConfigError::Io)?;
    let records: Vec<TaskRecord> = serde_json::from_str(&raw).map_err(|e| {
        ConfigError::ParseError(format!("seed file {}: {e}", path.display()))
    })?;

    let mut written = 0;
    for record in records {
        let label = record.label.clone();
        match Task::from_record(record) {
            Ok(task) => {
                store.upsert_task(&task).await?;
                written += 1;
            }
            Err(e) => warn!(task = %label, error = %e, "Skipping invalid seed record"),
        }
    }

    info!(path = %path.display(), tasks = written, "Tasks seeded");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::pipeline::test_support::MemoryTaskStore;

    #[tokio::test]
    async fn seeds_valid_records_and_skips_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[
                {{"label": "news", "owner_id": 7, "status": "active",
                  "source_ids": [-1001234567890], "destination_ids": [-100999],
                  "modifications": {{"replace_rules": "cat => dog\nbroken", "footer": "via news"}},
                  "delay_secs": 5}},
                {{"label": "", "owner_id": 7, "status": "active"}},
                {{"label": "odd", "owner_id": 7, "status": "paused"}}
            ]"#
        )
        .unwrap();

        let store = MemoryTaskStore::default();
        let written = seed_from_file(&store, file.path()).await.unwrap();

        assert_eq!(written, 1);
        let task = store.get_task(7, "news").await.unwrap().unwrap();
        assert_eq!(task.modifications.replace_rules.len(), 1);
        assert_eq!(task.modifications.footer.as_deref(), Some("via news"));
        assert_eq!(task.delay.as_secs(), 5);
    }

    #[tokio::test]
    async fn malformed_json_fails() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{not json").unwrap();

        let store = MemoryTaskStore::default();
        let err = seed_from_file(&store, file.path()).await.unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::ParseError(_))));
    }

    #[tokio::test]
    async fn missing_file_fails() {
        let store = MemoryTaskStore::default();
        let err = seed_from_file(&store, Path::new("/nonexistent/tasks.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::Io(_))));
    }
}
