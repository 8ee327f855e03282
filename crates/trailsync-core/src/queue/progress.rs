//! Offline progress cache

use super::QueueManager;
use crate::db::{StoreExt, Table, TxMode};
use crate::error::Result;
use crate::models::{progress_key, ProgressEntry};

impl QueueManager {
    /// Upsert a progress observation, never lowering progress or score
    pub fn cache_progress(&self, entry: ProgressEntry) -> Result<ProgressEntry> {
        self.store
            .run_transaction(&[Table::Progress], TxMode::ReadWrite, |tx| {
                let merged = match tx.get_progress(&entry.key())? {
                    Some(existing) => existing.merged_with(&entry),
                    None => ProgressEntry {
                        synced: false,
                        ..entry
                    },
                };
                tx.put_progress(&merged)?;
                Ok(merged)
            })
    }

    /// Cached progress of one actor through one activity
    pub fn progress(&self, actor_id: &str, activity_id: &str) -> Result<Option<ProgressEntry>> {
        let key = progress_key(actor_id, activity_id);
        self.store
            .run_transaction(&[Table::Progress], TxMode::ReadOnly, |tx| tx.get_progress(&key))
    }

    /// Progress rows whose statements have not been delivered yet
    pub fn unsynced_progress(&self) -> Result<Vec<ProgressEntry>> {
        self.store
            .run_transaction(&[Table::Progress], TxMode::ReadOnly, |tx| {
                tx.scan_progress(Some(false))
            })
    }

    /// Flag progress rows as delivered; unknown keys are skipped
    pub fn mark_progress_synced(&self, keys: &[String]) -> Result<usize> {
        self.store
            .run_transaction(&[Table::Progress], TxMode::ReadWrite, |tx| {
                let mut marked = 0;
                for key in keys {
                    if let Some(mut entry) = tx.get_progress(key)? {
                        if !entry.synced {
                            entry.synced = true;
                            tx.put_progress(&entry)?;
                            marked += 1;
                        }
                    }
                }
                Ok(marked)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::queue::QueueConfig;
    use std::sync::Arc;

    fn setup() -> QueueManager {
        QueueManager::new(Arc::new(MemoryStore::new()), QueueConfig::default())
    }

    #[test]
    fn test_cache_progress_keeps_best_values() {
        let queue = setup();
        queue
            .cache_progress(ProgressEntry::new("learner", "course-1", 0.6).with_score(0.9))
            .unwrap();
        let merged = queue
            .cache_progress(ProgressEntry::new("learner", "course-1", 0.4).with_score(0.7))
            .unwrap();

        assert!((merged.progress - 0.6).abs() < f64::EPSILON);
        assert_eq!(merged.score, Some(0.9));

        let cached = queue.progress("learner", "course-1").unwrap().unwrap();
        assert_eq!(cached, merged);
        assert!(queue.progress("learner", "course-2").unwrap().is_none());
    }

    #[test]
    fn test_mark_progress_synced() {
        let queue = setup();
        let entry = queue
            .cache_progress(ProgressEntry::new("learner", "course-1", 1.0))
            .unwrap();
        queue
            .cache_progress(ProgressEntry::new("learner", "course-2", 0.2))
            .unwrap();
        assert_eq!(queue.unsynced_progress().unwrap().len(), 2);

        let marked = queue
            .mark_progress_synced(&[entry.key(), "unknown".to_string()])
            .unwrap();
        assert_eq!(marked, 1);

        let unsynced = queue.unsynced_progress().unwrap();
        assert_eq!(unsynced.len(), 1);
        assert_eq!(unsynced[0].activity_id, "course-2");
    }

    #[test]
    fn test_new_observation_marks_row_unsynced_again() {
        let queue = setup();
        let entry = queue
            .cache_progress(ProgressEntry::new("learner", "course-1", 0.5))
            .unwrap();
        queue.mark_progress_synced(&[entry.key()]).unwrap();

        queue
            .cache_progress(ProgressEntry::new("learner", "course-1", 0.8))
            .unwrap();
        assert_eq!(queue.unsynced_progress().unwrap().len(), 1);
    }
}
