//! Offline progress cache model

use serde::{Deserialize, Serialize};

/// Locally cached progress of one actor through one activity.
///
/// Lets the UI show course progress while offline. The row is marked synced
/// once the statements that produced it were delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEntry {
    /// Actor identity (account name or mailbox)
    pub actor_id: String,
    /// Activity (course, module or lesson) identifier
    pub activity_id: String,
    /// Completion ratio in `0.0..=1.0`
    pub progress: f64,
    /// Best score seen, if the activity is graded
    pub score: Option<f64>,
    /// Whether the activity was completed
    pub completed: bool,
    /// Last local update (Unix ms)
    pub updated_at: i64,
    /// Whether the collector has acknowledged the underlying statements
    pub synced: bool,
}

impl ProgressEntry {
    #[must_use]
    pub fn new(actor_id: impl Into<String>, activity_id: impl Into<String>, progress: f64) -> Self {
        Self {
            actor_id: actor_id.into(),
            activity_id: activity_id.into(),
            progress: progress.clamp(0.0, 1.0),
            score: None,
            completed: progress >= 1.0,
            updated_at: chrono::Utc::now().timestamp_millis(),
            synced: false,
        }
    }

    #[must_use]
    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }

    /// Storage key combining actor and activity
    pub fn key(&self) -> String {
        progress_key(&self.actor_id, &self.activity_id)
    }

    /// Fold a newer observation into this entry without losing progress.
    ///
    /// Progress and score only ever move up; completion is sticky.
    #[must_use]
    pub fn merged_with(&self, newer: &Self) -> Self {
        let score = match (self.score, newer.score) {
            (Some(old), Some(new)) => Some(old.max(new)),
            (old, new) => new.or(old),
        };
        Self {
            actor_id: newer.actor_id.clone(),
            activity_id: newer.activity_id.clone(),
            progress: self.progress.max(newer.progress),
            score,
            completed: self.completed || newer.completed,
            updated_at: self.updated_at.max(newer.updated_at),
            synced: false,
        }
    }
}

/// Storage key for an actor/activity pair
pub fn progress_key(actor_id: &str, activity_id: &str) -> String {
    format!("{actor_id}\u{1f}{activity_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_clamps_progress() {
        let entry = ProgressEntry::new("learner", "course", 1.7);
        assert!((entry.progress - 1.0).abs() < f64::EPSILON);
        assert!(entry.completed);
    }

    #[test]
    fn test_merge_keeps_best_values() {
        let older = ProgressEntry::new("learner", "course", 0.8).with_score(90.0);
        let newer = ProgressEntry::new("learner", "course", 0.4).with_score(70.0);

        let merged = older.merged_with(&newer);
        assert!((merged.progress - 0.8).abs() < f64::EPSILON);
        assert_eq!(merged.score, Some(90.0));
        assert!(!merged.synced);
    }
}
