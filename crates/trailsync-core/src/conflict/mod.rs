//! Conflict resolution between queued statements and their server copies
//!
//! The resolver only acts when a remote copy matches the local event (same
//! id, or same actor/verb/object recorded within the tolerance window). Every
//! decision involving such a copy is kept in a bounded in-memory audit log.

mod statement;
mod strategy;

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

pub use statement::{is_same_statement, StatementView};
pub use strategy::{
    CategoryOverride, CustomStrategy, LastWriteWins, ResolutionStrategy, ScorePreserving,
    StrategyKind, TieBreak, TimestampStrategy, CONFLICT_MARKER,
};

use crate::models::{AuditRecord, ConflictAction, ConflictResolution, QueuedEvent};
use crate::util::{system_clock, Clock};

/// Default window for treating two statements as the same event
pub const DEFAULT_MATCH_TOLERANCE: Duration = Duration::from_secs(5);

/// Default number of audit records kept
pub const DEFAULT_AUDIT_CAPACITY: usize = 100;

/// Resolver tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolverConfig {
    pub match_tolerance: Duration,
    pub audit_capacity: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            match_tolerance: DEFAULT_MATCH_TOLERANCE,
            audit_capacity: DEFAULT_AUDIT_CAPACITY,
        }
    }
}

/// Applies a [`ResolutionStrategy`] and records what it decided
pub struct ConflictResolver {
    strategy: Box<dyn ResolutionStrategy>,
    config: ResolverConfig,
    audit: Mutex<VecDeque<AuditRecord>>,
    clock: Clock,
}

impl ConflictResolver {
    pub fn new(strategy: Box<dyn ResolutionStrategy>, config: ResolverConfig) -> Self {
        Self {
            strategy,
            config,
            audit: Mutex::new(VecDeque::new()),
            clock: system_clock(),
        }
    }

    /// Replace the wall clock (tests and simulations)
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }

    fn now(&self) -> (i64, DateTime<Utc>) {
        let millis = (self.clock)();
        (millis, DateTime::from_timestamp_millis(millis).unwrap_or_default())
    }

    /// Decide which version of `local` survives.
    ///
    /// Without a matching remote copy there is nothing to resolve and the local
    /// payload is used as-is, without an audit entry.
    pub fn resolve(&self, local: &QueuedEvent, remote: Option<&Value>) -> ConflictResolution {
        let Some(remote) = remote else {
            return untouched(local, None, "no remote copy");
        };
        if !self.matches_local(local, remote) {
            return untouched(local, Some(remote), "remote copy is a different event");
        }

        let (millis, now) = self.now();
        let resolution = self.strategy.resolve(&local.payload, remote, now);
        tracing::debug!(
            "Resolved conflict for {} with {}: {}",
            local.id,
            self.strategy.name(),
            resolution.action
        );
        self.record(local, self.strategy.name(), &resolution, millis);
        resolution
    }

    /// Settle `duplicate` as a copy of an event already in the same batch
    pub fn skip_duplicate(&self, duplicate: &QueuedEvent, original: &QueuedEvent) -> ConflictResolution {
        let resolution = ConflictResolution {
            action: ConflictAction::Skip,
            local: duplicate.payload.clone(),
            remote: Some(original.payload.clone()),
            resolved: None,
            reason: format!("duplicate of {}", original.id),
        };
        let (millis, _) = self.now();
        self.record(duplicate, "duplicate", &resolution, millis);
        resolution
    }

    /// Whether two queued events describe the same learning event
    pub fn is_duplicate(&self, a: &QueuedEvent, b: &QueuedEvent) -> bool {
        a.id == b.id || self.is_same(&a.payload, &b.payload)
    }

    /// The remote copy carries the queued event's id, or describes the same statement
    fn matches_local(&self, local: &QueuedEvent, remote: &Value) -> bool {
        StatementView::new(remote).id() == Some(local.id.as_str())
            || self.is_same(&local.payload, remote)
    }

    fn is_same(&self, local: &Value, remote: &Value) -> bool {
        is_same_statement(local, remote, self.config.match_tolerance)
    }

    fn record(&self, event: &QueuedEvent, strategy: &str, resolution: &ConflictResolution, recorded_at: i64) {
        let Ok(mut audit) = self.audit.lock() else {
            tracing::warn!("Conflict audit log poisoned; dropping record for {}", event.id);
            return;
        };
        if self.config.audit_capacity == 0 {
            return;
        }
        while audit.len() >= self.config.audit_capacity {
            audit.pop_front();
        }
        audit.push_back(AuditRecord {
            event_id: event.id.clone(),
            strategy: strategy.to_string(),
            resolution: resolution.clone(),
            recorded_at,
        });
    }

    /// Audit records, oldest first
    pub fn audit_trail(&self) -> Vec<AuditRecord> {
        self.audit
            .lock()
            .map(|audit| audit.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear_audit_trail(&self) {
        if let Ok(mut audit) = self.audit.lock() {
            audit.clear();
        }
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(
            StrategyKind::default().build(TieBreak::default()),
            ResolverConfig::default(),
        )
    }
}

impl std::fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictResolver")
            .field("strategy", &self.strategy.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn untouched(local: &QueuedEvent, remote: Option<&Value>, reason: &str) -> ConflictResolution {
    ConflictResolution {
        action: ConflictAction::UseLocal,
        local: local.payload.clone(),
        remote: remote.cloned(),
        resolved: Some(local.payload.clone()),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewEvent, Priority};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    fn fixed_clock() -> Clock {
        Arc::new(|| 1_717_243_200_000)
    }

    fn resolver() -> ConflictResolver {
        ConflictResolver::default().with_clock(fixed_clock())
    }

    fn queued(payload: Value) -> QueuedEvent {
        QueuedEvent::from_new(NewEvent::new(payload), Priority::Normal, 0)
    }

    fn completed(id: &str, timestamp: &str) -> Value {
        json!({
            "id": id,
            "actor": { "mbox": "mailto:learner@example.com" },
            "verb": { "id": "http://adlnet.gov/expapi/verbs/completed" },
            "object": { "id": "https://lms.example.com/course/42" },
            "timestamp": timestamp,
        })
    }

    #[test]
    fn test_no_remote_uses_local_without_audit() {
        let resolver = resolver();
        let local = queued(completed("a", "2024-01-01T00:00:00Z"));

        let resolution = resolver.resolve(&local, None);
        assert_eq!(resolution.action, ConflictAction::UseLocal);
        assert_eq!(resolution.resolved, Some(local.payload.clone()));
        assert!(resolver.audit_trail().is_empty());
    }

    #[test]
    fn test_newer_remote_wins_and_is_audited() {
        let resolver = resolver();
        let local = queued(completed("a", "2024-01-01T00:00:00Z"));
        let remote = completed("a", "2024-01-01T00:00:01Z");

        let resolution = resolver.resolve(&local, Some(&remote));
        assert_eq!(resolution.action, ConflictAction::UseRemote);
        assert_eq!(resolution.resolved, Some(remote));

        let trail = resolver.audit_trail();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].event_id, local.id);
        assert_eq!(trail[0].strategy, "timestamp");
        assert_eq!(trail[0].recorded_at, 1_717_243_200_000);
    }

    #[test]
    fn test_remote_keyed_by_queue_id_is_a_conflict() {
        let resolver = resolver();
        let mut payload = completed("ignored", "2024-01-01T00:00:00Z");
        payload.as_object_mut().unwrap().remove("id");
        payload["actor"] = json!({ "mbox": "mailto:offline@example.com" });
        let local = queued(payload);
        let mut remote = completed(local.id.as_str(), "2024-01-02T00:00:00Z");
        remote["result"] = json!({ "completion": true });

        let resolution = resolver.resolve(&local, Some(&remote));
        assert_eq!(resolution.action, ConflictAction::UseRemote);
        assert_eq!(resolution.resolved, Some(remote));

        let trail = resolver.audit_trail();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].event_id, local.id);
    }

    #[test]
    fn test_day_old_local_copy_yields_to_remote() {
        let resolver = resolver();
        let local = queued(completed("a", "2025-01-01T00:00:00Z"));
        let remote = completed("a", "2025-01-02T00:00:00Z");

        let resolution = resolver.resolve(&local, Some(&remote));
        assert_eq!(resolution.action, ConflictAction::UseRemote);
        assert_eq!(resolution.resolved, Some(remote));
    }

    #[test]
    fn test_merge_audit_keeps_both_originals() {
        let resolver = resolver();
        let local = queued(completed("a", "2025-01-01T00:00:00Z"));
        let mut remote = completed("a", "2025-01-01T00:00:00Z");
        remote["result"] = json!({ "score": { "scaled": 0.9 } });

        let resolution = resolver.resolve(&local, Some(&remote));
        assert_eq!(resolution.action, ConflictAction::Merge);
        assert!(resolution.resolved.unwrap().get(CONFLICT_MARKER).is_some());

        let trail = resolver.audit_trail();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].resolution.action, ConflictAction::Merge);
        assert_eq!(trail[0].resolution.local, local.payload);
        assert_eq!(trail[0].resolution.remote, Some(remote));
    }

    #[test]
    fn test_unrelated_remote_is_not_a_conflict() {
        let resolver = resolver();
        let local = queued(completed("a", "2024-01-01T00:00:00Z"));
        let mut remote = completed("b", "2024-01-01T00:00:00Z");
        remote["object"]["id"] = json!("https://lms.example.com/course/7");

        let resolution = resolver.resolve(&local, Some(&remote));
        assert_eq!(resolution.action, ConflictAction::UseLocal);
        assert!(resolver.audit_trail().is_empty());
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let resolver = resolver();
        let local = queued(completed("a", "2024-01-01T00:00:00Z"));
        let remote = completed("a", "2024-01-01T00:00:00Z");

        let first = resolver.resolve(&local, Some(&remote));
        let second = resolver.resolve(&local, Some(&remote));
        assert_eq!(first, second);
        assert_eq!(first.action, ConflictAction::Merge);
    }

    #[test]
    fn test_audit_log_is_bounded() {
        let resolver = ConflictResolver::new(
            Box::new(LastWriteWins),
            ResolverConfig {
                audit_capacity: 3,
                ..ResolverConfig::default()
            },
        );
        for n in 0..5 {
            let id = format!("stmt-{n}");
            let local = queued(completed(&id, "2024-01-01T00:00:00Z"));
            resolver.resolve(&local, Some(&local.payload.clone()));
        }

        let ids: Vec<String> = resolver
            .audit_trail()
            .into_iter()
            .map(|record| record.event_id.to_string())
            .collect();
        assert_eq!(ids, ["stmt-2", "stmt-3", "stmt-4"]);

        resolver.clear_audit_trail();
        assert!(resolver.audit_trail().is_empty());
    }

    #[test]
    fn test_duplicates_within_batch() {
        let resolver = resolver();
        let first = queued(completed("device-a", "2024-01-01T00:00:00Z"));
        let second = queued(completed("device-b", "2024-01-01T00:00:02Z"));
        let later = queued(completed("device-c", "2024-01-01T00:10:00Z"));

        assert!(resolver.is_duplicate(&first, &second));
        assert!(!resolver.is_duplicate(&first, &later));

        let resolution = resolver.skip_duplicate(&second, &first);
        assert_eq!(resolution.action, ConflictAction::Skip);
        assert!(resolution.resolved.is_none());
        assert_eq!(resolver.audit_trail()[0].strategy, "duplicate");
    }
}
