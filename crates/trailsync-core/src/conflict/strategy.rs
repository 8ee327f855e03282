//! Resolution strategies

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use super::statement::StatementView;
use crate::error::{Error, Result};
use crate::models::{ConflictAction, ConflictResolution};

/// Key of the marker object added to merged payloads
pub const CONFLICT_MARKER: &str = "_conflict";

/// Decides between a local payload and its matching remote counterpart
pub trait ResolutionStrategy: Send + Sync {
    /// Name recorded in audit entries
    fn name(&self) -> &str;

    /// Pick the surviving payload. `now` stamps merge markers.
    fn resolve(&self, local: &Value, remote: &Value, now: DateTime<Utc>) -> ConflictResolution;
}

/// Which side's payload a merge keeps when timestamps are equal
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TieBreak {
    #[default]
    PreferLocal,
    PreferRemote,
}

pub(crate) fn use_local(local: &Value, remote: &Value, reason: impl Into<String>) -> ConflictResolution {
    ConflictResolution {
        action: ConflictAction::UseLocal,
        local: local.clone(),
        remote: Some(remote.clone()),
        resolved: Some(local.clone()),
        reason: reason.into(),
    }
}

pub(crate) fn use_remote(local: &Value, remote: &Value, reason: impl Into<String>) -> ConflictResolution {
    ConflictResolution {
        action: ConflictAction::UseRemote,
        local: local.clone(),
        remote: Some(remote.clone()),
        resolved: Some(remote.clone()),
        reason: reason.into(),
    }
}

/// Merge keeping one side's payload, tagged with a marker object
pub(crate) fn merge(
    strategy: &str,
    local: &Value,
    remote: &Value,
    tie_break: TieBreak,
    now: DateTime<Utc>,
    reason: impl Into<String>,
) -> ConflictResolution {
    let mut resolved = match tie_break {
        TieBreak::PreferLocal => local.clone(),
        TieBreak::PreferRemote => remote.clone(),
    };
    if let Value::Object(fields) = &mut resolved {
        fields.insert(
            CONFLICT_MARKER.to_string(),
            json!({
                "strategy": strategy,
                "resolved_at": now.to_rfc3339_opts(SecondsFormat::Millis, true),
                "remote_timestamp": StatementView::new(remote).timestamp_text(),
            }),
        );
    }

    ConflictResolution {
        action: ConflictAction::Merge,
        local: local.clone(),
        remote: Some(remote.clone()),
        resolved: Some(resolved),
        reason: reason.into(),
    }
}

/// Newer statement timestamp wins; equal timestamps merge
#[derive(Debug, Clone, Copy, Default)]
pub struct TimestampStrategy {
    pub tie_break: TieBreak,
}

impl TimestampStrategy {
    pub const fn new(tie_break: TieBreak) -> Self {
        Self { tie_break }
    }

    fn resolve_as(
        self,
        strategy: &str,
        local: &Value,
        remote: &Value,
        now: DateTime<Utc>,
    ) -> ConflictResolution {
        let local_ts = StatementView::new(local).timestamp();
        let remote_ts = StatementView::new(remote).timestamp();

        let (Some(local_ts), Some(remote_ts)) = (local_ts, remote_ts) else {
            return merge(
                strategy,
                local,
                remote,
                TieBreak::PreferLocal,
                now,
                "timestamp missing or unparseable; kept local copy",
            );
        };

        match remote_ts.cmp(&local_ts) {
            Ordering::Greater => use_remote(local, remote, "remote copy is newer"),
            Ordering::Less => use_local(local, remote, "local copy is newer"),
            Ordering::Equal => merge(
                strategy,
                local,
                remote,
                self.tie_break,
                now,
                "equal timestamps",
            ),
        }
    }
}

impl ResolutionStrategy for TimestampStrategy {
    fn name(&self) -> &str {
        "timestamp"
    }

    fn resolve(&self, local: &Value, remote: &Value, now: DateTime<Utc>) -> ConflictResolution {
        self.resolve_as(self.name(), local, remote, now)
    }
}

/// Offline intent always dominates
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriteWins;

impl ResolutionStrategy for LastWriteWins {
    fn name(&self) -> &str {
        "last_write_wins"
    }

    fn resolve(&self, local: &Value, remote: &Value, _now: DateTime<Utc>) -> ConflictResolution {
        use_local(local, remote, "local write always wins")
    }
}

/// Keeps the higher score for graded statements, otherwise orders by timestamp
#[derive(Debug, Clone, Copy, Default)]
pub struct ScorePreserving {
    pub fallback: TimestampStrategy,
}

impl ResolutionStrategy for ScorePreserving {
    fn name(&self) -> &str {
        "score_preserving"
    }

    fn resolve(&self, local: &Value, remote: &Value, now: DateTime<Utc>) -> ConflictResolution {
        let local_score = StatementView::new(local).score();
        let remote_score = StatementView::new(remote).score();

        match (local_score, remote_score) {
            (Some(local_score), Some(remote_score)) if local_score > remote_score => use_local(
                local,
                remote,
                format!("local score {local_score} beats remote {remote_score}"),
            ),
            (Some(local_score), Some(remote_score)) if remote_score > local_score => use_remote(
                local,
                remote,
                format!("remote score {remote_score} beats local {local_score}"),
            ),
            _ => self.fallback.resolve_as(self.name(), local, remote, now),
        }
    }
}

/// Per-category decision; `None` defers to the base strategy
pub type CategoryOverride =
    Box<dyn Fn(&Value, &Value) -> Option<ConflictResolution> + Send + Sync>;

/// Base strategy with overrides keyed by statement verb id
pub struct CustomStrategy {
    base: Box<dyn ResolutionStrategy>,
    overrides: HashMap<String, CategoryOverride>,
}

impl CustomStrategy {
    pub fn new(base: Box<dyn ResolutionStrategy>) -> Self {
        Self {
            base,
            overrides: HashMap::new(),
        }
    }

    /// Register an override for statements with the given verb id
    #[must_use]
    pub fn with_override(
        mut self,
        verb_id: impl Into<String>,
        decide: impl Fn(&Value, &Value) -> Option<ConflictResolution> + Send + Sync + 'static,
    ) -> Self {
        self.overrides.insert(verb_id.into(), Box::new(decide));
        self
    }
}

impl ResolutionStrategy for CustomStrategy {
    fn name(&self) -> &str {
        "custom"
    }

    fn resolve(&self, local: &Value, remote: &Value, now: DateTime<Utc>) -> ConflictResolution {
        let decided = StatementView::new(local)
            .verb_id()
            .and_then(|verb| self.overrides.get(verb))
            .and_then(|decide| decide(local, remote));
        decided.unwrap_or_else(|| self.base.resolve(local, remote, now))
    }
}

impl fmt::Debug for CustomStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomStrategy")
            .field("base", &self.base.name())
            .field("overrides", &self.overrides.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Built-in strategies selectable from configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StrategyKind {
    #[default]
    Timestamp,
    LastWriteWins,
    ScorePreserving,
}

impl StrategyKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Timestamp => "timestamp",
            Self::LastWriteWins => "last-write-wins",
            Self::ScorePreserving => "score",
        }
    }

    pub fn build(self, tie_break: TieBreak) -> Box<dyn ResolutionStrategy> {
        match self {
            Self::Timestamp => Box::new(TimestampStrategy::new(tie_break)),
            Self::LastWriteWins => Box::new(LastWriteWins),
            Self::ScorePreserving => Box::new(ScorePreserving {
                fallback: TimestampStrategy::new(tie_break),
            }),
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "timestamp" => Ok(Self::Timestamp),
            "last-write-wins" | "lww" => Ok(Self::LastWriteWins),
            "score" | "score-preserving" => Ok(Self::ScorePreserving),
            other => Err(Error::InvalidInput(format!(
                "unknown conflict strategy '{other}' (expected timestamp, last-write-wins or score)"
            ))),
        }
    }
}
