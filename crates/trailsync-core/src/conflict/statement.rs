//! Read-only view over a statement payload.
//!
//! Payloads are opaque to the queue; the resolver only needs a handful of
//! well-known statement fields to order and match them.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;

/// Borrowed accessor for statement fields used in conflict resolution
#[derive(Debug, Clone, Copy)]
pub struct StatementView<'a> {
    payload: &'a Value,
}

impl<'a> StatementView<'a> {
    pub const fn new(payload: &'a Value) -> Self {
        Self { payload }
    }

    fn text(&self, pointer: &str) -> Option<&'a str> {
        self.payload
            .pointer(pointer)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    /// Statement id, if the payload carries one
    pub fn id(&self) -> Option<&'a str> {
        self.text("/id")
    }

    /// Verb id, also used as the statement category
    pub fn verb_id(&self) -> Option<&'a str> {
        self.text("/verb/id")
    }

    /// Target object id
    pub fn object_id(&self) -> Option<&'a str> {
        self.text("/object/id")
    }

    /// Stable identity of the actor.
    ///
    /// Uses the first inverse functional identifier present: mailbox, mailbox
    /// hash, OpenID, then account home page and name.
    pub fn actor_key(&self) -> Option<String> {
        if let Some(mbox) = self.text("/actor/mbox") {
            return Some(format!("mbox:{}", mbox.to_ascii_lowercase()));
        }
        if let Some(sha) = self.text("/actor/mbox_sha1sum") {
            return Some(format!("sha1:{sha}"));
        }
        if let Some(openid) = self.text("/actor/openid") {
            return Some(format!("openid:{openid}"));
        }
        let name = self.text("/actor/account/name")?;
        let home = self.text("/actor/account/homePage").unwrap_or_default();
        Some(format!("account:{home}|{name}"))
    }

    /// Raw timestamp text
    pub fn timestamp_text(&self) -> Option<&'a str> {
        self.text("/timestamp")
    }

    /// Parsed RFC 3339 timestamp; `None` when missing or unparseable
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        let text = self.timestamp_text()?;
        DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|value| value.with_timezone(&Utc))
    }

    /// Numeric score: `result.score.scaled`, then `result.score.raw`, then `score`
    pub fn score(&self) -> Option<f64> {
        ["/result/score/scaled", "/result/score/raw", "/score"]
            .into_iter()
            .find_map(|pointer| self.payload.pointer(pointer).and_then(Value::as_f64))
            .filter(|score| score.is_finite())
    }
}

/// Whether two payloads describe the same learning event.
///
/// True for equal statement ids, or for the same actor, verb and object
/// recorded within `tolerance` of each other.
pub fn is_same_statement(a: &Value, b: &Value, tolerance: Duration) -> bool {
    let (a, b) = (StatementView::new(a), StatementView::new(b));

    if let (Some(left), Some(right)) = (a.id(), b.id()) {
        if left == right {
            return true;
        }
    }

    let same_shape = match (a.actor_key(), b.actor_key()) {
        (Some(left), Some(right)) => {
            left == right
                && a.verb_id().is_some()
                && a.verb_id() == b.verb_id()
                && a.object_id().is_some()
                && a.object_id() == b.object_id()
        }
        _ => false,
    };
    if !same_shape {
        return false;
    }

    let (Some(left), Some(right)) = (a.timestamp(), b.timestamp()) else {
        return false;
    };
    let gap = if left >= right { left - right } else { right - left };
    gap.to_std().is_ok_and(|gap| gap <= tolerance)
}
