//! Per-category append logs with retention compaction.
//!
//! Each fact category persists to a flat append-only log, one JSON record per
//! line. On every run the log is rewritten atomically keeping only facts
//! within the retention horizon, which bounds on-disk and in-memory fact
//! volume regardless of invocation frequency.

use crate::error::TelemetryError;
use crate::fact::{Fact, FactCategory};
use crate::store::StateStore;
use std::sync::Arc;
use tracing::warn;

/// Append-log handle for one fact category.
pub struct FactLog {
    store: Arc<dyn StateStore>,
    name: String,
}

impl FactLog {
    pub fn new(store: Arc<dyn StateStore>, category: FactCategory) -> Self {
        Self {
            store,
            name: format!("facts-{}.jsonl", category.as_str()),
        }
    }

    /// Loads the retained facts, or `None` if this category's log has never
    /// been written. The distinction matters downstream: an absent log means
    /// the fact source was never connected (Gap), while an empty one means
    /// "connected, nothing retained" (Derived zero).
    pub fn load(&self) -> Result<Option<Vec<Fact>>, TelemetryError> {
        let Some(bytes) = self.store.load(&self.name)? else {
            return Ok(None);
        };
        let text = String::from_utf8_lossy(&bytes);
        let mut facts = Vec::new();
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Fact>(line) {
                Ok(fact) => facts.push(fact),
                Err(err) => warn!("skipping malformed fact record in {}: {err}", self.name),
            }
        }
        Ok(Some(facts))
    }

    /// Appends the accepted facts, drops everything older than the retention
    /// horizon, and rewrites the log atomically. Returns the retained set.
    ///
    /// A log that has never been written stays absent when there is nothing
    /// to append, preserving the "source never connected" signal.
    pub fn append_and_compact(
        &self,
        accepted: &[Fact],
        now: i64,
        retention_secs: i64,
    ) -> Result<Option<Vec<Fact>>, TelemetryError> {
        let existing = self.load()?;
        if existing.is_none() && accepted.is_empty() {
            return Ok(None);
        }

        let horizon = now - retention_secs;
        let mut retained: Vec<Fact> = existing
            .unwrap_or_default()
            .into_iter()
            .chain(accepted.iter().cloned())
            .filter(|fact| fact.timestamp >= horizon)
            .collect();
        retained.sort_by_key(|fact| fact.timestamp);

        let mut contents = String::new();
        for fact in &retained {
            contents.push_str(&serde_json::to_string(fact)?);
            contents.push('\n');
        }
        self.store.store(&self.name, contents.as_bytes())?;
        Ok(Some(retained))
    }
}
