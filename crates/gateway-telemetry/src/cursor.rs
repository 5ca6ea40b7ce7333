//! Idempotent incremental-read cursors.
//!
//! A cursor records the last-seen fact timestamp plus every dedupe key
//! observed at exactly that timestamp (ties at the boundary). Any fact
//! strictly older than the watermark, or at the watermark with a known key,
//! has already been processed and is skipped. The extraction cursor and the
//! sync cursor are independent instances of the same mechanism.

use crate::error::TelemetryError;
use crate::fact::{Fact, FactCategory};
use crate::store::StateStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Boundary key sets are capped to keep cursor files bounded; the newest
/// subset is retained.
pub const MAX_BOUNDARY_KEYS: usize = 64;

/// Persisted incremental-read watermark.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub last_seen_timestamp: i64,
    pub last_seen_keys: Vec<String>,
}

impl Cursor {
    /// Whether the fact was already covered by this cursor.
    pub fn covers(&self, fact: &Fact) -> bool {
        fact.timestamp < self.last_seen_timestamp
            || (fact.timestamp == self.last_seen_timestamp
                && self.last_seen_keys.iter().any(|k| k == &fact.dedupe_key))
    }

    /// Splits `facts` into the not-yet-seen subset and the cursor value that
    /// covers them. Pure; persistence is the caller's decision, so delivery
    /// paths can defer the commit until after a successful send.
    pub fn accept(&self, facts: Vec<Fact>) -> (Vec<Fact>, Cursor) {
        let accepted: Vec<Fact> = facts.into_iter().filter(|f| !self.covers(f)).collect();

        let mut next = self.clone();
        for fact in &accepted {
            if fact.timestamp > next.last_seen_timestamp {
                next.last_seen_timestamp = fact.timestamp;
                next.last_seen_keys.clear();
                next.last_seen_keys.push(fact.dedupe_key.clone());
            } else if fact.timestamp == next.last_seen_timestamp
                && !next.last_seen_keys.contains(&fact.dedupe_key)
            {
                next.last_seen_keys.push(fact.dedupe_key.clone());
            }
        }
        if next.last_seen_keys.len() > MAX_BOUNDARY_KEYS {
            let excess = next.last_seen_keys.len() - MAX_BOUNDARY_KEYS;
            next.last_seen_keys.drain(..excess);
        }

        (accepted, next)
    }
}

/// Load/commit wrapper binding a cursor to a named state file.
pub struct CursorStore {
    store: Arc<dyn StateStore>,
    name: String,
}

impl CursorStore {
    /// Cursor for the extraction side of a fact category.
    pub fn extraction(store: Arc<dyn StateStore>, category: FactCategory) -> Self {
        Self {
            store,
            name: format!("cursor-extract-{}.json", category.as_str()),
        }
    }

    /// Cursor for the outbound sync side of a fact category.
    pub fn sync(store: Arc<dyn StateStore>, category: FactCategory) -> Self {
        Self {
            store,
            name: format!("cursor-sync-{}.json", category.as_str()),
        }
    }

    pub fn load(&self) -> Result<Cursor, TelemetryError> {
        match self.store.load(&self.name)? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Cursor::default()),
        }
    }

    /// Atomically persists the cursor (temp write then rename underneath).
    pub fn commit(&self, cursor: &Cursor) -> Result<(), TelemetryError> {
        let bytes = serde_json::to_vec(cursor)?;
        self.store.store(&self.name, &bytes)
    }

    /// Filters previously-seen facts, persists the advanced cursor, and
    /// returns only the new facts.
    pub fn advance(&self, facts: Vec<Fact>) -> Result<Vec<Fact>, TelemetryError> {
        let current = self.load()?;
        let (accepted, next) = current.accept(facts);
        if next != current {
            self.commit(&next)?;
        }
        debug!(
            "cursor {} advanced to {} ({} accepted)",
            self.name,
            next.last_seen_timestamp,
            accepted.len()
        );
        Ok(accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::FactKind;
    use crate::store::MemoryStore;

    fn fact(ts: i64, job: &str) -> Fact {
        Fact::new(
            ts,
            FactKind::CronRun {
                job: job.to_string(),
                outcome: "completed".to_string(),
            },
            "cron job completed",
        )
    }

    #[test]
    fn test_advance_filters_previously_seen() {
        let store = Arc::new(MemoryStore::new());
        let cursors = CursorStore::extraction(store, FactCategory::CronRun);

        let first = cursors
            .advance(vec![fact(100, "a"), fact(101, "b")])
            .unwrap();
        assert_eq!(first.len(), 2);

        // Overlapping window: both facts already covered.
        let second = cursors
            .advance(vec![fact(100, "a"), fact(101, "b"), fact(102, "c")])
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].timestamp, 102);
    }

    #[test]
    fn test_boundary_ties_tracked_by_key() {
        let store = Arc::new(MemoryStore::new());
        let cursors = CursorStore::extraction(store, FactCategory::CronRun);

        cursors.advance(vec![fact(100, "a")]).unwrap();
        // Same timestamp, different defining fields: still new.
        let accepted = cursors.advance(vec![fact(100, "a"), fact(100, "b")]).unwrap();
        assert_eq!(accepted.len(), 1);

        let cursor = cursors.load().unwrap();
        assert_eq!(cursor.last_seen_timestamp, 100);
        assert_eq!(cursor.last_seen_keys.len(), 2);
    }

    #[test]
    fn test_cursor_is_monotonic() {
        let store = Arc::new(MemoryStore::new());
        let cursors = CursorStore::extraction(store, FactCategory::CronRun);

        cursors.advance(vec![fact(200, "a")]).unwrap();
        let before = cursors.load().unwrap().last_seen_timestamp;

        // A window of strictly-older facts must not move the watermark back.
        cursors.advance(vec![fact(150, "b")]).unwrap();
        let after = cursors.load().unwrap().last_seen_timestamp;
        assert!(after >= before);
        assert_eq!(after, 200);
    }

    #[test]
    fn test_boundary_key_set_is_bounded() {
        let cursor = Cursor::default();
        let facts: Vec<Fact> = (0..(MAX_BOUNDARY_KEYS + 10))
            .map(|i| fact(100, &format!("job-{i}")))
            .collect();
        let last_key = facts[facts.len() - 1].dedupe_key.clone();
        let (_, next) = cursor.accept(facts);
        assert_eq!(next.last_seen_keys.len(), MAX_BOUNDARY_KEYS);
        // Newest subset retained.
        assert!(next.last_seen_keys.contains(&last_key));
    }

    #[test]
    fn test_extraction_and_sync_cursors_are_independent() {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let extract = CursorStore::extraction(store.clone(), FactCategory::ApiCall);
        let sync = CursorStore::sync(store, FactCategory::ApiCall);

        extract.advance(vec![fact(100, "a")]).unwrap();
        assert_eq!(sync.load().unwrap(), Cursor::default());
    }

    #[test]
    fn test_missing_cursor_accepts_everything() {
        let store = Arc::new(MemoryStore::new());
        let cursors = CursorStore::sync(store, FactCategory::ApiCall);
        let accepted = cursors.advance(vec![fact(1, "a"), fact(2, "b")]).unwrap();
        assert_eq!(accepted.len(), 2);
    }
}
