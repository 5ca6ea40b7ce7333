//! One pipeline invocation end to end.
//!
//! A run reads the gateway's log window, extracts and deduplicates facts,
//! compacts the per-category append logs, and produces a snapshot appended to
//! the day's history. Outbound sync runs on its own cadence through
//! [`Pipeline::sync_once`]; the two paths share state only through the
//! atomic store, so they tolerate overlap.

use crate::aggregate::{Aggregator, RetainedFacts, Snapshot, SnapshotHistory};
use crate::config::TelemetryConfig;
use crate::cursor::CursorStore;
use crate::error::TelemetryError;
use crate::extract::Extractor;
use crate::fact::{Fact, FactCategory};
use crate::probe::{ControlPlaneProbe, LogSource};
use crate::retention::FactLog;
use crate::store::StateStore;
use crate::sync::{SyncOutcome, SyncTransmitter};
use std::sync::Arc;
use tracing::{debug, info};

/// Number of `(provider, endpoint_group)` entries ranked per snapshot.
const TOP_GROUPS: usize = 5;

/// Wires the pipeline stages over a shared store and the gateway seams.
pub struct Pipeline {
    config: Arc<TelemetryConfig>,
    store: Arc<dyn StateStore>,
    log_source: Arc<dyn LogSource>,
    probe: Arc<dyn ControlPlaneProbe>,
    extractor: Extractor,
    aggregator: Aggregator,
    transmitter: SyncTransmitter,
    history: SnapshotHistory,
}

impl Pipeline {
    pub fn new(
        config: Arc<TelemetryConfig>,
        store: Arc<dyn StateStore>,
        log_source: Arc<dyn LogSource>,
        probe: Arc<dyn ControlPlaneProbe>,
    ) -> Result<Self, TelemetryError> {
        Ok(Self {
            extractor: Extractor::new(),
            aggregator: Aggregator::new(config.local_offset, TOP_GROUPS),
            transmitter: SyncTransmitter::new(config.clone())?,
            history: SnapshotHistory::new(store.clone(), config.local_offset),
            config,
            store,
            log_source,
            probe,
        })
    }

    /// Runs extraction, retention, and aggregation once, returning the
    /// snapshot after appending it to the day's history.
    ///
    /// Rerunning over an unchanged log window is a no-op for the fact logs:
    /// the extraction cursors filter everything already accepted.
    pub fn run_once(&self, now: i64) -> Result<Snapshot, TelemetryError> {
        let window = self.log_source.window();
        let extracted = self.extractor.extract(&window);
        debug!(
            "extracted {} facts from a window of {} lines",
            extracted.len(),
            window.len()
        );

        let mut retained = RetainedFacts::default();
        for category in FactCategory::ALL {
            let of_category: Vec<Fact> = extracted
                .iter()
                .filter(|f| f.kind.category() == category)
                .cloned()
                .collect();

            let cursors = CursorStore::extraction(self.store.clone(), category);
            let accepted = cursors.advance(of_category)?;

            let log = FactLog::new(self.store.clone(), category);
            let facts = log.append_and_compact(&accepted, now, self.config.retention_secs())?;
            match category {
                FactCategory::ApiCall => retained.api_calls = facts,
                FactCategory::CronRun => retained.cron_runs = facts,
                FactCategory::SkillInvocation => retained.skill_invocations = facts,
                FactCategory::CriticalError => retained.critical_errors = facts,
            }
        }

        let probe_status = self.probe.status();
        let snapshot = self.aggregator.snapshot(&retained, &probe_status, now);
        self.history.append(&snapshot)?;

        info!(
            "snapshot generated: status {}, {} metrics",
            snapshot.service_status.as_str(),
            snapshot.metrics.len()
        );
        Ok(snapshot)
    }

    /// Delivers not-yet-synced API-call facts to the sink. Runs on its own
    /// cadence, independent of [`Pipeline::run_once`].
    pub async fn sync_once(&self, now: i64) -> Result<SyncOutcome, TelemetryError> {
        let log = FactLog::new(self.store.clone(), FactCategory::ApiCall);
        let facts = log.load()?.unwrap_or_default();
        self.transmitter.sync(self.store.clone(), &facts, now).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::Readiness;
    use crate::extract::{LogLine, Severity};
    use crate::probe::ProbeStatus;
    use crate::store::MemoryStore;

    const NOW: i64 = 1_700_000_000;

    struct FixedLogSource(Vec<LogLine>);

    impl LogSource for FixedLogSource {
        fn window(&self) -> Vec<LogLine> {
            self.0.clone()
        }
    }

    struct FixedProbe(ProbeStatus);

    impl ControlPlaneProbe for FixedProbe {
        fn status(&self) -> ProbeStatus {
            self.0
        }
    }

    fn line(ts: i64, message: &str) -> LogLine {
        LogLine {
            timestamp: ts,
            severity: Severity::Info,
            message: message.to_string(),
        }
    }

    fn reachable() -> ProbeStatus {
        ProbeStatus {
            reachable: true,
            pid: Some(7),
            uptime_secs: Some(60),
            unexpected_restarts_24h: Some(0),
        }
    }

    fn pipeline(lines: Vec<LogLine>, probe: ProbeStatus) -> Pipeline {
        let config = Arc::new(TelemetryConfig::default());
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        Pipeline::new(
            config,
            store,
            Arc::new(FixedLogSource(lines)),
            Arc::new(FixedProbe(probe)),
        )
        .unwrap()
    }

    #[test]
    fn test_run_once_produces_snapshot_from_log_window() {
        let lines = vec![
            line(
                NOW - 100,
                "POST https://open.larksuite.com/open-apis/im/v1/messages status=200 34ms",
            ),
            line(NOW - 90, "GET https://api.telegram.org/bot/getMe status=200"),
        ];
        let pipeline = pipeline(lines, reachable());

        let snapshot = pipeline.run_once(NOW).unwrap();
        assert_eq!(snapshot.metrics["api_call_total_24h"].value, Some(2.0));
        assert_eq!(snapshot.service_status.as_str(), "running");
    }

    #[test]
    fn test_rerun_over_same_window_is_idempotent() {
        let lines = vec![line(
            NOW - 100,
            "POST https://open.larksuite.com/open-apis/im/v1/messages status=200",
        )];
        let pipeline = pipeline(lines, reachable());

        let first = pipeline.run_once(NOW).unwrap();
        let second = pipeline.run_once(NOW + 1).unwrap();
        assert_eq!(
            first.metrics["api_call_total_24h"].value,
            second.metrics["api_call_total_24h"].value
        );
    }

    #[test]
    fn test_empty_window_leaves_sources_disconnected() {
        let pipeline = pipeline(Vec::new(), reachable());
        let snapshot = pipeline.run_once(NOW).unwrap();
        assert_eq!(
            snapshot.metrics["api_call_total_24h"].readiness,
            Readiness::Gap
        );
    }

    #[test]
    fn test_snapshot_appended_to_history() {
        let config = Arc::new(TelemetryConfig::default());
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let pipeline = Pipeline::new(
            config.clone(),
            store.clone(),
            Arc::new(FixedLogSource(Vec::new())),
            Arc::new(FixedProbe(reachable())),
        )
        .unwrap();

        pipeline.run_once(NOW).unwrap();
        pipeline.run_once(NOW + 60).unwrap();

        let history = SnapshotHistory::new(store, config.local_offset);
        assert_eq!(history.day(NOW).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_sync_once_noop_without_sink() {
        let pipeline = pipeline(Vec::new(), reachable());
        let outcome = pipeline.sync_once(NOW).await.unwrap();
        assert_eq!(outcome, SyncOutcome::default());
    }
}
