//! Rolling-window metric aggregation.
//!
//! Computes the dashboard snapshot from the retained fact set and the
//! control-plane probe: windowed counts and ratios over the trailing 24h and
//! the local calendar day, top-N provider/endpoint groupings, a coverage
//! ratio over the core metric set, and the service status state machine.
//!
//! Every metric carries a readiness tag. The Gap/zero distinction is load
//! bearing: a metric is Gap if and only if its defining fact source has never
//! been populated (or a ratio has nothing to divide by), never merely
//! because the computed value is zero.

use crate::error::TelemetryError;
use crate::fact::{Fact, FactKind};
use crate::probe::ProbeStatus;
use crate::store::StateStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use time::{OffsetDateTime, UtcOffset};

/// Data-availability classification attached to every reported metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    /// Sourced directly from an authoritative probe.
    Ready,
    /// Computed from retained facts.
    Derived,
    /// Structurally unavailable; never faked as a numeric value.
    Gap,
}

/// Fixed note attached to Gap metrics whose fact source was never populated.
pub const NOTE_SOURCE_NOT_CONNECTED: &str = "upstream fact source not connected";
/// Fixed note attached to Gap ratios with an empty window (nothing to divide).
pub const NOTE_NO_FACTS_IN_WINDOW: &str = "no facts in window";
/// Fixed placeholder rendered for Gap metrics.
pub const GAP_DISPLAY: &str = "—";

/// One reported metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricValue {
    pub readiness: Readiness,
    pub value: Option<f64>,
    pub display: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl MetricValue {
    pub fn ready(value: f64, display: String) -> Self {
        Self {
            readiness: Readiness::Ready,
            value: Some(value),
            display,
            note: None,
        }
    }

    pub fn derived_count(count: u64) -> Self {
        Self {
            readiness: Readiness::Derived,
            value: Some(count as f64),
            display: count.to_string(),
            note: None,
        }
    }

    pub fn derived_ratio(ratio: f64) -> Self {
        Self {
            readiness: Readiness::Derived,
            value: Some(ratio),
            display: format!("{ratio:.4}"),
            note: None,
        }
    }

    pub fn gap(note: &str) -> Self {
        Self {
            readiness: Readiness::Gap,
            value: None,
            display: GAP_DISPLAY.to_string(),
            note: Some(note.to_string()),
        }
    }
}

/// Service status recomputed fresh every cycle; no hysteresis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Running,
    Degraded,
    Down,
}

impl ServiceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceStatus::Running => "running",
            ServiceStatus::Degraded => "degraded",
            ServiceStatus::Down => "down",
        }
    }
}

/// `down` is terminal for the cycle; nothing else is evaluated.
pub fn service_status(reachable: bool, restarts_24h: u64, active_critical: u64) -> ServiceStatus {
    if !reachable {
        return ServiceStatus::Down;
    }
    if restarts_24h > 0 || active_critical > 0 {
        return ServiceStatus::Degraded;
    }
    ServiceStatus::Running
}

/// One `(provider, endpoint_group)` ranking entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopGroup {
    pub provider: String,
    pub endpoint_group: String,
    pub calls_24h: u64,
}

/// Collapsed critical-error summary carried on the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorFingerprint {
    pub signature: String,
    pub fingerprint: String,
    pub occurrences: u32,
    pub first_seen: i64,
    pub last_seen: i64,
}

/// Point-in-time aggregate of all metrics; append-only, one per invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Unix seconds.
    pub generated_at: i64,
    pub service_status: ServiceStatus,
    pub metrics: BTreeMap<String, MetricValue>,
    pub top_groups_24h: Vec<TopGroup>,
    pub critical_fingerprints: Vec<ErrorFingerprint>,
}

/// The fixed core metric set whose presence defines the coverage ratio.
pub const P0_CORE_METRICS: &[&str] = &[
    "api_call_total_24h",
    "api_error_rate_24h",
    "api_429_rate_24h",
    "api_unknown_rate_24h",
    "api_call_total_today",
    "api_error_rate_today",
    "cron_runs_24h",
    "skill_invocations_24h",
    "critical_errors_active",
    "unexpected_restarts_24h",
    "service_uptime_secs",
];

/// Retained facts per category. `None` means the category's append log has
/// never been written (source not connected), which is distinct from an
/// empty, connected log.
#[derive(Debug, Clone, Default)]
pub struct RetainedFacts {
    pub api_calls: Option<Vec<Fact>>,
    pub cron_runs: Option<Vec<Fact>>,
    pub skill_invocations: Option<Vec<Fact>>,
    pub critical_errors: Option<Vec<Fact>>,
}

/// Windowed counters over the API-call facts.
#[derive(Debug, Default, Clone, Copy)]
struct ApiWindowCounts {
    total: u64,
    failures: u64,
    rate_limited: u64,
    unknown: u64,
}

/// Computes the snapshot for one pipeline invocation.
pub struct Aggregator {
    local_offset: UtcOffset,
    top_n: usize,
}

impl Aggregator {
    pub fn new(local_offset: UtcOffset, top_n: usize) -> Self {
        Self { local_offset, top_n }
    }

    pub fn snapshot(&self, facts: &RetainedFacts, probe: &ProbeStatus, now: i64) -> Snapshot {
        let mut metrics = BTreeMap::new();

        let in_24h = |ts: i64| ts > now - 86_400 && ts <= now;
        let today = self.local_date(now);
        let in_today = |ts: i64| self.local_date(ts) == today && ts <= now;

        // API-call window metrics.
        let api_24h = facts
            .api_calls
            .as_deref()
            .map(|all| count_api_window(all, in_24h));
        let api_today = facts
            .api_calls
            .as_deref()
            .map(|all| count_api_window(all, in_today));

        metrics.insert(
            "api_call_total_24h".to_string(),
            count_metric(api_24h.map(|c| c.total)),
        );
        metrics.insert(
            "api_call_failure_24h".to_string(),
            count_metric(api_24h.map(|c| c.failures)),
        );
        metrics.insert(
            "api_rate_limited_24h".to_string(),
            count_metric(api_24h.map(|c| c.rate_limited)),
        );
        metrics.insert(
            "api_error_rate_24h".to_string(),
            ratio_metric(api_24h.map(|c| (c.failures, c.total))),
        );
        metrics.insert(
            "api_429_rate_24h".to_string(),
            ratio_metric(api_24h.map(|c| (c.rate_limited, c.total))),
        );
        metrics.insert(
            "api_unknown_rate_24h".to_string(),
            ratio_metric(api_24h.map(|c| (c.unknown, c.total))),
        );
        metrics.insert(
            "api_call_total_today".to_string(),
            count_metric(api_today.map(|c| c.total)),
        );
        metrics.insert(
            "api_error_rate_today".to_string(),
            ratio_metric(api_today.map(|c| (c.failures, c.total))),
        );

        // Cron and skill counters.
        let cron_24h = facts
            .cron_runs
            .as_deref()
            .map(|all| all.iter().filter(|f| in_24h(f.timestamp)).count() as u64);
        metrics.insert("cron_runs_24h".to_string(), count_metric(cron_24h));
        let cron_failures = facts.cron_runs.as_deref().map(|all| {
            all.iter()
                .filter(|f| in_24h(f.timestamp))
                .filter(|f| matches!(&f.kind, FactKind::CronRun { outcome, .. } if outcome == "failed"))
                .count() as u64
        });
        metrics.insert("cron_failures_24h".to_string(), count_metric(cron_failures));

        let skills_24h = facts
            .skill_invocations
            .as_deref()
            .map(|all| all.iter().filter(|f| in_24h(f.timestamp)).count() as u64);
        metrics.insert(
            "skill_invocations_24h".to_string(),
            count_metric(skills_24h),
        );

        // Critical errors active in the window.
        let critical_fingerprints = collect_fingerprints(facts.critical_errors.as_deref(), in_24h);
        let critical_active = facts
            .critical_errors
            .as_deref()
            .map(|_| critical_fingerprints.len() as u64);
        metrics.insert(
            "critical_errors_active".to_string(),
            count_metric(critical_active),
        );

        // Probe-sourced metrics are Ready when the probe answers.
        metrics.insert(
            "unexpected_restarts_24h".to_string(),
            match probe.unexpected_restarts_24h {
                Some(count) => MetricValue::ready(count as f64, count.to_string()),
                None => MetricValue::gap(NOTE_SOURCE_NOT_CONNECTED),
            },
        );
        metrics.insert(
            "service_uptime_secs".to_string(),
            match (probe.reachable, probe.uptime_secs) {
                (true, Some(uptime)) => MetricValue::ready(uptime as f64, uptime.to_string()),
                _ => MetricValue::gap(NOTE_SOURCE_NOT_CONNECTED),
            },
        );

        let status = service_status(
            probe.reachable,
            probe.unexpected_restarts_24h.unwrap_or(0),
            critical_active.unwrap_or(0),
        );

        let coverage = coverage_ratio(&metrics);
        metrics.insert(
            "coverage_ratio".to_string(),
            MetricValue::derived_ratio(coverage),
        );

        let top_groups_24h = top_groups(facts.api_calls.as_deref(), in_24h, self.top_n);

        Snapshot {
            generated_at: now,
            service_status: status,
            metrics,
            top_groups_24h,
            critical_fingerprints,
        }
    }

    fn local_date(&self, ts: i64) -> Option<time::Date> {
        OffsetDateTime::from_unix_timestamp(ts)
            .ok()
            .map(|dt| dt.to_offset(self.local_offset).date())
    }
}

fn count_api_window(facts: &[Fact], in_window: impl Fn(i64) -> bool) -> ApiWindowCounts {
    let mut counts = ApiWindowCounts::default();
    for fact in facts.iter().filter(|f| in_window(f.timestamp)) {
        let FactKind::ApiCall {
            provider,
            endpoint_group,
            rate_limited,
            failed,
            ..
        } = &fact.kind
        else {
            continue;
        };
        counts.total += 1;
        if *failed {
            counts.failures += 1;
        }
        if *rate_limited {
            counts.rate_limited += 1;
        }
        if provider == "unknown" || endpoint_group == "unknown" {
            counts.unknown += 1;
        }
    }
    counts
}

/// Count metric: Gap only when the source was never populated.
fn count_metric(count: Option<u64>) -> MetricValue {
    match count {
        Some(count) => MetricValue::derived_count(count),
        None => MetricValue::gap(NOTE_SOURCE_NOT_CONNECTED),
    }
}

/// Ratio metric: Gap when the source was never populated, or when the window
/// holds no facts (no denominator). Zero hits over a non-empty window is a
/// Derived zero, not a Gap.
fn ratio_metric(counts: Option<(u64, u64)>) -> MetricValue {
    match counts {
        None => MetricValue::gap(NOTE_SOURCE_NOT_CONNECTED),
        Some((_, 0)) => MetricValue::gap(NOTE_NO_FACTS_IN_WINDOW),
        Some((hits, total)) => MetricValue::derived_ratio(hits as f64 / total as f64),
    }
}

fn collect_fingerprints(
    facts: Option<&[Fact]>,
    in_window: impl Fn(i64) -> bool,
) -> Vec<ErrorFingerprint> {
    let Some(facts) = facts else {
        return Vec::new();
    };
    facts
        .iter()
        .filter(|f| in_window(f.timestamp))
        .filter_map(|f| match &f.kind {
            FactKind::CriticalError {
                signature,
                fingerprint,
                occurrences,
                first_seen,
                last_seen,
            } => Some(ErrorFingerprint {
                signature: signature.clone(),
                fingerprint: fingerprint.clone(),
                occurrences: *occurrences,
                first_seen: *first_seen,
                last_seen: *last_seen,
            }),
            _ => None,
        })
        .collect()
}

/// Ranks `(provider, endpoint_group)` by descending call count; ties break
/// by first-seen order.
fn top_groups(
    facts: Option<&[Fact]>,
    in_window: impl Fn(i64) -> bool,
    top_n: usize,
) -> Vec<TopGroup> {
    let Some(facts) = facts else {
        return Vec::new();
    };

    let mut order: Vec<(String, String)> = Vec::new();
    let mut counts: BTreeMap<(String, String), u64> = BTreeMap::new();
    for fact in facts.iter().filter(|f| in_window(f.timestamp)) {
        let FactKind::ApiCall {
            provider,
            endpoint_group,
            ..
        } = &fact.kind
        else {
            continue;
        };
        let key = (provider.clone(), endpoint_group.clone());
        if !counts.contains_key(&key) {
            order.push(key.clone());
        }
        *counts.entry(key).or_insert(0) += 1;
    }

    let mut ranked: Vec<(usize, (String, String), u64)> = order
        .into_iter()
        .enumerate()
        .map(|(first_seen, key)| {
            let count = counts[&key];
            (first_seen, key, count)
        })
        .collect();
    ranked.sort_by(|a, b| b.2.cmp(&a.2).then(a.0.cmp(&b.0)));

    ranked
        .into_iter()
        .take(top_n)
        .map(|(_, (provider, endpoint_group), calls_24h)| TopGroup {
            provider,
            endpoint_group,
            calls_24h,
        })
        .collect()
}

/// Fraction of the fixed core metric set currently carrying a value,
/// reported to the nearest 1e-4.
fn coverage_ratio(metrics: &BTreeMap<String, MetricValue>) -> f64 {
    let present = P0_CORE_METRICS
        .iter()
        .filter(|name| {
            metrics
                .get(**name)
                .map(|m| m.value.is_some())
                .unwrap_or(false)
        })
        .count();
    let ratio = present as f64 / P0_CORE_METRICS.len() as f64;
    (ratio * 10_000.0).round() / 10_000.0
}

/// Append-only snapshot history, partitioned by local calendar day.
pub struct SnapshotHistory {
    store: Arc<dyn StateStore>,
    local_offset: UtcOffset,
}

impl SnapshotHistory {
    pub fn new(store: Arc<dyn StateStore>, local_offset: UtcOffset) -> Self {
        Self {
            store,
            local_offset,
        }
    }

    fn partition_name(&self, ts: i64) -> String {
        let date = OffsetDateTime::from_unix_timestamp(ts)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH)
            .to_offset(self.local_offset)
            .date();
        format!(
            "snapshots-{:04}-{:02}-{:02}.jsonl",
            date.year(),
            u8::from(date.month()),
            date.day()
        )
    }

    /// Appends one snapshot to the day's partition.
    pub fn append(&self, snapshot: &Snapshot) -> Result<(), TelemetryError> {
        let name = self.partition_name(snapshot.generated_at);
        let mut contents = self.store.load(&name)?.unwrap_or_default();
        contents.extend_from_slice(serde_json::to_string(snapshot)?.as_bytes());
        contents.push(b'\n');
        self.store.store(&name, &contents)
    }

    /// Loads the snapshots recorded for the day containing `ts`.
    pub fn day(&self, ts: i64) -> Result<Vec<Snapshot>, TelemetryError> {
        let name = self.partition_name(ts);
        let Some(bytes) = self.store.load(&name)? else {
            return Ok(Vec::new());
        };
        let text = String::from_utf8_lossy(&bytes);
        let mut snapshots = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            snapshots.push(serde_json::from_str(line)?);
        }
        Ok(snapshots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    const NOW: i64 = 1_700_000_000;

    fn api_fact(ts: i64, provider: &str, group: &str, failed: bool, rate_limited: bool) -> Fact {
        Fact::new(
            ts,
            FactKind::ApiCall {
                provider: provider.to_string(),
                method: None,
                host: format!("{provider}.example.com"),
                path_template: "/x".to_string(),
                endpoint_group: group.to_string(),
                status_code: Some(if failed { 500 } else { 200 }),
                latency_ms: None,
                rate_limited,
                failed,
                request_id: None,
            },
            &format!("call {ts} {provider} {group}"),
        )
    }

    fn reachable_probe() -> ProbeStatus {
        ProbeStatus {
            reachable: true,
            pid: Some(42),
            uptime_secs: Some(3_600),
            unexpected_restarts_24h: Some(0),
        }
    }

    fn aggregator() -> Aggregator {
        Aggregator::new(UtcOffset::UTC, 5)
    }

    #[test]
    fn test_gap_when_source_never_populated() {
        let snapshot = aggregator().snapshot(&RetainedFacts::default(), &reachable_probe(), NOW);
        let metric = &snapshot.metrics["api_error_rate_24h"];
        assert_eq!(metric.readiness, Readiness::Gap);
        assert_eq!(metric.value, None);
        assert_eq!(metric.note.as_deref(), Some(NOTE_SOURCE_NOT_CONNECTED));
        assert_eq!(metric.display, GAP_DISPLAY);
    }

    #[test]
    fn test_derived_zero_when_connected_with_no_failures() {
        let facts = RetainedFacts {
            api_calls: Some(vec![api_fact(NOW - 100, "lark", "message_send", false, false)]),
            ..Default::default()
        };
        let snapshot = aggregator().snapshot(&facts, &reachable_probe(), NOW);
        let metric = &snapshot.metrics["api_error_rate_24h"];
        assert_eq!(metric.readiness, Readiness::Derived);
        assert_eq!(metric.value, Some(0.0));
    }

    #[test]
    fn test_zero_total_window_is_gap_ratio_but_derived_count() {
        // Connected log whose facts all fell out of the 24h window.
        let facts = RetainedFacts {
            api_calls: Some(vec![]),
            ..Default::default()
        };
        let snapshot = aggregator().snapshot(&facts, &reachable_probe(), NOW);
        assert_eq!(
            snapshot.metrics["api_call_total_24h"].value,
            Some(0.0),
            "count over a connected source is a real zero"
        );
        let rate = &snapshot.metrics["api_error_rate_24h"];
        assert_eq!(rate.readiness, Readiness::Gap);
        assert_eq!(rate.note.as_deref(), Some(NOTE_NO_FACTS_IN_WINDOW));
    }

    #[test]
    fn test_scenario_top_groups_and_unknown_rate() {
        let facts = RetainedFacts {
            api_calls: Some(vec![
                api_fact(NOW - 400, "lark", "message_send", false, false),
                api_fact(NOW - 300, "lark", "message_send", false, false),
                api_fact(NOW - 200, "lark", "message_send", false, false),
                api_fact(NOW - 100, "unknown", "unknown", true, false),
            ]),
            ..Default::default()
        };
        let snapshot = aggregator().snapshot(&facts, &reachable_probe(), NOW);

        assert_eq!(snapshot.metrics["api_call_total_24h"].value, Some(4.0));
        assert_eq!(snapshot.metrics["api_unknown_rate_24h"].value, Some(0.25));

        let top = &snapshot.top_groups_24h[0];
        assert_eq!(top.provider, "lark");
        assert_eq!(top.endpoint_group, "message_send");
        assert_eq!(top.calls_24h, 3);
    }

    #[test]
    fn test_top_group_ties_break_by_first_seen() {
        let facts = RetainedFacts {
            api_calls: Some(vec![
                api_fact(NOW - 300, "telegram", "message_send", false, false),
                api_fact(NOW - 250, "lark", "message_send", false, false),
                api_fact(NOW - 200, "telegram", "message_send", false, false),
                api_fact(NOW - 150, "lark", "message_send", false, false),
            ]),
            ..Default::default()
        };
        let snapshot = aggregator().snapshot(&facts, &reachable_probe(), NOW);
        assert_eq!(snapshot.top_groups_24h[0].provider, "telegram");
        assert_eq!(snapshot.top_groups_24h[1].provider, "lark");
    }

    #[test]
    fn test_scenario_degraded_on_critical_error() {
        let facts = RetainedFacts {
            critical_errors: Some(vec![Fact::new(
                NOW - 60,
                FactKind::CriticalError {
                    signature: "crash".to_string(),
                    fingerprint: "panic: runtime error".to_string(),
                    occurrences: 1,
                    first_seen: NOW - 60,
                    last_seen: NOW - 60,
                },
                "panic: runtime error",
            )]),
            ..Default::default()
        };
        let snapshot = aggregator().snapshot(&facts, &reachable_probe(), NOW);
        assert_eq!(snapshot.service_status, ServiceStatus::Degraded);
        assert_eq!(snapshot.metrics["critical_errors_active"].value, Some(1.0));
        assert_eq!(snapshot.critical_fingerprints.len(), 1);
    }

    #[test]
    fn test_scenario_down_overrides_everything() {
        let probe = ProbeStatus::default();
        let facts = RetainedFacts {
            api_calls: Some(vec![api_fact(NOW - 100, "lark", "message_send", false, false)]),
            ..Default::default()
        };
        let snapshot = aggregator().snapshot(&facts, &probe, NOW);
        assert_eq!(snapshot.service_status, ServiceStatus::Down);
    }

    #[test]
    fn test_status_recomputed_without_hysteresis() {
        assert_eq!(service_status(true, 0, 0), ServiceStatus::Running);
        assert_eq!(service_status(true, 1, 0), ServiceStatus::Degraded);
        assert_eq!(service_status(true, 0, 2), ServiceStatus::Degraded);
        assert_eq!(service_status(false, 0, 0), ServiceStatus::Down);
        // Fresh inputs, fresh answer.
        assert_eq!(service_status(true, 0, 0), ServiceStatus::Running);
    }

    #[test]
    fn test_coverage_ratio_counts_core_metrics() {
        let snapshot = aggregator().snapshot(&RetainedFacts::default(), &reachable_probe(), NOW);
        // Only the probe-backed core metrics carry values here.
        let coverage = snapshot.metrics["coverage_ratio"].value.unwrap();
        let expected = 2.0 / P0_CORE_METRICS.len() as f64;
        let expected = (expected * 10_000.0).round() / 10_000.0;
        assert!((coverage - expected).abs() < 1e-9);
    }

    #[test]
    fn test_local_day_window_respects_offset() {
        // 2023-11-14T22:13:20Z; at UTC+8 it is already 2023-11-15.
        let aggregator = Aggregator::new(UtcOffset::from_hms(8, 0, 0).unwrap(), 5);
        let yesterday_utc = NOW - 8 * 3_600; // still 11-14 at UTC+8
        let facts = RetainedFacts {
            api_calls: Some(vec![
                api_fact(NOW - 60, "lark", "message_send", false, false),
                api_fact(yesterday_utc, "lark", "message_send", false, false),
            ]),
            ..Default::default()
        };
        let snapshot = aggregator.snapshot(&facts, &reachable_probe(), NOW);
        assert_eq!(snapshot.metrics["api_call_total_today"].value, Some(1.0));
        assert_eq!(snapshot.metrics["api_call_total_24h"].value, Some(2.0));
    }

    #[test]
    fn test_uptime_ready_from_probe() {
        let snapshot = aggregator().snapshot(&RetainedFacts::default(), &reachable_probe(), NOW);
        let uptime = &snapshot.metrics["service_uptime_secs"];
        assert_eq!(uptime.readiness, Readiness::Ready);
        assert_eq!(uptime.value, Some(3_600.0));
    }

    #[test]
    fn test_snapshot_history_partitions_by_day() {
        let store = Arc::new(MemoryStore::new());
        let history = SnapshotHistory::new(store, UtcOffset::UTC);
        let snapshot = aggregator().snapshot(&RetainedFacts::default(), &reachable_probe(), NOW);

        history.append(&snapshot).unwrap();
        history.append(&snapshot).unwrap();
        assert_eq!(history.day(NOW).unwrap().len(), 2);
        // A different day is a different partition.
        assert!(history.day(NOW + 3 * 86_400).unwrap().is_empty());
    }
}
