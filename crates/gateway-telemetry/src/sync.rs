//! Outbound sync to the telemetry sink with retry logic.
//!
//! This module handles the final stage of fact delivery: building
//! whitelisted, privacy-screened payloads and sending them to the sink via
//! HTTP POST with bounded retry on transient failures. The sync cursor
//! commits only after the sink acknowledges a batch, so delivery is
//! at-least-once and a sink outage never loses facts.
//!
//! Privacy enforcement is structural and reject-whole: every outbound record
//! is rebuilt from an explicit field whitelist, a record carrying any field
//! outside it is dropped entirely, and a record whose string fields match a
//! sensitive pattern (email, bearer token, credential-shaped key-value) is
//! dropped entirely as well. Nothing is redacted-and-kept.

use crate::config::TelemetryConfig;
use crate::cursor::CursorStore;
use crate::error::TelemetryError;
use crate::fact::{Fact, FactCategory, FactKind};
use crate::store::StateStore;
use crate::SYNC_RETRY_COUNT;
use hmac::{Hmac, Mac};
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

type HmacSha256 = Hmac<Sha256>;

/// The only fields an outbound record may carry. Everything else is a
/// privacy defect in the record, and the record is rejected whole.
pub const OUTBOUND_FIELD_WHITELIST: &[&str] = &[
    "timestamp",
    "kind",
    "dedupe_key",
    "provider",
    "method",
    "host",
    "path_template",
    "endpoint_group",
    "status_code",
    "latency_ms",
    "rate_limited",
    "failed",
    "request_id",
];

/// Payload kind stamped on every sink envelope.
const SYNC_PAYLOAD_KIND: &str = "facts";

/// Outcome of one sync pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Records acknowledged by the sink.
    pub delivered: usize,
    /// Records rejected locally by the privacy filter.
    pub dropped: usize,
    /// Batches sent.
    pub batches: usize,
}

#[derive(Serialize)]
struct SyncEnvelope<'a> {
    kind: &'static str,
    tenant_id: &'a str,
    project_id: &'a str,
    generated_at: i64,
    payload: &'a [Value],
}

/// Detects sensitive content that must never leave the host, even inside a
/// whitelisted field.
struct SensitiveScanner {
    email: Regex,
    bearer: Regex,
    secret_kv: Regex,
}

impl SensitiveScanner {
    fn new() -> Result<Self, TelemetryError> {
        let compile = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|err| TelemetryError::InvalidConfig(format!("privacy rule: {err}")))
        };
        Ok(Self {
            email: compile(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}")?,
            bearer: compile(r"(?i)bearer\s+[A-Za-z0-9._~+/=-]{8,}")?,
            secret_kv: compile(
                r#"(?i)\b(authorization|cookie|set-cookie|api[_-]?key|token|secret|password)\s*[:=]\s*[^\s,;"']+"#,
            )?,
        })
    }

    fn matches(&self, text: &str) -> bool {
        self.email.is_match(text)
            || self.bearer.is_match(text)
            || self.secret_kv.is_match(text)
    }
}

/// Transmitter for the telemetry sink endpoint.
///
/// Handles payload construction, request signing, and retry with a bounded
/// attempt count. The delivery cursor advances per acknowledged batch.
pub struct SyncTransmitter {
    client: reqwest::Client,
    config: Arc<TelemetryConfig>,
    scanner: SensitiveScanner,
}

impl SyncTransmitter {
    pub fn new(config: Arc<TelemetryConfig>) -> Result<Self, TelemetryError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.sync_timeout_secs))
            .build()
            .map_err(|err| TelemetryError::InvalidConfig(format!("http client: {err}")))?;
        Ok(Self {
            client,
            config,
            scanner: SensitiveScanner::new()?,
        })
    }

    /// Delivers the not-yet-synced API-call facts in batches.
    ///
    /// The sync cursor commits after each acknowledged batch, never before,
    /// so a failed or timed-out POST leaves the cursor where it was and the
    /// batch is retransmitted on the next pass. Records the privacy filter
    /// rejects count as handled; the cursor moves past them.
    pub async fn sync(
        &self,
        store: Arc<dyn StateStore>,
        facts: &[Fact],
        now: i64,
    ) -> Result<SyncOutcome, TelemetryError> {
        if self.config.sink_url.is_empty() {
            debug!("sync disabled: no sink url configured");
            return Ok(SyncOutcome::default());
        }

        let cursors = CursorStore::sync(store, FactCategory::ApiCall);
        let cursor = cursors.load()?;
        let (pending, _) = cursor.accept(facts.to_vec());
        if pending.is_empty() {
            return Ok(SyncOutcome::default());
        }

        let mut outcome = SyncOutcome::default();
        let mut committed = cursor;

        for batch in pending.chunks(self.config.sync_batch_size) {
            let mut records = Vec::with_capacity(batch.len());
            for fact in batch {
                match self.build_record(fact) {
                    Some(record) => records.push(record),
                    None => outcome.dropped += 1,
                }
            }

            // A batch whose records were all rejected is still handled:
            // the cursor moves past it so it is never retried.
            if !records.is_empty() {
                let body = serde_json::to_vec(&SyncEnvelope {
                    kind: SYNC_PAYLOAD_KIND,
                    tenant_id: &self.config.tenant_id,
                    project_id: &self.config.project_id,
                    generated_at: now,
                    payload: &records,
                })?;
                self.send(&body).await?;
                outcome.delivered += records.len();
                outcome.batches += 1;
            }

            let (_, next) = committed.accept(batch.to_vec());
            cursors.commit(&next)?;
            committed = next;
        }

        debug!(
            "sync delivered {} records in {} batches ({} dropped)",
            outcome.delivered, outcome.batches, outcome.dropped
        );
        Ok(outcome)
    }

    /// Rebuilds a fact as an outbound record containing only whitelisted
    /// fields. Returns `None` for non-API facts, for records carrying any
    /// field outside the whitelist, and for records whose string fields
    /// match a sensitive pattern.
    fn build_record(&self, fact: &Fact) -> Option<Value> {
        if !matches!(fact.kind, FactKind::ApiCall { .. }) {
            return None;
        }

        let serialized = serde_json::to_value(fact).ok()?;
        let fields = serialized.as_object()?;

        let mut record = Map::new();
        for (key, value) in fields {
            if !OUTBOUND_FIELD_WHITELIST.contains(&key.as_str()) {
                warn!("rejecting record: field {key} is not whitelisted");
                return None;
            }
            if let Value::String(text) = value {
                if self.scanner.matches(text) {
                    warn!("rejecting record: sensitive content in field {key}");
                    return None;
                }
            }
            record.insert(key.clone(), value.clone());
        }
        Some(Value::Object(record))
    }

    async fn send(&self, body: &[u8]) -> Result<(), TelemetryError> {
        let mut attempts = 0;

        loop {
            attempts += 1;
            let mut req = self
                .client
                .post(&self.config.sink_url)
                .header("Content-Type", "application/json")
                .body(body.to_vec());
            if let Some(api_key) = &self.config.sink_api_key {
                req = req.header("authorization", format!("Bearer {api_key}"));
            }
            if let Some(secret) = &self.config.sink_signing_secret {
                req = req.header("x-signature", sign(secret, body));
            }
            let resp = req.send().await;

            match resp {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => {
                    let status = resp.status();
                    let code = status.as_u16();
                    // 4xx is permanent for this cycle; retrying won't change
                    // the answer. The cursor still does not advance.
                    if status.is_client_error() {
                        error!("sink rejected batch: HTTP {code}");
                        return Err(TelemetryError::SinkStatus(code));
                    }
                    if attempts >= SYNC_RETRY_COUNT {
                        error!("sink rejected batch after {attempts} attempts: HTTP {code}");
                        return Err(TelemetryError::SinkStatus(code));
                    }
                    debug!("sink returned HTTP {code}, attempt {attempts}, retrying");
                }
                Err(err) => {
                    if attempts >= SYNC_RETRY_COUNT {
                        error!("sink unreachable after {attempts} attempts: {err}");
                        return Err(TelemetryError::Delivery(err.to_string()));
                    }
                    debug!("sink request failed ({err}), attempt {attempts}, retrying");
                }
            }

            tokio::time::sleep(Duration::from_millis(200 * attempts as u64)).await;
        }
    }
}

/// HMAC-SHA256 over the exact request body, hex encoded.
fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        // HMAC accepts keys of any length; unreachable in practice.
        Err(_) => return String::new(),
    };
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}
