//! Typed fact records.
//!
//! A fact is an immutable, timestamped record of one observed occurrence,
//! keyed by a stable dedupe hash of its defining fields. Facts are created by
//! the extractor, never mutated, and removed only by retention compaction.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Fact categories tracked by the pipeline. Each category has its own append
/// log and extraction cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactCategory {
    ApiCall,
    CronRun,
    SkillInvocation,
    CriticalError,
}

impl FactCategory {
    pub const ALL: [FactCategory; 4] = [
        FactCategory::ApiCall,
        FactCategory::CronRun,
        FactCategory::SkillInvocation,
        FactCategory::CriticalError,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FactCategory::ApiCall => "api_call",
            FactCategory::CronRun => "cron_run",
            FactCategory::SkillInvocation => "skill_invocation",
            FactCategory::CriticalError => "critical_error",
        }
    }
}

/// Category-specific dimensions of a fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FactKind {
    ApiCall {
        provider: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        method: Option<String>,
        host: String,
        path_template: String,
        endpoint_group: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        status_code: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        latency_ms: Option<u64>,
        rate_limited: bool,
        failed: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    CronRun {
        job: String,
        outcome: String,
    },
    SkillInvocation {
        skill: String,
    },
    CriticalError {
        signature: String,
        fingerprint: String,
        occurrences: u32,
        first_seen: i64,
        last_seen: i64,
    },
}

impl FactKind {
    pub fn category(&self) -> FactCategory {
        match self {
            FactKind::ApiCall { .. } => FactCategory::ApiCall,
            FactKind::CronRun { .. } => FactCategory::CronRun,
            FactKind::SkillInvocation { .. } => FactCategory::SkillInvocation,
            FactKind::CriticalError { .. } => FactCategory::CriticalError,
        }
    }

    /// The defining fields hashed into the dedupe key, in a stable order.
    fn defining_fields(&self) -> String {
        match self {
            FactKind::ApiCall {
                provider,
                method,
                host,
                path_template,
                endpoint_group,
                status_code,
                latency_ms,
                rate_limited,
                failed,
                request_id,
            } => format!(
                "{provider}|{}|{host}|{path_template}|{endpoint_group}|{}|{}|{rate_limited}|{failed}|{}",
                method.as_deref().unwrap_or(""),
                status_code.map(|c| c.to_string()).unwrap_or_default(),
                latency_ms.map(|l| l.to_string()).unwrap_or_default(),
                request_id.as_deref().unwrap_or(""),
            ),
            FactKind::CronRun { job, outcome } => format!("{job}|{outcome}"),
            FactKind::SkillInvocation { skill } => skill.clone(),
            FactKind::CriticalError {
                signature,
                fingerprint,
                occurrences,
                first_seen,
                last_seen,
            } => format!("{signature}|{fingerprint}|{occurrences}|{first_seen}|{last_seen}"),
        }
    }
}

/// An immutable record of one observed occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    /// Occurrence timestamp, unix seconds.
    pub timestamp: i64,
    /// Stable hash guaranteeing at-most-once recording across overlapping
    /// extraction windows.
    pub dedupe_key: String,
    #[serde(flatten)]
    pub kind: FactKind,
}

impl Fact {
    /// Builds a fact and computes its dedupe key from the timestamp, the
    /// category tag, the defining fields, and the normalized message
    /// fingerprint.
    pub fn new(timestamp: i64, kind: FactKind, message: &str) -> Self {
        let fingerprint = normalize_fingerprint(message);
        let mut hasher = Sha256::new();
        hasher.update(timestamp.to_be_bytes());
        hasher.update(kind.category().as_str().as_bytes());
        hasher.update(kind.defining_fields().as_bytes());
        hasher.update(fingerprint.as_bytes());
        let dedupe_key = hex::encode(hasher.finalize());
        Self {
            timestamp,
            dedupe_key,
            kind,
        }
    }
}

/// Normalizes volatile substrings so repeated occurrences of "the same"
/// message collapse to one fingerprint: long digit runs and hex blobs become
/// stable placeholders.
pub fn normalize_fingerprint(message: &str) -> String {
    // Compiled per call; messages are short and extraction is not hot.
    #[allow(clippy::unwrap_used)]
    let hex_run = regex::Regex::new(r"\b(?:0x)?[0-9a-fA-F]{8,}\b").unwrap();
    #[allow(clippy::unwrap_used)]
    let digit_run = regex::Regex::new(r"\d{4,}").unwrap();

    let normalized = hex_run.replace_all(message, "<hex>");
    digit_run.replace_all(&normalized, "<num>").into_owned()
}
