//! Log-line classification into typed facts.
//!
//! The extractor is a best-effort, keyword/regex classifier with an explicit
//! `unknown` escape hatch: hosts that match no known provider and paths that
//! match no endpoint-group rule are reported as `unknown` rather than forced
//! into a named category. Classification rules are compiled once at
//! construction, in the manner of compiled processing rules.

use crate::fact::{normalize_fingerprint, Fact, FactKind};
use regex::Regex;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Severity of a raw log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

impl Severity {
    pub fn parse(text: &str) -> Option<Self> {
        match text.to_ascii_uppercase().as_str() {
            "DEBUG" | "DBG" => Some(Severity::Debug),
            "INFO" => Some(Severity::Info),
            "WARN" | "WARNING" => Some(Severity::Warn),
            "ERROR" | "ERR" | "FATAL" => Some(Severity::Error),
            _ => None,
        }
    }
}

/// One raw log line from the upstream log source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    /// Unix seconds.
    pub timestamp: i64,
    pub severity: Severity,
    pub message: String,
}

/// Known provider hosts, matched exactly or by suffix.
const PROVIDER_HOSTS: &[(&str, &str)] = &[
    ("open.larksuite.com", "lark"),
    ("open.feishu.cn", "lark"),
    ("api.telegram.org", "telegram"),
    ("slack.com", "slack"),
    ("discord.com", "discord"),
    ("api.openai.com", "openai"),
    ("api.anthropic.com", "anthropic"),
    ("googleapis.com", "google"),
    ("graph.microsoft.com", "microsoft"),
    ("api.github.com", "github"),
];

/// Ordered endpoint-group keyword rules; first match wins. Paths matching no
/// rule are grouped as `unknown`, not as a catch-all named group.
const ENDPOINT_GROUPS: &[(&str, &[&str])] = &[
    ("auth", &["oauth", "auth", "token", "login"]),
    ("account", &["account", "tenant", "profile", "user"]),
    ("webhooks", &["webhook", "callback"]),
    ("media", &["media", "image", "file", "upload", "download"]),
    ("message_receive", &["getupdates", "received", "inbound"]),
    ("message_send", &["sendmessage", "postmessage", "messages", "send"]),
    ("scheduler", &["cron", "schedule", "timer"]),
    ("admin_config", &["admin", "config", "settings"]),
    ("health_metrics", &["health", "metrics", "status", "ping"]),
];

/// Hard-failure signatures that qualify as critical system errors. Generic
/// business-logic errors must not appear here.
const CRITICAL_SIGNATURES: &[(&str, &str)] = &[
    ("startup_failure", r"(?i)unrecoverable startup|failed to start"),
    ("out_of_memory", r"(?i)out of memory|\bOOM\b|memory exhausted"),
    (
        "crash",
        r"(?i)panic: |unhandled (?:crash|exception)|fatal runtime error",
    ),
    (
        "port_in_use",
        r"(?i)address already in use|port \d+ (?:is )?already in use",
    ),
    ("shutdown_timeout", r"(?i)shutdown tim(?:ed\s?out|eout)"),
];

/// Classifies raw log lines into typed facts.
pub struct Extractor {
    url: Regex,
    status_explicit: Regex,
    status_bare: Regex,
    rate_limit: Regex,
    latency: Regex,
    request_id: Regex,
    method: Regex,
    cron_run: Regex,
    skill_invoked: Regex,
    critical: Vec<(&'static str, Regex)>,
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new()
    }
}

impl Extractor {
    #[allow(clippy::unwrap_used)] // patterns are fixed and tested
    pub fn new() -> Self {
        Self {
            url: Regex::new(r#"https?://[^\s"'<>]+"#).unwrap(),
            status_explicit: Regex::new(r"(?i)status(?:\s+code)?[:=]?\s*(\d{3})").unwrap(),
            status_bare: Regex::new(r"\b([1-5]\d{2})\b").unwrap(),
            rate_limit: Regex::new(r"(?i)too many requests|throttl|rate.?limit").unwrap(),
            latency: Regex::new(r"\b(\d+)\s*ms\b").unwrap(),
            request_id: Regex::new(r"(?i)request[_\s-]?id[:=]?\s*([A-Za-z0-9._-]+)").unwrap(),
            method: Regex::new(r"\b(GET|POST|PUT|DELETE|PATCH|HEAD)\b").unwrap(),
            cron_run: Regex::new(
                r#"(?i)(?:cron|scheduled) job ['"]?([A-Za-z0-9_.:-]+)['"]? (completed|failed)"#,
            )
            .unwrap(),
            skill_invoked: Regex::new(
                r#"(?i)(?:invoking skill|skill) ['"]?([A-Za-z0-9_.:-]+)['"]?(?: invoked)?"#,
            )
            .unwrap(),
            critical: CRITICAL_SIGNATURES
                .iter()
                .map(|(name, pattern)| (*name, Regex::new(pattern).unwrap()))
                .collect(),
        }
    }

    /// Produces typed facts for a bounded window of raw log lines. An empty
    /// window yields zero facts; this is not an error.
    pub fn extract(&self, lines: &[LogLine]) -> Vec<Fact> {
        let mut facts = Vec::new();
        // (signature, fingerprint) -> (occurrences, first_seen, last_seen, message)
        let mut errors: HashMap<(String, String), (u32, i64, i64, String)> = HashMap::new();
        let mut error_order: Vec<(String, String)> = Vec::new();

        for line in lines {
            if let Some(fact) = self.classify_api_call(line) {
                facts.push(fact);
            }
            if let Some(fact) = self.classify_cron_run(line) {
                facts.push(fact);
            }
            if let Some(fact) = self.classify_skill_invocation(line) {
                facts.push(fact);
            }
            if let Some(signature) = self.match_critical(line) {
                let fingerprint = normalize_fingerprint(&line.message);
                let key = (signature.to_string(), fingerprint);
                match errors.get_mut(&key) {
                    Some(entry) => {
                        entry.0 += 1;
                        entry.1 = entry.1.min(line.timestamp);
                        entry.2 = entry.2.max(line.timestamp);
                    }
                    None => {
                        errors.insert(
                            key.clone(),
                            (1, line.timestamp, line.timestamp, line.message.clone()),
                        );
                        error_order.push(key);
                    }
                }
            }
        }

        // Repeated occurrences of the same error collapse to one fact.
        for key in error_order {
            let (occurrences, first_seen, last_seen, message) = errors[&key].clone();
            let (signature, fingerprint) = key;
            facts.push(Fact::new(
                last_seen,
                FactKind::CriticalError {
                    signature,
                    fingerprint,
                    occurrences,
                    first_seen,
                    last_seen,
                },
                &message,
            ));
        }

        debug!("extracted {} facts from {} log lines", facts.len(), lines.len());
        facts
    }

    fn classify_api_call(&self, line: &LogLine) -> Option<Fact> {
        let raw_url = self.url.find(&line.message)?;
        let trimmed = raw_url.as_str().trim_end_matches([')', ',', '.', ';', '"', '\'']);
        let Ok(url) = Url::parse(trimmed) else {
            debug!("skipping malformed URL in log line: {trimmed}");
            return None;
        };
        let host = url.host_str()?.to_string();

        let provider = map_provider(&host);
        let path_template = template_path(url.path());
        let endpoint_group = map_endpoint_group(url.path());

        // Bare status search must not pick digits out of the URL itself.
        let without_url = line.message.replace(raw_url.as_str(), "");
        let status_code = self
            .status_explicit
            .captures(&line.message)
            .or_else(|| self.status_bare.captures(&without_url))
            .and_then(|cap| cap[1].parse::<u16>().ok())
            .filter(|code| (100..=599).contains(code));

        let rate_limited =
            status_code == Some(429) || self.rate_limit.is_match(&line.message);
        // No parseable status is conservatively a failure, never a success.
        let failed = status_code.map_or(true, |code| code >= 400);

        let method = self
            .method
            .find(&line.message)
            .map(|m| m.as_str().to_string());
        let latency_ms = self
            .latency
            .captures(&without_url)
            .and_then(|cap| cap[1].parse::<u64>().ok());
        let request_id = self
            .request_id
            .captures(&without_url)
            .map(|cap| cap[1].to_string());

        Some(Fact::new(
            line.timestamp,
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
            },
            &line.message,
        ))
    }

    fn classify_cron_run(&self, line: &LogLine) -> Option<Fact> {
        let caps = self.cron_run.captures(&line.message)?;
        Some(Fact::new(
            line.timestamp,
            FactKind::CronRun {
                job: caps[1].to_string(),
                outcome: caps[2].to_lowercase(),
            },
            &line.message,
        ))
    }

    fn classify_skill_invocation(&self, line: &LogLine) -> Option<Fact> {
        let lowered = line.message.to_lowercase();
        if !lowered.contains("skill") || !lowered.contains("invok") {
            return None;
        }
        let caps = self.skill_invoked.captures(&line.message)?;
        Some(Fact::new(
            line.timestamp,
            FactKind::SkillInvocation {
                skill: caps[1].to_string(),
            },
            &line.message,
        ))
    }

    fn match_critical(&self, line: &LogLine) -> Option<&'static str> {
        self.critical
            .iter()
            .find(|(_, regex)| regex.is_match(&line.message))
            .map(|(name, _)| *name)
    }
}

/// Maps a host to a known provider via exact or suffix match, else `unknown`.
fn map_provider(host: &str) -> String {
    for (entry, provider) in PROVIDER_HOSTS {
        if host == *entry || host.ends_with(&format!(".{entry}")) {
            return (*provider).to_string();
        }
    }
    "unknown".to_string()
}

/// Maps a URL path to a coarse endpoint group via ordered keyword rules,
/// else `unknown`.
fn map_endpoint_group(path: &str) -> String {
    let lowered = path.to_lowercase();
    for (group, keywords) in ENDPOINT_GROUPS {
        if keywords.iter().any(|kw| lowered.contains(kw)) {
            return (*group).to_string();
        }
    }
    "unknown".to_string()
}

/// Replaces identifier-shaped path segments with `:id` so paths with
/// different resource ids share a template.
fn template_path(path: &str) -> String {
    let segments: Vec<String> = path
        .split('/')
        .map(|segment| {
            if is_identifier_segment(segment) {
                ":id".to_string()
            } else {
                segment.to_string()
            }
        })
        .collect();
    segments.join("/")
}

fn is_identifier_segment(segment: &str) -> bool {
    if segment.len() >= 4 && segment.chars().all(|c| c.is_ascii_digit()) {
        return true;
    }
    if segment.len() >= 16 && segment.chars().all(|c| c.is_ascii_hexdigit() || c == '-') {
        return true;
    }
    false
}
