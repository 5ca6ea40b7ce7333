//! Collaborator interfaces for the monitored gateway.
//!
//! The pipeline observes the gateway through two read-only seams: an upstream
//! log source supplying a bounded window of raw lines, and a control-plane
//! probe reporting process reachability. Production implementations read the
//! gateway's log file and pidfile; tests substitute fixtures.

use crate::extract::{LogLine, Severity};
use std::fs;
use std::path::PathBuf;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::debug;

/// Upstream log source: an ordered, bounded window of raw log lines.
pub trait LogSource: Send + Sync {
    /// Returns the current window. An unreachable or empty source yields an
    /// empty window, not an error; dependent metrics degrade to Gap.
    fn window(&self) -> Vec<LogLine>;
}

/// Control-plane probe result for the monitored service.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProbeStatus {
    pub reachable: bool,
    pub pid: Option<u32>,
    /// Seconds since the monitored process started, when derivable.
    pub uptime_secs: Option<u64>,
    /// Unexpected restarts observed in the trailing 24h, when the restart
    /// source is connected.
    pub unexpected_restarts_24h: Option<u64>,
}

/// Control-plane probe for the monitored service.
pub trait ControlPlaneProbe: Send + Sync {
    fn status(&self) -> ProbeStatus;
}

/// Checks process liveness with a signal-0 probe.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    // Signal 0 performs permission and existence checks without delivering.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    true
}

/// Log source reading the tail of the gateway's log file.
///
/// Lines are expected as `<rfc3339-timestamp> <SEVERITY> <message>`; lines
/// that do not parse are skipped.
pub struct FileLogSource {
    path: PathBuf,
    max_lines: usize,
}

impl FileLogSource {
    pub fn new(path: impl Into<PathBuf>, max_lines: usize) -> Self {
        Self {
            path: path.into(),
            max_lines,
        }
    }

    fn parse_line(line: &str) -> Option<LogLine> {
        let mut parts = line.splitn(3, ' ');
        let timestamp = OffsetDateTime::parse(parts.next()?, &Rfc3339)
            .ok()?
            .unix_timestamp();
        let severity = Severity::parse(parts.next()?)?;
        let message = parts.next()?.trim().to_string();
        Some(LogLine {
            timestamp,
            severity,
            message,
        })
    }
}

impl LogSource for FileLogSource {
    fn window(&self) -> Vec<LogLine> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) => {
                debug!("gateway log {} unreadable: {err}", self.path.display());
                return Vec::new();
            }
        };

        let lines: Vec<&str> = contents.lines().collect();
        let start = lines.len().saturating_sub(self.max_lines);
        lines[start..]
            .iter()
            .filter_map(|line| Self::parse_line(line))
            .collect()
    }
}

/// Control-plane probe backed by the gateway's pidfile.
///
/// Reachability means the pidfile names a live process. Uptime derives from
/// the pidfile's modification time. A restart counter is not connected here;
/// the dependent metric reports Gap.
pub struct PidfileProbe {
    pidfile: PathBuf,
}

impl PidfileProbe {
    pub fn new(pidfile: impl Into<PathBuf>) -> Self {
        Self {
            pidfile: pidfile.into(),
        }
    }
}

impl ControlPlaneProbe for PidfileProbe {
    fn status(&self) -> ProbeStatus {
        let Ok(contents) = fs::read_to_string(&self.pidfile) else {
            return ProbeStatus::default();
        };
        let Ok(pid) = contents.trim().parse::<u32>() else {
            return ProbeStatus::default();
        };
        if !pid_alive(pid) {
            return ProbeStatus::default();
        }

        let uptime_secs = fs::metadata(&self.pidfile)
            .ok()
            .and_then(|meta| meta.modified().ok())
            .and_then(|mtime| mtime.elapsed().ok())
            .map(|elapsed| elapsed.as_secs());

        ProbeStatus {
            reachable: true,
            pid: Some(pid),
            uptime_secs,
            unexpected_restarts_24h: None,
        }
    }
}
