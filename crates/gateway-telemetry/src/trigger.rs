//! Trigger controller: debounce and single-flight for pipeline runs.
//!
//! Triggers arrive from a timer and from external nudges, so two guards sit
//! in front of the pipeline: a persisted debounce stamp that enforces minimum
//! spacing between accepted triggers, and a PID lock file that keeps at most
//! one run in flight across processes. The debounce stamp is written before
//! the job launches, so a failed run still counts against the spacing.

use crate::error::TelemetryError;
use crate::probe::pid_alive;
use crate::store::StateStore;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

const TRIGGER_STAMP: &str = "last-trigger.json";
const PIPELINE_LOCK: &str = "pipeline.lock";

/// What the controller did with a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerDecision {
    /// Accepted; the pipeline job was launched detached.
    Launched,
    /// Rejected; the previous accepted trigger is too recent.
    Debounced { remaining_secs: u64 },
    /// Rejected; another live process holds the pipeline lock.
    Locked { holder_pid: u32 },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TriggerStamp {
    triggered_at: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct LockFile {
    pid: u32,
}

/// Gatekeeper for pipeline runs.
pub struct TriggerController {
    store: Arc<dyn StateStore>,
    debounce_secs: u64,
}

impl TriggerController {
    pub fn new(store: Arc<dyn StateStore>, debounce_secs: u64) -> Self {
        Self {
            store,
            debounce_secs,
        }
    }

    /// Applies the debounce and lock guards; on acceptance, stamps the
    /// trigger, takes the lock, and launches `job` detached. The lock is
    /// released when the job finishes, success or not.
    pub fn trigger<F, Fut>(&self, now: i64, job: F) -> Result<TriggerDecision, TelemetryError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if let Some(remaining_secs) = self.debounce_remaining(now)? {
            debug!("trigger debounced, {remaining_secs}s until next accepted");
            return Ok(TriggerDecision::Debounced { remaining_secs });
        }

        match self.acquire_lock() {
            Ok(()) => {}
            Err(TelemetryError::LockHeld(holder_pid)) => {
                debug!("trigger rejected, pipeline lock held by pid {holder_pid}");
                return Ok(TriggerDecision::Locked { holder_pid });
            }
            Err(err) => return Err(err),
        }

        // Stamp before launch: a run that fails still spaces the next one.
        let stamp = serde_json::to_vec(&TriggerStamp { triggered_at: now })?;
        self.store.store(TRIGGER_STAMP, &stamp)?;

        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            job().await;
            if let Err(err) = store.remove(PIPELINE_LOCK) {
                warn!("failed to release pipeline lock: {err}");
            }
        });

        info!("pipeline run launched");
        Ok(TriggerDecision::Launched)
    }

    /// Seconds left in the debounce window, or `None` when clear.
    fn debounce_remaining(&self, now: i64) -> Result<Option<u64>, TelemetryError> {
        let Some(bytes) = self.store.load(TRIGGER_STAMP)? else {
            return Ok(None);
        };
        let stamp: TriggerStamp = serde_json::from_slice(&bytes)?;
        let elapsed = now.saturating_sub(stamp.triggered_at);
        if elapsed >= 0 && (elapsed as u64) < self.debounce_secs {
            Ok(Some(self.debounce_secs - elapsed as u64))
        } else {
            Ok(None)
        }
    }

    /// Takes the pipeline lock, reclaiming it from dead holders.
    fn acquire_lock(&self) -> Result<(), TelemetryError> {
        if let Some(bytes) = self.store.load(PIPELINE_LOCK)? {
            if let Ok(lock) = serde_json::from_slice::<LockFile>(&bytes) {
                if pid_alive(lock.pid) {
                    return Err(TelemetryError::LockHeld(lock.pid));
                }
                warn!("reclaiming pipeline lock from dead pid {}", lock.pid);
            }
            // Unparseable or stale lock: fall through and overwrite.
        }
        let lock = serde_json::to_vec(&LockFile {
            pid: std::process::id(),
        })?;
        self.store.store(PIPELINE_LOCK, &lock)
    }
}
