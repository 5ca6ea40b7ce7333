//! # Gateway Telemetry
//!
//! Telemetry fact pipeline for a running agent-gateway process. The library
//! observes the gateway strictly read-only and produces periodic,
//! privacy-filtered metrics for a dashboard plus a redacted outbound feed.
//!
//! ## Pipeline
//!
//! - [`extract`]: turns raw log lines into typed, deduplicated facts
//! - [`cursor`]: idempotent incremental-read watermarks per fact category
//! - [`retention`]: append-only fact logs compacted to a retention horizon
//! - [`aggregate`]: rolling-window metrics with an explicit readiness taxonomy
//! - [`sync`]: whitelisted, redacted, signed delivery to an external sink
//! - [`trigger`]: debounced, mutually-exclusive pipeline invocation
//!
//! All shared state lives in flat files written through the [`store`]
//! abstraction with temp-write-then-rename semantics, so overlapping
//! extraction and sync processes always observe fully-old or fully-new
//! content.

#![deny(clippy::all)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

/// Rolling-window metric aggregation and service status.
pub mod aggregate;

/// Environment-driven configuration.
pub mod config;

/// Idempotent incremental-read cursors.
pub mod cursor;

/// Pipeline error types.
pub mod error;

/// Typed fact records and dedupe keys.
pub mod fact;

/// Log-line classification into facts.
pub mod extract;

/// Pipeline orchestration for one invocation.
pub mod pipeline;

/// Collaborator interfaces: upstream log source and control-plane probe.
pub mod probe;

/// Append-log retention compaction.
pub mod retention;

/// Injectable atomic state storage.
pub mod store;

/// Outbound sync transmitter.
pub mod sync;

/// Debounced, lock-guarded trigger controller.
pub mod trigger;

/// Maximum in-cycle delivery attempts before a sink batch is left for the
/// next sync cycle. The batch itself is never dropped; the sync cursor only
/// advances on success.
pub(crate) const SYNC_RETRY_COUNT: usize = 3;

/// Library version, reported at agent startup.
pub const TELEMETRY_VERSION: &str = env!("CARGO_PKG_VERSION");
