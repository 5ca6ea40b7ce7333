#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

use std::{env, sync::Arc};
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use gateway_telemetry::{
    config::TelemetryConfig,
    pipeline::Pipeline,
    probe::{FileLogSource, PidfileProbe},
    store::FileStore,
    trigger::TriggerController,
    TELEMETRY_VERSION,
};

/// Cadence at which the timer nudges the trigger controller; the controller's
/// debounce decides whether a run actually happens.
const TRIGGER_POLL_INTERVAL: u64 = 30;

/// Upper bound on the log window read per extraction pass.
const LOG_WINDOW_LINES: usize = 10_000;

#[tokio::main]
pub async fn main() {
    let log_level = env::var("AGW_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("hyper=off,reqwest=off,rustls=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_target(true)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let config = match TelemetryConfig::from_env() {
        Ok(config) => Arc::new(config),
        Err(err) => {
            error!("Error creating config on telemetry agent startup: {err}");
            return;
        }
    };

    let store = match FileStore::new(&config.state_dir) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            error!(
                "Unable to open state directory {}: {err}",
                config.state_dir.display()
            );
            return;
        }
    };

    let log_source = Arc::new(FileLogSource::new(
        config.gateway_log_path.clone(),
        LOG_WINDOW_LINES,
    ));
    let probe = Arc::new(PidfileProbe::new(config.gateway_pidfile.clone()));

    let pipeline = match Pipeline::new(
        Arc::clone(&config),
        store.clone(),
        log_source,
        probe,
    ) {
        Ok(pipeline) => Arc::new(pipeline),
        Err(err) => {
            error!("Error wiring pipeline on telemetry agent startup: {err}");
            return;
        }
    };

    let controller = TriggerController::new(store, config.debounce_secs);

    info!(
        "telemetry agent {TELEMETRY_VERSION} started, observing {}",
        config.gateway_log_path.display()
    );

    let cancel_token = CancellationToken::new();
    let sync_cancel = cancel_token.clone();
    let sync_pipeline = Arc::clone(&pipeline);
    let sync_interval_secs = config.sync_interval_secs;
    tokio::spawn(async move {
        let mut sync_interval = interval(Duration::from_secs(sync_interval_secs));
        sync_interval.tick().await; // discard first tick, which is instantaneous

        loop {
            tokio::select! {
                _ = sync_interval.tick() => {
                    debug!("running outbound sync");
                    match sync_pipeline.sync_once(unix_now()).await {
                        Ok(outcome) => {
                            if outcome.delivered > 0 || outcome.dropped > 0 {
                                info!(
                                    "sync delivered {} records ({} dropped)",
                                    outcome.delivered, outcome.dropped
                                );
                            }
                        }
                        Err(err) => error!("outbound sync failed: {err}"),
                    }
                }
                _ = sync_cancel.cancelled() => break,
            }
        }
    });

    let mut trigger_interval = interval(Duration::from_secs(TRIGGER_POLL_INTERVAL));

    loop {
        tokio::select! {
            _ = trigger_interval.tick() => {
                let run_pipeline = Arc::clone(&pipeline);
                let now = unix_now();
                let result = controller.trigger(now, move || async move {
                    if let Err(err) = run_pipeline.run_once(now) {
                        error!("pipeline run failed: {err}");
                    }
                });
                match result {
                    Ok(decision) => debug!("trigger decision: {decision:?}"),
                    Err(err) => error!("trigger controller error: {err}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                cancel_token.cancel();
                break;
            }
        }
    }
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}
