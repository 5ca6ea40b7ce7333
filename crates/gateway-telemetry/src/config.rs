use crate::error::TelemetryError;
use std::env;
use std::path::PathBuf;
use time::UtcOffset;

/// Configuration for the telemetry pipeline and outbound sync.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Directory holding cursor files, fact logs, and snapshot history.
    pub state_dir: PathBuf,
    /// Path to the gateway log file observed by the extractor.
    pub gateway_log_path: PathBuf,
    /// Path to the gateway pidfile used by the control-plane probe.
    pub gateway_pidfile: PathBuf,
    /// Sink endpoint URL for outbound sync (empty disables sync).
    pub sink_url: String,
    /// Bearer key passed through to the sink (never persisted).
    pub sink_api_key: Option<String>,
    /// HMAC-SHA256 signing secret for outbound payloads.
    pub sink_signing_secret: Option<String>,
    /// Tenant identifier stamped on outbound payloads.
    pub tenant_id: String,
    /// Project identifier stamped on outbound payloads.
    pub project_id: String,
    /// Maximum facts per outbound batch.
    pub sync_batch_size: usize,
    /// Timeout for a single sink POST, in seconds.
    pub sync_timeout_secs: u64,
    /// Cadence of the independent sync loop, in seconds.
    pub sync_interval_secs: u64,
    /// Retention horizon for fact logs, in hours.
    pub retention_hours: u64,
    /// Minimum spacing between accepted pipeline triggers, in seconds.
    pub debounce_secs: u64,
    /// Local UTC offset used for calendar-day windows.
    pub local_offset: UtcOffset,
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/gateway-telemetry"),
            gateway_log_path: PathBuf::from("/var/log/agent-gateway/gateway.log"),
            gateway_pidfile: PathBuf::from("/run/agent-gateway.pid"),
            sink_url: String::new(),
            sink_api_key: None,
            sink_signing_secret: None,
            tenant_id: "default".to_string(),
            project_id: "default".to_string(),
            sync_batch_size: 200,
            sync_timeout_secs: 10,
            sync_interval_secs: 300,
            retention_hours: 48,
            debounce_secs: 60,
            local_offset: UtcOffset::UTC,
            log_level: "info".to_string(),
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables.
    pub fn from_env() -> Result<Self, TelemetryError> {
        let defaults = Self::default();

        let state_dir = env::var("AGW_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.state_dir);
        let gateway_log_path = env::var("AGW_GATEWAY_LOG_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.gateway_log_path);
        let gateway_pidfile = env::var("AGW_GATEWAY_PIDFILE")
            .map(PathBuf::from)
            .unwrap_or(defaults.gateway_pidfile);
        let sink_url = env::var("AGW_SINK_URL").unwrap_or_default();
        let sink_api_key = env::var("AGW_SINK_API_KEY").ok();
        let sink_signing_secret = env::var("AGW_SINK_SIGNING_SECRET").ok();
        let tenant_id = env::var("AGW_TENANT_ID").unwrap_or(defaults.tenant_id);
        let project_id = env::var("AGW_PROJECT_ID").unwrap_or(defaults.project_id);
        let sync_batch_size = parse_env("AGW_SYNC_BATCH_SIZE", defaults.sync_batch_size);
        let sync_timeout_secs = parse_env("AGW_SYNC_TIMEOUT_SECS", defaults.sync_timeout_secs);
        let sync_interval_secs = parse_env("AGW_SYNC_INTERVAL_SECS", defaults.sync_interval_secs);
        let retention_hours = parse_env("AGW_RETENTION_HOURS", defaults.retention_hours);
        let debounce_secs = parse_env("AGW_DEBOUNCE_SECS", defaults.debounce_secs);
        let log_level = env::var("AGW_LOG_LEVEL")
            .map(|val| val.to_lowercase())
            .unwrap_or(defaults.log_level);

        // Captured once at startup so window computation stays pure.
        let local_offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);

        let config = Self {
            state_dir,
            gateway_log_path,
            gateway_pidfile,
            sink_url,
            sink_api_key,
            sink_signing_secret,
            tenant_id,
            project_id,
            sync_batch_size,
            sync_timeout_secs,
            sync_interval_secs,
            retention_hours,
            debounce_secs,
            local_offset,
            log_level,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), TelemetryError> {
        if self.sync_batch_size == 0 {
            return Err(TelemetryError::InvalidConfig(
                "sync batch size must be greater than 0".to_string(),
            ));
        }

        if self.sync_timeout_secs == 0 {
            return Err(TelemetryError::InvalidConfig(
                "sync timeout must be greater than 0".to_string(),
            ));
        }

        if self.retention_hours == 0 {
            return Err(TelemetryError::InvalidConfig(
                "retention horizon must be greater than 0".to_string(),
            ));
        }

        if !self.sink_url.is_empty()
            && !self.sink_url.starts_with("http://")
            && !self.sink_url.starts_with("https://")
        {
            return Err(TelemetryError::InvalidConfig(format!(
                "sink URL '{}' must be an http(s) URL",
                self.sink_url
            )));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(TelemetryError::InvalidConfig(format!(
                "invalid log level '{}'; must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }

    /// Retention horizon as a second count.
    pub fn retention_secs(&self) -> i64 {
        self.retention_hours as i64 * 3600
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|val| val.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = TelemetryConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_zero_batch_size() {
        let config = TelemetryConfig {
            sync_batch_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_retention() {
        let config = TelemetryConfig {
            retention_hours: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let config = TelemetryConfig {
            log_level: "verbose".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_bad_sink_url() {
        let config = TelemetryConfig {
            sink_url: "ftp://sink.example.com".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = TelemetryConfig {
            sink_url: "https://sink.example.com/ingest".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_retention_secs() {
        let config = TelemetryConfig {
            retention_hours: 48,
            ..Default::default()
        };
        assert_eq!(config.retention_secs(), 48 * 3600);
    }
}
