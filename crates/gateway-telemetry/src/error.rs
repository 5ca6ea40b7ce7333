/// Errors that can occur in the telemetry pipeline.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("state store error: {0}")]
    Store(#[from] std::io::Error),

    #[error("state serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("sink delivery failed: {0}")]
    Delivery(String),

    #[error("sink returned status {0}")]
    SinkStatus(u16),

    #[error("pipeline lock held by pid {0}")]
    LockHeld(u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = TelemetryError::InvalidConfig("missing sink URL".to_string());
        assert_eq!(
            error.to_string(),
            "invalid configuration: missing sink URL"
        );
    }

    #[test]
    fn test_sink_status_display() {
        let error = TelemetryError::SinkStatus(500);
        assert_eq!(error.to_string(), "sink returned status 500");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let error: TelemetryError = io.into();
        assert!(matches!(error, TelemetryError::Store(_)));
    }
}
