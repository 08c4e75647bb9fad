//! Error taxonomy shared by configuration loading and sensor fetching.
//!
//! Cleaning problems are not errors here: they are recorded as a
//! [`RejectionReason`](crate::readings::RejectionReason) on the sample.

use thiserror::Error;

/// Malformed configuration. Always fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("region '{code}' has a degenerate bounding box (min must be < max on both axes)")]
    DegenerateRegion { code: String },

    #[error("region code '{0}' is configured more than once")]
    DuplicateRegion(String),

    #[error("region code must not be empty")]
    EmptyRegionCode,

    #[error("local region '{0}' is not among the configured regions")]
    UnknownLocalRegion(String),

    #[error("healthy threshold {0} is outside 0..=100")]
    InvalidThreshold(f64),

    #[error("invalid range for {name}: min {min} > max {max}")]
    InvalidBounds { name: &'static str, min: f64, max: f64 },

    #[error("invalid setting {name}: {reason}")]
    InvalidSetting { name: &'static str, reason: String },

    #[error("'{0}' cannot be used as a sheet name")]
    InvalidSheetName(String),

    #[error("sheet '{0}' would receive more than one kind of row")]
    SheetNameClash(String),
}

/// Failure reported by a [`SensorSource`](crate::services::SensorSource).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// Rate limiting, timeouts, 5xx. Worth retrying.
    #[error("transient fetch error: {0}")]
    Transient(String),

    /// Bad credentials, malformed request, unparseable payload.
    #[error("fatal fetch error: {0}")]
    Fatal(String),
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(FetchError::Transient("429".into()).is_retryable());
        assert!(!FetchError::Fatal("401".into()).is_retryable());
    }

    #[test]
    fn test_config_error_messages_name_the_region() {
        let err = ConfigError::DegenerateRegion { code: "TV".into() };
        assert!(err.to_string().contains("'TV'"));
    }
}
