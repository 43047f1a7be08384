// ============================================================================
// Error Handling
// ============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransitError {
    /// Network failure, timeout, or a non-2xx answer from an upstream source.
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The upstream answered but the body did not have the expected shape.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("No data from any source: {0}")]
    NoDataAnySource(String),

    /// The persistent topology store (shared or local) could not be used.
    #[error("Cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("Transit data temporarily unavailable")]
    TransitDataUnavailable,

    #[error("Invalid coordinate ({lat}, {lon})")]
    InvalidCoordinate { lat: f64, lon: f64 },

    #[error("Coordinate ({lat}, {lon}) is outside the service area")]
    OutsideServiceArea { lat: f64, lon: f64 },

    #[error("Startup failed: {0}")]
    Startup(String),
}

impl From<reqwest::Error> for TransitError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            TransitError::MalformedResponse(e.to_string())
        } else {
            TransitError::UpstreamUnavailable(e.to_string())
        }
    }
}

impl From<serde_json::Error> for TransitError {
    fn from(e: serde_json::Error) -> Self {
        TransitError::MalformedResponse(e.to_string())
    }
}

impl From<std::io::Error> for TransitError {
    fn from(e: std::io::Error) -> Self {
        TransitError::CacheUnavailable(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TransitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_errors_become_cache_unavailable() {
        let err: TransitError =
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only").into();
        assert!(matches!(err, TransitError::CacheUnavailable(_)));
    }

    #[test]
    fn test_json_errors_become_malformed_response() {
        let err: TransitError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, TransitError::MalformedResponse(_)));
    }

    #[test]
    fn test_unavailable_message() {
        assert_eq!(
            TransitError::TransitDataUnavailable.to_string(),
            "Transit data temporarily unavailable"
        );
    }
}
