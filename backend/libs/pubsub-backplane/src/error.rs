//! Error types for backplane operations

use thiserror::Error;

/// Backplane errors
#[derive(Error, Debug)]
pub enum BackplaneError {
    /// Redis connection or operation error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Envelope serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Envelope received that does not match the expected shape
    #[error("Invalid message format: {0}")]
    InvalidMessage(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BackplaneError::InvalidMessage("missing payload".to_string());
        assert_eq!(err.to_string(), "Invalid message format: missing payload");
    }

    #[test]
    fn test_error_from_serde() {
        let json_err = serde_json::from_str::<String>("{not json").unwrap_err();
        let err: BackplaneError = json_err.into();
        assert!(matches!(err, BackplaneError::Serialization(_)));
    }
}
