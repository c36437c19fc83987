//! Error types for the posecast engine

/// Result type alias using the posecast Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while negotiating sessions, ingesting frames or
/// delivering poses
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Offer could not be parsed or answered
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// Session not found
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Operation attempted on a closed session
    #[error("Session closed: {0}")]
    SessionClosed(String),

    /// Unknown camera slot name
    #[error("Slot not found: {0}")]
    SlotNotFound(String),

    /// Transport capability failure (connection, track, relay)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Side channel send failure
    #[error("Data channel error: {0}")]
    DataChannel(String),

    /// Preview encoding failure
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The coordinator is shutting down and accepts no new work
    #[error("Shutting down")]
    ShuttingDown,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error was caused by the remote peer's session description
    pub fn is_negotiation_error(&self) -> bool {
        matches!(self, Error::Negotiation(_))
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }

    /// Check if this error refers to something that does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::SessionNotFound(_) | Error::SlotNotFound(_))
    }

    /// Check if the caller may retry the operation later
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Io(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<image::ImageError> for Error {
    fn from(e: image::ImageError) -> Self {
        Error::Encoding(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::SlotNotFound("cam9".to_string());
        assert_eq!(err.to_string(), "Slot not found: cam9");
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::Negotiation("bad sdp".to_string()).is_negotiation_error());
        assert!(!Error::ShuttingDown.is_negotiation_error());
        assert!(Error::SessionNotFound("x".to_string()).is_not_found());
        assert!(Error::SlotNotFound("x".to_string()).is_not_found());
        assert!(Error::InvalidConfig("x".to_string()).is_config_error());
        assert!(Error::Transport("ice".to_string()).is_retryable());
        assert!(!Error::InvalidConfig("x".to_string()).is_retryable());
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = Error::from(json_err);
        assert!(matches!(err, Error::Serialization(_)));
    }
}
