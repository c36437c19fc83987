//! Error types for the WebRTC transport

/// Result type alias using WebRTC Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in WebRTC transport operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// WebRTC peer connection error
    #[error("Peer connection error: {0}")]
    PeerConnectionError(String),

    /// Media track error
    #[error("Media track error: {0}")]
    MediaTrackError(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }
}

impl From<webrtc::Error> for Error {
    fn from(e: webrtc::Error) -> Self {
        Error::WebRtcError(e.to_string())
    }
}

/// Map into the engine's error at the capability boundary
impl From<Error> for posecast_core::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::InvalidConfig(msg) => posecast_core::Error::InvalidConfig(msg),
            Error::SdpError(msg) => posecast_core::Error::Negotiation(msg),
            Error::Other(e) => posecast_core::Error::Other(e),
            other => posecast_core::Error::Transport(other.to_string()),
        }
    }
}
