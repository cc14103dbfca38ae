//! Error types for voxturn.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoxturnError {
    // Configuration errors
    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Capture errors
    #[error("Capture device unavailable: {message}")]
    DeviceUnavailable { message: String },

    #[error("Audio capture failed: {message}")]
    AudioCapture { message: String },

    #[error("Clip encoding failed: {message}")]
    ClipEncode { message: String },

    // Playback errors
    #[error("Fragment {sequence} of stream {stream_id} could not be decoded: {message}")]
    FragmentDecode {
        stream_id: String,
        sequence: u64,
        message: String,
    },

    #[error("Audio output failed: {message}")]
    Playback { message: String },

    // Transport errors
    #[error("Transport dropped mid-utterance")]
    TransportDropped,

    #[error("Transport error on stream {stream_id}: {message}")]
    Transport { stream_id: String, message: String },

    // Session errors
    #[error("Session is no longer running")]
    SessionClosed,

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Generic error for cases not covered above
    #[error("{0}")]
    Other(String),
}

impl VoxturnError {
    /// Returns true for errors that end only the current playback stream.
    pub fn is_stream_scoped(&self) -> bool {
        matches!(
            self,
            VoxturnError::FragmentDecode { .. }
                | VoxturnError::Playback { .. }
                | VoxturnError::Transport { .. }
        )
    }
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, VoxturnError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_device_unavailable_display() {
        let error = VoxturnError::DeviceUnavailable {
            message: "permission denied".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Capture device unavailable: permission denied"
        );
    }

    #[test]
    fn test_fragment_decode_display() {
        let error = VoxturnError::FragmentDecode {
            stream_id: "turn-7".to_string(),
            sequence: 3,
            message: "bad header".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Fragment 3 of stream turn-7 could not be decoded: bad header"
        );
    }

    #[test]
    fn test_transport_dropped_display() {
        assert_eq!(
            VoxturnError::TransportDropped.to_string(),
            "Transport dropped mid-utterance"
        );
    }

    #[test]
    fn test_config_invalid_value_display() {
        let error = VoxturnError::ConfigInvalidValue {
            key: "capture.sample_rate".to_string(),
            message: "must be positive".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Invalid configuration value for capture.sample_rate: must be positive"
        );
    }

    #[test]
    fn test_stream_scoped_errors() {
        let decode = VoxturnError::FragmentDecode {
            stream_id: "s".to_string(),
            sequence: 1,
            message: "x".to_string(),
        };
        assert!(decode.is_stream_scoped());
        assert!(
            VoxturnError::Playback {
                message: "x".to_string()
            }
            .is_stream_scoped()
        );
        assert!(
            !VoxturnError::DeviceUnavailable {
                message: "x".to_string()
            }
            .is_stream_scoped()
        );
        assert!(!VoxturnError::TransportDropped.is_stream_scoped());
    }

    #[test]
    fn test_from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let error: VoxturnError = io_error.into();
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_from_toml_error() {
        let toml_error = toml::from_str::<toml::Value>("invalid = toml = syntax").unwrap_err();
        let error: VoxturnError = toml_error.into();
        assert!(error.to_string().contains("Configuration error"));
    }

    #[test]
    fn test_error_source_chain_io() {
        let io_error = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let error: VoxturnError = io_error.into();
        let error_trait: &dyn std::error::Error = &error;
        assert!(error_trait.source().is_some());
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<VoxturnError>();
        assert_sync::<VoxturnError>();
    }
}
