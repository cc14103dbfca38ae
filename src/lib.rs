//! voxturn - Duplex voice-conversation audio pipeline
//!
//! Endpointed microphone capture on one side, strictly ordered playback of
//! reply fragments on the other, and a turn coordinator that keeps the two
//! from hearing each other.

// Enforce error handling discipline
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod audio;
pub mod capture;
#[cfg(feature = "cli")]
pub mod cli;
pub mod clock;
pub mod config;
pub mod defaults;
pub mod duplex;
pub mod error;
pub mod playback;
pub mod reporter;
pub mod session;
pub mod timer;
pub mod transport;

// Capture side
pub use audio::lifecycle::{CaptureLease, DeviceManager};
pub use audio::source::AudioSource;
pub use capture::{CaptureEvent, CaptureState, CapturedClip, Endpointer};

// Playback side
pub use playback::{
    AudioFragment, ChannelPlayer, FragmentAssembler, PlaybackEvent, PlaybackProgress, Renderer,
};

// Session
pub use session::{DuplexSession, SessionHandle, SessionOutput, SessionParts, SessionRunner};
pub use transport::{RecognitionSink, TransportEvent};

// Error handling
pub use error::{Result, VoxturnError};
pub use reporter::{ErrorReporter, LogReporter};

// Config
pub use config::{Config, SilenceThreshold};

/// Build version string with optional git commit hash.
///
/// Returns `"0.0.1+abc1234"` when git hash is available, `"0.0.1"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}
