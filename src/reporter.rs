//! Reporting of non-fatal runtime errors.

use crate::error::VoxturnError;

/// Receives errors that do not stop the session.
pub trait ErrorReporter: Send + Sync {
    /// Reports an error raised by `component`.
    fn report(&self, component: &str, error: &VoxturnError);
}

/// Reporter that logs through `tracing`.
///
/// Stream-scoped failures are warnings; anything else is an error.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, component: &str, error: &VoxturnError) {
        if error.is_stream_scoped() {
            tracing::warn!(component, error = %error, "stream error");
        } else {
            tracing::error!(component, error = %error, "runtime error");
        }
    }
}
