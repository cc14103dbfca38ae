//! Outgoing audio: endpointing and utterance capture.

pub mod endpointing;
pub mod session;

pub use endpointing::{CaptureEvent, CaptureNotice, Endpointer};
pub use session::{CaptureSession, CaptureState, CapturedClip, FinalizeReason};
