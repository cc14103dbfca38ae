pub mod analyzer;
#[cfg(feature = "cpal-audio")]
pub mod capture;
pub mod lifecycle;
pub mod source;
pub mod vad;
pub mod wav;
