//! Incoming audio: fragment reassembly, sequential playback and channels.

pub mod assembler;
pub mod channel;
pub mod fragment;
pub mod gate;
pub mod renderer;

pub use assembler::{FragmentAssembler, PlaybackEvent};
pub use channel::{ChannelCallbacks, ChannelPlay, ChannelPlayer, Fingerprint};
pub use fragment::{AudioFragment, PlaybackProgress, Stream};
pub use gate::{AudioOutputGate, GateState};
pub use renderer::{RecordingRenderer, RenderOrigin, RenderOutcome, RenderTicket, Renderer};
