//! Duplex turn coordination.
//!
//! Capture must not run while output is sounding, or the microphone hears
//! the reply. The coordinator watches output activity and suppresses or
//! resumes endpointing on each edge.

use crate::capture::endpointing::{CaptureEvent, Endpointer};
use crate::playback::assembler::FragmentAssembler;
use crate::playback::channel::ChannelPlayer;
use tracing::debug;

#[derive(Debug, Default)]
pub struct DuplexCoordinator {
    output_active: bool,
}

impl DuplexCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn output_active(&self) -> bool {
        self.output_active
    }

    /// Output is active while a stream fragment renders or a channel is sounding.
    pub fn is_output_active(assembler: &FragmentAssembler, channel: &ChannelPlayer) -> bool {
        assembler.is_rendering() || channel.is_output_active()
    }

    /// Applies the current output activity to capture.
    ///
    /// On the rising edge any recording in progress is discarded and speech
    /// signals are ignored; on the falling edge speech handling resumes.
    pub fn observe_output(&mut self, active: bool, endpointer: &mut Endpointer) -> Vec<CaptureEvent> {
        if active == self.output_active {
            return Vec::new();
        }
        self.output_active = active;
        if active {
            debug!("output started: capture suppressed");
            endpointer.suppress()
        } else {
            debug!("output stopped: capture resumed");
            endpointer.lift_suppression();
            Vec::new()
        }
    }

    /// Stops all output: the active stream and any channel.
    pub fn stop_output(&self, assembler: &mut FragmentAssembler, channel: &mut ChannelPlayer) {
        assembler.stop();
        channel.stop();
    }
}
