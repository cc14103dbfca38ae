//! Fragment assembler and sequential player.
//!
//! Owns the lifetime of the active [`Stream`]. Fragments are rendered one at
//! a time in sequence order; the next fragment is only started from the
//! previous one's completion. Binding a new stream is an ordering barrier:
//! nothing from the old stream renders afterwards.

use crate::audio::analyzer::Levels;
use crate::clock::{Clock, SystemClock};
use crate::error::VoxturnError;
use crate::playback::fragment::{AudioFragment, PlaybackProgress, Stream};
use crate::playback::gate::AudioOutputGate;
use crate::playback::renderer::{RenderOrigin, RenderOutcome, RenderTicket, Renderer};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Something observable that happened while assembling a stream.
#[derive(Debug)]
pub enum PlaybackEvent {
    StreamBound { stream_id: String },
    FragmentStarted { stream_id: String, sequence: u64 },
    FragmentFinished { stream_id: String, sequence: u64 },
    StreamComplete { stream_id: String },
    StreamFailed { stream_id: String, error: VoxturnError },
}

struct InFlight {
    ticket: RenderTicket,
    started_at: Instant,
}

pub struct FragmentAssembler {
    renderer: Box<dyn Renderer>,
    gate: AudioOutputGate,
    clock: Arc<dyn Clock>,
    active: Option<Stream>,
    generation: u64,
    rendering: Option<InFlight>,
}

impl FragmentAssembler {
    pub fn new(renderer: Box<dyn Renderer>) -> Self {
        Self {
            renderer,
            gate: AudioOutputGate::unlocked(),
            clock: Arc::new(SystemClock),
            active: None,
            generation: 0,
            rendering: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_gate(mut self, gate: AudioOutputGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn active_stream_id(&self) -> Option<&str> {
        self.active.as_ref().map(Stream::id)
    }

    pub fn active_stream(&self) -> Option<&Stream> {
        self.active.as_ref()
    }

    /// True from the moment a render is issued until its outcome arrives.
    pub fn is_rendering(&self) -> bool {
        self.rendering.is_some()
    }

    /// Levels of the fragment currently sounding.
    pub fn output_levels(&self) -> Option<Levels> {
        if self.is_rendering() {
            self.renderer.output_levels()
        } else {
            None
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Makes `stream_id` the active stream, tearing down any other one.
    ///
    /// Binding the already active stream is a no-op.
    pub fn bind_stream(&mut self, stream_id: &str) -> Vec<PlaybackEvent> {
        if self.active_stream_id() == Some(stream_id) {
            return Vec::new();
        }
        self.teardown();
        self.active = Some(Stream::new(stream_id));
        info!(stream_id, generation = self.generation, "stream bound");
        vec![PlaybackEvent::StreamBound {
            stream_id: stream_id.to_string(),
        }]
    }

    /// Buffers a fragment of the active stream and tries to advance.
    ///
    /// Fragments for any other stream are ignored. `total` is recorded only
    /// if no count is known yet.
    pub fn submit_fragment(
        &mut self,
        stream_id: &str,
        fragment: AudioFragment,
        total: Option<u64>,
    ) -> Vec<PlaybackEvent> {
        let Some(stream) = self.active.as_mut().filter(|s| s.id() == stream_id) else {
            debug!(stream_id, sequence = fragment.sequence, "fragment for inactive stream ignored");
            return Vec::new();
        };

        let sequence = fragment.sequence;
        if let Err(reason) = stream.insert(fragment) {
            debug!(stream_id, sequence, ?reason, "fragment not stored");
        }
        if let Some(count) = total {
            stream.declare_total(count);
        }
        self.advance()
    }

    /// Records the total fragment count of the active stream and tries to advance.
    pub fn declare_total_fragment_count(&mut self, stream_id: &str, count: u64) -> Vec<PlaybackEvent> {
        let Some(stream) = self.active.as_mut().filter(|s| s.id() == stream_id) else {
            debug!(stream_id, count, "total for inactive stream ignored");
            return Vec::new();
        };
        if !stream.declare_total(count) {
            debug!(stream_id, count, known = ?stream.total(), "total already known");
        }
        self.advance()
    }

    /// Halts playback, discards pending fragments and clears the binding.
    ///
    /// Safe at any time; late render outcomes become no-ops.
    pub fn stop(&mut self) {
        if let Some(stream_id) = self.active_stream_id() {
            info!(stream_id, "stream stopped");
        }
        self.teardown();
    }

    /// Fails the active stream with `error`, as the transport reporting one would.
    pub fn fail_stream(&mut self, stream_id: &str, error: VoxturnError) -> Vec<PlaybackEvent> {
        if self.active_stream_id() != Some(stream_id) {
            return Vec::new();
        }
        self.fail(error)
    }

    /// Tries to advance after something outside changed, such as the output gate unlocking.
    pub fn resume(&mut self) -> Vec<PlaybackEvent> {
        self.advance()
    }

    /// Handles a render completion or failure.
    ///
    /// Outcomes that do not match the render in flight are stale and dropped.
    pub fn on_render_outcome(&mut self, outcome: RenderOutcome) -> Vec<PlaybackEvent> {
        let current = self.rendering.as_ref().map(|r| r.ticket);
        if current != Some(outcome.ticket) {
            debug!(ticket = ?outcome.ticket, "stale render outcome dropped");
            return Vec::new();
        }
        self.rendering = None;

        match outcome.result {
            Ok(()) => {
                let mut events = Vec::new();
                if let Some(stream) = self.active.as_mut()
                    && let Some(sequence) = stream.finish_current()
                {
                    events.push(PlaybackEvent::FragmentFinished {
                        stream_id: stream.id().to_string(),
                        sequence,
                    });
                }
                events.extend(self.advance());
                events
            }
            Err(error) => self.fail_at(outcome.ticket.sequence, error),
        }
    }

    pub fn progress(&self) -> Option<PlaybackProgress> {
        let stream = self.active.as_ref()?;
        let in_flight_elapsed = match (&self.rendering, stream.in_flight_seconds()) {
            (Some(render), Some(duration)) => {
                let elapsed = self.clock.now().duration_since(render.started_at).as_secs_f64();
                elapsed.min(duration)
            }
            _ => 0.0,
        };
        Some(PlaybackProgress {
            stream_id: stream.id().to_string(),
            elapsed_seconds: stream.played_seconds() + in_flight_elapsed,
            total_seconds: stream.cumulative_seconds(),
        })
    }

    fn advance(&mut self) -> Vec<PlaybackEvent> {
        if self.rendering.is_some() {
            return Vec::new();
        }
        let Some(stream) = self.active.as_mut() else {
            return Vec::new();
        };

        if stream.is_complete() {
            let stream_id = stream.id().to_string();
            info!(stream_id = %stream_id, seconds = stream.played_seconds(), "stream complete");
            self.active = None;
            self.generation += 1;
            return vec![PlaybackEvent::StreamComplete { stream_id }];
        }

        if !self.gate.is_unlocked() {
            return Vec::new();
        }

        let Some(fragment) = stream.take_next() else {
            return Vec::new();
        };
        let stream_id = stream.id().to_string();
        let ticket = RenderTicket {
            origin: RenderOrigin::Stream,
            generation: self.generation,
            sequence: fragment.sequence,
        };
        self.rendering = Some(InFlight {
            ticket,
            started_at: self.clock.now(),
        });

        match self.renderer.render(ticket, &fragment.payload) {
            Ok(()) => {
                debug!(stream_id = %stream_id, sequence = fragment.sequence, "fragment started");
                vec![PlaybackEvent::FragmentStarted {
                    stream_id,
                    sequence: fragment.sequence,
                }]
            }
            Err(error) => {
                self.rendering = None;
                self.fail_at(fragment.sequence, error)
            }
        }
    }

    fn fail_at(&mut self, sequence: u64, error: VoxturnError) -> Vec<PlaybackEvent> {
        let Some(stream_id) = self.active_stream_id().map(str::to_string) else {
            return Vec::new();
        };
        let error = match error {
            VoxturnError::FragmentDecode { .. } => error,
            other => VoxturnError::FragmentDecode {
                stream_id,
                sequence,
                message: other.to_string(),
            },
        };
        self.fail(error)
    }

    fn fail(&mut self, error: VoxturnError) -> Vec<PlaybackEvent> {
        let Some(stream_id) = self.active_stream_id().map(str::to_string) else {
            return Vec::new();
        };
        warn!(stream_id = %stream_id, error = %error, "stream failed");
        self.teardown();
        vec![PlaybackEvent::StreamFailed { stream_id, error }]
    }

    fn teardown(&mut self) {
        if self.rendering.take().is_some() {
            self.renderer.halt();
        }
        if let Some(mut stream) = self.active.take() {
            let discarded = stream.discard_pending();
            if discarded > 0 {
                debug!(stream_id = stream.id(), discarded, "pending fragments discarded");
            }
        }
        self.generation += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::playback::gate::AudioOutputGate;
    use crate::playback::renderer::{RecordingProbe, RecordingRenderer};

    fn frag(sequence: u64) -> AudioFragment {
        AudioFragment::new(sequence, vec![sequence as u8], Some(1.0))
    }

    fn assembler() -> (FragmentAssembler, RecordingProbe) {
        let renderer = RecordingRenderer::new();
        let probe = renderer.probe();
        (FragmentAssembler::new(Box::new(renderer)), probe)
    }

    fn finish(assembler: &mut FragmentAssembler, probe: &RecordingProbe) -> Vec<PlaybackEvent> {
        let outcome = probe.finish().expect("a render in flight");
        assembler.on_render_outcome(outcome)
    }

    #[test]
    fn test_bind_same_stream_is_idempotent() {
        let (mut asm, _probe) = assembler();
        assert_eq!(asm.bind_stream("a").len(), 1);
        asm.submit_fragment("a", frag(2), None);
        assert!(asm.bind_stream("a").is_empty());
        assert_eq!(asm.active_stream().unwrap().pending_len(), 1);
    }

    #[test]
    fn test_fragment_for_inactive_stream_is_ignored() {
        let (mut asm, probe) = assembler();
        assert!(asm.submit_fragment("a", frag(1), None).is_empty());
        asm.bind_stream("b");
        assert!(asm.submit_fragment("a", frag(1), None).is_empty());
        assert!(probe.rendered().is_empty());
    }

    #[test]
    fn test_renders_in_order_one_at_a_time() {
        let (mut asm, probe) = assembler();
        asm.bind_stream("s");
        asm.submit_fragment("s", frag(3), None);
        asm.submit_fragment("s", frag(2), None);
        assert!(probe.rendered().is_empty());

        asm.submit_fragment("s", frag(1), Some(3));
        assert!(asm.is_rendering());
        assert_eq!(probe.rendered_sequences(), vec![1]);

        finish(&mut asm, &probe);
        finish(&mut asm, &probe);
        let events = finish(&mut asm, &probe);

        assert_eq!(probe.rendered_sequences(), vec![1, 2, 3]);
        assert_eq!(probe.max_concurrent(), 1);
        assert!(matches!(
            events.last(),
            Some(PlaybackEvent::StreamComplete { stream_id }) if stream_id == "s"
        ));
        assert!(asm.active_stream_id().is_none());
    }

    #[test]
    fn test_total_declared_after_everything_played() {
        let (mut asm, probe) = assembler();
        asm.bind_stream("s");
        asm.submit_fragment("s", frag(1), None);
        asm.submit_fragment("s", frag(2), None);
        finish(&mut asm, &probe);
        let events = finish(&mut asm, &probe);
        assert!(!events.iter().any(|e| matches!(e, PlaybackEvent::StreamComplete { .. })));

        let events = asm.declare_total_fragment_count("s", 2);
        assert!(matches!(events.as_slice(), [PlaybackEvent::StreamComplete { .. }]));
    }

    #[test]
    fn test_fragments_after_completion_are_ignored() {
        let (mut asm, probe) = assembler();
        asm.bind_stream("s");
        asm.submit_fragment("s", frag(1), Some(1));
        finish(&mut asm, &probe);
        assert!(asm.submit_fragment("s", frag(2), None).is_empty());
        assert_eq!(probe.rendered_sequences(), vec![1]);
    }

    #[test]
    fn test_rebinding_discards_old_stream() {
        let (mut asm, probe) = assembler();
        asm.bind_stream("old");
        asm.submit_fragment("old", frag(1), None);
        asm.submit_fragment("old", frag(2), None);
        let stale = probe.rendered()[0];

        asm.bind_stream("new");
        assert_eq!(probe.halts(), 1);
        assert!(!asm.is_rendering());

        // Completion of the halted render arrives late.
        let events = asm.on_render_outcome(RenderOutcome::finished(stale));
        assert!(events.is_empty());
        assert_eq!(probe.rendered_sequences(), vec![1]);

        asm.submit_fragment("new", frag(1), None);
        assert_eq!(probe.rendered().len(), 2);
        assert_ne!(probe.rendered()[1].generation, stale.generation);
    }

    #[test]
    fn test_render_failure_stops_stream() {
        let (mut asm, probe) = assembler();
        asm.bind_stream("s");
        asm.submit_fragment("s", frag(1), None);
        asm.submit_fragment("s", frag(2), None);

        let outcome = probe.fail("bad frame").unwrap();
        let events = asm.on_render_outcome(outcome);
        match events.as_slice() {
            [PlaybackEvent::StreamFailed { stream_id, error }] => {
                assert_eq!(stream_id, "s");
                assert!(matches!(error, VoxturnError::FragmentDecode { sequence: 1, .. }));
            }
            other => panic!("expected StreamFailed, got {:?}", other),
        }
        assert!(asm.active_stream_id().is_none());
        assert_eq!(probe.rendered_sequences(), vec![1]);
    }

    #[test]
    fn test_refused_render_clears_rendering_flag() {
        let renderer = RecordingRenderer::new().with_refused_sequence(1);
        let mut asm = FragmentAssembler::new(Box::new(renderer));
        asm.bind_stream("s");
        let events = asm.submit_fragment("s", frag(1), None);
        assert!(matches!(events.as_slice(), [PlaybackEvent::StreamFailed { .. }]));
        assert!(!asm.is_rendering());
    }

    #[test]
    fn test_stop_is_safe_any_time() {
        let (mut asm, probe) = assembler();
        asm.stop();
        asm.bind_stream("s");
        asm.submit_fragment("s", frag(1), None);
        let ticket = probe.rendered()[0];
        asm.stop();
        asm.stop();
        assert!(asm.active_stream_id().is_none());
        assert!(asm.on_render_outcome(RenderOutcome::finished(ticket)).is_empty());
    }

    #[test]
    fn test_locked_gate_buffers_until_resume() {
        let gate = AudioOutputGate::locked();
        let renderer = RecordingRenderer::new();
        let probe = renderer.probe();
        let mut asm = FragmentAssembler::new(Box::new(renderer)).with_gate(gate.clone());

        asm.bind_stream("s");
        asm.submit_fragment("s", frag(1), None);
        assert!(probe.rendered().is_empty());

        gate.request_unlock();
        gate.complete_unlock();
        asm.resume();
        assert_eq!(probe.rendered_sequences(), vec![1]);
    }

    #[test]
    fn test_progress_tracks_clock() {
        let clock = ManualClock::new();
        let renderer = RecordingRenderer::new();
        let probe = renderer.probe();
        let mut asm =
            FragmentAssembler::new(Box::new(renderer)).with_clock(Arc::new(clock.clone()));

        assert!(asm.progress().is_none());
        asm.bind_stream("s");
        asm.submit_fragment("s", frag(1), None);
        asm.submit_fragment("s", frag(2), None);

        clock.advance_ms(400);
        let progress = asm.progress().unwrap();
        assert!((progress.elapsed_seconds - 0.4).abs() < 1e-9);
        assert_eq!(progress.total_seconds, 2.0);

        clock.advance_ms(5000);
        assert_eq!(asm.progress().unwrap().elapsed_seconds, 1.0);

        finish(&mut asm, &probe);
        assert_eq!(asm.progress().unwrap().elapsed_seconds, 1.0);
    }

    #[test]
    fn test_fail_stream_only_affects_active() {
        let (mut asm, _probe) = assembler();
        asm.bind_stream("s");
        assert!(
            asm.fail_stream("other", VoxturnError::Other("x".into()))
                .is_empty()
        );
        let events = asm.fail_stream(
            "s",
            VoxturnError::Transport {
                stream_id: "s".into(),
                message: "reset".into(),
            },
        );
        assert!(matches!(
            events.as_slice(),
            [PlaybackEvent::StreamFailed {
                error: VoxturnError::Transport { .. },
                ..
            }]
        ));
    }
}
