//! The duplex session event loop.
//!
//! [`DuplexSession`] is the synchronous core: every mutation of capture and
//! playback state goes through one of its methods, and each returns the
//! outputs it produced. [`SessionRunner`] drives it from a single tokio task,
//! serializing commands, timer firings, render outcomes and capture polls.

use crate::audio::analyzer::Levels;
use crate::audio::lifecycle::DeviceManager;
use crate::audio::vad::{EnergyDetector, EnergyDetectorConfig, SpeechDetector, SpeechSignal};
use crate::audio::wav::pcm_bytes;
use crate::capture::endpointing::{CaptureEvent, Endpointer};
use crate::capture::session::CaptureState;
use crate::clock::{Clock, TokioClock};
use crate::config::{Config, SilenceThreshold};
use crate::duplex::DuplexCoordinator;
use crate::error::{Result, VoxturnError};
use crate::playback::assembler::{FragmentAssembler, PlaybackEvent};
use crate::playback::channel::{ChannelCallbacks, ChannelPlay, ChannelPlayer, Fingerprint};
use crate::playback::fragment::{AudioFragment, PlaybackProgress};
use crate::playback::gate::{AudioOutputGate, GateState};
use crate::playback::renderer::{RenderOrigin, RenderOutcome, Renderer};
use crate::reporter::{ErrorReporter, LogReporter};
use crate::timer::{Scheduler, TimerEvent, TimerKind};
use crate::transport::{RecognitionSink, TransportEvent};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Something the session did that callers may care about.
#[derive(Debug)]
pub enum SessionOutput {
    Capture(CaptureEvent),
    Playback(PlaybackEvent),
}

/// Point-in-time view for the UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub capture_state: CaptureState,
    /// Silence countdown time left, while counting down.
    pub remaining: Option<Duration>,
    pub progress: Option<PlaybackProgress>,
    /// Analyzer levels of the most recent captured block.
    pub input_levels: Option<Levels>,
    /// Analyzer levels of the audio currently sounding.
    pub output_levels: Option<Levels>,
    pub output_active: bool,
    pub gate: GateState,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            capture_state: CaptureState::Idle,
            remaining: None,
            progress: None,
            input_levels: None,
            output_levels: None,
            output_active: false,
            gate: GateState::Unlocked,
        }
    }
}

/// Collaborators a session is assembled from.
pub struct SessionParts {
    pub devices: DeviceManager,
    pub scheduler: Arc<dyn Scheduler>,
    pub stream_renderer: Box<dyn Renderer>,
    pub channel_renderer: Box<dyn Renderer>,
    pub sink: Box<dyn RecognitionSink>,
    clock: Arc<dyn Clock>,
    detector: Option<Box<dyn SpeechDetector>>,
    reporter: Arc<dyn ErrorReporter>,
    gate: Option<AudioOutputGate>,
}

impl SessionParts {
    pub fn new(
        devices: DeviceManager,
        scheduler: Arc<dyn Scheduler>,
        stream_renderer: Box<dyn Renderer>,
        channel_renderer: Box<dyn Renderer>,
        sink: Box<dyn RecognitionSink>,
    ) -> Self {
        Self {
            devices,
            scheduler,
            stream_renderer,
            channel_renderer,
            sink,
            clock: Arc::new(TokioClock),
            detector: None,
            reporter: Arc::new(LogReporter),
            gate: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the built-in energy detector.
    pub fn with_detector(mut self, detector: Box<dyn SpeechDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Shares an output gate instead of creating one from config.
    pub fn with_gate(mut self, gate: AudioOutputGate) -> Self {
        self.gate = Some(gate);
        self
    }
}

pub struct DuplexSession {
    endpointer: Endpointer,
    assembler: FragmentAssembler,
    channel: ChannelPlayer,
    duplex: DuplexCoordinator,
    detector: Box<dyn SpeechDetector>,
    sink: Box<dyn RecognitionSink>,
    reporter: Arc<dyn ErrorReporter>,
    gate: AudioOutputGate,
    threshold: SilenceThreshold,
    input_levels: Option<Levels>,
    poll_interval: Duration,
}

impl DuplexSession {
    /// Assembles a session. Fails with `ConfigInvalidValue` if `config` does
    /// not validate; nothing is started in that case.
    pub fn new(config: &Config, parts: SessionParts) -> Result<Self> {
        config.validate()?;
        let gate = parts.gate.unwrap_or_else(|| {
            if config.playback.require_unlock {
                AudioOutputGate::locked()
            } else {
                AudioOutputGate::unlocked()
            }
        });
        let threshold = config.silence_threshold();
        let streaming = parts.sink.supports_streaming_recognition();

        let endpointer = Endpointer::new(
            parts.devices,
            Arc::clone(&parts.scheduler),
            &config.capture,
        )
        .with_clock(Arc::clone(&parts.clock))
        .with_threshold(threshold.clone())
        .with_raw_forwarding(streaming);

        let assembler = FragmentAssembler::new(parts.stream_renderer)
            .with_clock(Arc::clone(&parts.clock))
            .with_gate(gate.clone());

        let channel = ChannelPlayer::new(
            parts.channel_renderer,
            parts.scheduler,
            config.playback.channel_settle(),
        )
        .with_gate(gate.clone());

        let detector: Box<dyn SpeechDetector> = match parts.detector {
            Some(detector) => detector,
            None => Box::new(EnergyDetector::with_clock(
                EnergyDetectorConfig {
                    speech_threshold: config.capture.speech_threshold,
                    hangover_ms: config.capture.detector_hangover_ms,
                },
                parts.clock,
            )),
        };

        info!(
            sink = parts.sink.name(),
            streaming,
            silence_ms = threshold.get().as_millis() as u64,
            "session created"
        );

        Ok(Self {
            endpointer,
            assembler,
            channel,
            duplex: DuplexCoordinator::new(),
            detector,
            sink: parts.sink,
            reporter: parts.reporter,
            gate,
            threshold,
            input_levels: None,
            poll_interval: config.capture.poll_interval(),
        })
    }

    pub fn capture_state(&self) -> CaptureState {
        self.endpointer.state()
    }

    pub fn endpointer(&self) -> &Endpointer {
        &self.endpointer
    }

    pub fn assembler(&self) -> &FragmentAssembler {
        &self.assembler
    }

    pub fn channel(&self) -> &ChannelPlayer {
        &self.channel
    }

    /// Live silence threshold; changes apply on the next countdown tick.
    pub fn silence_threshold(&self) -> &SilenceThreshold {
        &self.threshold
    }

    pub fn arm(&mut self) -> Result<Vec<SessionOutput>> {
        let events = self.endpointer.arm()?;
        self.detector.reset();
        let mut outputs = Vec::new();
        self.route_capture(events, &mut outputs);
        // Output may already be sounding when capture is armed.
        self.sync_duplex(&mut outputs);
        Ok(outputs)
    }

    pub fn disarm(&mut self) -> Vec<SessionOutput> {
        let events = self.endpointer.disarm();
        self.input_levels = None;
        let mut outputs = Vec::new();
        self.route_capture(events, &mut outputs);
        outputs
    }

    /// Speech start raised by an external detector.
    pub fn speech_start(&mut self) -> Vec<SessionOutput> {
        let events = self.endpointer.on_speech_start();
        let mut outputs = Vec::new();
        self.route_capture(events, &mut outputs);
        outputs
    }

    /// Speech end raised by an external detector.
    pub fn speech_end(&mut self) -> Vec<SessionOutput> {
        let events = self.endpointer.on_speech_end();
        let mut outputs = Vec::new();
        self.route_capture(events, &mut outputs);
        outputs
    }

    pub fn transport(&mut self, event: TransportEvent) -> Vec<SessionOutput> {
        let mut outputs = Vec::new();
        match event {
            TransportEvent::StreamStart { stream_id } => {
                let events = self.assembler.bind_stream(&stream_id);
                self.route_playback(events, &mut outputs);
            }
            TransportEvent::Fragment {
                stream_id,
                sequence,
                payload,
                duration_hint,
                total_fragments,
            } => {
                let fragment = AudioFragment::new(sequence, payload, duration_hint);
                let events = self
                    .assembler
                    .submit_fragment(&stream_id, fragment, total_fragments);
                self.route_playback(events, &mut outputs);
            }
            TransportEvent::TotalFragmentCount { stream_id, count } => {
                let events = self.assembler.declare_total_fragment_count(&stream_id, count);
                self.route_playback(events, &mut outputs);
            }
            TransportEvent::StreamEnd { stream_id } => {
                let highest = self
                    .assembler
                    .active_stream()
                    .filter(|s| s.id() == stream_id && s.total().is_none())
                    .map(|s| s.highest_seen());
                if let Some(count) = highest {
                    debug!(stream_id = %stream_id, count, "stream ended without a count");
                    let events = self.assembler.declare_total_fragment_count(&stream_id, count);
                    self.route_playback(events, &mut outputs);
                }
            }
            TransportEvent::StreamError { stream_id, message } => {
                let error = VoxturnError::Transport {
                    stream_id: stream_id.clone(),
                    message,
                };
                let events = self.assembler.fail_stream(&stream_id, error);
                self.route_playback(events, &mut outputs);
            }
            TransportEvent::Dropped => match self.endpointer.transport_dropped() {
                Ok(events) => self.route_capture(events, &mut outputs),
                Err(e) => self.reporter.report("capture", &e),
            },
        }
        self.sync_duplex(&mut outputs);
        outputs
    }

    pub fn play_on_channel(
        &mut self,
        channel_id: &str,
        payload: Vec<u8>,
        fingerprint: Fingerprint,
        callbacks: ChannelCallbacks,
    ) -> (ChannelPlay, Vec<SessionOutput>) {
        let play = self
            .channel
            .play_on_channel(channel_id, payload, fingerprint, callbacks);
        let mut outputs = Vec::new();
        self.sync_duplex(&mut outputs);
        (play, outputs)
    }

    /// Stops the active stream and any channel.
    pub fn stop_playback(&mut self) -> Vec<SessionOutput> {
        self.duplex.stop_output(&mut self.assembler, &mut self.channel);
        let mut outputs = Vec::new();
        self.sync_duplex(&mut outputs);
        outputs
    }

    /// Unlocks the output gate and starts anything that was waiting on it.
    pub fn unlock_output(&mut self) -> Vec<SessionOutput> {
        self.gate.request_unlock();
        self.gate.complete_unlock();
        let mut outputs = Vec::new();
        let events = self.assembler.resume();
        self.route_playback(events, &mut outputs);
        self.channel.resume();
        self.sync_duplex(&mut outputs);
        outputs
    }

    pub fn on_timer(&mut self, event: TimerEvent) -> Vec<SessionOutput> {
        let mut outputs = Vec::new();
        match event.kind {
            TimerKind::SilenceCountdown => match self.endpointer.on_timer(event) {
                Ok(events) => self.route_capture(events, &mut outputs),
                Err(e) => self.reporter.report("capture", &e),
            },
            TimerKind::ChannelSettle => {
                self.channel.on_timer(event);
            }
        }
        self.sync_duplex(&mut outputs);
        outputs
    }

    pub fn on_render_outcome(&mut self, outcome: RenderOutcome) -> Vec<SessionOutput> {
        let mut outputs = Vec::new();
        match outcome.ticket.origin {
            RenderOrigin::Stream => {
                let events = self.assembler.on_render_outcome(outcome);
                self.route_playback(events, &mut outputs);
            }
            RenderOrigin::Channel => self.channel.on_render_outcome(outcome),
        }
        self.sync_duplex(&mut outputs);
        outputs
    }

    /// Reads one block from the capture device and feeds detector and endpointing.
    pub fn poll_capture(&mut self) -> Vec<SessionOutput> {
        let block = match self.endpointer.read_block() {
            Ok(Some(block)) => block,
            Ok(None) => return Vec::new(),
            Err(e) => {
                self.reporter.report("capture", &e);
                return Vec::new();
            }
        };
        self.input_levels = Some(block.levels);

        let mut outputs = Vec::new();
        if !self.endpointer.is_suppressed() {
            let events = match self.detector.process(&block.samples) {
                Some(SpeechSignal::Start) => self.endpointer.on_speech_start(),
                Some(SpeechSignal::End) => self.endpointer.on_speech_end(),
                None => Vec::new(),
            };
            self.route_capture(events, &mut outputs);
        }
        let events = self.endpointer.on_audio(&block.samples);
        self.route_capture(events, &mut outputs);
        outputs
    }

    /// Stops output and releases the capture device.
    pub fn shutdown(&mut self) -> Vec<SessionOutput> {
        self.duplex.stop_output(&mut self.assembler, &mut self.channel);
        let outputs = self.disarm();
        info!("session shut down");
        outputs
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            capture_state: self.endpointer.state(),
            remaining: self.endpointer.remaining(),
            progress: self.assembler.progress(),
            input_levels: self.input_levels.clone(),
            output_levels: self
                .assembler
                .output_levels()
                .or_else(|| self.channel.output_levels()),
            output_active: self.duplex.output_active(),
            gate: self.gate.state(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn sync_duplex(&mut self, outputs: &mut Vec<SessionOutput>) {
        let active = DuplexCoordinator::is_output_active(&self.assembler, &self.channel);
        if active && !self.duplex.output_active() {
            self.detector.reset();
        }
        let events = self.duplex.observe_output(active, &mut self.endpointer);
        self.route_capture(events, outputs);
    }

    fn route_capture(&mut self, events: Vec<CaptureEvent>, outputs: &mut Vec<SessionOutput>) {
        let streaming = self.sink.supports_streaming_recognition();
        for event in events {
            let sent = match &event {
                CaptureEvent::RawSamples(samples) => {
                    if let Err(e) = self.sink.push_pcm(&pcm_bytes(samples)) {
                        self.reporter.report(self.sink.name(), &e);
                    }
                    continue;
                }
                CaptureEvent::ClipReady(_) if streaming => self.sink.finalize(),
                CaptureEvent::ClipReady(clip) => self.sink.submit_clip(clip),
                CaptureEvent::Notice(_) if streaming => self.sink.discard(),
                CaptureEvent::StateChanged { from, to }
                    if streaming && from.is_recording() && *to == CaptureState::Idle =>
                {
                    self.sink.discard()
                }
                _ => Ok(()),
            };
            if let Err(e) = sent {
                self.reporter.report(self.sink.name(), &e);
            }
            outputs.push(SessionOutput::Capture(event));
        }
    }

    fn route_playback(&mut self, events: Vec<PlaybackEvent>, outputs: &mut Vec<SessionOutput>) {
        for event in events {
            if let PlaybackEvent::StreamFailed { error, .. } = &event {
                self.reporter.report("playback", error);
            }
            outputs.push(SessionOutput::Playback(event));
        }
    }
}

/// Requests sent from a [`SessionHandle`] to the event loop.
#[derive(Debug)]
pub enum SessionCommand {
    Arm {
        reply: oneshot::Sender<Result<()>>,
    },
    Disarm,
    Transport(TransportEvent),
    SpeechStart,
    SpeechEnd,
    PlayOnChannel {
        channel_id: String,
        payload: Vec<u8>,
        fingerprint: Fingerprint,
        callbacks: ChannelCallbacks,
        reply: oneshot::Sender<ChannelPlay>,
    },
    StopPlayback,
    UnlockOutput,
    Shutdown,
}

impl DuplexSession {
    pub fn handle_command(&mut self, command: SessionCommand) -> Vec<SessionOutput> {
        match command {
            SessionCommand::Arm { reply } => match self.arm() {
                Ok(outputs) => {
                    let _ = reply.send(Ok(()));
                    outputs
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                    Vec::new()
                }
            },
            SessionCommand::Disarm => self.disarm(),
            SessionCommand::Transport(event) => self.transport(event),
            SessionCommand::SpeechStart => self.speech_start(),
            SessionCommand::SpeechEnd => self.speech_end(),
            SessionCommand::PlayOnChannel {
                channel_id,
                payload,
                fingerprint,
                callbacks,
                reply,
            } => {
                let (play, outputs) =
                    self.play_on_channel(&channel_id, payload, fingerprint, callbacks);
                let _ = reply.send(play);
                outputs
            }
            SessionCommand::StopPlayback => self.stop_playback(),
            SessionCommand::UnlockOutput => self.unlock_output(),
            SessionCommand::Shutdown => self.shutdown(),
        }
    }
}

/// Drives a [`DuplexSession`] on a tokio task.
pub struct SessionRunner {
    session: DuplexSession,
    timers: mpsc::UnboundedReceiver<TimerEvent>,
    outcomes: mpsc::UnboundedReceiver<RenderOutcome>,
}

impl SessionRunner {
    /// `timers` and `outcomes` are the receiving ends of the session's
    /// scheduler and renderers.
    pub fn new(
        session: DuplexSession,
        timers: mpsc::UnboundedReceiver<TimerEvent>,
        outcomes: mpsc::UnboundedReceiver<RenderOutcome>,
    ) -> Self {
        Self {
            session,
            timers,
            outcomes,
        }
    }

    /// Spawns the event loop. Returns the control handle and the output stream.
    pub fn spawn(self) -> (SessionHandle, mpsc::UnboundedReceiver<SessionOutput>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(self.session.snapshot());
        let threshold = self.session.silence_threshold().clone();

        let task = tokio::spawn(self.run(command_rx, output_tx, snapshot_tx));

        (
            SessionHandle {
                commands: command_tx,
                snapshot: snapshot_rx,
                threshold,
                task,
            },
            output_rx,
        )
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        output_tx: mpsc::UnboundedSender<SessionOutput>,
        snapshot_tx: watch::Sender<SessionSnapshot>,
    ) {
        let mut poll = tokio::time::interval(self.session.poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let (outputs, done) = tokio::select! {
                command = commands.recv() => match command {
                    Some(SessionCommand::Shutdown) | None => (self.session.shutdown(), true),
                    Some(command) => (self.session.handle_command(command), false),
                },
                Some(event) = self.timers.recv() => (self.session.on_timer(event), false),
                Some(outcome) = self.outcomes.recv() => (self.session.on_render_outcome(outcome), false),
                _ = poll.tick() => (self.session.poll_capture(), false),
            };

            for output in outputs {
                // Nobody listening is fine; the snapshot still updates.
                let _ = output_tx.send(output);
            }
            let snapshot = self.session.snapshot();
            snapshot_tx.send_if_modified(|current| {
                if *current == snapshot {
                    false
                } else {
                    *current = snapshot;
                    true
                }
            });

            if done {
                break;
            }
        }
        debug!("session event loop exited");
    }
}

/// Control handle for a running session.
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    snapshot: watch::Receiver<SessionSnapshot>,
    threshold: SilenceThreshold,
    task: JoinHandle<()>,
}

impl SessionHandle {
    fn send(&self, command: SessionCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| VoxturnError::SessionClosed)
    }

    /// Arms capture. Fails with `DeviceUnavailable` if the device cannot be opened.
    pub async fn arm(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Arm { reply })?;
        rx.await.map_err(|_| VoxturnError::SessionClosed)?
    }

    pub fn disarm(&self) -> Result<()> {
        self.send(SessionCommand::Disarm)
    }

    pub fn transport(&self, event: TransportEvent) -> Result<()> {
        self.send(SessionCommand::Transport(event))
    }

    pub fn speech_start(&self) -> Result<()> {
        self.send(SessionCommand::SpeechStart)
    }

    pub fn speech_end(&self) -> Result<()> {
        self.send(SessionCommand::SpeechEnd)
    }

    pub async fn play_on_channel(
        &self,
        channel_id: &str,
        payload: Vec<u8>,
        fingerprint: Fingerprint,
        callbacks: ChannelCallbacks,
    ) -> Result<ChannelPlay> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::PlayOnChannel {
            channel_id: channel_id.to_string(),
            payload,
            fingerprint,
            callbacks,
            reply,
        })?;
        rx.await.map_err(|_| VoxturnError::SessionClosed)
    }

    pub fn stop_playback(&self) -> Result<()> {
        self.send(SessionCommand::StopPlayback)
    }

    pub fn unlock_output(&self) -> Result<()> {
        self.send(SessionCommand::UnlockOutput)
    }

    /// Changes the silence threshold. A running countdown sees it on its next tick.
    pub fn set_silence_threshold(&self, threshold: Duration) {
        self.threshold.set(threshold);
    }

    /// Receiver of UI snapshots: capture state, countdown, progress and input/output levels.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Stops output, releases the device and waits for the event loop to exit.
    pub async fn shutdown(self) -> Result<()> {
        // Already closed is fine: the loop is exiting anyway.
        let _ = self.commands.send(SessionCommand::Shutdown);
        self.task
            .await
            .map_err(|e| VoxturnError::Other(format!("session task failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::source::{AudioSource, MockAudioSource, MockDeviceProbe};
    use crate::audio::vad::NullDetector;
    use crate::capture::endpointing::CaptureNotice;
    use crate::clock::ManualClock;
    use crate::playback::renderer::{RecordingProbe, RecordingRenderer};
    use crate::timer::ManualScheduler;
    use crate::transport::{CollectorSink, Outbound};

    struct Rig {
        session: DuplexSession,
        clock: ManualClock,
        scheduler: Arc<ManualScheduler>,
        stream: RecordingProbe,
        channel: RecordingProbe,
        device: MockDeviceProbe,
        sink: CollectorSink,
    }

    fn rig_with(sink: CollectorSink, source: MockAudioSource) -> Rig {
        let device = source.probe();
        let devices = DeviceManager::new(Box::new(move || {
            Ok(Box::new(source.clone()) as Box<dyn AudioSource>)
        }));
        let clock = ManualClock::new();
        let scheduler = Arc::new(ManualScheduler::new());
        let stream_renderer = RecordingRenderer::new();
        let channel_renderer = RecordingRenderer::new();
        let stream = stream_renderer.probe();
        let channel = channel_renderer.probe();

        let parts = SessionParts::new(
            devices,
            scheduler.clone(),
            Box::new(stream_renderer),
            Box::new(channel_renderer),
            Box::new(sink.clone()),
        )
        .with_clock(Arc::new(clock.clone()))
        .with_detector(Box::new(NullDetector));

        let mut config = Config::default();
        config.capture.silence_threshold_ms = 1000;
        Rig {
            session: DuplexSession::new(&config, parts).unwrap(),
            clock,
            scheduler,
            stream,
            channel,
            device,
            sink,
        }
    }

    fn rig() -> Rig {
        rig_with(CollectorSink::new(), MockAudioSource::new())
    }

    impl Rig {
        fn run_countdown(&mut self) -> Vec<SessionOutput> {
            let mut outputs = Vec::new();
            while let Some((delay, event)) = self.scheduler.take(TimerKind::SilenceCountdown) {
                self.clock.advance(delay);
                outputs.extend(self.session.on_timer(event));
            }
            outputs
        }

        fn utterance(&mut self, ms: u64) -> Vec<SessionOutput> {
            self.session.speech_start();
            self.session.poll_capture();
            self.clock.advance_ms(ms);
            self.session.speech_end();
            self.run_countdown()
        }

        fn fragment(&mut self, sequence: u64) -> Vec<SessionOutput> {
            self.session.transport(TransportEvent::Fragment {
                stream_id: "reply".to_string(),
                sequence,
                payload: vec![sequence as u8],
                duration_hint: Some(0.5),
                total_fragments: None,
            })
        }
    }

    fn has_clip(outputs: &[SessionOutput]) -> bool {
        outputs
            .iter()
            .any(|o| matches!(o, SessionOutput::Capture(CaptureEvent::ClipReady(_))))
    }

    #[test]
    fn test_batch_sink_receives_clip() {
        let mut rig = rig();
        rig.session.arm().unwrap();
        let outputs = rig.utterance(800);
        assert!(has_clip(&outputs));
        assert!(matches!(rig.sink.collected().as_slice(), [Outbound::Clip(_)]));
        assert_eq!(rig.session.capture_state(), CaptureState::Listening);
    }

    #[test]
    fn test_streaming_sink_receives_pcm_then_finalize() {
        let mut rig = rig_with(
            CollectorSink::streaming(),
            MockAudioSource::new().with_samples(vec![7; 4]),
        );
        rig.session.arm().unwrap();
        rig.utterance(800);
        assert_eq!(
            rig.sink.collected(),
            vec![
                Outbound::Pcm(vec![7, 0, 7, 0, 7, 0, 7, 0]),
                Outbound::Finalize
            ]
        );
    }

    #[test]
    fn test_streaming_sink_discards_short_clip() {
        let mut rig = rig_with(CollectorSink::streaming(), MockAudioSource::new());
        rig.session.arm().unwrap();
        rig.session
            .silence_threshold()
            .set(Duration::from_millis(200));
        let outputs = rig.utterance(100);
        assert!(!has_clip(&outputs));
        assert_eq!(rig.sink.collected().last(), Some(&Outbound::Discard));
    }

    #[test]
    fn test_playback_suppresses_recording() {
        let mut rig = rig();
        rig.session.arm().unwrap();
        rig.session.speech_start();
        rig.session.poll_capture();

        rig.session.transport(TransportEvent::StreamStart {
            stream_id: "reply".to_string(),
        });
        let outputs = rig.fragment(1);

        assert!(outputs.iter().any(|o| matches!(
            o,
            SessionOutput::Capture(CaptureEvent::Notice(CaptureNotice::RecordingDiscarded))
        )));
        assert_eq!(rig.session.capture_state(), CaptureState::Listening);
        assert!(rig.session.snapshot().output_active);

        // Speech during output is ignored, not queued.
        assert!(rig.session.speech_start().is_empty());

        let outcome = rig.stream.finish().unwrap();
        rig.session.on_render_outcome(outcome);
        assert!(!rig.session.snapshot().output_active);
        assert_eq!(rig.session.speech_start().len(), 1);
        assert!(rig.sink.collected().is_empty());
    }

    #[test]
    fn test_stream_end_without_count_completes() {
        let mut rig = rig();
        rig.session.transport(TransportEvent::StreamStart {
            stream_id: "reply".to_string(),
        });
        rig.fragment(2);
        rig.fragment(1);
        let outcome = rig.stream.finish().unwrap();
        rig.session.on_render_outcome(outcome);

        rig.session.transport(TransportEvent::StreamEnd {
            stream_id: "reply".to_string(),
        });
        let outcome = rig.stream.finish().unwrap();
        let outputs = rig.session.on_render_outcome(outcome);
        assert!(outputs.iter().any(|o| matches!(
            o,
            SessionOutput::Playback(PlaybackEvent::StreamComplete { .. })
        )));
        assert_eq!(rig.stream.rendered_sequences(), vec![1, 2]);
    }

    #[test]
    fn test_stream_error_fails_stream() {
        let mut rig = rig();
        rig.session.transport(TransportEvent::StreamStart {
            stream_id: "reply".to_string(),
        });
        rig.fragment(2);
        let outputs = rig.session.transport(TransportEvent::StreamError {
            stream_id: "reply".to_string(),
            message: "reset by peer".to_string(),
        });
        assert!(outputs.iter().any(|o| matches!(
            o,
            SessionOutput::Playback(PlaybackEvent::StreamFailed { .. })
        )));
        assert!(rig.session.assembler().active_stream_id().is_none());
    }

    #[test]
    fn test_transport_dropped_finalizes_recording() {
        let mut rig = rig();
        rig.session.arm().unwrap();
        rig.session.speech_start();
        rig.session.poll_capture();
        let outputs = rig.session.transport(TransportEvent::Dropped);
        assert!(has_clip(&outputs));
    }

    #[test]
    fn test_locked_gate_holds_output_until_unlock() {
        let mut rig = rig();
        let gate = AudioOutputGate::locked();
        rig.session.gate = gate.clone();
        rig.session.assembler = FragmentAssembler::new(Box::new(RecordingRenderer::new()))
            .with_gate(gate);
        rig.session.transport(TransportEvent::StreamStart {
            stream_id: "reply".to_string(),
        });
        rig.fragment(1);
        assert!(!rig.session.snapshot().output_active);
        assert_eq!(rig.session.snapshot().gate, GateState::Locked);

        rig.session.unlock_output();
        assert!(rig.session.snapshot().output_active);
    }

    #[test]
    fn test_channel_output_counts_as_active() {
        let mut rig = rig();
        rig.session.arm().unwrap();
        let (play, _) = rig.session.play_on_channel(
            "avatar",
            vec![1],
            Fingerprint::new("a"),
            ChannelCallbacks::new(),
        );
        assert_eq!(play, ChannelPlay::Started);
        assert!(rig.session.snapshot().output_active);

        let outcome = rig.channel.finish().unwrap();
        rig.session.on_render_outcome(outcome);
        assert!(!rig.session.snapshot().output_active);
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let mut rig = rig();
        rig.session.arm().unwrap();
        rig.session.transport(TransportEvent::StreamStart {
            stream_id: "reply".to_string(),
        });
        rig.fragment(1);
        rig.session.shutdown();
        assert_eq!(rig.session.capture_state(), CaptureState::Idle);
        assert!(!rig.device.is_started());
        assert_eq!(rig.stream.halts(), 1);
    }

    #[test]
    fn test_invalid_config_is_refused() {
        let parts = || {
            SessionParts::new(
                DeviceManager::new(Box::new(|| {
                    Ok(Box::new(MockAudioSource::new()) as Box<dyn AudioSource>)
                })),
                Arc::new(ManualScheduler::new()),
                Box::new(RecordingRenderer::new()),
                Box::new(RecordingRenderer::new()),
                Box::new(CollectorSink::new()),
            )
        };

        let mut config = Config::default();
        config.capture.poll_interval_ms = 0;
        assert!(matches!(
            DuplexSession::new(&config, parts()),
            Err(VoxturnError::ConfigInvalidValue { key, .. }) if key == "capture.poll_interval_ms"
        ));

        let mut config = Config::default();
        config.capture.countdown_tick_ms = 0;
        assert!(matches!(
            DuplexSession::new(&config, parts()),
            Err(VoxturnError::ConfigInvalidValue { key, .. }) if key == "capture.countdown_tick_ms"
        ));
    }

    #[test]
    fn test_snapshot_reports_output_levels_while_sounding() {
        let mut rig = rig();
        assert!(rig.session.snapshot().output_levels.is_none());

        rig.session.transport(TransportEvent::StreamStart {
            stream_id: "reply".to_string(),
        });
        rig.session.transport(TransportEvent::Fragment {
            stream_id: "reply".to_string(),
            sequence: 1,
            payload: vec![200; 64],
            duration_hint: Some(0.5),
            total_fragments: Some(1),
        });
        let levels = rig.session.snapshot().output_levels.unwrap();
        assert!(levels.rms > 0.0);

        let outcome = rig.stream.finish().unwrap();
        rig.session.on_render_outcome(outcome);
        assert!(rig.session.snapshot().output_levels.is_none());

        rig.session.play_on_channel(
            "avatar",
            vec![90; 64],
            Fingerprint::new("a"),
            ChannelCallbacks::new(),
        );
        assert!(rig.session.snapshot().output_levels.is_some());
        rig.session.stop_playback();
        assert!(rig.session.snapshot().output_levels.is_none());
    }

    #[test]
    fn test_snapshot_reports_countdown() {
        let mut rig = rig();
        rig.session.arm().unwrap();
        rig.session.speech_start();
        rig.clock.advance_ms(600);
        rig.session.speech_end();
        rig.clock.advance_ms(250);
        let snapshot = rig.session.snapshot();
        assert_eq!(snapshot.capture_state, CaptureState::SilenceCountdown);
        assert_eq!(snapshot.remaining, Some(Duration::from_millis(750)));
    }
}
