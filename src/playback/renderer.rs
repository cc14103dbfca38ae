//! Audio output seam.
//!
//! A [`Renderer`] starts playing one payload at a time and reports the end
//! of that payload later, as a [`RenderOutcome`] delivered to the event loop.
//! Every outcome carries the [`RenderTicket`] it was started with, so the
//! owner can drop outcomes that belong to a stream or channel that has
//! since been torn down.
//!
//! Renderers may also tap what they play: [`Renderer::output_levels`]
//! reports analyzer levels of the payload currently sounding.

use crate::audio::analyzer::{LevelAnalyzer, Levels};
use crate::error::{Result, VoxturnError};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Which player issued a render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderOrigin {
    Stream,
    Channel,
}

/// Identity of one render request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderTicket {
    pub origin: RenderOrigin,
    pub generation: u64,
    pub sequence: u64,
}

/// Completion or failure of a render, delivered asynchronously.
#[derive(Debug)]
pub struct RenderOutcome {
    pub ticket: RenderTicket,
    pub result: Result<()>,
}

impl RenderOutcome {
    pub fn finished(ticket: RenderTicket) -> Self {
        Self {
            ticket,
            result: Ok(()),
        }
    }

    pub fn failed(ticket: RenderTicket, error: VoxturnError) -> Self {
        Self {
            ticket,
            result: Err(error),
        }
    }
}

/// Plays encoded audio payloads on an output device.
pub trait Renderer: Send {
    /// Starts rendering `payload`.
    ///
    /// Returning `Ok` means an outcome for `ticket` will follow unless the
    /// render is halted first. An `Err` means nothing started.
    fn render(&mut self, ticket: RenderTicket, payload: &[u8]) -> Result<()>;

    /// Stops whatever is sounding. No outcome is delivered for a halted render.
    fn halt(&mut self);

    /// Analyzer levels of the audio sounding right now, if this renderer taps its output.
    fn output_levels(&self) -> Option<Levels> {
        None
    }
}

/// Bands the test double reports for output levels.
const RECORDING_LEVEL_BANDS: usize = 4;

#[derive(Debug, Default)]
struct RecordingState {
    rendered: Vec<(RenderTicket, Vec<u8>)>,
    in_flight: Vec<RenderTicket>,
    max_concurrent: usize,
    halts: usize,
    refuse: HashSet<u64>,
}

/// Renderer double that records every request.
///
/// Renders stay in flight until a test finishes them through the
/// [`RecordingProbe`], or immediately when built with `with_auto_complete`.
#[derive(Debug, Clone, Default)]
pub struct RecordingRenderer {
    state: Arc<Mutex<RecordingState>>,
    auto_complete: Option<mpsc::UnboundedSender<RenderOutcome>>,
}

impl RecordingRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports every render as finished through `outcomes` right away.
    pub fn with_auto_complete(mut self, outcomes: mpsc::UnboundedSender<RenderOutcome>) -> Self {
        self.auto_complete = Some(outcomes);
        self
    }

    /// Refuses to start the fragment with this sequence, as an undecodable payload would.
    pub fn with_refused_sequence(self, sequence: u64) -> Self {
        self.lock().refuse.insert(sequence);
        self
    }

    pub fn probe(&self) -> RecordingProbe {
        RecordingProbe {
            state: Arc::clone(&self.state),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RecordingState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Renderer for RecordingRenderer {
    fn render(&mut self, ticket: RenderTicket, payload: &[u8]) -> Result<()> {
        {
            let mut state = self.lock();
            if state.refuse.contains(&ticket.sequence) {
                return Err(VoxturnError::Playback {
                    message: format!("cannot decode fragment {}", ticket.sequence),
                });
            }
            state.rendered.push((ticket, payload.to_vec()));
            state.in_flight.push(ticket);
            state.max_concurrent = state.max_concurrent.max(state.in_flight.len());
        }

        if let Some(outcomes) = &self.auto_complete {
            self.lock().in_flight.retain(|t| *t != ticket);
            // Receiver gone means the session shut down.
            let _ = outcomes.send(RenderOutcome::finished(ticket));
        }
        Ok(())
    }

    fn halt(&mut self) {
        let mut state = self.lock();
        state.in_flight.clear();
        state.halts += 1;
    }

    /// Synthetic levels of the newest in-flight payload, each byte taken as one sample.
    fn output_levels(&self) -> Option<Levels> {
        let state = self.lock();
        let ticket = *state.in_flight.last()?;
        let (_, payload) = state.rendered.iter().rev().find(|(t, _)| *t == ticket)?;
        let samples: Vec<i16> = payload.iter().map(|&b| i16::from(b) << 7).collect();
        Some(LevelAnalyzer::new(RECORDING_LEVEL_BANDS).analyze(&samples))
    }
}

/// Inspects and drives a [`RecordingRenderer`] after it was boxed and moved.
#[derive(Debug, Clone)]
pub struct RecordingProbe {
    state: Arc<Mutex<RecordingState>>,
}

impl RecordingProbe {
    fn lock(&self) -> std::sync::MutexGuard<'_, RecordingState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every render request so far, in order.
    pub fn rendered(&self) -> Vec<RenderTicket> {
        self.lock().rendered.iter().map(|(t, _)| *t).collect()
    }

    /// Sequence numbers rendered so far, in order.
    pub fn rendered_sequences(&self) -> Vec<u64> {
        self.lock().rendered.iter().map(|(t, _)| t.sequence).collect()
    }

    pub fn rendered_payloads(&self) -> Vec<Vec<u8>> {
        self.lock().rendered.iter().map(|(_, p)| p.clone()).collect()
    }

    /// The oldest render still sounding.
    pub fn in_flight(&self) -> Option<RenderTicket> {
        self.lock().in_flight.first().copied()
    }

    /// Highest number of renders that were sounding at once.
    pub fn max_concurrent(&self) -> usize {
        self.lock().max_concurrent
    }

    pub fn halts(&self) -> usize {
        self.lock().halts
    }

    /// Finishes the oldest in-flight render and returns its outcome.
    pub fn finish(&self) -> Option<RenderOutcome> {
        let mut state = self.lock();
        if state.in_flight.is_empty() {
            return None;
        }
        Some(RenderOutcome::finished(state.in_flight.remove(0)))
    }

    /// Fails the oldest in-flight render and returns its outcome.
    pub fn fail(&self, message: &str) -> Option<RenderOutcome> {
        let mut state = self.lock();
        if state.in_flight.is_empty() {
            return None;
        }
        let ticket = state.in_flight.remove(0);
        Some(RenderOutcome::failed(
            ticket,
            VoxturnError::Playback {
                message: message.to_string(),
            },
        ))
    }
}

#[cfg(feature = "rodio-playback")]
pub use rodio_output::RodioRenderer;

#[cfg(feature = "rodio-playback")]
mod rodio_output {
    use super::{RenderOutcome, RenderTicket, Renderer};
    use crate::audio::analyzer::{LevelAnalyzer, Levels};
    use crate::defaults;
    use crate::error::{Result, VoxturnError};
    use rodio::Source;
    use std::io::Cursor;
    use std::sync::{Arc, Mutex, MutexGuard};
    use std::sync::mpsc as std_mpsc;
    use std::thread::{self, JoinHandle};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tracing::{debug, warn};

    const POLL_INTERVAL: Duration = Duration::from_millis(10);

    enum Command {
        Play(RenderTicket, Vec<u8>),
        Halt,
        Shutdown,
    }

    type SharedLevels = Arc<Mutex<Option<Levels>>>;

    fn lock(levels: &SharedLevels) -> MutexGuard<'_, Option<Levels>> {
        levels.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Passes decoded samples through unchanged, publishing analyzer levels
    /// of the first channel once per FFT window.
    struct LevelTap<S> {
        inner: S,
        analyzer: LevelAnalyzer,
        window: Vec<i16>,
        window_len: usize,
        position: usize,
        levels: SharedLevels,
    }

    impl<S: Source<Item = f32>> LevelTap<S> {
        fn new(inner: S, bands: usize, fft_size: usize, levels: SharedLevels) -> Self {
            Self {
                inner,
                analyzer: LevelAnalyzer::with_fft_size(bands, fft_size),
                window: Vec::with_capacity(fft_size),
                window_len: fft_size.max(2),
                position: 0,
                levels,
            }
        }
    }

    impl<S: Source<Item = f32>> Iterator for LevelTap<S> {
        type Item = f32;

        fn next(&mut self) -> Option<f32> {
            let sample = self.inner.next()?;
            let channels = usize::from(self.inner.channels().max(1));
            if self.position % channels == 0 {
                self.window
                    .push((sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16);
                if self.window.len() >= self.window_len {
                    *lock(&self.levels) = Some(self.analyzer.analyze(&self.window));
                    self.window.clear();
                }
            }
            self.position = self.position.wrapping_add(1);
            Some(sample)
        }
    }

    impl<S: Source<Item = f32>> Source for LevelTap<S> {
        fn current_frame_len(&self) -> Option<usize> {
            self.inner.current_frame_len()
        }

        fn channels(&self) -> u16 {
            self.inner.channels()
        }

        fn sample_rate(&self) -> u32 {
            self.inner.sample_rate()
        }

        fn total_duration(&self) -> Option<Duration> {
            self.inner.total_duration()
        }
    }

    /// Renderer playing through the default output device with rodio.
    ///
    /// `OutputStream` is not `Send`, so a dedicated thread owns it and the
    /// sink; the renderer only passes commands to that thread.
    pub struct RodioRenderer {
        commands: std_mpsc::Sender<Command>,
        levels: SharedLevels,
        thread: Option<JoinHandle<()>>,
    }

    impl RodioRenderer {
        /// Opens the default output device. Outcomes are sent to `outcomes`.
        pub fn spawn(outcomes: mpsc::UnboundedSender<RenderOutcome>) -> Result<Self> {
            Self::spawn_with_analyzer(
                outcomes,
                defaults::ANALYZER_BANDS,
                defaults::ANALYZER_FFT_SIZE,
            )
        }

        /// Like [`spawn`](Self::spawn), with the output analyzer's band count and FFT window.
        pub fn spawn_with_analyzer(
            outcomes: mpsc::UnboundedSender<RenderOutcome>,
            bands: usize,
            fft_size: usize,
        ) -> Result<Self> {
            let (commands, command_rx) = std_mpsc::channel();
            let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<()>>(1);
            let levels = SharedLevels::default();
            let tap = OutputTap {
                bands,
                fft_size,
                levels: Arc::clone(&levels),
            };

            let thread = thread::Builder::new()
                .name("voxturn-output".to_string())
                .spawn(move || output_thread(command_rx, ready_tx, outcomes, tap))?;

            match ready_rx.recv() {
                Ok(Ok(())) => Ok(Self {
                    commands,
                    levels,
                    thread: Some(thread),
                }),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(VoxturnError::Playback {
                    message: "output thread exited during startup".to_string(),
                }),
            }
        }
    }

    struct OutputTap {
        bands: usize,
        fft_size: usize,
        levels: SharedLevels,
    }

    fn output_thread(
        commands: std_mpsc::Receiver<Command>,
        ready: std_mpsc::SyncSender<Result<()>>,
        outcomes: mpsc::UnboundedSender<RenderOutcome>,
        tap: OutputTap,
    ) {
        let opened = rodio::OutputStream::try_default()
            .map_err(|e| e.to_string())
            .and_then(|(stream, handle)| {
                rodio::Sink::try_new(&handle)
                    .map(|sink| (stream, handle, sink))
                    .map_err(|e| e.to_string())
            });
        let (_stream, handle, mut sink) = match opened {
            Ok(parts) => {
                let _ = ready.send(Ok(()));
                parts
            }
            Err(message) => {
                let _ = ready.send(Err(VoxturnError::Playback { message }));
                return;
            }
        };

        let mut current: Option<RenderTicket> = None;
        loop {
            match commands.recv_timeout(POLL_INTERVAL) {
                Ok(Command::Play(ticket, payload)) => {
                    match rodio::Decoder::new(Cursor::new(payload)) {
                        Ok(source) => {
                            sink.append(LevelTap::new(
                                source.convert_samples::<f32>(),
                                tap.bands,
                                tap.fft_size,
                                Arc::clone(&tap.levels),
                            ));
                            current = Some(ticket);
                        }
                        Err(e) => {
                            let _ = outcomes.send(RenderOutcome::failed(
                                ticket,
                                VoxturnError::Playback {
                                    message: e.to_string(),
                                },
                            ));
                        }
                    }
                }
                Ok(Command::Halt) => {
                    sink.stop();
                    current = None;
                    *lock(&tap.levels) = None;
                    // A stopped sink is replaced so later appends start cleanly.
                    match rodio::Sink::try_new(&handle) {
                        Ok(fresh) => sink = fresh,
                        Err(e) => warn!(error = %e, "failed to recreate output sink"),
                    }
                }
                Ok(Command::Shutdown) | Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                    sink.stop();
                    debug!("output thread exiting");
                    return;
                }
                Err(std_mpsc::RecvTimeoutError::Timeout) => {}
            }

            if current.is_some() && sink.empty()
                && let Some(ticket) = current.take()
            {
                *lock(&tap.levels) = None;
                let _ = outcomes.send(RenderOutcome::finished(ticket));
            }
        }
    }

    impl Renderer for RodioRenderer {
        fn render(&mut self, ticket: RenderTicket, payload: &[u8]) -> Result<()> {
            self.commands
                .send(Command::Play(ticket, payload.to_vec()))
                .map_err(|_| VoxturnError::Playback {
                    message: "output thread is not running".to_string(),
                })
        }

        fn halt(&mut self) {
            if self.commands.send(Command::Halt).is_err() {
                warn!("halt requested but output thread is not running");
            }
        }

        fn output_levels(&self) -> Option<Levels> {
            lock(&self.levels).clone()
        }
    }

    impl Drop for RodioRenderer {
        fn drop(&mut self) {
            let _ = self.commands.send(Command::Shutdown);
            if let Some(thread) = self.thread.take()
                && thread.join().is_err()
            {
                warn!("output thread panicked");
            }
        }
    }
}
