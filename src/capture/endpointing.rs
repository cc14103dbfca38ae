//! Endpointing capture state machine.
//!
//! Turns speech start/end signals into finished utterances:
//!
//! ```text
//! Idle ─arm→ Listening ─speech start→ Recording ─speech end→ SilenceCountdown
//!              ↑                          ↑                        │
//!              │                          └──── speech start ──────┤
//!              └──────────── countdown reaches zero ───────────────┘
//! ```
//!
//! The countdown is a self-rescheduling timer that re-reads the live silence
//! threshold on every tick. Any state returns to `Idle` on `disarm`.

use crate::audio::lifecycle::{CaptureBlock, CaptureLease, DeviceManager};
use crate::audio::wav::encode_wav;
use crate::capture::session::{CaptureSession, CaptureState, CapturedClip, FinalizeReason};
use crate::clock::{Clock, SystemClock};
use crate::config::{CaptureConfig, SilenceThreshold};
use crate::defaults;
use crate::error::Result;
use crate::timer::{Scheduler, TimerEvent, TimerKind};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Recoverable, user-facing capture notices. Not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureNotice {
    /// The utterance was shorter than the minimum clip length and was dropped.
    ClipTooShort { recorded: Duration },
    /// Output started mid-utterance; the recording was dropped.
    RecordingDiscarded,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    StateChanged { from: CaptureState, to: CaptureState },
    ClipReady(CapturedClip),
    Notice(CaptureNotice),
    /// A block captured while recording, for realtime recognizers.
    RawSamples(Vec<i16>),
}

pub struct Endpointer {
    devices: DeviceManager,
    scheduler: Arc<dyn Scheduler>,
    clock: Arc<dyn Clock>,
    threshold: SilenceThreshold,
    min_clip: Duration,
    tick: Duration,
    sample_rate: u32,
    session: Option<CaptureSession>,
    lease: Option<CaptureLease>,
    generation: u64,
    suppressed: bool,
    forward_raw: bool,
}

impl Endpointer {
    pub fn new(devices: DeviceManager, scheduler: Arc<dyn Scheduler>, config: &CaptureConfig) -> Self {
        Self {
            devices,
            scheduler,
            clock: Arc::new(SystemClock),
            threshold: SilenceThreshold::new(Duration::from_millis(config.silence_threshold_ms)),
            min_clip: config.min_clip(),
            tick: config.countdown_tick(),
            sample_rate: config.sample_rate,
            session: None,
            lease: None,
            generation: 0,
            suppressed: false,
            forward_raw: false,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Shares a live threshold handle instead of the one seeded from config.
    pub fn with_threshold(mut self, threshold: SilenceThreshold) -> Self {
        self.threshold = threshold;
        self
    }

    /// Emits `RawSamples` for every block buffered while recording.
    pub fn with_raw_forwarding(mut self, forward_raw: bool) -> Self {
        self.forward_raw = forward_raw;
        self
    }

    pub fn state(&self) -> CaptureState {
        self.session
            .as_ref()
            .map_or(CaptureState::Idle, CaptureSession::state)
    }

    pub fn session(&self) -> Option<&CaptureSession> {
        self.session.as_ref()
    }

    pub fn threshold(&self) -> &SilenceThreshold {
        &self.threshold
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppressed
    }

    pub fn is_device_held(&self) -> bool {
        self.lease.as_ref().is_some_and(|l| !l.is_released())
    }

    /// Time left on the silence countdown, if one is running.
    pub fn remaining(&self) -> Option<Duration> {
        let session = self.session.as_ref()?;
        if session.state != CaptureState::SilenceCountdown {
            return None;
        }
        let silence_started_at = session.silence_started_at?;
        let silent_for = self.clock.now().saturating_duration_since(silence_started_at);
        Some(self.threshold.get().saturating_sub(silent_for))
    }

    /// Idle → Listening. Acquires the capture device.
    ///
    /// A no-op when already armed. On failure the machine stays `Idle`.
    pub fn arm(&mut self) -> Result<Vec<CaptureEvent>> {
        if self.session.is_some() {
            debug!(state = %self.state(), "arm ignored: already armed");
            return Ok(Vec::new());
        }
        let lease = self.devices.acquire()?;
        self.sample_rate = lease.sample_rate();
        self.lease = Some(lease);
        self.session = Some(CaptureSession::listening());
        self.generation += 1;
        info!("capture armed");
        Ok(vec![self.changed(CaptureState::Idle, CaptureState::Listening)])
    }

    /// Any state → Idle. Releases the device and drops any unsent audio.
    pub fn disarm(&mut self) -> Vec<CaptureEvent> {
        self.scheduler.cancel(TimerKind::SilenceCountdown);
        self.generation += 1;
        if let Some(mut lease) = self.lease.take()
            && let Err(e) = lease.release()
        {
            warn!(error = %e, "failed to release capture device");
        }
        match self.session.take() {
            Some(session) => {
                info!(discarded = session.buffered.len(), "capture disarmed");
                vec![self.changed(session.state, CaptureState::Idle)]
            }
            None => Vec::new(),
        }
    }

    pub fn on_speech_start(&mut self) -> Vec<CaptureEvent> {
        if self.suppressed {
            debug!("speech start ignored while output is active");
            return Vec::new();
        }
        let now = self.clock.now();
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        let from = session.state;
        match from {
            CaptureState::Listening => {
                session.recording_started_at = Some(now);
                session.silence_started_at = None;
                session.buffered.clear();
            }
            CaptureState::SilenceCountdown => {
                session.silence_started_at = None;
                self.scheduler.cancel(TimerKind::SilenceCountdown);
                self.generation += 1;
            }
            CaptureState::Idle | CaptureState::Recording => return Vec::new(),
        }
        session.state = CaptureState::Recording;
        vec![self.changed(from, CaptureState::Recording)]
    }

    pub fn on_speech_end(&mut self) -> Vec<CaptureEvent> {
        if self.suppressed {
            debug!("speech end ignored while output is active");
            return Vec::new();
        }
        let now = self.clock.now();
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        if session.state != CaptureState::Recording {
            return Vec::new();
        }
        session.state = CaptureState::SilenceCountdown;
        session.silence_started_at = Some(now);

        self.generation += 1;
        let first_tick = self.tick.min(self.threshold.get());
        self.scheduler.schedule(
            first_tick,
            TimerEvent::new(TimerKind::SilenceCountdown, self.generation),
        );
        vec![self.changed(CaptureState::Recording, CaptureState::SilenceCountdown)]
    }

    /// One countdown tick. Reschedules itself until the threshold is reached.
    pub fn on_timer(&mut self, event: TimerEvent) -> Result<Vec<CaptureEvent>> {
        if event.kind != TimerKind::SilenceCountdown || event.generation != self.generation {
            debug!(?event, "stale countdown tick dropped");
            return Ok(Vec::new());
        }
        let Some(remaining) = self.remaining() else {
            return Ok(Vec::new());
        };
        if !remaining.is_zero() {
            self.scheduler.schedule(self.tick.min(remaining), event);
            return Ok(Vec::new());
        }
        self.finalize(FinalizeReason::Silence)
    }

    /// The transport closed mid-utterance: keep whatever was buffered.
    pub fn transport_dropped(&mut self) -> Result<Vec<CaptureEvent>> {
        if !self.state().is_recording() {
            return Ok(Vec::new());
        }
        self.finalize(FinalizeReason::TransportDropped)
    }

    /// Output started. A recording in progress is dropped, not finalized,
    /// and speech signals are ignored until `lift_suppression`.
    pub fn suppress(&mut self) -> Vec<CaptureEvent> {
        self.suppressed = true;
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        let from = session.state;
        if !from.is_recording() {
            return Vec::new();
        }
        let discarded = session.reset_to_listening();
        self.scheduler.cancel(TimerKind::SilenceCountdown);
        self.generation += 1;
        info!(samples = discarded.len(), "recording discarded: output started");
        vec![
            self.changed(from, CaptureState::Listening),
            CaptureEvent::Notice(CaptureNotice::RecordingDiscarded),
        ]
    }

    pub fn lift_suppression(&mut self) {
        if self.suppressed {
            debug!("speech handling resumed");
        }
        self.suppressed = false;
    }

    /// Buffers a captured block while recording.
    pub fn on_audio(&mut self, samples: &[i16]) -> Vec<CaptureEvent> {
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        if !session.state.is_recording() || samples.is_empty() {
            return Vec::new();
        }
        session.buffered.extend_from_slice(samples);
        if self.forward_raw {
            vec![CaptureEvent::RawSamples(samples.to_vec())]
        } else {
            Vec::new()
        }
    }

    /// Reads the next block from the capture device, if armed.
    pub fn read_block(&mut self) -> Result<Option<CaptureBlock>> {
        match self.lease.as_mut() {
            Some(lease) => lease.read_block(),
            None => Ok(None),
        }
    }

    fn finalize(&mut self, reason: FinalizeReason) -> Result<Vec<CaptureEvent>> {
        let now = self.clock.now();
        let Some(session) = self.session.as_mut() else {
            return Ok(Vec::new());
        };
        let from = session.state;
        let recorded = session
            .recording_started_at
            .map_or(Duration::ZERO, |start| now.saturating_duration_since(start));
        let samples = session.reset_to_listening();

        self.scheduler.cancel(TimerKind::SilenceCountdown);
        self.generation += 1;
        let mut events = vec![self.changed(from, CaptureState::Listening)];

        let keep = match reason {
            FinalizeReason::Silence => recorded >= self.min_clip,
            FinalizeReason::TransportDropped => !samples.is_empty(),
        };
        if !keep {
            if reason == FinalizeReason::Silence {
                info!(recorded_ms = recorded.as_millis() as u64, "clip too short, discarded");
                events.push(CaptureEvent::Notice(CaptureNotice::ClipTooShort { recorded }));
            }
            return Ok(events);
        }

        let bytes = encode_wav(&samples, self.sample_rate)?;
        let duration = Duration::from_micros(
            samples.len() as u64 * 1_000_000 / self.sample_rate.max(1) as u64,
        );
        info!(
            ?reason,
            recorded_ms = recorded.as_millis() as u64,
            bytes = bytes.len(),
            "clip ready"
        );
        events.push(CaptureEvent::ClipReady(CapturedClip {
            bytes,
            mime_type: defaults::CLIP_MIME_TYPE,
            duration,
            sample_rate: self.sample_rate,
            reason,
        }));
        Ok(events)
    }

    fn changed(&self, from: CaptureState, to: CaptureState) -> CaptureEvent {
        debug!(%from, %to, "capture state changed");
        CaptureEvent::StateChanged { from, to }
    }
}

impl Drop for Endpointer {
    fn drop(&mut self) {
        self.scheduler.cancel(TimerKind::SilenceCountdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::source::{AudioSource, MockAudioSource, MockDeviceProbe};
    use crate::clock::ManualClock;
    use crate::error::VoxturnError;
    use crate::timer::ManualScheduler;

    struct Rig {
        endpointer: Endpointer,
        clock: ManualClock,
        scheduler: Arc<ManualScheduler>,
        device: MockDeviceProbe,
    }

    fn rig_with(source: MockAudioSource) -> Rig {
        let device = source.probe();
        let devices = DeviceManager::new(Box::new(move || {
            Ok(Box::new(source.clone()) as Box<dyn AudioSource>)
        }));
        let clock = ManualClock::new();
        let scheduler = Arc::new(ManualScheduler::new());
        let config = CaptureConfig {
            silence_threshold_ms: 1000,
            min_clip_ms: 500,
            countdown_tick_ms: 100,
            ..CaptureConfig::default()
        };
        let endpointer = Endpointer::new(devices, scheduler.clone(), &config)
            .with_clock(Arc::new(clock.clone()));
        Rig {
            endpointer,
            clock,
            scheduler,
            device,
        }
    }

    fn rig() -> Rig {
        rig_with(MockAudioSource::new())
    }

    impl Rig {
        /// Fires countdown ticks, advancing the clock by each delay, until none is pending.
        fn run_countdown(&mut self) -> Vec<CaptureEvent> {
            let mut events = Vec::new();
            while let Some((delay, event)) = self.scheduler.take(TimerKind::SilenceCountdown) {
                self.clock.advance(delay);
                events.extend(self.endpointer.on_timer(event).unwrap());
            }
            events
        }

        fn record(&mut self, ms: u64) {
            self.endpointer.on_speech_start();
            self.endpointer.on_audio(&vec![100i16; 16 * ms as usize]);
            self.clock.advance_ms(ms);
        }
    }

    fn clips(events: &[CaptureEvent]) -> Vec<&CapturedClip> {
        events
            .iter()
            .filter_map(|e| match e {
                CaptureEvent::ClipReady(clip) => Some(clip),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_arm_moves_to_listening_and_holds_device() {
        let mut rig = rig();
        let events = rig.endpointer.arm().unwrap();
        assert_eq!(
            events,
            vec![CaptureEvent::StateChanged {
                from: CaptureState::Idle,
                to: CaptureState::Listening
            }]
        );
        assert!(rig.device.is_started());
        assert!(rig.endpointer.is_device_held());
    }

    #[test]
    fn test_arm_twice_is_noop() {
        let mut rig = rig();
        rig.endpointer.arm().unwrap();
        rig.record(100);
        assert!(rig.endpointer.arm().unwrap().is_empty());
        assert_eq!(rig.endpointer.state(), CaptureState::Recording);
        assert_eq!(rig.device.starts(), 1);
    }

    #[test]
    fn test_arm_failure_stays_idle() {
        let mut rig = rig_with(MockAudioSource::new().with_start_failure());
        let err = rig.endpointer.arm().unwrap_err();
        assert!(matches!(err, VoxturnError::DeviceUnavailable { .. }));
        assert_eq!(rig.endpointer.state(), CaptureState::Idle);
        assert!(!rig.endpointer.is_device_held());
    }

    #[test]
    fn test_speech_ignored_when_idle() {
        let mut rig = rig();
        assert!(rig.endpointer.on_speech_start().is_empty());
        assert!(rig.endpointer.on_speech_end().is_empty());
        assert_eq!(rig.endpointer.state(), CaptureState::Idle);
    }

    #[test]
    fn test_speech_end_ignored_unless_recording() {
        let mut rig = rig();
        rig.endpointer.arm().unwrap();
        assert!(rig.endpointer.on_speech_end().is_empty());
        assert_eq!(rig.endpointer.state(), CaptureState::Listening);
    }

    #[test]
    fn test_full_utterance_emits_one_clip() {
        let mut rig = rig();
        rig.endpointer.arm().unwrap();
        rig.record(800);
        rig.endpointer.on_speech_end();
        assert_eq!(rig.endpointer.state(), CaptureState::SilenceCountdown);

        let events = rig.run_countdown();
        let found = clips(&events);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].mime_type, "audio/wav");
        assert_eq!(found[0].reason, FinalizeReason::Silence);
        assert_eq!(found[0].duration, Duration::from_millis(800));
        assert_eq!(rig.endpointer.state(), CaptureState::Listening);
        assert!(rig.scheduler.is_empty());
    }

    #[test]
    fn test_countdown_ticks_and_remaining() {
        let mut rig = rig();
        rig.endpointer.arm().unwrap();
        rig.record(800);
        rig.endpointer.on_speech_end();
        assert_eq!(rig.endpointer.remaining(), Some(Duration::from_millis(1000)));

        let (delay, event) = rig.scheduler.take(TimerKind::SilenceCountdown).unwrap();
        assert_eq!(delay, Duration::from_millis(100));
        rig.clock.advance(delay);
        assert!(rig.endpointer.on_timer(event).unwrap().is_empty());
        assert_eq!(rig.endpointer.remaining(), Some(Duration::from_millis(900)));
        assert_eq!(
            rig.scheduler.delay_of(TimerKind::SilenceCountdown),
            Some(Duration::from_millis(100))
        );
    }

    #[test]
    fn test_speech_restart_cancels_countdown() {
        let mut rig = rig();
        rig.endpointer.arm().unwrap();
        rig.record(800);
        let started = rig.endpointer.session().unwrap().recording_started_at();
        rig.endpointer.on_speech_end();
        let (_, stale) = rig.scheduler.take(TimerKind::SilenceCountdown).unwrap();
        rig.clock.advance_ms(400);

        let events = rig.endpointer.on_speech_start();
        assert_eq!(
            events,
            vec![CaptureEvent::StateChanged {
                from: CaptureState::SilenceCountdown,
                to: CaptureState::Recording
            }]
        );
        assert_eq!(rig.endpointer.session().unwrap().recording_started_at(), started);
        assert!(rig.scheduler.is_empty());

        // A tick already in flight when speech resumed is inert.
        rig.clock.advance_ms(2000);
        assert!(rig.endpointer.on_timer(stale).unwrap().is_empty());
        assert_eq!(rig.endpointer.state(), CaptureState::Recording);
    }

    #[test]
    fn test_short_recording_is_discarded_with_notice() {
        let mut rig = rig();
        rig.endpointer.arm().unwrap();
        rig.endpointer.on_speech_start();
        rig.clock.advance_ms(100);
        rig.endpointer.on_speech_end();
        // Threshold shortened below the clip floor.
        rig.endpointer.threshold().set(Duration::from_millis(200));

        let events = rig.run_countdown();
        assert!(clips(&events).is_empty());
        assert!(events.contains(&CaptureEvent::Notice(CaptureNotice::ClipTooShort {
            recorded: Duration::from_millis(300)
        })));
        assert_eq!(rig.endpointer.state(), CaptureState::Listening);
    }

    #[test]
    fn test_threshold_change_applies_on_next_tick() {
        let mut rig = rig();
        rig.endpointer.arm().unwrap();
        rig.record(800);
        rig.endpointer.on_speech_end();

        let (delay, event) = rig.scheduler.take(TimerKind::SilenceCountdown).unwrap();
        rig.clock.advance(delay);
        rig.endpointer.threshold().set(Duration::from_millis(50));
        let events = rig.endpointer.on_timer(event).unwrap();
        assert_eq!(clips(&events).len(), 1);
    }

    #[test]
    fn test_threshold_raise_extends_countdown() {
        let mut rig = rig();
        rig.endpointer.arm().unwrap();
        rig.record(800);
        rig.endpointer.on_speech_end();
        rig.endpointer.threshold().set(Duration::from_millis(3000));

        let mut elapsed = Duration::ZERO;
        while let Some((delay, event)) = rig.scheduler.take(TimerKind::SilenceCountdown) {
            rig.clock.advance(delay);
            elapsed += delay;
            rig.endpointer.on_timer(event).unwrap();
        }
        assert_eq!(elapsed, Duration::from_millis(3000));
    }

    #[test]
    fn test_raw_samples_forwarded_while_recording() {
        let mut rig = rig();
        rig.endpointer.forward_raw = true;
        rig.endpointer.arm().unwrap();
        assert!(rig.endpointer.on_audio(&[1, 2]).is_empty());

        rig.endpointer.on_speech_start();
        assert_eq!(
            rig.endpointer.on_audio(&[3, 4]),
            vec![CaptureEvent::RawSamples(vec![3, 4])]
        );
        assert_eq!(rig.endpointer.session().unwrap().buffered_samples(), 2);
    }

    #[test]
    fn test_suppress_discards_recording() {
        let mut rig = rig();
        rig.endpointer.arm().unwrap();
        rig.record(800);
        rig.endpointer.on_speech_end();

        let events = rig.endpointer.suppress();
        assert_eq!(
            events,
            vec![
                CaptureEvent::StateChanged {
                    from: CaptureState::SilenceCountdown,
                    to: CaptureState::Listening
                },
                CaptureEvent::Notice(CaptureNotice::RecordingDiscarded),
            ]
        );
        assert!(rig.scheduler.is_empty());
        assert!(rig.endpointer.on_speech_start().is_empty());
        assert_eq!(rig.endpointer.state(), CaptureState::Listening);

        rig.endpointer.lift_suppression();
        assert_eq!(rig.endpointer.on_speech_start().len(), 1);
        assert_eq!(rig.endpointer.session().unwrap().buffered_samples(), 0);
    }

    #[test]
    fn test_transport_dropped_keeps_short_recording() {
        let mut rig = rig();
        rig.endpointer.arm().unwrap();
        rig.record(100);
        let events = rig.endpointer.transport_dropped().unwrap();
        let found = clips(&events);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].reason, FinalizeReason::TransportDropped);
        assert_eq!(rig.endpointer.state(), CaptureState::Listening);
    }

    #[test]
    fn test_transport_dropped_with_empty_buffer_emits_nothing() {
        let mut rig = rig();
        rig.endpointer.arm().unwrap();
        rig.endpointer.on_speech_start();
        let events = rig.endpointer.transport_dropped().unwrap();
        assert!(clips(&events).is_empty());
        assert_eq!(rig.endpointer.state(), CaptureState::Listening);

        assert!(rig.endpointer.transport_dropped().unwrap().is_empty());
    }

    #[test]
    fn test_disarm_from_every_state() {
        for target in [
            CaptureState::Idle,
            CaptureState::Listening,
            CaptureState::Recording,
            CaptureState::SilenceCountdown,
        ] {
            let mut rig = rig();
            if target != CaptureState::Idle {
                rig.endpointer.arm().unwrap();
            }
            if target.is_recording() {
                rig.record(800);
            }
            if target == CaptureState::SilenceCountdown {
                rig.endpointer.on_speech_end();
            }
            assert_eq!(rig.endpointer.state(), target);
            let pending = rig.scheduler.take(TimerKind::SilenceCountdown);

            rig.endpointer.disarm();
            assert_eq!(rig.endpointer.state(), CaptureState::Idle);
            assert!(!rig.device.is_started());
            assert!(rig.scheduler.is_empty());

            if let Some((delay, event)) = pending {
                rig.clock.advance(delay * 20);
                assert!(rig.endpointer.on_timer(event).unwrap().is_empty());
            }
            rig.endpointer.disarm();
        }
    }

    #[test]
    fn test_read_block_only_while_armed() {
        let mut rig = rig_with(MockAudioSource::new().with_samples(vec![5; 320]));
        assert!(rig.endpointer.read_block().unwrap().is_none());
        rig.endpointer.arm().unwrap();
        let block = rig.endpointer.read_block().unwrap().unwrap();
        assert_eq!(block.samples.len(), 320);
        rig.endpointer.disarm();
        assert!(rig.endpointer.read_block().unwrap().is_none());
    }
}
