//! Channel playback: single-payload playback keyed by channel id.
//!
//! A channel models a continuously speaking avatar. A new payload for the
//! channel that is sounding replaces what it is saying; the same payload
//! delivered twice is ignored. A payload still settling or waiting for the
//! output gate was never heard, so a newer one replaces it without an
//! interrupt. Switching to another channel ends the
//! previous one without an interrupt.

use crate::audio::analyzer::Levels;
use crate::error::VoxturnError;
use crate::playback::gate::AudioOutputGate;
use crate::playback::renderer::{RenderOrigin, RenderOutcome, RenderTicket, Renderer};
use crate::timer::{Scheduler, TimerEvent, TimerKind};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Identity of a channel payload, used to recognize duplicate deliveries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Fingerprint derived from the payload bytes.
    pub fn of_payload(payload: &[u8]) -> Self {
        let mut hasher = DefaultHasher::new();
        payload.hash(&mut hasher);
        Self(format!("{:016x}", hasher.finish()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

type Callback = Box<dyn FnOnce() + Send>;
type ErrorCallback = Box<dyn FnOnce(&VoxturnError) + Send>;

/// Terminal notifications for one `play_on_channel` call.
///
/// At most one of them fires per call.
#[derive(Default)]
pub struct ChannelCallbacks {
    on_complete: Option<Callback>,
    on_interrupt: Option<Callback>,
    on_error: Option<ErrorCallback>,
}

impl ChannelCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_complete(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }

    pub fn on_interrupt(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_interrupt = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnOnce(&VoxturnError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    fn complete(self) {
        if let Some(f) = self.on_complete {
            f();
        }
    }

    fn interrupt(self) {
        if let Some(f) = self.on_interrupt {
            f();
        }
    }

    fn error(self, error: &VoxturnError) {
        if let Some(f) = self.on_error {
            f(error);
        }
    }
}

impl fmt::Debug for ChannelCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelCallbacks")
            .field("on_complete", &self.on_complete.is_some())
            .field("on_interrupt", &self.on_interrupt.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// What `play_on_channel` did with the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPlay {
    /// Rendering started.
    Started,
    /// Same payload already active on this channel; nothing happened.
    Duplicate,
    /// The channel's sounding payload was interrupted; this one starts after the settle delay.
    Replacing,
    /// Output is locked; this payload starts once it unlocks.
    Deferred,
    /// Rendering could not start; `on_error` fired.
    Failed,
}

#[derive(Debug)]
struct ChannelRequest {
    channel_id: String,
    fingerprint: Fingerprint,
    payload: Vec<u8>,
    callbacks: ChannelCallbacks,
}

#[derive(Debug)]
enum Phase {
    Sounding(RenderTicket),
    Settling,
    Deferred,
}

#[derive(Debug)]
struct Active {
    request: ChannelRequest,
    phase: Phase,
}

pub struct ChannelPlayer {
    renderer: Box<dyn Renderer>,
    gate: AudioOutputGate,
    scheduler: Arc<dyn Scheduler>,
    settle: Duration,
    active: Option<Active>,
    generation: u64,
    plays: u64,
}

impl ChannelPlayer {
    pub fn new(renderer: Box<dyn Renderer>, scheduler: Arc<dyn Scheduler>, settle: Duration) -> Self {
        Self {
            renderer,
            gate: AudioOutputGate::unlocked(),
            scheduler,
            settle,
            active: None,
            generation: 0,
            plays: 0,
        }
    }

    pub fn with_gate(mut self, gate: AudioOutputGate) -> Self {
        self.gate = gate;
        self
    }

    /// Channel currently sounding, settling or waiting for the gate.
    pub fn active_channel(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.request.channel_id.as_str())
    }

    /// True while audio is sounding or a replacement is about to start.
    pub fn is_output_active(&self) -> bool {
        matches!(
            self.active,
            Some(Active {
                phase: Phase::Sounding(_) | Phase::Settling,
                ..
            })
        )
    }

    pub fn is_sounding(&self) -> bool {
        matches!(
            self.active,
            Some(Active {
                phase: Phase::Sounding(_),
                ..
            })
        )
    }

    /// Levels of the payload currently sounding.
    pub fn output_levels(&self) -> Option<Levels> {
        if self.is_sounding() {
            self.renderer.output_levels()
        } else {
            None
        }
    }

    pub fn play_on_channel(
        &mut self,
        channel_id: &str,
        payload: Vec<u8>,
        fingerprint: Fingerprint,
        callbacks: ChannelCallbacks,
    ) -> ChannelPlay {
        let request = ChannelRequest {
            channel_id: channel_id.to_string(),
            fingerprint,
            payload,
            callbacks,
        };

        let same_channel = self
            .active
            .as_ref()
            .filter(|a| a.request.channel_id == channel_id);

        if let Some(current) = same_channel {
            if current.request.fingerprint == request.fingerprint {
                debug!(channel_id, "duplicate channel payload ignored");
                return ChannelPlay::Duplicate;
            }

            if !matches!(current.phase, Phase::Sounding(_)) {
                // Nothing audible yet: the waiting payload is superseded silently.
                if self.take_active().is_some() {
                    debug!(channel_id, "waiting channel payload superseded");
                }
                return self.start(request);
            }

            if let Some(previous) = self.take_active() {
                info!(channel_id, "channel payload interrupted");
                previous.request.callbacks.interrupt();
            }
            self.active = Some(Active {
                request,
                phase: Phase::Settling,
            });
            self.scheduler.schedule(
                self.settle,
                TimerEvent::new(TimerKind::ChannelSettle, self.generation),
            );
            return ChannelPlay::Replacing;
        }

        if let Some(previous) = self.take_active() {
            debug!(
                from = %previous.request.channel_id,
                to = channel_id,
                "switching channel"
            );
        }
        self.start(request)
    }

    /// Starts a replacement once its settle delay has elapsed.
    pub fn on_timer(&mut self, event: TimerEvent) -> Option<ChannelPlay> {
        if event.kind != TimerKind::ChannelSettle || event.generation != self.generation {
            debug!(?event, "stale channel timer dropped");
            return None;
        }
        match self.active.take() {
            Some(Active {
                request,
                phase: Phase::Settling,
            }) => Some(self.start(request)),
            other => {
                self.active = other;
                None
            }
        }
    }

    /// Starts a payload that was waiting for the output gate.
    pub fn resume(&mut self) -> Option<ChannelPlay> {
        match self.active.take() {
            Some(Active {
                request,
                phase: Phase::Deferred,
            }) => Some(self.start(request)),
            other => {
                self.active = other;
                None
            }
        }
    }

    pub fn on_render_outcome(&mut self, outcome: RenderOutcome) {
        let current = match &self.active {
            Some(Active {
                phase: Phase::Sounding(ticket),
                ..
            }) => Some(*ticket),
            _ => None,
        };
        if current != Some(outcome.ticket) {
            debug!(ticket = ?outcome.ticket, "stale channel outcome dropped");
            return;
        }
        let Some(active) = self.active.take() else {
            return;
        };
        self.generation += 1;

        let channel_id = active.request.channel_id;
        match outcome.result {
            Ok(()) => {
                debug!(channel_id = %channel_id, "channel payload finished");
                active.request.callbacks.complete();
            }
            Err(error) => {
                warn!(channel_id = %channel_id, error = %error, "channel payload failed");
                active.request.callbacks.error(&error);
            }
        }
    }

    /// Stops whatever is active without firing callbacks.
    pub fn stop(&mut self) {
        if let Some(previous) = self.take_active() {
            debug!(channel_id = %previous.request.channel_id, "channel stopped");
        }
    }

    fn start(&mut self, request: ChannelRequest) -> ChannelPlay {
        if !self.gate.is_unlocked() {
            debug!(channel_id = %request.channel_id, "output locked; channel payload deferred");
            self.active = Some(Active {
                request,
                phase: Phase::Deferred,
            });
            return ChannelPlay::Deferred;
        }

        self.plays += 1;
        let ticket = RenderTicket {
            origin: RenderOrigin::Channel,
            generation: self.generation,
            sequence: self.plays,
        };
        let result = self.renderer.render(ticket, &request.payload);
        match result {
            Ok(()) => {
                debug!(channel_id = %request.channel_id, "channel payload started");
                self.active = Some(Active {
                    request,
                    phase: Phase::Sounding(ticket),
                });
                ChannelPlay::Started
            }
            Err(error) => {
                warn!(channel_id = %request.channel_id, error = %error, "channel payload failed to start");
                request.callbacks.error(&error);
                ChannelPlay::Failed
            }
        }
    }

    /// Clears the active slot, halting output and invalidating its timers and outcomes.
    fn take_active(&mut self) -> Option<Active> {
        let previous = self.active.take()?;
        match previous.phase {
            Phase::Sounding(_) => self.renderer.halt(),
            Phase::Settling => self.scheduler.cancel(TimerKind::ChannelSettle),
            Phase::Deferred => {}
        }
        self.generation += 1;
        Some(previous)
    }
}
