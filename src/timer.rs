//! Self-rescheduling timers for the session event loop.
//!
//! Components never sleep. They ask a [`Scheduler`] to deliver a
//! [`TimerEvent`] back to the event loop after a delay. Every event carries
//! the generation that was live when it was scheduled; the receiving
//! component drops events whose generation is no longer current.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

/// Which component a timer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Endpointing silence countdown tick.
    SilenceCountdown,
    /// Settle delay before a replacement channel payload starts.
    ChannelSettle,
}

/// A timer firing, delivered back to the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEvent {
    pub kind: TimerKind,
    pub generation: u64,
}

impl TimerEvent {
    pub fn new(kind: TimerKind, generation: u64) -> Self {
        Self { kind, generation }
    }
}

/// Schedules timer events for later delivery.
///
/// At most one timer per [`TimerKind`] is outstanding: scheduling a kind
/// replaces any earlier timer of that kind.
pub trait Scheduler: Send + Sync {
    /// Delivers `event` after `delay`.
    fn schedule(&self, delay: Duration, event: TimerEvent);

    /// Cancels the outstanding timer of `kind`, if any.
    fn cancel(&self, kind: TimerKind);
}

/// Tokio-backed scheduler that sends fired timers into an mpsc channel.
///
/// Must be used from within a tokio runtime.
pub struct TokioScheduler {
    tx: mpsc::UnboundedSender<TimerEvent>,
    pending: Mutex<HashMap<TimerKind, AbortHandle>>,
}

impl TokioScheduler {
    /// Creates a scheduler and the receiver its timers are delivered to.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                pending: Mutex::new(HashMap::new()),
            },
            rx,
        )
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, event: TimerEvent) {
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Receiver gone means the session shut down.
            let _ = tx.send(event);
        });
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = pending.insert(event.kind, task.abort_handle()) {
            previous.abort();
        }
    }

    fn cancel(&self, kind: TimerKind) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = pending.remove(&kind) {
            handle.abort();
        }
    }
}

/// Scheduler that only records requests; tests fire them by hand.
#[derive(Debug, Default)]
pub struct ManualScheduler {
    pending: Mutex<Vec<(Duration, TimerEvent)>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns the outstanding timer of `kind`.
    pub fn take(&self, kind: TimerKind) -> Option<(Duration, TimerEvent)> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let index = pending.iter().position(|(_, event)| event.kind == kind)?;
        Some(pending.remove(index))
    }

    /// Returns the delay of the outstanding timer of `kind` without removing it.
    pub fn delay_of(&self, kind: TimerKind) -> Option<Duration> {
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending
            .iter()
            .find(|(_, event)| event.kind == kind)
            .map(|(delay, _)| *delay)
    }

    /// Number of outstanding timers.
    pub fn len(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, event: TimerEvent) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.retain(|(_, existing)| existing.kind != event.kind);
        pending.push((delay, event));
    }

    fn cancel(&self, kind: TimerKind) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.retain(|(_, existing)| existing.kind != kind);
    }
}
