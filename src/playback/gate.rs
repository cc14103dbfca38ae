//! Output unlock gate.
//!
//! Some output backends refuse to make sound until a user gesture unlocks
//! them. Until the gate reads `Unlocked`, players buffer but never render.

use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GateState {
    Locked,
    Unlocking,
    Unlocked,
}

impl GateState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => GateState::Locked,
            1 => GateState::Unlocking,
            _ => GateState::Unlocked,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            GateState::Locked => 0,
            GateState::Unlocking => 1,
            GateState::Unlocked => 2,
        }
    }
}

/// Shared output gate. Clones observe the same state.
#[derive(Debug, Clone)]
pub struct AudioOutputGate {
    state: Arc<AtomicU8>,
}

impl AudioOutputGate {
    /// A gate that must be unlocked before anything plays.
    #[must_use]
    pub fn locked() -> Self {
        Self::with_state(GateState::Locked)
    }

    /// A gate for backends that need no unlock.
    #[must_use]
    pub fn unlocked() -> Self {
        Self::with_state(GateState::Unlocked)
    }

    fn with_state(state: GateState) -> Self {
        Self {
            state: Arc::new(AtomicU8::new(state.as_u8())),
        }
    }

    #[must_use]
    pub fn state(&self) -> GateState {
        GateState::from_u8(self.state.load(Ordering::SeqCst))
    }

    #[must_use]
    pub fn is_unlocked(&self) -> bool {
        self.state() == GateState::Unlocked
    }

    /// Locked → Unlocking. Returns false from any other state.
    pub fn request_unlock(&self) -> bool {
        let moved = self.transition(GateState::Locked, GateState::Unlocking);
        if moved {
            tracing::debug!("output gate: unlocking");
        }
        moved
    }

    /// Unlocking → Unlocked. Returns false from any other state.
    pub fn complete_unlock(&self) -> bool {
        let moved = self.transition(GateState::Unlocking, GateState::Unlocked);
        if moved {
            tracing::debug!("output gate: unlocked");
        }
        moved
    }

    /// Unlocking → Locked, so a later gesture can try again.
    pub fn fail_unlock(&self) -> bool {
        self.transition(GateState::Unlocking, GateState::Locked)
    }

    fn transition(&self, from: GateState, to: GateState) -> bool {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

impl Default for AudioOutputGate {
    fn default() -> Self {
        Self::unlocked()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_unlock_sequence() {
        let gate = AudioOutputGate::locked();
        assert_eq!(gate.state(), GateState::Locked);
        assert!(!gate.complete_unlock());

        assert!(gate.request_unlock());
        assert_eq!(gate.state(), GateState::Unlocking);
        assert!(!gate.request_unlock());

        assert!(gate.complete_unlock());
        assert!(gate.is_unlocked());
    }

    #[test]
    fn test_gate_failed_unlock_returns_to_locked() {
        let gate = AudioOutputGate::locked();
        gate.request_unlock();
        assert!(gate.fail_unlock());
        assert_eq!(gate.state(), GateState::Locked);
        assert!(!gate.fail_unlock());
    }

    #[test]
    fn test_gate_clone_shares_state() {
        let gate = AudioOutputGate::locked();
        let other = gate.clone();
        gate.request_unlock();
        gate.complete_unlock();
        assert!(other.is_unlocked());
    }

    #[test]
    fn test_gate_default_is_unlocked() {
        assert!(AudioOutputGate::default().is_unlocked());
    }
}
