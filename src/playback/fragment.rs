//! Fragment reassembly for one incoming audio stream.
//!
//! Fragments arrive in any order and are released strictly by sequence
//! number, starting at 1. The total count may be learned at any point,
//! including after every fragment has already been buffered.

use crate::audio::wav::probe_duration_secs;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// One sequence-numbered chunk of encoded audio.
#[derive(Clone, PartialEq)]
pub struct AudioFragment {
    pub sequence: u64,
    pub payload: Vec<u8>,
    pub duration_seconds: f64,
}

impl AudioFragment {
    /// Builds a fragment, probing the payload for its duration when no hint is given.
    ///
    /// Payloads that cannot be probed count as zero seconds.
    pub fn new(sequence: u64, payload: Vec<u8>, duration_hint: Option<f64>) -> Self {
        let duration_seconds = duration_hint
            .filter(|d| d.is_finite() && *d >= 0.0)
            .or_else(|| probe_duration_secs(&payload))
            .unwrap_or(0.0);
        Self {
            sequence,
            payload,
            duration_seconds,
        }
    }
}

impl fmt::Debug for AudioFragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioFragment")
            .field("sequence", &self.sequence)
            .field("payload_len", &self.payload.len())
            .field("duration_seconds", &self.duration_seconds)
            .finish()
    }
}

/// Why a fragment was not stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejected {
    /// The stream already played its last fragment.
    Complete,
    /// Sequence numbers start at 1.
    ZeroSequence,
    /// The sequence was already played or is playing.
    AlreadyPlayed,
    /// A fragment with this sequence is already buffered.
    Duplicate,
    /// The sequence is past the declared total.
    BeyondTotal,
}

/// Derived playback position of the active stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaybackProgress {
    pub stream_id: String,
    pub elapsed_seconds: f64,
    pub total_seconds: f64,
}

/// Reassembly state of one logical stream.
#[derive(Debug)]
pub struct Stream {
    id: String,
    total: Option<u64>,
    next_to_play: u64,
    pending: BTreeMap<u64, AudioFragment>,
    in_flight: Option<(u64, f64)>,
    played_seconds: f64,
    highest_seen: u64,
}

impl Stream {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            total: None,
            next_to_play: 1,
            pending: BTreeMap::new(),
            in_flight: None,
            played_seconds: 0.0,
            highest_seen: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn total(&self) -> Option<u64> {
        self.total
    }

    pub fn next_to_play(&self) -> u64 {
        self.next_to_play
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Highest sequence number ever stored, 0 if none.
    pub fn highest_seen(&self) -> u64 {
        self.highest_seen
    }

    /// True once the total is known and every fragment up to it has played.
    pub fn is_complete(&self) -> bool {
        self.in_flight.is_none() && self.total.is_some_and(|total| self.next_to_play > total)
    }

    pub fn insert(&mut self, fragment: AudioFragment) -> Result<(), Rejected> {
        let sequence = fragment.sequence;
        if self.is_complete() {
            return Err(Rejected::Complete);
        }
        if sequence == 0 {
            return Err(Rejected::ZeroSequence);
        }
        if sequence < self.next_to_play || self.in_flight.is_some_and(|(seq, _)| seq == sequence)
        {
            return Err(Rejected::AlreadyPlayed);
        }
        if self.total.is_some_and(|total| sequence > total) {
            return Err(Rejected::BeyondTotal);
        }
        if self.pending.contains_key(&sequence) {
            return Err(Rejected::Duplicate);
        }
        self.highest_seen = self.highest_seen.max(sequence);
        self.pending.insert(sequence, fragment);
        Ok(())
    }

    /// Records the total fragment count. First writer wins.
    ///
    /// Returns false when a count was already recorded. Buffered fragments
    /// past the new total are dropped.
    pub fn declare_total(&mut self, count: u64) -> bool {
        if self.total.is_some() {
            return false;
        }
        self.total = Some(count);
        self.pending.retain(|&sequence, _| sequence <= count);
        true
    }

    /// Removes and returns the next fragment in order, if it is present and
    /// nothing is currently in flight.
    pub fn take_next(&mut self) -> Option<AudioFragment> {
        if self.in_flight.is_some() {
            return None;
        }
        let fragment = self.pending.remove(&self.next_to_play)?;
        self.in_flight = Some((fragment.sequence, fragment.duration_seconds));
        Some(fragment)
    }

    /// Sequence number currently in flight.
    pub fn in_flight(&self) -> Option<u64> {
        self.in_flight.map(|(sequence, _)| sequence)
    }

    /// Marks the in-flight fragment as played and moves to the next sequence.
    pub fn finish_current(&mut self) -> Option<u64> {
        let (sequence, duration) = self.in_flight.take()?;
        self.played_seconds += duration;
        self.next_to_play = sequence + 1;
        Some(sequence)
    }

    /// Drops every buffered fragment, returning how many were discarded.
    pub fn discard_pending(&mut self) -> usize {
        let discarded = self.pending.len();
        self.pending.clear();
        discarded
    }

    /// Seconds of audio fully played so far.
    pub fn played_seconds(&self) -> f64 {
        self.played_seconds
    }

    /// Duration of the in-flight fragment, if any.
    pub fn in_flight_seconds(&self) -> Option<f64> {
        self.in_flight.map(|(_, duration)| duration)
    }

    /// Played plus in-flight plus buffered duration.
    pub fn cumulative_seconds(&self) -> f64 {
        self.played_seconds
            + self.in_flight_seconds().unwrap_or(0.0)
            + self
                .pending
                .values()
                .map(|f| f.duration_seconds)
                .sum::<f64>()
    }
}
