//! Transport-facing types.
//!
//! The network transport itself lives outside this crate. It feeds
//! [`TransportEvent`]s in and receives finished utterances through a
//! [`RecognitionSink`].

use crate::capture::session::CapturedClip;
use crate::error::{Result, VoxturnError};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Events delivered by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportEvent {
    /// A reply stream begins; it becomes the active stream.
    StreamStart { stream_id: String },
    /// One fragment of a reply stream, in any order.
    Fragment {
        stream_id: String,
        sequence: u64,
        payload: Vec<u8>,
        #[serde(default)]
        duration_hint: Option<f64>,
        #[serde(default)]
        total_fragments: Option<u64>,
    },
    /// The number of fragments in the stream, possibly after all of them arrived.
    TotalFragmentCount { stream_id: String, count: u64 },
    /// No more fragments will arrive for this stream.
    StreamEnd { stream_id: String },
    /// The transport failed this stream.
    StreamError { stream_id: String, message: String },
    /// The underlying connection closed.
    Dropped,
}

impl TransportEvent {
    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

/// Receives finished utterances for recognition.
///
/// Batch sinks get one encoded clip per utterance. Streaming sinks get raw
/// little-endian PCM while the user speaks, then an explicit finalize.
pub trait RecognitionSink: Send {
    fn supports_streaming_recognition(&self) -> bool;

    /// A finished utterance (batch mode).
    fn submit_clip(&mut self, clip: &CapturedClip) -> Result<()>;

    /// Raw PCM captured while recording (streaming mode).
    fn push_pcm(&mut self, _pcm: &[u8]) -> Result<()> {
        Ok(())
    }

    /// The utterance ended (streaming mode).
    fn finalize(&mut self) -> Result<()> {
        Ok(())
    }

    /// The utterance was dropped; forget any PCM already pushed (streaming mode).
    fn discard(&mut self) -> Result<()> {
        Ok(())
    }

    /// Name for logging/debugging.
    fn name(&self) -> &'static str {
        "recognition"
    }
}

/// What a sink was asked to send.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Clip(CapturedClip),
    Pcm(Vec<u8>),
    Finalize,
    Discard,
}

/// Forwards outbound audio into a tokio channel for a transport task.
pub struct ChannelRecognitionSink {
    tx: mpsc::UnboundedSender<Outbound>,
    streaming: bool,
}

impl ChannelRecognitionSink {
    pub fn new(streaming: bool) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, streaming }, rx)
    }

    fn send(&self, outbound: Outbound) -> Result<()> {
        self.tx.send(outbound).map_err(|_| VoxturnError::TransportDropped)
    }
}

impl RecognitionSink for ChannelRecognitionSink {
    fn supports_streaming_recognition(&self) -> bool {
        self.streaming
    }

    fn submit_clip(&mut self, clip: &CapturedClip) -> Result<()> {
        self.send(Outbound::Clip(clip.clone()))
    }

    fn push_pcm(&mut self, pcm: &[u8]) -> Result<()> {
        self.send(Outbound::Pcm(pcm.to_vec()))
    }

    fn finalize(&mut self) -> Result<()> {
        self.send(Outbound::Finalize)
    }

    fn discard(&mut self) -> Result<()> {
        self.send(Outbound::Discard)
    }

    fn name(&self) -> &'static str {
        "channel"
    }
}

/// Sink that keeps everything it receives, for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct CollectorSink {
    collected: Arc<Mutex<Vec<Outbound>>>,
    streaming: bool,
}

impl CollectorSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn streaming() -> Self {
        Self {
            streaming: true,
            ..Self::default()
        }
    }

    /// Everything received so far. Clones share the same log.
    pub fn collected(&self) -> Vec<Outbound> {
        self.collected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn push(&self, outbound: Outbound) {
        self.collected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(outbound);
    }
}

impl RecognitionSink for CollectorSink {
    fn supports_streaming_recognition(&self) -> bool {
        self.streaming
    }

    fn submit_clip(&mut self, clip: &CapturedClip) -> Result<()> {
        self.push(Outbound::Clip(clip.clone()));
        Ok(())
    }

    fn push_pcm(&mut self, pcm: &[u8]) -> Result<()> {
        self.push(Outbound::Pcm(pcm.to_vec()));
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        self.push(Outbound::Finalize);
        Ok(())
    }

    fn discard(&mut self) -> Result<()> {
        self.push(Outbound::Discard);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "collector"
    }
}
