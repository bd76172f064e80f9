//! Audio sinks.
//!
//! A sink consumes one [`VoiceData`] at a time from the reader thread.
//! Sinks that forward audio own their downstream sink, so a pipeline is
//! built by nesting constructors:
//!
//! ```no_run
//! use voice_receiver::sink::{BundledOpusSink, PcmVolumeFilter, WaveSink};
//! use voice_receiver::jitter_buffer::JitterBufferConfig;
//!
//! let wave = WaveSink::create("capture.wav").unwrap();
//! let louder = PcmVolumeFilter::new(wave, 1.5).unwrap();
//! let sink = BundledOpusSink::new(louder, JitterBufferConfig::default()).unwrap();
//! ```
//!
//! Whether a sink receives Opus or PCM is decided by [`AudioSink::wants_opus`].

use voice_capture_common::{RtcpPacket, RtpPacket};

use crate::connection::SpeakerId;

mod filters;
mod pipeline;
pub mod sentence;
mod wave;

pub use filters::{ConditionalFilter, PcmVolumeFilter, TimedFilter, UserFilter};
pub use pipeline::{BundledOpusSink, JitterBufferSink, OpusDecoderSink};
pub use sentence::{SentenceConfig, SentenceSink, UtteranceCallback};
pub use wave::{pcm_to_wav, WaveSink};

/// One unit of audio handed to a sink.
#[derive(Debug, Clone)]
pub struct VoiceData {
    // ---
    /// Opus payload or PCM bytes, depending on what the sink asked for
    pub data: Vec<u8>,

    /// Resolved speaker, `None` if the SSRC was not mapped yet
    pub speaker: Option<SpeakerId>,

    /// Packet the audio came from, `None` for concealed PCM frames
    pub packet: Option<RtpPacket>,
}

impl VoiceData {
    // ---
    pub fn new(data: Vec<u8>, speaker: Option<SpeakerId>, packet: Option<RtpPacket>) -> Self {
        Self {
            data,
            speaker,
            packet,
        }
    }

    /// True for a jitter-buffer placeholder: a sequence number that
    /// never arrived, carried as a packet with no decrypted payload.
    pub fn is_gap(&self) -> bool {
        self.packet.as_ref().map_or(true, |p| p.decrypted.is_none())
    }
}

/// How a sink wants the reader to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopSignal {
    // ---
    /// Dispatch datagrams already queued on the socket before exiting
    pub drain: bool,

    /// Release audio still held in jitter buffers before exiting
    pub flush: bool,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self {
            drain: true,
            flush: false,
        }
    }
}

/// Result of handing data to a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkFlow {
    Continue,
    Stop(StopSignal),
}

impl SinkFlow {
    pub fn is_stop(self) -> bool {
        matches!(self, SinkFlow::Stop(_))
    }
}

/// Consumer of captured voice.
///
/// Called from the reader thread, so implementations must be `Send`.
pub trait AudioSink: Send {
    // ---
    /// Whether this sink takes raw Opus packets rather than PCM.
    fn wants_opus(&self) -> bool {
        false
    }

    /// Consumes one unit of audio.
    fn write(&mut self, data: VoiceData) -> SinkFlow;

    /// Observes a decrypted RTCP packet.
    fn on_rtcp(&mut self, _packet: &RtcpPacket) {}

    /// Releases anything held back (jitter buffers, partial utterances).
    fn flush(&mut self) -> SinkFlow {
        SinkFlow::Continue
    }

    /// Releases resources. Safe to call more than once.
    fn cleanup(&mut self) {}
}

impl<S: AudioSink + ?Sized> AudioSink for Box<S> {
    // ---
    fn wants_opus(&self) -> bool {
        (**self).wants_opus()
    }

    fn write(&mut self, data: VoiceData) -> SinkFlow {
        (**self).write(data)
    }

    fn on_rtcp(&mut self, packet: &RtcpPacket) {
        (**self).on_rtcp(packet)
    }

    fn flush(&mut self) -> SinkFlow {
        (**self).flush()
    }

    fn cleanup(&mut self) {
        (**self).cleanup()
    }
}

type VoiceHandler = Box<dyn FnMut(VoiceData) -> SinkFlow + Send>;
type RtcpHandler = Box<dyn FnMut(&RtcpPacket) + Send>;

/// Sink built from closures.
pub struct BasicSink {
    // ---
    on_voice: VoiceHandler,
    on_rtcp: RtcpHandler,
    opus: bool,
}

impl BasicSink {
    // ---
    /// Creates a PCM sink that calls `on_voice` for every frame.
    pub fn new<F>(on_voice: F) -> Self
    where
        F: FnMut(VoiceData) -> SinkFlow + Send + 'static,
    {
        // ---
        Self {
            on_voice: Box::new(on_voice),
            on_rtcp: Box::new(|_| {}),
            opus: false,
        }
    }

    /// Also calls `on_rtcp` for every control packet.
    pub fn with_rtcp<F>(mut self, on_rtcp: F) -> Self
    where
        F: FnMut(&RtcpPacket) + Send + 'static,
    {
        self.on_rtcp = Box::new(on_rtcp);
        self
    }

    /// Receives Opus packets instead of PCM.
    pub fn opus(mut self) -> Self {
        self.opus = true;
        self
    }
}

impl AudioSink for BasicSink {
    // ---
    fn wants_opus(&self) -> bool {
        self.opus
    }

    fn write(&mut self, data: VoiceData) -> SinkFlow {
        (self.on_voice)(data)
    }

    fn on_rtcp(&mut self, packet: &RtcpPacket) {
        (self.on_rtcp)(packet)
    }
}
