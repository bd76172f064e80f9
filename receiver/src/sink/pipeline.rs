//! Opus-side sinks: jitter buffering and decoding.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use anyhow::Result;
use tracing::{debug, warn};
use voice_capture_common::{RtcpPacket, RtpPacket};

use super::{AudioSink, SinkFlow, VoiceData};
use crate::codec::{silence_frame, OpusDecoderWrapper, SAMPLES_PER_FRAME};
use crate::connection::SpeakerId;
use crate::jitter_buffer::{JitterBufferConfig, JitterSlot, SimpleJitterBuffer};

struct JitterStream {
    buffer: SimpleJitterBuffer,
    speaker: Option<SpeakerId>,
    last_timestamp: u32,
}

/// Reorders Opus packets per SSRC before passing them on.
///
/// Sequence numbers given up on are forwarded as gap placeholders (a
/// packet with the missing sequence number and no payload) so the
/// next sink can conceal them.
pub struct JitterBufferSink<D> {
    // ---
    destination: D,
    config: JitterBufferConfig,
    streams: HashMap<u32, JitterStream>,
}

impl<D: AudioSink> JitterBufferSink<D> {
    // ---
    /// # Errors
    ///
    /// Returns error if `config.maxsize` is zero.
    pub fn new(destination: D, config: JitterBufferConfig) -> Result<Self> {
        // ---
        // Validate up front rather than on the first packet
        SimpleJitterBuffer::new(config)?;

        Ok(Self {
            destination,
            config,
            streams: HashMap::new(),
        })
    }

    pub fn destination(&self) -> &D {
        &self.destination
    }

    fn forward(&mut self, ssrc: u32, slots: Vec<JitterSlot>, next_seq: Option<u16>) -> SinkFlow {
        // ---
        let Some(stream) = self.streams.get_mut(&ssrc) else {
            return SinkFlow::Continue;
        };
        let speaker = stream.speaker;
        let mut seq = next_seq;

        for slot in slots {
            let data = match slot {
                Some(packet) => {
                    seq = Some(packet.sequence.wrapping_add(1));
                    stream.last_timestamp = packet.timestamp;
                    VoiceData::new(packet.opus().to_vec(), speaker, Some(packet))
                }
                None => {
                    let missing = seq.unwrap_or(0);
                    seq = Some(missing.wrapping_add(1));
                    stream.last_timestamp = stream
                        .last_timestamp
                        .wrapping_add(SAMPLES_PER_FRAME as u32);
                    let placeholder = RtpPacket::new(missing, stream.last_timestamp, ssrc, Vec::new());
                    VoiceData::new(Vec::new(), speaker, Some(placeholder))
                }
            };

            if let SinkFlow::Stop(signal) = self.destination.write(data) {
                return SinkFlow::Stop(signal);
            }
        }

        SinkFlow::Continue
    }
}

impl<D: AudioSink> AudioSink for JitterBufferSink<D> {
    // ---
    fn wants_opus(&self) -> bool {
        true
    }

    fn write(&mut self, data: VoiceData) -> SinkFlow {
        // ---
        let Some(packet) = data.packet else {
            debug!("Jitter buffer sink ignoring data without a packet");
            return SinkFlow::Continue;
        };
        let ssrc = packet.ssrc;

        let stream = match self.streams.entry(ssrc) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                let Ok(buffer) = SimpleJitterBuffer::new(self.config) else {
                    return SinkFlow::Continue;
                };
                e.insert(JitterStream {
                    buffer,
                    speaker: None,
                    last_timestamp: packet.timestamp,
                })
            }
        };
        if data.speaker.is_some() {
            stream.speaker = data.speaker;
        }

        let next_seq = stream.buffer.last_sequence().map(|s| s.wrapping_add(1));
        let slots = stream.buffer.push(packet);

        match self.forward(ssrc, slots, next_seq) {
            SinkFlow::Stop(signal) if signal.flush => {
                self.flush();
                SinkFlow::Stop(signal)
            }
            flow => flow,
        }
    }

    fn on_rtcp(&mut self, packet: &RtcpPacket) {
        self.destination.on_rtcp(packet)
    }

    fn flush(&mut self) -> SinkFlow {
        // ---
        let mut ssrcs: Vec<u32> = self.streams.keys().copied().collect();
        ssrcs.sort_unstable();

        for ssrc in ssrcs {
            let Some(stream) = self.streams.get_mut(&ssrc) else {
                continue;
            };
            let next_seq = stream.buffer.last_sequence().map(|s| s.wrapping_add(1));
            let slots = stream.buffer.flush();

            // Once stopping, keep delivering what is left
            let _ = self.forward(ssrc, slots, next_seq);
        }

        self.destination.flush()
    }

    fn cleanup(&mut self) {
        self.destination.cleanup()
    }
}

struct DecodeStream {
    decoder: OpusDecoderWrapper,
    speaker: Option<SpeakerId>,
    pending_gaps: usize,
}

/// Decodes Opus packets to PCM for the next sink.
///
/// Gap placeholders are held until the following packet arrives, so the
/// frame right before it can be rebuilt from that packet's FEC data.
pub struct OpusDecoderSink<D> {
    // ---
    destination: D,
    streams: HashMap<u32, DecodeStream>,
}

impl<D: AudioSink> OpusDecoderSink<D> {
    // ---
    pub fn new(destination: D) -> Self {
        // ---
        Self {
            destination,
            streams: HashMap::new(),
        }
    }

    pub fn destination(&self) -> &D {
        &self.destination
    }
}

impl<D: AudioSink> AudioSink for OpusDecoderSink<D> {
    // ---
    fn wants_opus(&self) -> bool {
        true
    }

    fn write(&mut self, data: VoiceData) -> SinkFlow {
        // ---
        let gap = data.is_gap();
        let VoiceData {
            speaker, packet, ..
        } = data;
        let Some(packet) = packet else {
            return SinkFlow::Continue;
        };

        let stream = match self.streams.entry(packet.ssrc) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => match OpusDecoderWrapper::new() {
                Ok(decoder) => e.insert(DecodeStream {
                    decoder,
                    speaker,
                    pending_gaps: 0,
                }),
                Err(err) => {
                    warn!("Cannot decode SSRC {}: {:#}", packet.ssrc, err);
                    return SinkFlow::Continue;
                }
            },
        };

        if speaker.is_some() {
            stream.speaker = speaker;
        }
        if gap {
            stream.pending_gaps += 1;
            return SinkFlow::Continue;
        }

        let gaps = std::mem::take(&mut stream.pending_gaps);
        let mut frames = Vec::with_capacity(gaps + 1);
        for n in 0..gaps {
            // Only the frame directly before this packet is in its FEC data
            let next = (n + 1 == gaps).then(|| packet.opus());
            frames.push(VoiceData::new(stream.decoder.decode_missing(next, true), speaker, None));
        }
        let pcm = stream.decoder.decode_or_silence(packet.opus());
        frames.push(VoiceData::new(pcm, speaker, Some(packet)));

        for frame in frames {
            if let SinkFlow::Stop(signal) = self.destination.write(frame) {
                return SinkFlow::Stop(signal);
            }
        }
        SinkFlow::Continue
    }

    fn on_rtcp(&mut self, packet: &RtcpPacket) {
        self.destination.on_rtcp(packet)
    }

    /// Emits silence for gaps no later packet will conceal, then
    /// flushes the destination.
    fn flush(&mut self) -> SinkFlow {
        // ---
        let mut ssrcs: Vec<u32> = self.streams.keys().copied().collect();
        ssrcs.sort_unstable();

        for ssrc in ssrcs {
            let Some(stream) = self.streams.get_mut(&ssrc) else {
                continue;
            };
            let gaps = std::mem::take(&mut stream.pending_gaps);
            if gaps > 0 {
                debug!("Filling {} trailing gap(s) for SSRC {} with silence", gaps, ssrc);
            }
            for _ in 0..gaps {
                let frame = VoiceData::new(silence_frame(), stream.speaker, None);
                if let SinkFlow::Stop(signal) = self.destination.write(frame) {
                    return SinkFlow::Stop(signal);
                }
            }
        }

        self.destination.flush()
    }

    fn cleanup(&mut self) {
        self.destination.cleanup()
    }
}

/// Jitter buffer followed by an Opus decoder, feeding a PCM sink.
pub struct BundledOpusSink<D> {
    inner: JitterBufferSink<OpusDecoderSink<D>>,
}

impl<D: AudioSink> BundledOpusSink<D> {
    // ---
    /// # Errors
    ///
    /// Returns error if `config.maxsize` is zero.
    pub fn new(destination: D, config: JitterBufferConfig) -> Result<Self> {
        // ---
        Ok(Self {
            inner: JitterBufferSink::new(OpusDecoderSink::new(destination), config)?,
        })
    }

    pub fn destination(&self) -> &D {
        self.inner.destination().destination()
    }
}

impl<D: AudioSink> AudioSink for BundledOpusSink<D> {
    // ---
    fn wants_opus(&self) -> bool {
        true
    }

    fn write(&mut self, data: VoiceData) -> SinkFlow {
        self.inner.write(data)
    }

    fn on_rtcp(&mut self, packet: &RtcpPacket) {
        self.inner.on_rtcp(packet)
    }

    fn flush(&mut self) -> SinkFlow {
        self.inner.flush()
    }

    fn cleanup(&mut self) {
        self.inner.cleanup()
    }
}
