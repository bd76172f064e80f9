//! Per-speaker buffered decoding.
//!
//! Every SSRC gets its own jitter buffer and Opus decoder. Packets go in
//! one at a time; decoded PCM frames come out in sequence order with
//! lost frames rebuilt from FEC or replaced by silence.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use anyhow::Result;
use tracing::{debug, trace};
use voice_capture_common::RtpPacket;

use crate::codec::OpusDecoderWrapper;
use crate::jitter_buffer::{JitterBufferConfig, JitterSlot, SimpleJitterBuffer};

/// One decoded 20ms frame.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    // ---
    pub ssrc: u32,

    /// Interleaved little-endian PCM
    pub pcm: Vec<u8>,

    /// Source packet, `None` when the frame was concealed
    pub packet: Option<RtpPacket>,
}

impl DecodedFrame {
    pub fn is_concealed(&self) -> bool {
        self.packet.is_none()
    }
}

struct SpeakerStream {
    buffer: SimpleJitterBuffer,
    decoder: OpusDecoderWrapper,
}

impl SpeakerStream {
    // ---
    fn new(config: JitterBufferConfig) -> Result<Self> {
        // ---
        Ok(Self {
            buffer: SimpleJitterBuffer::new(config)?,
            decoder: OpusDecoderWrapper::new()?,
        })
    }

    fn decode_slots(&mut self, ssrc: u32, slots: Vec<JitterSlot>, fec: bool) -> Vec<DecodedFrame> {
        // ---
        // A gap can only be rebuilt from the packet right after it
        let pcm: Vec<Vec<u8>> = slots
            .iter()
            .enumerate()
            .map(|(i, slot)| match slot {
                Some(packet) => self.decoder.decode_or_silence(packet.opus()),
                None => {
                    let next = slots.get(i + 1).and_then(|s| s.as_ref()).map(|p| p.opus());
                    self.decoder.decode_missing(next, fec)
                }
            })
            .collect();

        slots
            .into_iter()
            .zip(pcm)
            .map(|(packet, pcm)| DecodedFrame { ssrc, pcm, packet })
            .collect()
    }
}

/// Jitter-buffered Opus decoding for any number of concurrent speakers.
pub struct BufferedDecoder {
    // ---
    config: JitterBufferConfig,
    fec: bool,
    streams: HashMap<u32, SpeakerStream>,
}

impl BufferedDecoder {
    // ---
    /// Creates a decoder set that builds each new stream from `config`.
    ///
    /// # Errors
    ///
    /// Returns error if `config.maxsize` is zero.
    pub fn new(config: JitterBufferConfig) -> Result<Self> {
        // ---
        if config.maxsize < 1 {
            anyhow::bail!("maxsize must be greater than 0");
        }

        Ok(Self {
            config,
            fec: true,
            streams: HashMap::new(),
        })
    }

    /// Disables FEC reconstruction; gaps become silence.
    pub fn without_fec(mut self) -> Self {
        self.fec = false;
        self
    }

    /// Feeds one decrypted packet and returns the frames it released.
    ///
    /// # Errors
    ///
    /// Returns error if a decoder for a new SSRC cannot be created.
    pub fn feed_rtp(&mut self, packet: RtpPacket) -> Result<Vec<DecodedFrame>> {
        // ---
        let ssrc = packet.ssrc;
        let stream = match self.streams.entry(ssrc) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                debug!("Starting decoder for SSRC {}", ssrc);
                e.insert(SpeakerStream::new(self.config)?)
            }
        };

        let slots = stream.buffer.push(packet);
        trace!("SSRC {} released {} slot(s)", ssrc, slots.len());
        Ok(stream.decode_slots(ssrc, slots, self.fec))
    }

    /// Releases everything still buffered for one SSRC.
    pub fn flush(&mut self, ssrc: u32) -> Vec<DecodedFrame> {
        // ---
        let fec = self.fec;
        match self.streams.get_mut(&ssrc) {
            Some(stream) => {
                let slots = stream.buffer.flush();
                stream.decode_slots(ssrc, slots, fec)
            }
            None => Vec::new(),
        }
    }

    /// Releases everything still buffered for every SSRC.
    pub fn flush_all(&mut self) -> Vec<DecodedFrame> {
        // ---
        self.active_streams()
            .into_iter()
            .flat_map(|ssrc| self.flush(ssrc))
            .collect()
    }

    /// Restarts the given streams from scratch, or every stream when
    /// `ssrcs` is empty. Pending packets are discarded.
    ///
    /// # Errors
    ///
    /// Returns error if a replacement decoder cannot be created.
    pub fn reset(&mut self, ssrcs: &[u32]) -> Result<()> {
        // ---
        let targets = if ssrcs.is_empty() {
            self.active_streams()
        } else {
            ssrcs.to_vec()
        };

        for ssrc in targets {
            if let Some(stream) = self.streams.get_mut(&ssrc) {
                *stream = SpeakerStream::new(self.config)?;
            }
        }
        Ok(())
    }

    /// Forgets a stream entirely, e.g. when its speaker disconnects.
    pub fn drop_ssrc(&mut self, ssrc: u32) {
        // ---
        if let Some(stream) = self.streams.remove(&ssrc) {
            debug!(
                "Dropped decoder for SSRC {} ({} packet(s) discarded)",
                ssrc,
                stream.buffer.len()
            );
        }
    }

    /// SSRCs with a live decoder, in ascending order.
    pub fn active_streams(&self) -> Vec<u32> {
        // ---
        let mut ssrcs: Vec<u32> = self.streams.keys().copied().collect();
        ssrcs.sort_unstable();
        ssrcs
    }

    /// Packets waiting in all jitter buffers.
    pub fn pending(&self) -> usize {
        self.streams.values().map(|s| s.buffer.len()).sum()
    }

    /// Frames replaced with silence after decode errors, live streams only.
    pub fn decode_failures(&self) -> u64 {
        self.streams.values().map(|s| s.decoder.failures()).sum()
    }

    /// Packets the jitter buffers dropped as too late, live streams only.
    pub fn stale_packets(&self) -> u64 {
        self.streams.values().map(|s| s.buffer.stale_count()).sum()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::codec::{silence_frame, FRAME_SIZE_BYTES, SAMPLES_PER_FRAME, SAMPLING_RATE};
    use opus::{Application, Channels, Encoder};

    fn opus_frames(count: usize) -> Vec<Vec<u8>> {
        let mut encoder = Encoder::new(SAMPLING_RATE, Channels::Stereo, Application::Voip)
            .expect("encoder creation failed");
        encoder.set_inband_fec(true).expect("fec");
        encoder.set_packet_loss_perc(25).expect("loss perc");

        (0..count)
            .map(|f| {
                let pcm: Vec<i16> = (0..SAMPLES_PER_FRAME * 2)
                    .map(|i| ((((f * SAMPLES_PER_FRAME + i / 2) as f32) * 0.06).sin() * 9000.0) as i16)
                    .collect();
                encoder.encode_vec(&pcm, 4000).expect("encoding failed")
            })
            .collect()
    }

    fn packet(ssrc: u32, seq: u16, opus: &[u8]) -> RtpPacket {
        let mut p = RtpPacket::new(seq, seq as u32 * 960, ssrc, Vec::new());
        p.decrypted = Some(opus.to_vec());
        p
    }

    fn decoder(maxsize: usize, prefill: usize) -> BufferedDecoder {
        BufferedDecoder::new(JitterBufferConfig { maxsize, prefill }).expect("valid config")
    }

    #[test]
    fn test_streams_are_independent() {
        // ---
        let frames = opus_frames(3);
        let mut bd = decoder(10, 0);

        let a = bd.feed_rtp(packet(1, 100, &frames[0])).expect("feed");
        let b = bd.feed_rtp(packet(2, 7, &frames[1])).expect("feed");
        let a2 = bd.feed_rtp(packet(1, 101, &frames[2])).expect("feed");

        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert_eq!(a2.len(), 1);
        assert_eq!(a2[0].ssrc, 1);
        assert_eq!(a2[0].pcm.len(), FRAME_SIZE_BYTES);
        assert_eq!(bd.active_streams(), vec![1, 2]);
    }

    #[test]
    fn test_gap_is_concealed_with_fec() {
        // ---
        let frames = opus_frames(6);
        let mut bd = decoder(1, 0);

        let mut out = Vec::new();
        for seq in [0u16, 1, 3, 4] {
            out.extend(bd.feed_rtp(packet(9, seq, &frames[seq as usize])).expect("feed"));
        }

        let concealed: Vec<_> = out.iter().filter(|f| f.is_concealed()).collect();
        assert_eq!(concealed.len(), 1);
        assert_eq!(concealed[0].pcm.len(), FRAME_SIZE_BYTES);
        assert_ne!(concealed[0].pcm, silence_frame());
    }

    #[test]
    fn test_gap_without_fec_is_silence() {
        // ---
        let frames = opus_frames(6);
        let mut bd = decoder(1, 0).without_fec();

        let mut out = Vec::new();
        for seq in [0u16, 1, 3, 4] {
            out.extend(bd.feed_rtp(packet(9, seq, &frames[seq as usize])).expect("feed"));
        }

        let concealed: Vec<_> = out.iter().filter(|f| f.is_concealed()).collect();
        assert_eq!(concealed.len(), 1);
        assert_eq!(concealed[0].pcm, silence_frame());
    }

    #[test]
    fn test_flush_drains_pending() {
        // ---
        let frames = opus_frames(4);
        let mut bd = decoder(10, 3);

        for seq in 0..3u16 {
            assert!(bd.feed_rtp(packet(5, seq, &frames[seq as usize])).expect("feed").is_empty());
        }
        assert_eq!(bd.pending(), 3);

        let out = bd.flush(5);
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|f| !f.is_concealed()));
        assert_eq!(bd.pending(), 0);
        assert!(bd.flush(77).is_empty());
    }

    #[test]
    fn test_reset_and_drop() {
        // ---
        let frames = opus_frames(2);
        let mut bd = decoder(10, 2);
        bd.feed_rtp(packet(1, 0, &frames[0])).expect("feed");
        bd.feed_rtp(packet(2, 0, &frames[1])).expect("feed");
        assert_eq!(bd.pending(), 2);

        bd.reset(&[1]).expect("reset");
        assert_eq!(bd.pending(), 1);

        bd.reset(&[]).expect("reset");
        assert_eq!(bd.pending(), 0);
        assert_eq!(bd.active_streams(), vec![1, 2]);

        bd.drop_ssrc(1);
        assert_eq!(bd.active_streams(), vec![2]);
    }

    #[test]
    fn test_rejects_zero_maxsize() {
        // ---
        assert!(BufferedDecoder::new(JitterBufferConfig {
            maxsize: 0,
            prefill: 0
        })
        .is_err());
    }
}
