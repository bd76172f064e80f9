//! Opus audio codec decoding.
//!
//! Provides a wrapper around the Opus decoder for decompressing the
//! gateway's Opus frames into interleaved little-endian PCM bytes, the
//! format every PCM sink and the WAV container expect.

use anyhow::{Context, Result};
use opus::{Channels, Decoder};
use tracing::warn;

/// Sample rate for audio decoding (48kHz fullband)
pub const SAMPLING_RATE: u32 = 48000;

/// Number of audio channels (stereo)
pub const CHANNELS: usize = 2;

/// Bytes per interleaved sample frame (16-bit × channels)
pub const SAMPLE_SIZE: usize = 2 * CHANNELS;

/// Bytes per single-channel sample
pub const SAMPLE_WIDTH: usize = SAMPLE_SIZE / CHANNELS;

/// Frame duration in milliseconds
pub const FRAME_LENGTH_MS: usize = 20;

/// Samples per channel per frame (20ms at 48kHz)
pub const SAMPLES_PER_FRAME: usize = (SAMPLING_RATE as usize * FRAME_LENGTH_MS) / 1000;

/// PCM bytes in one decoded frame
pub const FRAME_SIZE_BYTES: usize = SAMPLES_PER_FRAME * SAMPLE_SIZE;

/// Largest Opus packet duration (120ms) in samples per channel
const MAX_FRAME_SAMPLES: usize = 5760;

/// Returns one frame of digital silence.
pub fn silence_frame() -> Vec<u8> {
    vec![0u8; FRAME_SIZE_BYTES]
}

/// Opus decoder wrapper for one audio stream.
///
/// Opus decoders are stateful (prediction, FEC context), so every
/// speaker needs its own instance.
///
/// # Configuration
///
/// - Sample Rate: 48kHz
/// - Channels: Stereo, interleaved
/// - Frame Size: 20ms (960 samples per channel, 3840 bytes)
///
/// # Example
///
/// ```no_run
/// use voice_receiver::codec::OpusDecoderWrapper;
///
/// let mut decoder = OpusDecoderWrapper::new().unwrap();
/// let compressed = vec![0u8; 60]; // Opus frame
/// let pcm = decoder.decode_or_silence(&compressed);
/// ```
pub struct OpusDecoderWrapper {
    // ---
    decoder: Decoder,
    failures: u64,
}

impl OpusDecoderWrapper {
    // ---
    /// Creates a new Opus decoder.
    ///
    /// # Errors
    ///
    /// Returns error if Opus decoder initialization fails.
    pub fn new() -> Result<Self> {
        // ---
        let decoder = Decoder::new(SAMPLING_RATE, Channels::Stereo)
            .context("failed to create Opus decoder")?;

        Ok(Self {
            decoder,
            failures: 0,
        })
    }

    /// Decodes an Opus packet to PCM bytes.
    ///
    /// With `fec` set, the packet's in-band redundancy is decoded
    /// instead of its primary frame, recovering the frame *before* it.
    ///
    /// # Errors
    ///
    /// Returns error if Opus decoding fails (corrupted data, invalid format).
    pub fn decode(&mut self, data: &[u8], fec: bool) -> Result<Vec<u8>> {
        // ---
        // FEC must be asked for exactly one frame's worth of audio.
        let capacity = if fec {
            SAMPLES_PER_FRAME
        } else {
            MAX_FRAME_SAMPLES
        };
        let mut output = vec![0i16; capacity * CHANNELS];

        let decoded = self
            .decoder
            .decode(data, &mut output, fec)
            .context("Opus decoding failed")?;

        output.truncate(decoded * CHANNELS);
        Ok(samples_to_bytes(&output))
    }

    /// Decodes a frame, substituting silence if the frame is corrupt.
    pub fn decode_or_silence(&mut self, data: &[u8]) -> Vec<u8> {
        // ---
        match self.decode(data, false) {
            Ok(pcm) => pcm,
            Err(e) => {
                self.failures += 1;
                warn!("Substituting silence for undecodable frame: {:#}", e);
                silence_frame()
            }
        }
    }

    /// Produces audio for a frame that never arrived.
    ///
    /// When `fec` is enabled and the packet after the gap is available,
    /// the lost frame is rebuilt from that packet's forward error
    /// correction data. Otherwise one frame of silence is returned.
    pub fn decode_missing(&mut self, next: Option<&[u8]>, fec: bool) -> Vec<u8> {
        // ---
        match next {
            Some(next) if fec && !next.is_empty() => match self.decode(next, true) {
                Ok(pcm) => pcm,
                Err(e) => {
                    self.failures += 1;
                    warn!("FEC reconstruction failed, using silence: {:#}", e);
                    silence_frame()
                }
            },
            _ => silence_frame(),
        }
    }

    /// Returns how many frames were replaced with silence after errors.
    pub fn failures(&self) -> u64 {
        self.failures
    }
}

/// Flattens interleaved 16-bit samples into little-endian bytes.
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Reads little-endian bytes back into 16-bit samples (odd tail ignored).
pub fn bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}
