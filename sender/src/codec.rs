//! Opus audio codec encoding.
//!
//! Provides a wrapper around the Opus encoder configured the way a voice
//! gateway sends audio: 48 kHz stereo, 20ms frames, in-band FEC enabled.

use anyhow::{Context, Result};
use opus::{Application, Channels, Encoder};

/// Sample rate for audio encoding (48kHz fullband)
pub const SAMPLE_RATE: u32 = 48000;

/// Number of interleaved audio channels (stereo)
pub const CHANNELS: usize = 2;

/// Frame duration in milliseconds
pub const FRAME_DURATION_MS: usize = 20;

/// Samples per channel per frame (20ms at 48kHz)
pub const SAMPLES_PER_FRAME: usize = (SAMPLE_RATE as usize * FRAME_DURATION_MS) / 1000;

/// Interleaved samples in one frame
pub const FRAME_SAMPLES: usize = SAMPLES_PER_FRAME * CHANNELS;

/// Target bitrate in bits per second
pub const BITRATE: i32 = 64000;

/// Packet loss the encoder plans FEC for, in percent
pub const DEFAULT_EXPECTED_LOSS: u8 = 15;

/// Opus encoder wrapper for audio compression.
///
/// Encodes interleaved stereo PCM (16-bit signed integers) into Opus
/// frames. Every frame also carries a low-bitrate copy of the previous
/// one so the receiver can rebuild a single lost packet.
///
/// # Configuration
///
/// - Sample Rate: 48kHz
/// - Channels: Stereo
/// - Bitrate: 64 kbps
/// - Frame Size: 20ms (960 samples per channel)
/// - Application: VOIP (optimized for speech)
/// - In-band FEC: on
///
/// # Example
///
/// ```no_run
/// use voice_sender::codec::{OpusEncoderWrapper, FRAME_SAMPLES};
///
/// let mut encoder = OpusEncoderWrapper::new().unwrap();
/// let pcm_samples = vec![0i16; FRAME_SAMPLES]; // 20ms of silence
/// let compressed = encoder.encode(&pcm_samples).unwrap();
/// ```
pub struct OpusEncoderWrapper {
    // ---
    encoder: Encoder,
}

impl OpusEncoderWrapper {
    // ---
    /// Creates an encoder planning for [`DEFAULT_EXPECTED_LOSS`].
    ///
    /// # Errors
    ///
    /// Returns error if the Opus encoder cannot be created or configured.
    pub fn new() -> Result<Self> {
        Self::with_expected_loss(DEFAULT_EXPECTED_LOSS)
    }

    /// Creates an encoder tuned for `loss_percent` packet loss.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - `loss_percent` is above 100
    /// - Opus encoder initialization fails
    /// - Bitrate or FEC settings are rejected
    pub fn with_expected_loss(loss_percent: u8) -> Result<Self> {
        // ---
        if loss_percent > 100 {
            anyhow::bail!("expected loss must be 0-100, got {}", loss_percent);
        }

        let mut encoder = Encoder::new(SAMPLE_RATE, Channels::Stereo, Application::Voip)
            .context("failed to create Opus encoder")?;

        encoder
            .set_bitrate(opus::Bitrate::Bits(BITRATE))
            .context("failed to set bitrate")?;
        encoder
            .set_inband_fec(true)
            .context("failed to enable in-band FEC")?;
        encoder
            .set_packet_loss_perc(i32::from(loss_percent))
            .context("failed to set expected packet loss")?;

        Ok(Self { encoder })
    }

    /// Encodes one frame of interleaved stereo PCM.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Input size is not exactly [`FRAME_SAMPLES`] (1920)
    /// - Opus encoding fails
    pub fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>> {
        // ---
        if pcm.len() != FRAME_SAMPLES {
            anyhow::bail!(
                "invalid frame size: expected {}, got {}",
                FRAME_SAMPLES,
                pcm.len()
            );
        }

        let mut output = vec![0u8; 4000]; // Max Opus frame size
        let len = self
            .encoder
            .encode(pcm, &mut output)
            .context("Opus encoding failed")?;

        output.truncate(len);
        Ok(output)
    }
}
