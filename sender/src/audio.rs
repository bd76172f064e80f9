//! Audio file reading and preprocessing.
//!
//! Handles WAV parsing and conversion to the format voice packets carry
//! (48kHz interleaved stereo PCM).

use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use hound::{SampleFormat, WavReader, WavSpec};
use tracing::info;

use crate::codec::{CHANNELS, FRAME_SAMPLES, SAMPLE_RATE};

/// Audio data container with PCM samples and metadata.
///
/// Samples are always 48kHz interleaved stereo regardless of input
/// file format.
#[derive(Debug, Clone)]
pub struct AudioData {
    // ---
    /// Interleaved L/R samples as 16-bit signed integers
    pub samples: Vec<i16>,

    /// Sample rate of the input file
    pub original_sample_rate: u32,

    /// Number of channels in the input file
    pub original_channels: u16,
}

impl AudioData {
    // ---
    /// Wraps samples that are already 48kHz interleaved stereo.
    pub fn from_interleaved(samples: Vec<i16>) -> Self {
        Self {
            samples,
            original_sample_rate: SAMPLE_RATE,
            original_channels: CHANNELS as u16,
        }
    }

    /// Returns an iterator over 20ms audio frames.
    ///
    /// Each frame holds [`FRAME_SAMPLES`] interleaved samples except
    /// possibly the last, which the streamer pads with zeros.
    pub fn frames(&self) -> impl Iterator<Item = &[i16]> {
        self.samples.chunks(FRAME_SAMPLES)
    }

    /// Returns the total duration in seconds.
    pub fn duration_secs(&self) -> f64 {
        (self.samples.len() / CHANNELS) as f64 / SAMPLE_RATE as f64
    }

    /// Returns the number of frames, counting a partial last frame.
    pub fn frame_count(&self) -> usize {
        self.samples.len().div_ceil(FRAME_SAMPLES)
    }
}

/// Reads a WAV file and converts it for streaming.
///
/// # Errors
///
/// Returns error if:
/// - File cannot be opened
/// - WAV format is invalid
/// - Sample format is unsupported
///
/// # Example
///
/// ```no_run
/// use voice_sender::audio::read_wav;
///
/// let audio = read_wav("voice.wav").unwrap();
/// println!("Duration: {:.2}s", audio.duration_secs());
/// ```
pub fn read_wav<P: AsRef<Path>>(path: P) -> Result<AudioData> {
    // ---
    let path = path.as_ref();
    info!("Reading WAV file: {}", path.display());

    let reader = WavReader::open(path)
        .with_context(|| format!("failed to open WAV file: {}", path.display()))?;
    load(reader)
}

/// Reads WAV data from any byte source, e.g. an in-memory buffer.
///
/// # Errors
///
/// Returns error if the data is not a supported WAV stream.
pub fn read_wav_from<R: Read>(source: R) -> Result<AudioData> {
    // ---
    let reader = WavReader::new(source).context("failed to parse WAV header")?;
    load(reader)
}

fn load<R: Read>(mut reader: WavReader<R>) -> Result<AudioData> {
    // ---
    let spec = reader.spec();
    info!(
        "WAV format: {}Hz, {} channels, {} bits",
        spec.sample_rate, spec.channels, spec.bits_per_sample
    );

    if spec.channels == 0 {
        anyhow::bail!("WAV file declares zero channels");
    }

    let raw_samples: Vec<i16> = match (spec.sample_format, spec.bits_per_sample) {
        // --- Native path
        (SampleFormat::Int, 16) => reader
            .samples::<i16>()
            .collect::<Result<Vec<_>, _>>()
            .context("failed to read 16-bit PCM WAV samples")?,

        // --- Float path
        (SampleFormat::Float, 32) => reader
            .samples::<f32>()
            .collect::<Result<Vec<_>, _>>()
            .context("failed to read 32-bit float WAV samples")?
            .into_iter()
            .map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
            .collect(),

        (SampleFormat::Int, bits) => {
            anyhow::bail!(
                "unsupported integer PCM WAV format: {}-bit (only 16-bit PCM is supported)",
                bits
            );
        }

        (SampleFormat::Float, bits) => {
            anyhow::bail!(
                "unsupported float WAV format: {}-bit (only 32-bit float is supported)",
                bits
            );
        }
    };

    info!("Read {} samples from file", raw_samples.len());

    Ok(AudioData {
        samples: convert_to_target_format(&raw_samples, &spec),
        original_sample_rate: spec.sample_rate,
        original_channels: spec.channels,
    })
}

/// Converts audio samples to 48kHz interleaved stereo.
///
/// Each channel is resampled separately with linear interpolation, which
/// is adequate for speech.
fn convert_to_target_format(samples: &[i16], spec: &WavSpec) -> Vec<i16> {
    // ---
    let (left, right) = split_channels(samples, spec.channels as usize);

    let (left, right) = if spec.sample_rate != SAMPLE_RATE {
        info!("Resampling from {}Hz to {}Hz", spec.sample_rate, SAMPLE_RATE);
        (
            resample_linear(&left, spec.sample_rate, SAMPLE_RATE),
            resample_linear(&right, spec.sample_rate, SAMPLE_RATE),
        )
    } else {
        (left, right)
    };

    let stereo: Vec<i16> = left
        .iter()
        .zip(&right)
        .flat_map(|(&l, &r)| [l, r])
        .collect();

    info!(
        "Converted to target format: {} samples ({} frames)",
        stereo.len(),
        stereo.len().div_ceil(FRAME_SAMPLES)
    );
    stereo
}

/// Splits interleaved input into left and right channels.
///
/// Mono is duplicated to both sides; channels past the second are dropped.
fn split_channels(samples: &[i16], channels: usize) -> (Vec<i16>, Vec<i16>) {
    // ---
    if channels == 1 {
        let mono = samples.to_vec();
        return (mono.clone(), mono);
    }

    samples
        .chunks_exact(channels)
        .map(|frame| (frame[0], frame[1]))
        .unzip()
}

/// Resamples audio using linear interpolation.
fn resample_linear(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    // ---
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let new_len = (samples.len() as f64 / ratio) as usize;
    let last = samples.len() - 1;

    (0..new_len)
        .map(|i| {
            let src_pos = i as f64 * ratio;
            let src_idx = src_pos as usize;
            if src_idx >= last {
                return samples[last];
            }

            // Linear interpolation between adjacent samples
            let frac = src_pos - src_idx as f64;
            let s0 = samples[src_idx] as f64;
            let s1 = samples[src_idx + 1] as f64;
            (s0 + (s1 - s0) * frac) as i16
        })
        .collect()
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use hound::WavWriter;
    use std::io::Cursor;

    fn wav_bytes(spec: WavSpec, samples: &[i16]) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        let mut writer = WavWriter::new(&mut cursor, spec).expect("writer");
        for &s in samples {
            writer.write_sample(s).expect("sample");
        }
        writer.finalize().expect("finalize");
        cursor.into_inner()
    }

    fn spec(channels: u16, sample_rate: u32) -> WavSpec {
        WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        }
    }

    #[test]
    fn test_split_channels_mono_duplicates() {
        // ---
        let (l, r) = split_channels(&[1, 2, 3], 1);
        assert_eq!(l, vec![1, 2, 3]);
        assert_eq!(r, vec![1, 2, 3]);
    }

    #[test]
    fn test_split_channels_drops_extra() {
        // ---
        // Quad: [a, b, c, d] per frame
        let (l, r) = split_channels(&[1, 2, 3, 4, 5, 6, 7, 8], 4);
        assert_eq!(l, vec![1, 5]);
        assert_eq!(r, vec![2, 6]);
    }

    #[test]
    fn test_resample_linear_upsample() {
        // ---
        let resampled = resample_linear(&[0, 1000, 2000], 16000, 48000);

        // Should approximately triple the sample count
        assert!(resampled.len() >= 8 && resampled.len() <= 9);
        assert_eq!(resampled[0], 0);
    }

    #[test]
    fn test_resample_linear_same_rate() {
        // ---
        let samples = vec![100, 200, 300];
        assert_eq!(resample_linear(&samples, 48000, 48000), samples);
        assert!(resample_linear(&[], 16000, 48000).is_empty());
    }

    #[test]
    fn test_read_mono_16k_wav() {
        // ---
        let bytes = wav_bytes(spec(1, 16000), &vec![500i16; 16000]);
        let audio = read_wav_from(Cursor::new(bytes)).expect("read");

        assert_eq!(audio.original_sample_rate, 16000);
        assert_eq!(audio.original_channels, 1);
        assert!((audio.duration_secs() - 1.0).abs() < 0.01);
        assert!(audio.samples.iter().all(|&s| s == 500));
    }

    #[test]
    fn test_read_rejects_24_bit() {
        // ---
        let spec24 = WavSpec {
            bits_per_sample: 24,
            ..spec(2, 48000)
        };
        let mut cursor = Cursor::new(Vec::new());
        let mut writer = WavWriter::new(&mut cursor, spec24).expect("writer");
        writer.write_sample(1i32).expect("sample");
        writer.write_sample(1i32).expect("sample");
        writer.finalize().expect("finalize");

        assert!(read_wav_from(Cursor::new(cursor.into_inner())).is_err());
    }

    #[test]
    fn test_audio_data_frames() {
        // ---
        let audio = AudioData::from_interleaved(vec![0i16; FRAME_SAMPLES * 2 + 10]);

        let frames: Vec<_> = audio.frames().collect();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].len(), FRAME_SAMPLES);
        assert_eq!(frames[2].len(), 10);
        assert_eq!(audio.frame_count(), 3);
    }
}
