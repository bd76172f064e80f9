//! WAV output.

use std::fs::File;
use std::io::{BufWriter, Cursor, Seek, Write};
use std::path::Path;

use anyhow::{Context, Result};
use hound::{SampleFormat, WavSpec, WavWriter};
use tracing::{error, warn};

use super::{AudioSink, SinkFlow, StopSignal, VoiceData};
use crate::codec::{bytes_to_samples, CHANNELS, SAMPLE_WIDTH, SAMPLING_RATE};

/// Format of every WAV this crate writes: the decoder's PCM layout.
fn wav_spec() -> WavSpec {
    WavSpec {
        channels: CHANNELS as u16,
        sample_rate: SAMPLING_RATE,
        bits_per_sample: (SAMPLE_WIDTH * 8) as u16,
        sample_format: SampleFormat::Int,
    }
}

fn write_pcm<W: Write + Seek>(writer: &mut WavWriter<W>, pcm: &[u8]) -> hound::Result<()> {
    for sample in bytes_to_samples(pcm) {
        writer.write_sample(sample)?;
    }
    Ok(())
}

/// Wraps decoded PCM in a WAV container, rewound for reading.
///
/// # Errors
///
/// Returns error if the container cannot be written.
pub fn pcm_to_wav(pcm: &[u8]) -> Result<Cursor<Vec<u8>>> {
    // ---
    let mut cursor = Cursor::new(Vec::with_capacity(pcm.len() + 44));
    {
        let mut writer =
            WavWriter::new(&mut cursor, wav_spec()).context("failed to start WAV container")?;
        write_pcm(&mut writer, pcm).context("failed to write PCM")?;
        writer.finalize().context("failed to finalize WAV container")?;
    }
    cursor.set_position(0);
    Ok(cursor)
}

/// Writes every PCM frame it receives into one WAV file.
pub struct WaveSink<W: Write + Seek> {
    writer: Option<WavWriter<W>>,
}

impl WaveSink<BufWriter<File>> {
    // ---
    /// Creates (or truncates) a WAV file at `path`.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be created.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        // ---
        let path = path.as_ref();
        let writer = WavWriter::create(path, wav_spec())
            .with_context(|| format!("failed to create WAV file: {}", path.display()))?;

        Ok(Self {
            writer: Some(writer),
        })
    }
}

impl<W: Write + Seek> WaveSink<W> {
    // ---
    /// Writes into any seekable output.
    ///
    /// # Errors
    ///
    /// Returns error if the WAV header cannot be written.
    pub fn new(output: W) -> Result<Self> {
        // ---
        let writer = WavWriter::new(output, wav_spec()).context("failed to start WAV output")?;
        Ok(Self {
            writer: Some(writer),
        })
    }
}

impl<W: Write + Seek + Send> AudioSink for WaveSink<W> {
    // ---
    fn write(&mut self, data: VoiceData) -> SinkFlow {
        // ---
        let Some(writer) = self.writer.as_mut() else {
            return SinkFlow::Continue;
        };

        match write_pcm(writer, &data.data) {
            Ok(()) => SinkFlow::Continue,
            Err(e) => {
                error!("WAV write failed, stopping: {}", e);
                SinkFlow::Stop(StopSignal {
                    drain: false,
                    flush: false,
                })
            }
        }
    }

    fn cleanup(&mut self) {
        // ---
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.finalize() {
                warn!("Failed to finalize WAV output: {}", e);
            }
        }
    }
}
