//! Voice gateway simulator.
//!
//! Produces the traffic a voice gateway sends to a listening client:
//! Opus frames with in-band FEC, packetized as RTP, sealed with the
//! session cipher, with periodic RTCP receiver reports mixed in. Used to
//! drive the receiver end to end and in integration tests.

pub mod audio;
pub mod codec;
pub mod network;

pub use audio::{read_wav, read_wav_from, AudioData};
pub use codec::OpusEncoderWrapper;
pub use network::VoiceSender;
pub use voice_capture_common::RtpPacket;

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use voice_capture_common::rtp::EXTENSION_PROFILE_ONE_BYTE;
use voice_capture_common::{MetricsContext, ReportBlock, RtcpPacket, RtpExtension};

/// One-byte extension element id used for the speaking level
const AUDIO_LEVEL_EXTENSION_ID: u8 = 1;

/// How a stream of voice packets is produced.
#[derive(Debug, Clone, Copy)]
pub struct StreamConfig {
    // ---
    pub ssrc: u32,

    /// Delay between packets; zero sends as fast as possible
    pub interval: Duration,

    /// Replay the audio until the task is cancelled
    pub loop_audio: bool,

    /// Attach a header extension to every packet
    pub extension: bool,

    /// Send a receiver report after this many packets; 0 disables
    pub report_every: u32,

    pub first_sequence: u16,
    pub first_timestamp: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        // ---
        Self {
            ssrc: 0,
            interval: Duration::from_millis(codec::FRAME_DURATION_MS as u64),
            loop_audio: false,
            extension: false,
            report_every: 50,
            first_sequence: 0,
            first_timestamp: 0,
        }
    }
}

/// Streams audio frames as encrypted voice packets.
///
/// Encodes each frame with Opus and transmits it with sequence and
/// timestamp advancing (and wrapping) per frame. Returns the number of
/// voice packets sent.
///
/// # Arguments
///
/// * `audio` - Audio data to stream
/// * `encoder` - Opus encoder instance
/// * `sender` - Encrypting network sender
/// * `metrics` - Prometheus handles to update, if any
/// * `config` - SSRC, pacing, and packet options
///
/// # Errors
///
/// Returns error if encoding or encryption fails.
pub async fn stream_voice(
    audio: &AudioData,
    encoder: &mut OpusEncoderWrapper,
    sender: &mut VoiceSender,
    metrics: Option<&MetricsContext>,
    config: &StreamConfig,
) -> Result<u64> {
    // ---
    if audio.samples.is_empty() {
        warn!("No audio to stream");
        return Ok(0);
    }

    let mut sequence = config.first_sequence;
    let mut timestamp = config.first_timestamp;
    let mut frame_count: u64 = 0;

    loop {
        for frame in audio.frames() {
            // Pad last frame if needed
            let mut frame_data = frame.to_vec();
            if frame_data.len() < codec::FRAME_SAMPLES {
                debug!(
                    "Padding last frame: {} samples -> {}",
                    frame_data.len(),
                    codec::FRAME_SAMPLES
                );
                frame_data.resize(codec::FRAME_SAMPLES, 0);
            }

            let started = Instant::now();
            let opus = encoder
                .encode(&frame_data)
                .with_context(|| format!("failed to encode frame {}", frame_count))?;
            if let Some(m) = metrics {
                m.encode_seconds.observe(started.elapsed().as_secs_f64());
            }

            let packet = build_packet(config, sequence, timestamp, &frame_data);
            let sent = sender.send_voice(&packet, &opus).await?;
            if let Some(m) = metrics {
                if sent > 0 {
                    m.packets_sent_total.inc();
                    m.bytes_sent_total.inc_by(sent as u64);
                }
            }

            frame_count += 1;
            if config.report_every > 0 && frame_count.is_multiple_of(u64::from(config.report_every)) {
                let report = receiver_report(config.ssrc, sequence, frame_count);
                if sender.send_receiver_report(&report).await? > 0 {
                    if let Some(m) = metrics {
                        m.rtcp_reports_sent_total.inc();
                    }
                }
            }

            sequence = sequence.wrapping_add(1);
            timestamp = timestamp.wrapping_add(codec::SAMPLES_PER_FRAME as u32);

            // Pace transmission (real-time simulation)
            if !config.interval.is_zero() {
                tokio::time::sleep(config.interval).await;
            }
        }

        if !config.loop_audio {
            break;
        }
        debug!("Looping audio after {} frames", frame_count);
    }

    info!("Streamed {} frames", frame_count);
    Ok(frame_count)
}

fn build_packet(config: &StreamConfig, sequence: u16, timestamp: u32, pcm: &[i16]) -> RtpPacket {
    // ---
    let packet = RtpPacket::new(sequence, timestamp, config.ssrc, Vec::new());
    if !config.extension {
        return packet;
    }

    let mut packet = packet.with_extension_flag();
    packet.extension = Some(RtpExtension {
        profile: EXTENSION_PROFILE_ONE_BYTE,
        elements: vec![(AUDIO_LEVEL_EXTENSION_ID, vec![audio_level(pcm)])],
    });
    packet
}

/// RFC 6464 style level: 0 is loudest, 127 is silence (-dBov).
fn audio_level(pcm: &[i16]) -> u8 {
    // ---
    if pcm.is_empty() {
        return 127;
    }

    let mean_square = pcm
        .iter()
        .map(|&s| {
            let x = f64::from(s) / f64::from(i16::MAX);
            x * x
        })
        .sum::<f64>()
        / pcm.len() as f64;
    if mean_square <= 0.0 {
        return 127;
    }

    let dbov = -10.0 * mean_square.log10();
    dbov.clamp(0.0, 127.0) as u8
}

fn receiver_report(ssrc: u32, sequence: u16, sent: u64) -> RtcpPacket {
    // ---
    RtcpPacket::ReceiverReport {
        ssrc,
        reports: vec![ReportBlock {
            ssrc,
            highest_sequence: u32::from(sequence),
            ..ReportBlock::default()
        }],
        extension: (sent as u32).to_be_bytes().to_vec(),
    }
}
