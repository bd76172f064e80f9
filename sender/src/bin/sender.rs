//! Voice gateway simulator - CLI binary.
//!
//! Reads a WAV file, encodes it to Opus with FEC, packetizes it into
//! RTP, encrypts each packet for the chosen mode, and transmits it via
//! UDP to a voice receiver.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use voice_capture_common::{
    init_tracing, parse_secret_key, ColorWhen, EncryptionMode, MetricsContext, MetricsServerConfig,
};
use voice_sender::{stream_voice, OpusEncoderWrapper, StreamConfig, VoiceSender};

/// Voice Sender - Stream audio files as encrypted voice traffic
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    // ---
    /// Input audio file (WAV format)
    #[arg(short, long)]
    input: String,

    /// Remote address (IP:port) to send to
    #[arg(short, long, default_value = "127.0.0.1:5004")]
    remote: String,

    /// Encryption mode
    #[arg(short, long, default_value = "xsalsa20_poly1305_lite")]
    mode: EncryptionMode,

    /// 32-byte session key as 64 hex characters
    #[arg(short, long, value_parser = parse_secret_key)]
    key: [u8; 32],

    /// SSRC for this stream (random if omitted)
    #[arg(short, long)]
    ssrc: Option<u32>,

    /// Packet transmission interval in milliseconds
    ///
    /// Controls pacing of packet transmission. Default 20ms matches
    /// the frame duration for real-time streaming.
    #[arg(short = 't', long, default_value = "20")]
    interval_ms: u64,

    /// Replay input audio continuously (default). Use `--no-loop` to play once and exit.
    #[arg(long = "no-loop", default_value_t = true, action = clap::ArgAction::SetFalse)]
    loop_audio: bool,

    /// Attach an audio-level header extension to every packet
    #[arg(long)]
    extension: bool,

    /// Send an RTCP receiver report every N packets (0 disables)
    #[arg(long, default_value = "50")]
    report_every: u32,

    /// Packet loss percentage the encoder plans FEC for
    #[arg(long, default_value = "15")]
    expected_loss: u8,

    /// Prometheus metrics bind address (serves `GET /metrics`).
    #[arg(long, default_value = "127.0.0.1:9100")]
    metrics_bind: String,

    /// Coloring
    #[arg(long, value_enum, default_value = "auto")]
    color: ColorWhen,
}

/// Capture version number from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    let args = Args::parse();

    init_tracing(args.color)?;

    info!("Starting voice sender v{VERSION}");
    info!("Input file: {}", args.input);
    info!("Remote address: {} ({})", args.remote, args.mode);
    info!("Transmission interval: {}ms", args.interval_ms);
    info!("Loop audio: {}", args.loop_audio);
    info!("Metrics bind: {}", args.metrics_bind);

    let metrics = MetricsContext::new("sender")?;
    let metrics_bind = args.metrics_bind.parse().context("invalid metrics bind")?;
    let _metrics_task = metrics.spawn_metrics_server(MetricsServerConfig::new(metrics_bind));

    // Read and preprocess audio in blocking task
    info!("Reading audio file...");
    let input_path = args.input.clone();
    let audio = tokio::task::spawn_blocking(move || voice_sender::read_wav(input_path))
        .await
        .context("audio reading task failed")??;

    info!(
        "Loaded {:.2}s of audio ({} frames)",
        audio.duration_secs(),
        audio.frame_count()
    );

    let mut encoder = OpusEncoderWrapper::with_expected_loss(args.expected_loss)
        .context("failed to create encoder")?;
    let mut sender = VoiceSender::new(&args.remote, args.mode, args.key)
        .await
        .context("failed to create sender")?;

    let ssrc = args.ssrc.unwrap_or_else(rand::random::<u32>);
    info!("Session SSRC: {} (0x{:08X})", ssrc, ssrc);

    let config = StreamConfig {
        ssrc,
        interval: Duration::from_millis(args.interval_ms),
        loop_audio: args.loop_audio,
        extension: args.extension,
        report_every: args.report_every,
        ..StreamConfig::default()
    };

    info!("Starting transmission...");
    tokio::select! {
        result = stream_voice(&audio, &mut encoder, &mut sender, Some(&metrics), &config) => {
            result?;
        }
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for Ctrl-C")?;
            info!("Interrupted");
        }
    }

    let (packets, bytes) = sender.stats();
    info!(
        "Transmission complete: {} packets, {} reports, {} bytes",
        packets,
        sender.reports_sent(),
        bytes
    );

    Ok(())
}
