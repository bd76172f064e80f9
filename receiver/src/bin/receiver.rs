//! Voice capture receiver - CLI binary.
//!
//! Listens for encrypted voice datagrams on a UDP port, splits each
//! speaker's audio into utterances at pauses, and writes every
//! utterance to its own WAV file.

use std::io::Cursor;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use voice_capture_common::{
    init_tracing, parse_secret_key, parse_ssrc_mapping, ColorWhen, EncryptionMode, MetricsContext,
    MetricsServerConfig,
};
use voice_receiver::sink::sentence::{BoxFuture, SentenceConfig, SentenceSink, UtteranceCallback};
use voice_receiver::{
    JitterBufferConfig, ReaderConfig, SpeakerId, StopSignal, UdpVoiceConnection, VoiceReader,
};

/// Voice Receiver - Capture per-speaker utterances from a voice channel
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    // ---
    /// Address to bind the voice socket on
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Port to listen on
    #[arg(short, long, default_value = "5004")]
    port: u16,

    /// Encryption mode negotiated for the session
    #[arg(short, long, default_value = "xsalsa20_poly1305_lite")]
    mode: EncryptionMode,

    /// 32-byte session key as 64 hex characters
    #[arg(short, long, value_parser = parse_secret_key)]
    key: [u8; 32],

    /// SSRC to speaker mapping, e.g. `--map 1234=42` (repeatable)
    #[arg(long = "map", value_parser = parse_ssrc_mapping)]
    mappings: Vec<(u32, u64)>,

    /// Largest number of packets held per speaker before gaps are skipped
    #[arg(long, default_value = "10")]
    jitter_maxsize: usize,

    /// Packets buffered before the first release
    #[arg(long, default_value = "3")]
    jitter_prefill: usize,

    /// Pause length that ends an utterance, in milliseconds
    #[arg(long, default_value = "700")]
    silence_ms: u64,

    /// How often speakers are checked for finished utterances, in milliseconds
    #[arg(long, default_value = "1000")]
    check_interval_ms: u64,

    /// Directory utterance WAV files are written to
    #[arg(short, long, default_value = "utterances")]
    out_dir: PathBuf,

    /// Prometheus metrics bind address (serves `GET /metrics`).
    #[arg(long, default_value = "127.0.0.1:9200")]
    metrics_bind: String,

    /// Coloring
    #[arg(long, value_enum, default_value = "auto")]
    color: ColorWhen,
}

/// Capture version number from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Time allowed for the final utterances to be written after Ctrl-C
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Builds the callback that stores each utterance as
/// `<out_dir>/<speaker>-<n>.wav`.
fn utterance_writer(out_dir: PathBuf) -> UtteranceCallback {
    // ---
    let counter = Arc::new(AtomicU64::new(0));

    Arc::new(move |speaker: SpeakerId, wav: Cursor<Vec<u8>>| -> BoxFuture {
        let n = counter.fetch_add(1, Ordering::Relaxed);
        let path = out_dir.join(format!("{}-{}.wav", speaker.0, n));

        Box::pin(async move {
            let bytes = wav.into_inner();
            let len = bytes.len();
            match tokio::fs::write(&path, bytes).await {
                Ok(()) => info!("Wrote {} ({} bytes) for {}", path.display(), len, speaker),
                Err(e) => error!("Failed to write {}: {}", path.display(), e),
            }
        })
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    let args = Args::parse();
    init_tracing(args.color)?;
    info!("Starting voice receiver v{VERSION}");
    info!("Listening on {}:{} ({})", args.bind, args.port, args.mode);
    info!("Writing utterances to {}", args.out_dir.display());
    info!("Metrics bind: {}", args.metrics_bind);

    let metrics = MetricsContext::new("receiver")?;
    let metrics_bind = args.metrics_bind.parse().context("invalid metrics bind")?;
    let _metrics_task = metrics.spawn_metrics_server(MetricsServerConfig::new(metrics_bind));

    tokio::fs::create_dir_all(&args.out_dir)
        .await
        .with_context(|| format!("failed to create {}", args.out_dir.display()))?;

    let reader_config = ReaderConfig {
        jitter: JitterBufferConfig {
            maxsize: args.jitter_maxsize,
            prefill: args.jitter_prefill,
        },
        ..ReaderConfig::default()
    };
    let sentence_config = SentenceConfig {
        silence_threshold: Duration::from_millis(args.silence_ms),
        check_interval: Duration::from_millis(args.check_interval_ms),
    };

    let connection = Arc::new(UdpVoiceConnection::bind(
        (args.bind.as_str(), args.port),
        args.mode,
        args.key,
        reader_config.poll_interval,
    )?);
    for (ssrc, speaker) in &args.mappings {
        connection.ssrc_map().insert(*ssrc, SpeakerId(*speaker));
    }
    if connection.ssrc_map().is_empty() {
        warn!("No SSRC mappings given; utterances from unknown senders are dropped");
    }
    connection.set_connected(true);

    let mut sink = SentenceSink::with_metrics(
        &Handle::current(),
        utterance_writer(args.out_dir.clone()),
        sentence_config,
        Some(metrics.clone()),
    );
    let finished = sink.finished();

    let (done_tx, done_rx) = oneshot::channel();
    let mut handle = VoiceReader::spawn(connection, sink, reader_config, Some(metrics), move |err| {
        let _ = done_tx.send(err);
    })?;

    info!("Ready to receive audio...");

    let failure = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for Ctrl-C")?;
            info!("Shutting down");
            handle.stop_with(StopSignal { drain: false, flush: true });
            None
        }
        result = done_rx => result.ok().flatten(),
    };

    let joined = tokio::task::spawn_blocking(move || handle.join(SHUTDOWN_GRACE))
        .await
        .context("reader join task failed")?;
    if !joined {
        warn!("Reader thread still running at exit");
    }

    if let Some(finished) = finished {
        if tokio::time::timeout(SHUTDOWN_GRACE, finished).await.is_err() {
            warn!("Gave up waiting for final utterances");
        }
    }

    match failure {
        Some(e) => Err(e.context("voice reader failed")),
        None => Ok(()),
    }
}
