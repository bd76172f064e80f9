//! Utterance segmentation.
//!
//! [`SentenceSink`] collects each speaker's Opus packets and, once that
//! speaker has been quiet for longer than the silence threshold, decodes
//! the whole utterance into a WAV container and hands it to an async
//! callback.
//!
//! The reader thread only sends packets into a channel. A single tokio
//! task owns every speaker's buffer, so appending and flushing never
//! race.

use std::collections::HashMap;
use std::future::Future;
use std::io::Cursor;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use voice_capture_common::rtp::seq_distance;
use voice_capture_common::{MetricsContext, RtpPacket};

use super::{pcm_to_wav, AudioSink, SinkFlow, VoiceData};
use crate::codec::{silence_frame, OpusDecoderWrapper, FRAME_SIZE_BYTES, SAMPLING_RATE, SAMPLE_SIZE};
use crate::connection::SpeakerId;

/// Longest run of lost frames filled in inside one utterance (1s).
const MAX_GAP_FRAMES: usize = 50;

/// Boxed future returned by an utterance callback.
pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Receives each finished utterance as a rewound WAV container.
///
/// May be called from the aggregator task on any runtime thread.
pub type UtteranceCallback = Arc<dyn Fn(SpeakerId, Cursor<Vec<u8>>) -> BoxFuture + Send + Sync>;

/// Sentence segmentation settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentenceConfig {
    // ---
    /// Quiet time after which a speaker's utterance is considered over
    pub silence_threshold: Duration,

    /// How often speakers are checked for silence
    pub check_interval: Duration,
}

impl Default for SentenceConfig {
    fn default() -> Self {
        // ---
        Self {
            silence_threshold: Duration::from_millis(700),
            check_interval: Duration::from_secs(1),
        }
    }
}

enum Command {
    Packet(SpeakerId, RtpPacket),
    FlushAll,
}

/// Per-speaker utterance aggregator.
pub struct SentenceSink {
    // ---
    tx: Option<UnboundedSender<Command>>,
    task: Option<JoinHandle<()>>,
    finished: Option<oneshot::Receiver<()>>,
    flush_requested: bool,
}

impl SentenceSink {
    // ---
    /// Starts the aggregator task on `handle`.
    pub fn new(handle: &Handle, callback: UtteranceCallback, config: SentenceConfig) -> Self {
        Self::with_metrics(handle, callback, config, None)
    }

    /// Like [`SentenceSink::new`], recording utterance metrics.
    pub fn with_metrics(
        handle: &Handle,
        callback: UtteranceCallback,
        config: SentenceConfig,
        metrics: Option<MetricsContext>,
    ) -> Self {
        // ---
        let (tx, rx) = mpsc::unbounded_channel();
        let (finished_tx, finished_rx) = oneshot::channel();
        let aggregator = Aggregator {
            callback,
            config,
            metrics,
            speakers: HashMap::new(),
            _finished: finished_tx,
        };
        let task = handle.spawn(aggregator.run(rx));

        Self {
            tx: Some(tx),
            task: Some(task),
            finished: Some(finished_rx),
            flush_requested: false,
        }
    }

    /// Resolves (with an error) once the aggregator task has ended,
    /// including any final flush. Can be taken once.
    pub fn finished(&mut self) -> Option<oneshot::Receiver<()>> {
        self.finished.take()
    }

    /// True while the aggregator task is alive.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl AudioSink for SentenceSink {
    // ---
    fn wants_opus(&self) -> bool {
        true
    }

    fn write(&mut self, data: VoiceData) -> SinkFlow {
        // ---
        let (Some(speaker), Some(packet)) = (data.speaker, data.packet) else {
            return SinkFlow::Continue;
        };

        if let Some(tx) = &self.tx {
            if tx.send(Command::Packet(speaker, packet)).is_err() {
                debug!("Sentence aggregator gone, dropping packet");
            }
        }
        SinkFlow::Continue
    }

    fn flush(&mut self) -> SinkFlow {
        // ---
        if let Some(tx) = &self.tx {
            if tx.send(Command::FlushAll).is_ok() {
                self.flush_requested = true;
            }
        }
        SinkFlow::Continue
    }

    fn cleanup(&mut self) {
        // ---
        // Closing the channel ends the task once queued commands are done
        self.tx = None;

        if let Some(task) = self.task.take() {
            if !self.flush_requested {
                task.abort();
            }
        }
    }
}

impl Drop for SentenceSink {
    fn drop(&mut self) {
        self.cleanup();
    }
}

struct SpeakerBuffer {
    packets: Vec<RtpPacket>,
    last_packet: Instant,
}

struct Aggregator {
    callback: UtteranceCallback,
    config: SentenceConfig,
    metrics: Option<MetricsContext>,
    speakers: HashMap<SpeakerId, SpeakerBuffer>,

    /// Dropped with the task, which wakes the receiver
    _finished: oneshot::Sender<()>,
}

impl Aggregator {
    // ---
    async fn run(mut self, mut rx: UnboundedReceiver<Command>) {
        // ---
        let mut ticker = tokio::time::interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Packet(speaker, packet)) => self.append(speaker, packet),
                    Some(Command::FlushAll) => self.flush_all().await,
                    None => break,
                },
                _ = ticker.tick() => self.flush_expired().await,
            }
        }

        debug!(
            "Sentence aggregator stopped with {} speaker(s) pending",
            self.speakers.len()
        );
    }

    fn append(&mut self, speaker: SpeakerId, packet: RtpPacket) {
        // ---
        let buffer = self.speakers.entry(speaker).or_insert_with(|| SpeakerBuffer {
            packets: Vec::new(),
            last_packet: Instant::now(),
        });
        buffer.packets.push(packet);
        buffer.last_packet = Instant::now();
    }

    async fn flush_expired(&mut self) {
        // ---
        let threshold = self.config.silence_threshold;
        let mut expired: Vec<SpeakerId> = self
            .speakers
            .iter()
            .filter(|(_, b)| !b.packets.is_empty() && b.last_packet.elapsed() > threshold)
            .map(|(speaker, _)| *speaker)
            .collect();
        expired.sort_unstable();

        for speaker in expired {
            if let Some(buffer) = self.speakers.remove(&speaker) {
                self.deliver(speaker, buffer.packets).await;
            }
        }
    }

    async fn flush_all(&mut self) {
        // ---
        let mut speakers: Vec<(SpeakerId, SpeakerBuffer)> = self.speakers.drain().collect();
        speakers.sort_unstable_by_key(|(speaker, _)| *speaker);

        for (speaker, buffer) in speakers {
            if !buffer.packets.is_empty() {
                self.deliver(speaker, buffer.packets).await;
            }
        }
    }

    async fn deliver(&self, speaker: SpeakerId, packets: Vec<RtpPacket>) {
        // ---
        let pcm = match decode_utterance(packets) {
            Ok(pcm) => pcm,
            Err(e) => {
                warn!("Dropping utterance from {}: {:#}", speaker, e);
                return;
            }
        };

        let seconds = pcm.len() as f64 / (SAMPLING_RATE as usize * SAMPLE_SIZE) as f64;
        let wav = match pcm_to_wav(&pcm) {
            Ok(wav) => wav,
            Err(e) => {
                warn!("Dropping utterance from {}: {:#}", speaker, e);
                return;
            }
        };

        info!("Utterance from {} ({:.2}s)", speaker, seconds);
        if let Some(metrics) = &self.metrics {
            metrics.utterances_flushed_total.inc();
            metrics.utterance_seconds.observe(seconds);
        }

        (self.callback)(speaker, wav).await;
    }
}

/// Decodes one speaker's packets in sequence order into PCM.
///
/// Lost packets inside the utterance are rebuilt from the following
/// packet's FEC data (the frame just before it) or filled with silence.
fn decode_utterance(mut packets: Vec<RtpPacket>) -> anyhow::Result<Vec<u8>> {
    // ---
    let Some(base) = packets.first().map(|p| p.sequence) else {
        return Ok(Vec::new());
    };
    packets.sort_by_key(|p| seq_distance(p.sequence, base));
    packets.dedup_by_key(|p| p.sequence);

    let mut decoder = OpusDecoderWrapper::new()?;
    let mut pcm = Vec::with_capacity(packets.len() * FRAME_SIZE_BYTES);
    let mut previous: Option<u16> = None;

    for packet in &packets {
        if let Some(prev) = previous {
            let missing = (seq_distance(packet.sequence, prev).max(1) as usize - 1).min(MAX_GAP_FRAMES);
            for n in 0..missing {
                if n + 1 == missing {
                    pcm.extend(decoder.decode_missing(Some(packet.opus()), true));
                } else {
                    pcm.extend(silence_frame());
                }
            }
        }
        pcm.extend(decoder.decode_or_silence(packet.opus()));
        previous = Some(packet.sequence);
    }

    Ok(pcm)
}
