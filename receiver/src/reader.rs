//! Reader thread.
//!
//! One OS thread per voice connection performs blocking socket reads,
//! classifies each datagram, decrypts it, resolves the speaker, and
//! hands the result to the sink. Per-packet problems are logged and
//! counted; only a socket that stays broken past the reconnect timeout
//! ends the thread with an error.

use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use tracing::{debug, error, info, warn};
use voice_capture_common::rtp::{self, RTCP_RECEIVER_REPORT};
use voice_capture_common::{Cipher, MetricsContext, PacketError, RtcpPacket, RtpPacket};

use crate::buffered::{BufferedDecoder, DecodedFrame};
use crate::connection::VoiceConnection;
use crate::jitter_buffer::JitterBufferConfig;
use crate::sink::{AudioSink, SinkFlow, StopSignal, VoiceData};
use crate::stats::ReaderStats;

/// Upper bound on datagrams dispatched while draining on stop.
const MAX_DRAIN_DATAGRAMS: usize = 256;

/// Reader thread settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderConfig {
    // ---
    /// Socket read timeout; also the worst-case stop latency
    pub poll_interval: Duration,

    /// How long a failing socket may take to come back
    pub reconnect_timeout: Duration,

    /// How long dropping a handle waits for the thread
    pub join_timeout: Duration,

    /// Receive buffer size in bytes
    pub recv_buffer: usize,

    /// Jitter buffering used when the sink wants PCM
    pub jitter: JitterBufferConfig,

    /// Interval between periodic stats logs
    pub stats_interval: Duration,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        // ---
        Self {
            poll_interval: Duration::from_millis(10),
            reconnect_timeout: Duration::from_secs(20),
            join_timeout: Duration::from_secs(1),
            recv_buffer: 4096,
            jitter: JitterBufferConfig::default(),
            stats_interval: Duration::from_secs(5),
        }
    }
}

/// Lifecycle of a reader thread.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    /// Waiting for the voice connection
    Idle = 0,

    /// Connected, nothing received yet
    Connected = 1,

    Reading = 2,
    Stopped = 3,
    Failed = 4,
}

impl ReaderState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ReaderState::Connected,
            2 => ReaderState::Reading,
            3 => ReaderState::Stopped,
            4 => ReaderState::Failed,
            _ => ReaderState::Idle,
        }
    }
}

#[derive(Debug)]
struct Shared {
    stop: AtomicBool,
    drain: AtomicBool,
    flush: AtomicBool,
    state: AtomicU8,
}

impl Shared {
    // ---
    fn new() -> Self {
        Self {
            stop: AtomicBool::new(false),
            drain: AtomicBool::new(false),
            flush: AtomicBool::new(false),
            state: AtomicU8::new(ReaderState::Idle as u8),
        }
    }

    fn request_stop(&self, signal: StopSignal) {
        // ---
        self.drain.fetch_or(signal.drain, Ordering::SeqCst);
        self.flush.fetch_or(signal.flush, Ordering::SeqCst);
        self.stop.store(true, Ordering::SeqCst);
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn state(&self) -> ReaderState {
        ReaderState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ReaderState) {
        // ---
        let previous = self.state.swap(state as u8, Ordering::SeqCst);
        if previous != state as u8 {
            debug!(
                "Reader state {:?} -> {:?}",
                ReaderState::from_u8(previous),
                state
            );
        }
    }
}

/// Running totals used to turn decoder counters into metric deltas.
#[derive(Default)]
struct DecoderTotals {
    failures: u64,
    stale: u64,
}

/// Reader loop state, owned by the reader thread.
pub struct VoiceReader<C: ?Sized, S> {
    // ---
    connection: Arc<C>,
    sink: S,
    cipher: Cipher,

    /// Present when the sink wants PCM
    decoder: Option<BufferedDecoder>,
    decoder_totals: DecoderTotals,

    stats: ReaderStats,
    metrics: Option<MetricsContext>,
    shared: Arc<Shared>,
    config: ReaderConfig,
}

impl<C, S> VoiceReader<C, S>
where
    C: VoiceConnection + ?Sized + 'static,
    S: AudioSink + 'static,
{
    // ---
    /// Starts reading `connection` into `sink` on a new thread.
    ///
    /// `after` runs exactly once when the thread ends, with the error
    /// that ended it, if any.
    ///
    /// # Errors
    ///
    /// Returns error if the jitter configuration is invalid or the
    /// thread cannot be spawned.
    pub fn spawn<F>(
        connection: Arc<C>,
        sink: S,
        config: ReaderConfig,
        metrics: Option<MetricsContext>,
        after: F,
    ) -> Result<ReaderHandle>
    where
        F: FnOnce(Option<anyhow::Error>) + Send + 'static,
    {
        // ---
        let cipher = Cipher::new(connection.mode(), connection.secret_key());
        let decoder = if sink.wants_opus() {
            None
        } else {
            Some(BufferedDecoder::new(config.jitter)?)
        };

        let shared = Arc::new(Shared::new());
        let (done_tx, done_rx) = mpsc::channel();

        let mut reader = Self {
            connection,
            sink,
            cipher,
            decoder,
            decoder_totals: DecoderTotals::default(),
            stats: ReaderStats::new(config.stats_interval, metrics.clone()),
            metrics,
            shared: Arc::clone(&shared),
            config,
        };

        let thread = thread::Builder::new()
            .name("voice-reader".into())
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| reader.run()))
                    .unwrap_or_else(|payload| {
                        Err(anyhow!("reader thread panicked: {}", panic_message(&*payload)))
                    });
                reader.finish(result, after);
                let _ = done_tx.send(());
            })
            .context("failed to spawn reader thread")?;

        Ok(ReaderHandle {
            shared,
            thread: Some(thread),
            done: done_rx,
            join_timeout: config.join_timeout,
        })
    }

    fn run(&mut self) -> Result<()> {
        // ---
        let mut buf = vec![0u8; self.config.recv_buffer];
        let mut failing_since: Option<Instant> = None;
        info!("Voice reader started ({})", self.cipher.mode());

        while !self.shared.stopping() {
            if !self.connection.is_connected() {
                if let Some(since) = failing_since {
                    if since.elapsed() >= self.config.reconnect_timeout {
                        return Err(anyhow!(
                            "voice connection did not recover within {:?}",
                            self.config.reconnect_timeout
                        ));
                    }
                }
                self.shared.set_state(ReaderState::Idle);
                // Bounded so a stop request is still noticed
                self.connection.wait_for_connection(self.config.poll_interval);
                continue;
            }
            if self.shared.state() == ReaderState::Idle {
                self.shared.set_state(ReaderState::Connected);
            }

            match self.connection.recv(&mut buf) {
                Ok(len) => {
                    failing_since = None;
                    self.shared.set_state(ReaderState::Reading);

                    if let SinkFlow::Stop(signal) = self.handle_datagram(&buf[..len]) {
                        info!(
                            "Sink requested stop (drain={}, flush={})",
                            signal.drain, signal.flush
                        );
                        self.shared.request_stop(signal);
                    }
                }
                Err(e) if is_poll_timeout(&e) => continue,
                Err(e) => {
                    match failing_since {
                        None => warn!("Socket error in reader thread: {}", e),
                        Some(_) => debug!("Socket still failing: {}", e),
                    }
                    let since = *failing_since.get_or_insert_with(Instant::now);

                    if since.elapsed() >= self.config.reconnect_timeout {
                        return Err(anyhow::Error::new(e)
                            .context("voice socket failed and the connection did not recover"));
                    }
                    // One poll interval at a time; a stop request must still be noticed
                    thread::sleep(self.config.poll_interval);
                }
            }
        }

        if self.shared.drain.load(Ordering::SeqCst) {
            self.drain(&mut buf);
        }
        if self.shared.flush.load(Ordering::SeqCst) {
            self.flush();
        }
        Ok(())
    }

    /// Dispatches datagrams already queued on the socket.
    fn drain(&mut self, buf: &mut [u8]) {
        // ---
        let mut drained = 0;
        while drained < MAX_DRAIN_DATAGRAMS && self.connection.is_connected() {
            match self.connection.recv(buf) {
                Ok(len) => {
                    // Already stopping; later stop requests change nothing
                    let _ = self.handle_datagram(&buf[..len]);
                    drained += 1;
                }
                Err(_) => break,
            }
        }
        debug!("Drained {} datagram(s) before stopping", drained);
    }

    /// Releases audio held in jitter buffers.
    fn flush(&mut self) {
        // ---
        if let Some(decoder) = self.decoder.as_mut() {
            let frames = decoder.flush_all();
            debug!("Flushing {} buffered frame(s)", frames.len());
            for frame in frames {
                let speaker = self.connection.speaker_for(frame.ssrc);
                let _ = self.sink.write(VoiceData::new(frame.pcm, speaker, frame.packet));
            }
        }
        let _ = self.sink.flush();
    }

    fn finish<F>(&mut self, result: Result<()>, after: F)
    where
        F: FnOnce(Option<anyhow::Error>),
    {
        // ---
        if panic::catch_unwind(AssertUnwindSafe(|| self.sink.cleanup())).is_err() {
            error!("Sink cleanup panicked");
        }
        self.stats.log();

        match &result {
            Ok(()) => {
                self.shared.set_state(ReaderState::Stopped);
                info!("Voice reader stopped");
            }
            Err(e) => {
                self.shared.set_state(ReaderState::Failed);
                error!("Voice reader failed: {:#}", e);
            }
        }
        self.shared.stop.store(true, Ordering::SeqCst);

        let error = result.err();
        if panic::catch_unwind(AssertUnwindSafe(move || after(error))).is_err() {
            error!("Calling the reader completion callback failed");
        }
    }

    fn handle_datagram(&mut self, raw: &[u8]) -> SinkFlow {
        // ---
        self.stats.record_datagram(raw.len());

        if rtp::is_rtcp(raw) {
            self.handle_rtcp(raw);
            return SinkFlow::Continue;
        }

        let mut packet = match RtpPacket::decode(raw) {
            Ok(packet) => packet,
            Err(e) => {
                self.stats.record_malformed();
                warn!("Dropping malformed RTP packet: {}", e);
                return SinkFlow::Continue;
            }
        };

        if let Err(e) = self.cipher.decrypt_rtp(&mut packet) {
            match e {
                PacketError::Decrypt(_) => self.stats.record_decrypt_failure(),
                _ => self.stats.record_malformed(),
            }
            warn!(
                "Dropping RTP packet seq={} ssrc={}: {}",
                packet.sequence, packet.ssrc, e
            );
            return SinkFlow::Continue;
        }
        self.stats.record_rtp(packet.ssrc, packet.sequence);

        let speaker = self.connection.speaker_for(packet.ssrc);
        if speaker.is_none() {
            self.stats.record_unknown_ssrc();
            debug!("Received packet for unknown SSRC {}", packet.ssrc);
        }

        let Some(decoder) = self.decoder.as_mut() else {
            let opus = packet.opus().to_vec();
            return self.sink.write(VoiceData::new(opus, speaker, Some(packet)));
        };

        let started = Instant::now();
        let frames = match decoder.feed_rtp(packet) {
            Ok(frames) => frames,
            Err(e) => {
                warn!("Cannot decode packet: {:#}", e);
                return SinkFlow::Continue;
            }
        };
        self.record_decode(started.elapsed(), &frames);

        for frame in frames {
            if let SinkFlow::Stop(signal) = self.sink.write(VoiceData::new(frame.pcm, speaker, frame.packet)) {
                return SinkFlow::Stop(signal);
            }
        }
        SinkFlow::Continue
    }

    fn handle_rtcp(&mut self, raw: &[u8]) {
        // ---
        self.stats.record_rtcp();

        let plaintext = match self.cipher.decrypt_rtcp(raw) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                self.stats.record_decrypt_failure();
                warn!("Dropping RTCP packet: {}", e);
                return;
            }
        };

        match RtcpPacket::decode(&plaintext) {
            Ok(packet) => {
                if packet.packet_type() != RTCP_RECEIVER_REPORT {
                    warn!("Received unusual RTCP packet type {}", packet.packet_type());
                    debug!("{:?}", packet);
                }
                self.sink.on_rtcp(&packet);
            }
            Err(e) => {
                self.stats.record_malformed();
                warn!("Dropping malformed RTCP packet: {}", e);
            }
        }
    }

    fn record_decode(&mut self, elapsed: Duration, frames: &[DecodedFrame]) {
        // ---
        let (Some(metrics), Some(decoder)) = (&self.metrics, &self.decoder) else {
            return;
        };

        metrics.decode_seconds.observe(elapsed.as_secs_f64());
        metrics
            .frames_concealed_total
            .inc_by(frames.iter().filter(|f| f.is_concealed()).count() as u64);
        metrics
            .jitter_buffer_occupancy_packets
            .set(decoder.pending() as i64);

        let failures = decoder.decode_failures();
        let stale = decoder.stale_packets();
        metrics
            .decode_failures_total
            .inc_by(failures.saturating_sub(self.decoder_totals.failures));
        metrics
            .jitter_stale_packets_total
            .inc_by(stale.saturating_sub(self.decoder_totals.stale));
        self.decoder_totals = DecoderTotals { failures, stale };
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    // ---
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

fn is_poll_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Control handle for a running reader thread.
///
/// Dropping the handle stops the thread and waits up to the configured
/// join timeout for it to exit.
pub struct ReaderHandle {
    // ---
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
    done: Receiver<()>,
    join_timeout: Duration,
}

impl ReaderHandle {
    // ---
    /// Asks the thread to exit; it notices within one poll interval.
    pub fn stop(&self) {
        self.stop_with(StopSignal {
            drain: false,
            flush: false,
        })
    }

    /// Asks the thread to exit, draining and flushing as requested.
    pub fn stop_with(&self, signal: StopSignal) {
        self.shared.request_stop(signal)
    }

    pub fn is_listening(&self) -> bool {
        !self.shared.stopping()
    }

    pub fn state(&self) -> ReaderState {
        self.shared.state()
    }

    /// Waits up to `timeout` for the thread to exit.
    ///
    /// Returns `false` (and logs a warning) if it is still running.
    pub fn join(&mut self, timeout: Duration) -> bool {
        // ---
        let Some(thread) = self.thread.take() else {
            return true;
        };

        match self.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if thread.join().is_err() {
                    error!("Voice reader thread panicked");
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("Voice reader thread did not exit within {:?}", timeout);
                self.thread = Some(thread);
                false
            }
        }
    }
}

impl Drop for ReaderHandle {
    fn drop(&mut self) {
        // ---
        self.stop();
        self.join(self.join_timeout);
    }
}
