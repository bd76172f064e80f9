//! Statistics tracking for the voice reader.
//!
//! Tracks datagram counts, per-packet failures, and per-SSRC loss and
//! reordering for periodic logging. When a [`MetricsContext`] is
//! attached, every count is mirrored into Prometheus as well.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::info;
use voice_capture_common::rtp::seq_distance;
use voice_capture_common::MetricsContext;

/// Per-SSRC sequence tracking.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamStats {
    // ---
    pub packets_received: u64,

    /// Packets lost (detected via sequence gaps)
    pub packets_lost: u64,

    /// Packets that arrived behind a later one
    pub packets_reordered: u64,

    /// Repeats of the newest sequence number, not counted as received
    pub packets_duplicated: u64,

    last_sequence: Option<u16>,
}

impl StreamStats {
    // ---
    fn record(&mut self, sequence: u16) {
        // ---
        let Some(last) = self.last_sequence else {
            self.packets_received += 1;
            self.last_sequence = Some(sequence);
            return;
        };

        let distance = seq_distance(sequence, last);
        if distance == 0 {
            self.packets_duplicated += 1;
            return;
        }

        self.packets_received += 1;
        if distance > 0 {
            self.packets_lost += distance as u64 - 1;
            self.last_sequence = Some(sequence);
        } else {
            // A late arrival fills a gap we already counted as lost
            self.packets_reordered += 1;
            self.packets_lost = self.packets_lost.saturating_sub(1);
        }
    }

    /// Packet loss percentage for this stream.
    pub fn loss_percentage(&self) -> f64 {
        // ---
        let total = self.packets_received + self.packets_lost;
        if total == 0 {
            0.0
        } else {
            (self.packets_lost as f64 / total as f64) * 100.0
        }
    }
}

/// Reader statistics.
///
/// Designed to be logged periodically for observability.
#[derive(Debug, Clone)]
pub struct ReaderStats {
    // ---
    pub rtp_packets: u64,
    pub rtcp_packets: u64,
    pub bytes_received: u64,
    pub decrypt_failures: u64,
    pub malformed_packets: u64,
    pub unknown_ssrc_packets: u64,

    streams: HashMap<u32, StreamStats>,
    metrics: Option<MetricsContext>,

    /// Start time for rate calculations
    start_time: Instant,

    last_log_time: Instant,
    log_interval: Duration,
}

impl ReaderStats {
    // ---
    /// Creates a new stats tracker.
    ///
    /// # Arguments
    ///
    /// * `log_interval` - How often to automatically log stats
    /// * `metrics` - Prometheus handles to mirror counts into
    pub fn new(log_interval: Duration, metrics: Option<MetricsContext>) -> Self {
        // ---
        let now = Instant::now();
        Self {
            rtp_packets: 0,
            rtcp_packets: 0,
            bytes_received: 0,
            decrypt_failures: 0,
            malformed_packets: 0,
            unknown_ssrc_packets: 0,
            streams: HashMap::new(),
            metrics,
            start_time: now,
            last_log_time: now,
            log_interval,
        }
    }

    pub fn record_datagram(&mut self, bytes: usize) {
        // ---
        self.bytes_received += bytes as u64;
        if let Some(m) = &self.metrics {
            m.bytes_received_total.inc_by(bytes as u64);
        }
    }

    /// Records a decrypted RTP packet.
    pub fn record_rtp(&mut self, ssrc: u32, sequence: u16) {
        // ---
        self.rtp_packets += 1;
        self.streams.entry(ssrc).or_default().record(sequence);
        if let Some(m) = &self.metrics {
            m.rtp_packets_received_total.inc();
        }

        self.maybe_log();
    }

    pub fn record_rtcp(&mut self) {
        // ---
        self.rtcp_packets += 1;
        if let Some(m) = &self.metrics {
            m.rtcp_packets_received_total.inc();
        }
    }

    pub fn record_decrypt_failure(&mut self) {
        // ---
        self.decrypt_failures += 1;
        if let Some(m) = &self.metrics {
            m.decrypt_failures_total.inc();
        }
    }

    pub fn record_malformed(&mut self) {
        // ---
        self.malformed_packets += 1;
        if let Some(m) = &self.metrics {
            m.malformed_packets_total.inc();
        }
    }

    pub fn record_unknown_ssrc(&mut self) {
        // ---
        self.unknown_ssrc_packets += 1;
        if let Some(m) = &self.metrics {
            m.unknown_ssrc_packets_total.inc();
        }
    }

    /// Returns tracking for one SSRC, if it has sent anything.
    pub fn stream(&self, ssrc: u32) -> Option<&StreamStats> {
        self.streams.get(&ssrc)
    }

    /// Calculates packet loss percentage across all streams.
    pub fn loss_percentage(&self) -> f64 {
        // ---
        let lost: u64 = self.streams.values().map(|s| s.packets_lost).sum();
        let total = self.rtp_packets + lost;
        if total == 0 {
            0.0
        } else {
            (lost as f64 / total as f64) * 100.0
        }
    }

    /// Calculates packets per second reception rate.
    pub fn packets_per_second(&self) -> f64 {
        // ---
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            0.0
        } else {
            self.rtp_packets as f64 / elapsed
        }
    }

    /// Logs statistics if interval has elapsed.
    fn maybe_log(&mut self) {
        // ---
        if self.last_log_time.elapsed() >= self.log_interval {
            self.log();
            self.last_log_time = Instant::now();
        }
    }

    /// Force log current statistics.
    pub fn log(&self) {
        // ---
        let reordered: u64 = self.streams.values().map(|s| s.packets_reordered).sum();
        let duplicated: u64 = self.streams.values().map(|s| s.packets_duplicated).sum();
        info!(
            "RX Stats: {} rtp ({:.2} pkt/s), {} rtcp, {:.2}% loss, {} reordered, {} duplicate, {} decrypt fail, {} malformed, {} unknown ssrc, {} stream(s)",
            self.rtp_packets,
            self.packets_per_second(),
            self.rtcp_packets,
            self.loss_percentage(),
            reordered,
            duplicated,
            self.decrypt_failures,
            self.malformed_packets,
            self.unknown_ssrc_packets,
            self.streams.len()
        );
    }
}

impl Default for ReaderStats {
    fn default() -> Self {
        // ---
        Self::new(Duration::from_secs(5), None)
    }
}
