//! Jitter buffer for RTP packet reordering and loss detection.
//!
//! Push packets in as they arrive; every push returns the longest run of
//! packets that can now be released in sequence order. Gaps that never
//! fill are released as `None` placeholders once the buffer overflows,
//! so downstream decoders know exactly where to conceal a frame.

use anyhow::Result;
use tracing::{debug, trace};
use voice_capture_common::rtp::{seq_after, seq_before, seq_distance};
use voice_capture_common::RtpPacket;

/// Jitter buffer configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitterBufferConfig {
    // ---
    /// Pending packets tolerated before a gap is declared lost
    pub maxsize: usize,

    /// Pushes absorbed silently before the first release
    pub prefill: usize,
}

impl Default for JitterBufferConfig {
    fn default() -> Self {
        // ---
        Self {
            maxsize: 10,
            prefill: 3,
        }
    }
}

/// One released slot: a packet, or `None` for a sequence number that
/// was given up on.
pub type JitterSlot = Option<RtpPacket>;

/// Sequence-ordered jitter buffer.
///
/// # Design
///
/// - **Prefill**: the first `prefill` pushes only buffer, so startup
///   reordering is fixed before an emission order is committed to.
/// - **Contiguous release**: packets leave only as an unbroken run
///   continuing the last released sequence number.
/// - **Overflow = loss**: when more than `maxsize` packets wait behind a
///   hole, the hole is released as placeholders.
/// - **Wrap-aware**: all comparisons use signed 16-bit distance.
///
/// # Example
///
/// ```
/// use voice_receiver::jitter_buffer::{JitterBufferConfig, SimpleJitterBuffer};
/// use voice_capture_common::RtpPacket;
///
/// let config = JitterBufferConfig { maxsize: 10, prefill: 1 };
/// let mut buffer = SimpleJitterBuffer::new(config).unwrap();
///
/// assert!(buffer.push(RtpPacket::new(2, 1920, 7, vec![])).is_empty());
/// let out = buffer.push(RtpPacket::new(1, 960, 7, vec![]));
/// let seqs: Vec<u16> = out.iter().flatten().map(|p| p.sequence).collect();
/// assert_eq!(seqs, vec![1, 2]);
/// ```
#[derive(Debug)]
pub struct SimpleJitterBuffer {
    // ---
    maxsize: usize,

    /// Remaining silent pushes
    prefill: usize,

    /// Last released sequence number
    last_seq: Option<u16>,

    /// Pending packets sorted by sequence number
    buffer: Vec<RtpPacket>,

    stale: u64,
}

impl SimpleJitterBuffer {
    // ---
    /// Creates a new jitter buffer with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns error if `maxsize` is zero.
    pub fn new(config: JitterBufferConfig) -> Result<Self> {
        // ---
        if config.maxsize < 1 {
            anyhow::bail!("maxsize must be greater than 0");
        }

        Ok(Self {
            maxsize: config.maxsize,
            prefill: config.prefill,
            last_seq: None,
            buffer: Vec::new(),
            stale: 0,
        })
    }

    /// Inserts a packet and returns whatever can be released.
    ///
    /// Packets at or behind the last released sequence number are
    /// dropped, as are duplicates of a packet already pending.
    pub fn push(&mut self, packet: RtpPacket) -> Vec<JitterSlot> {
        // ---
        if let Some(last) = self.last_seq {
            if !seq_after(packet.sequence, last) {
                self.stale += 1;
                debug!(
                    "Dropping stale packet: seq={} (last released={})",
                    packet.sequence, last
                );
                return Vec::new();
            }
        }

        let pos = self
            .buffer
            .partition_point(|p| seq_before(p.sequence, packet.sequence));
        if self
            .buffer
            .get(pos)
            .is_some_and(|p| p.sequence == packet.sequence)
        {
            debug!("Dropping duplicate packet: seq={}", packet.sequence);
            return Vec::new();
        }
        self.buffer.insert(pos, packet);

        if self.prefill > 0 {
            self.prefill -= 1;
            return Vec::new();
        }

        self.ready_batch()
    }

    /// Releases every pending packet, with placeholders for the holes.
    ///
    /// Used when a stream ends so nothing is left stranded behind a gap.
    pub fn flush(&mut self) -> Vec<JitterSlot> {
        // ---
        self.prefill = 0;
        let mut out = Vec::with_capacity(self.buffer.len());

        for packet in self.buffer.drain(..) {
            if let Some(last) = self.last_seq {
                let missing = seq_distance(packet.sequence, last).max(1) as usize - 1;
                out.extend((0..missing).map(|_| None));
            }
            self.last_seq = Some(packet.sequence);
            out.push(Some(packet));
        }

        out
    }

    /// Returns the number of pending packets.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Last sequence number released (packet or placeholder).
    pub fn last_sequence(&self) -> Option<u16> {
        self.last_seq
    }

    /// Packets dropped for arriving at or behind the release point.
    pub fn stale_count(&self) -> u64 {
        self.stale
    }

    fn ready_batch(&mut self) -> Vec<JitterSlot> {
        // ---
        let mut out = Vec::new();

        while let Some(head) = self.buffer.first().map(|p| p.sequence) {
            let last = *self.last_seq.get_or_insert(head.wrapping_sub(1));

            // Head continues the sequence: release the contiguous run
            if head == last.wrapping_add(1) {
                let run = self
                    .buffer
                    .iter()
                    .enumerate()
                    .take_while(|(n, p)| p.sequence == last.wrapping_add(*n as u16 + 1))
                    .count();

                out.extend(self.buffer.drain(..run).map(Some));
                self.last_seq = out.last().and_then(|p| p.as_ref()).map(|p| p.sequence);
                break;
            }

            if self.buffer.len() <= self.maxsize {
                break;
            }

            // Overflowing behind a hole: give up on the missing numbers
            let missing = seq_distance(head, last).max(1) as usize - 1;
            trace!(
                "Jitter buffer overflow: skipping {} missing before seq={}",
                missing,
                head
            );
            out.extend((0..missing).map(|_| None));
            self.last_seq = Some(head.wrapping_sub(1));
        }

        out
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    fn make_packet(seq: u16) -> RtpPacket {
        RtpPacket::new(seq, seq as u32 * 960, 0x12345678, vec![1, 2, 3])
    }

    fn buffer(maxsize: usize, prefill: usize) -> SimpleJitterBuffer {
        SimpleJitterBuffer::new(JitterBufferConfig { maxsize, prefill })
            .expect("valid config")
    }

    /// Renders a release as sequence numbers, `None` kept as-is.
    fn seqs(slots: &[JitterSlot]) -> Vec<Option<u16>> {
        slots.iter().map(|s| s.as_ref().map(|p| p.sequence)).collect()
    }

    #[test]
    fn test_rejects_zero_maxsize() {
        // ---
        let result = SimpleJitterBuffer::new(JitterBufferConfig {
            maxsize: 0,
            prefill: 0,
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_fixture_table() {
        // ---
        // (maxsize, prefill, pushes, expected release per push)
        let fixtures: Vec<(usize, usize, Vec<u16>, Vec<Vec<Option<u16>>>)> = vec![
            (
                3,
                0,
                vec![1, 2, 4, 5],
                vec![vec![Some(1)], vec![Some(2)], vec![], vec![]],
            ),
            (
                1,
                0,
                vec![1, 2, 4, 5],
                vec![
                    vec![Some(1)],
                    vec![Some(2)],
                    vec![],
                    vec![None, Some(4), Some(5)],
                ],
            ),
            (
                2,
                0,
                vec![10, 12, 13, 14],
                vec![
                    vec![Some(10)],
                    vec![],
                    vec![],
                    vec![None, Some(12), Some(13), Some(14)],
                ],
            ),
            (
                10,
                3,
                vec![3, 1, 2, 4],
                vec![vec![], vec![], vec![], vec![Some(1), Some(2), Some(3), Some(4)]],
            ),
            (
                10,
                0,
                vec![5, 7, 6],
                vec![vec![Some(5)], vec![], vec![Some(6), Some(7)]],
            ),
        ];

        for (maxsize, prefill, pushes, expected) in fixtures {
            let mut jb = buffer(maxsize, prefill);
            for (i, (seq, want)) in pushes.iter().zip(&expected).enumerate() {
                let got = seqs(&jb.push(make_packet(*seq)));
                assert_eq!(
                    &got, want,
                    "maxsize={} prefill={} push #{} (seq {})",
                    maxsize, prefill, i, seq
                );
            }
        }
    }

    #[test]
    fn test_flush_releases_gaps() {
        // ---
        let mut jb = buffer(3, 0);
        for seq in [1, 2, 4, 5] {
            jb.push(make_packet(seq));
        }

        assert_eq!(seqs(&jb.flush()), vec![None, Some(4), Some(5)]);
        assert!(jb.is_empty());
        assert_eq!(jb.last_sequence(), Some(5));
    }

    #[test]
    fn test_stale_and_duplicate_packets_dropped() {
        // ---
        let mut jb = buffer(10, 0);
        assert_eq!(seqs(&jb.push(make_packet(5))), vec![Some(5)]);

        assert!(jb.push(make_packet(5)).is_empty());
        assert!(jb.push(make_packet(3)).is_empty());
        assert_eq!(jb.stale_count(), 2);

        // Pending duplicate behind a hole
        assert!(jb.push(make_packet(8)).is_empty());
        assert!(jb.push(make_packet(8)).is_empty());
        assert_eq!(jb.len(), 1);
    }

    #[test]
    fn test_first_packet_may_have_any_sequence() {
        // ---
        let mut jb = buffer(10, 0);
        assert_eq!(seqs(&jb.push(make_packet(0))), vec![Some(0)]);

        let mut jb = buffer(10, 0);
        assert_eq!(seqs(&jb.push(make_packet(40000))), vec![Some(40000)]);
    }

    #[test]
    fn test_sequence_wraparound() {
        // ---
        let mut jb = buffer(10, 1);

        assert!(jb.push(make_packet(65535)).is_empty());
        assert_eq!(
            seqs(&jb.push(make_packet(65534))),
            vec![Some(65534), Some(65535)]
        );
        assert_eq!(seqs(&jb.push(make_packet(1))), vec![]);
        assert_eq!(seqs(&jb.push(make_packet(0))), vec![Some(0), Some(1)]);

        // 65535 is behind 1 across the wrap, not ahead of it
        assert!(jb.push(make_packet(65535)).is_empty());
    }

    #[test]
    fn test_gap_across_wraparound() {
        // ---
        let mut jb = buffer(1, 0);
        jb.push(make_packet(65534));

        assert!(jb.push(make_packet(1)).is_empty());
        assert_eq!(
            seqs(&jb.push(make_packet(2))),
            vec![None, None, Some(1), Some(2)]
        );
    }

    #[test]
    fn test_prefill_corrects_startup_order() {
        // ---
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for prefill in 1..6usize {
            let mut order: Vec<u16> = (100..100 + prefill as u16 + 1).collect();
            order.shuffle(&mut rng);

            let mut jb = buffer(20, prefill);
            for &seq in &order[..prefill] {
                assert!(jb.push(make_packet(seq)).is_empty());
            }

            // The first post-prefill release is the whole window, sorted
            let released = seqs(&jb.push(make_packet(order[prefill])));
            let expected: Vec<_> = (100..100 + prefill as u16 + 1).map(Some).collect();
            assert_eq!(released, expected, "prefill={}", prefill);
        }
    }

    #[test]
    fn test_lossless_reordering_preserves_stream() {
        // ---
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);

        for start in [0u16, 1000, 65500] {
            // Shuffle within small windows to mimic network reordering
            let mut arrivals: Vec<u16> = (0..200u16).map(|i| start.wrapping_add(i)).collect();
            for window in arrivals.chunks_mut(4) {
                window.shuffle(&mut rng);
            }

            let mut jb = buffer(50, 3);
            let mut released = Vec::new();
            for seq in &arrivals {
                released.extend(jb.push(make_packet(*seq)));
            }
            released.extend(jb.flush());

            let expected: Vec<_> = (0..200u16).map(|i| Some(start.wrapping_add(i))).collect();
            assert_eq!(seqs(&released), expected, "start={}", start);
        }
    }

    #[test]
    fn test_single_loss_yields_single_placeholder() {
        // ---
        let mut jb = buffer(4, 0);
        let mut released = Vec::new();
        for seq in (0..20u16).filter(|&s| s != 7) {
            released.extend(jb.push(make_packet(seq)));
        }

        let out = seqs(&released);
        assert_eq!(out.iter().filter(|s| s.is_none()).count(), 1);

        let hole = out.iter().position(|s| s.is_none()).expect("placeholder");
        assert_eq!(out[hole - 1], Some(6));
        assert_eq!(out[hole + 1], Some(8));
    }
}
