//! Integration tests for network resilience.
//!
//! Encrypted voice packets from the gateway simulator pass through a
//! lossy, reordering network before reaching the receive pipeline. The
//! output must stay a gap-free run of 20ms frames.

mod network_simulator;

use std::sync::{Arc, Mutex};

use network_simulator::{NetworkSimulator, NetworkSimulatorConfig};
use voice_capture_common::rtp::{self, Packet};
use voice_capture_common::{Cipher, EncryptionMode, RtpPacket};
use voice_receiver::codec::FRAME_SIZE_BYTES;
use voice_receiver::sink::{BasicSink, BundledOpusSink};
use voice_receiver::{AudioSink, BufferedDecoder, DecodedFrame, JitterBufferConfig, SinkFlow, VoiceData};
use voice_sender::codec::{FRAME_SAMPLES, SAMPLES_PER_FRAME};
use voice_sender::OpusEncoderWrapper;

const KEY: [u8; 32] = [0x3C; 32];
const SSRC: u32 = 0xC0FFEE;

/// Encodes `count` frames of a tone and seals them as wire datagrams.
fn encrypted_stream(mode: EncryptionMode, count: u16, first_sequence: u16) -> Vec<Vec<u8>> {
    // ---
    let mut encoder = OpusEncoderWrapper::with_expected_loss(20).expect("encoder creation failed");
    let cipher = Cipher::new(mode, KEY);

    (0..count)
        .map(|i| {
            let pcm: Vec<i16> = (0..FRAME_SAMPLES)
                .map(|s| {
                    let t = (usize::from(i) * SAMPLES_PER_FRAME + s / 2) as f32 / 48000.0;
                    ((t * 2.0 * std::f32::consts::PI * 330.0).sin() * 8000.0) as i16
                })
                .collect();
            let opus = encoder.encode(&pcm).expect("encoding failed");

            let sequence = first_sequence.wrapping_add(i);
            let packet = RtpPacket::new(sequence, u32::from(sequence) * 960, SSRC, Vec::new());
            cipher.encrypt_rtp(&packet, &opus).expect("encryption failed")
        })
        .collect()
}

/// Receive-side decrypt, as the reader thread does it.
fn decrypt(cipher: &Cipher, datagram: &[u8]) -> RtpPacket {
    // ---
    let Ok(Packet::Rtp(mut packet)) = rtp::decode(datagram) else {
        panic!("expected an RTP datagram");
    };
    cipher.decrypt_rtp(&mut packet).expect("decryption failed");
    packet
}

/// Every slot between the first and last packet must be present
/// exactly once, in order.
fn assert_contiguous(frames: &[DecodedFrame]) {
    // ---
    assert!(!frames.is_empty());
    assert!(frames.iter().all(|f| f.pcm.len() == FRAME_SIZE_BYTES));

    let first = frames[0].packet.as_ref().expect("first frame is real").sequence;
    let last = frames[frames.len() - 1]
        .packet
        .as_ref()
        .expect("last frame is real")
        .sequence;
    assert_eq!(frames.len(), usize::from(last.wrapping_sub(first)) + 1);

    for (i, frame) in frames.iter().enumerate() {
        if let Some(packet) = &frame.packet {
            assert_eq!(packet.sequence, first.wrapping_add(i as u16));
        }
    }
}

/// Tests the full path without network impairment.
#[test]
fn test_end_to_end_perfect_network() {
    // ---
    let cipher = Cipher::new(EncryptionMode::Lite, KEY);
    let mut decoder = BufferedDecoder::new(JitterBufferConfig::default()).expect("decoder");

    let mut frames = Vec::new();
    for datagram in encrypted_stream(EncryptionMode::Lite, 50, 0) {
        frames.extend(decoder.feed_rtp(decrypt(&cipher, &datagram)).expect("feed"));
    }
    frames.extend(decoder.flush_all());

    assert_eq!(frames.len(), 50);
    assert!(frames.iter().all(|f| !f.is_concealed()));
    assert_contiguous(&frames);
}

/// Tests loss and reordering across the sequence wrap.
#[test]
fn test_lossy_reordering_network() {
    // ---
    for mode in [EncryptionMode::Normal, EncryptionMode::Suffix, EncryptionMode::Lite] {
        let mut sim = NetworkSimulator::new(NetworkSimulatorConfig {
            loss_rate: 0.1,
            reorder_rate: 0.2,
            reorder_depth: 2,
            seed: Some(1234),
            ..Default::default()
        });
        for datagram in encrypted_stream(mode, 200, 65_450) {
            sim.send(datagram);
        }
        let stats = sim.stats();
        assert!(stats.datagrams_lost > 0);

        let cipher = Cipher::new(mode, KEY);
        let mut decoder = BufferedDecoder::new(JitterBufferConfig {
            maxsize: 6,
            prefill: 3,
        })
        .expect("decoder");

        let mut frames = Vec::new();
        for datagram in sim.drain() {
            frames.extend(decoder.feed_rtp(decrypt(&cipher, &datagram)).expect("feed"));
        }
        frames.extend(decoder.flush_all());

        assert_contiguous(&frames);
        let concealed = frames.iter().filter(|f| f.is_concealed()).count() as u64;
        let delivered = frames.len() as u64 - concealed;
        let stale = decoder.stale_packets();
        assert_eq!(delivered + stale, 200 - stats.datagrams_lost);

        // Late packets leave a concealed slot behind them
        assert!(concealed >= stale);
        assert!(concealed <= stats.datagrams_lost + stale);
    }
}

/// Tests the sink form of the same pipeline.
#[test]
fn test_bundled_sink_conceals_losses() {
    // ---
    let mut sim = NetworkSimulator::new(NetworkSimulatorConfig {
        loss_rate: 0.15,
        seed: Some(99),
        ..Default::default()
    });
    for datagram in encrypted_stream(EncryptionMode::Suffix, 100, 0) {
        sim.send(datagram);
    }
    let lost = sim.stats().datagrams_lost;

    let collected = Arc::new(Mutex::new(Vec::new()));
    let out = Arc::clone(&collected);
    let pcm_sink = BasicSink::new(move |data: VoiceData| {
        out.lock().expect("lock").push(data);
        SinkFlow::Continue
    });
    let mut sink = BundledOpusSink::new(pcm_sink, JitterBufferConfig::default()).expect("sink");
    assert!(sink.wants_opus());

    let cipher = Cipher::new(EncryptionMode::Suffix, KEY);
    for datagram in sim.drain() {
        let packet = decrypt(&cipher, &datagram);
        let opus = packet.opus().to_vec();
        assert_eq!(sink.write(VoiceData::new(opus, None, Some(packet))), SinkFlow::Continue);
    }
    assert_eq!(sink.flush(), SinkFlow::Continue);

    let collected = collected.lock().expect("lock");
    assert!(collected.iter().all(|d| d.data.len() == FRAME_SIZE_BYTES));

    let sequences: Vec<u16> = collected
        .iter()
        .filter_map(|d| d.packet.as_ref().map(|p| p.sequence))
        .collect();
    assert_eq!(sequences.len() as u64, 100 - lost);
    assert!(sequences.windows(2).all(|w| w[0] < w[1]));

    // Losses before the first or after the last packet are not concealed
    let span = u64::from(sequences[sequences.len() - 1] - sequences[0]) + 1;
    assert_eq!(collected.len() as u64, span);
    assert!(span - sequences.len() as u64 <= lost);
}
