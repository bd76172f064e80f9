//! Loopback integration tests.
//!
//! The gateway simulator sends encrypted traffic over real UDP sockets on
//! 127.0.0.1 to a reader thread, which decrypts it, resolves speakers,
//! and hands decoded audio to a collecting sink.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use voice_capture_common::{EncryptionMode, MetricsContext, RtcpPacket};
use voice_receiver::codec::FRAME_SIZE_BYTES;
use voice_receiver::sink::BasicSink;
use voice_receiver::{
    ReaderConfig, ReaderHandle, ReaderState, SinkFlow, SpeakerId, StopSignal, UdpVoiceConnection,
    VoiceData, VoiceReader,
};
use voice_sender::codec::FRAME_SAMPLES;
use voice_sender::{stream_voice, AudioData, OpusEncoderWrapper, StreamConfig, VoiceSender};

const KEY: [u8; 32] = [0x77; 32];

struct Capture {
    voice: Arc<Mutex<Vec<VoiceData>>>,
    reports: Arc<AtomicUsize>,
    done: mpsc::Receiver<Option<anyhow::Error>>,
    handle: ReaderHandle,
    remote: String,
}

/// Starts a reader on an ephemeral port with SSRC 1 mapped to speaker 10.
fn start_capture(mode: EncryptionMode, metrics: Option<MetricsContext>) -> Capture {
    // ---
    let config = ReaderConfig::default();
    let connection = Arc::new(
        UdpVoiceConnection::bind("127.0.0.1:0", mode, KEY, config.poll_interval).expect("bind"),
    );
    connection.ssrc_map().insert(1, SpeakerId(10));
    connection.set_connected(true);
    let remote = connection.local_addr().expect("addr").to_string();

    let voice = Arc::new(Mutex::new(Vec::new()));
    let reports = Arc::new(AtomicUsize::new(0));
    let v = Arc::clone(&voice);
    let r = Arc::clone(&reports);
    let sink = BasicSink::new(move |data: VoiceData| {
        v.lock().expect("lock").push(data);
        SinkFlow::Continue
    })
    .with_rtcp(move |packet: &RtcpPacket| {
        if matches!(packet, RtcpPacket::ReceiverReport { .. }) {
            r.fetch_add(1, Ordering::SeqCst);
        }
    });

    let (done_tx, done) = mpsc::channel();
    let handle = VoiceReader::spawn(connection, sink, config, metrics, move |err| {
        let _ = done_tx.send(err);
    })
    .expect("spawn reader");

    Capture {
        voice,
        reports,
        done,
        handle,
        remote,
    }
}

async fn send_frames(remote: &str, mode: EncryptionMode, key: [u8; 32], ssrc: u32, frames: usize) {
    // ---
    let mut sender = VoiceSender::new(remote, mode, key).await.expect("sender");
    let mut encoder = OpusEncoderWrapper::new().expect("encoder");
    let samples: Vec<i16> = (0..FRAME_SAMPLES * frames)
        .map(|i| (((i / 2) as f32 * 0.05).sin() * 6000.0) as i16)
        .collect();
    let config = StreamConfig {
        ssrc,
        interval: Duration::from_millis(1),
        report_every: 5,
        extension: true,
        ..StreamConfig::default()
    };

    let sent = stream_voice(&AudioData::from_interleaved(samples), &mut encoder, &mut sender, None, &config)
        .await
        .expect("stream");
    assert_eq!(sent, frames as u64);
}

fn finish(capture: &mut Capture) {
    // ---
    capture.handle.stop_with(StopSignal {
        drain: true,
        flush: true,
    });
    assert!(capture.handle.join(Duration::from_secs(5)));
    assert_eq!(capture.handle.state(), ReaderState::Stopped);

    let result = capture.done.recv_timeout(Duration::from_secs(1)).expect("callback ran");
    assert!(result.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_loopback_delivers_speaker_audio() {
    // ---
    for mode in [EncryptionMode::Normal, EncryptionMode::Suffix, EncryptionMode::Lite] {
        let mut capture = start_capture(mode, None);
        send_frames(&capture.remote, mode, KEY, 1, 20).await;
        finish(&mut capture);

        let voice = capture.voice.lock().expect("lock");
        assert_eq!(voice.len(), 20, "mode {}", mode);
        assert!(voice.iter().all(|d| d.speaker == Some(SpeakerId(10))));
        assert!(voice.iter().all(|d| d.data.len() == FRAME_SIZE_BYTES));
        assert!(voice.iter().all(|d| !d.is_gap()));

        let sequences: Vec<u16> = voice
            .iter()
            .filter_map(|d| d.packet.as_ref().map(|p| p.sequence))
            .collect();
        assert_eq!(sequences, (0..20).collect::<Vec<u16>>());

        // Header extension parsed off the payload
        assert!(voice
            .iter()
            .all(|d| d.packet.as_ref().is_some_and(|p| p.extension.is_some())));
        assert_eq!(capture.reports.load(Ordering::SeqCst), 4);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_loopback_unknown_ssrc() {
    // ---
    let metrics = MetricsContext::new("loopback-unknown").expect("metrics");
    let mut capture = start_capture(EncryptionMode::Lite, Some(metrics.clone()));
    send_frames(&capture.remote, EncryptionMode::Lite, KEY, 99, 5).await;
    finish(&mut capture);

    let voice = capture.voice.lock().expect("lock");
    assert_eq!(voice.len(), 5);
    assert!(voice.iter().all(|d| d.speaker.is_none()));
    assert_eq!(metrics.unknown_ssrc_packets_total.get(), 5);
    assert_eq!(metrics.rtp_packets_received_total.get(), 5);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_loopback_wrong_key_is_dropped() {
    // ---
    let metrics = MetricsContext::new("loopback-wrong-key").expect("metrics");
    let mut capture = start_capture(EncryptionMode::Suffix, Some(metrics.clone()));
    send_frames(&capture.remote, EncryptionMode::Suffix, [0x01; 32], 1, 10).await;
    finish(&mut capture);

    assert!(capture.voice.lock().expect("lock").is_empty());
    assert_eq!(capture.reports.load(Ordering::SeqCst), 0);

    // 10 voice packets plus 2 receiver reports
    assert_eq!(metrics.decrypt_failures_total.get(), 12);
    assert_eq!(metrics.rtp_packets_received_total.get(), 0);
}
