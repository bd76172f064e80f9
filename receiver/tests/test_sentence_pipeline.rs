//! Sentence capture end to end.
//!
//! Two simulated speakers talk over loopback UDP; the reader feeds a
//! sentence sink, and each speaker's pause must produce one WAV
//! utterance of the right length.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use voice_capture_common::{EncryptionMode, MetricsContext};
use voice_receiver::codec::{CHANNELS, SAMPLES_PER_FRAME, SAMPLING_RATE};
use voice_receiver::sink::sentence::BoxFuture;
use voice_receiver::sink::{SentenceConfig, SentenceSink, UtteranceCallback};
use voice_receiver::{ReaderConfig, SpeakerId, StopSignal, UdpVoiceConnection, VoiceReader};
use voice_sender::codec::FRAME_SAMPLES;
use voice_sender::{stream_voice, AudioData, OpusEncoderWrapper, StreamConfig, VoiceSender};

const KEY: [u8; 32] = [0x2B; 32];
const MODE: EncryptionMode = EncryptionMode::Lite;

type Utterance = (SpeakerId, Cursor<Vec<u8>>);

fn collecting_callback() -> (UtteranceCallback, mpsc::UnboundedReceiver<Utterance>) {
    // ---
    let (tx, rx) = mpsc::unbounded_channel();
    let callback: UtteranceCallback = Arc::new(move |speaker: SpeakerId, wav: Cursor<Vec<u8>>| -> BoxFuture {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send((speaker, wav));
        })
    });
    (callback, rx)
}

async fn speak(remote: &str, ssrc: u32, frames: usize) {
    // ---
    let mut sender = VoiceSender::new(remote, MODE, KEY).await.expect("sender");
    let mut encoder = OpusEncoderWrapper::new().expect("encoder");
    let samples: Vec<i16> = (0..FRAME_SAMPLES * frames)
        .map(|i| (((i / 2) as f32 * 0.03).sin() * 9000.0) as i16)
        .collect();
    let config = StreamConfig {
        ssrc,
        interval: Duration::from_millis(2),
        report_every: 0,
        ..StreamConfig::default()
    };

    stream_voice(&AudioData::from_interleaved(samples), &mut encoder, &mut sender, None, &config)
        .await
        .expect("stream");
}

fn wav_frames(wav: Cursor<Vec<u8>>) -> usize {
    // ---
    let reader = hound::WavReader::new(wav).expect("valid wav");
    let spec = reader.spec();
    assert_eq!(spec.channels as usize, CHANNELS);
    assert_eq!(spec.sample_rate, SAMPLING_RATE);
    assert_eq!(spec.bits_per_sample, 16);

    reader.len() as usize / (SAMPLES_PER_FRAME * CHANNELS)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_two_speakers_produce_utterances() {
    // ---
    let reader_config = ReaderConfig::default();
    let connection = Arc::new(
        UdpVoiceConnection::bind("127.0.0.1:0", MODE, KEY, reader_config.poll_interval)
            .expect("bind"),
    );
    connection.ssrc_map().insert(111, SpeakerId(1));
    connection.ssrc_map().insert(222, SpeakerId(2));
    connection.set_connected(true);
    let remote = connection.local_addr().expect("addr").to_string();

    let metrics = MetricsContext::new("sentence-e2e").expect("metrics");
    let (callback, mut utterances) = collecting_callback();
    let sink = SentenceSink::with_metrics(
        &Handle::current(),
        callback,
        SentenceConfig {
            silence_threshold: Duration::from_millis(150),
            check_interval: Duration::from_millis(50),
        },
        Some(metrics.clone()),
    );

    let mut handle = VoiceReader::spawn(connection, sink, reader_config, None, |_| {}).expect("spawn");

    tokio::join!(speak(&remote, 111, 25), speak(&remote, 222, 15));

    let mut received = Vec::new();
    for _ in 0..2 {
        let utterance = tokio::time::timeout(Duration::from_secs(5), utterances.recv())
            .await
            .expect("utterance before timeout")
            .expect("channel open");
        received.push(utterance);
    }
    received.sort_by_key(|(speaker, _)| *speaker);

    let mut received = received.into_iter();
    let (first, wav) = received.next().expect("speaker 1");
    assert_eq!(first, SpeakerId(1));
    assert_eq!(wav_frames(wav), 25);

    let (second, wav) = received.next().expect("speaker 2");
    assert_eq!(second, SpeakerId(2));
    assert_eq!(wav_frames(wav), 15);

    assert_eq!(metrics.utterances_flushed_total.get(), 2);

    handle.stop();
    assert!(tokio::task::spawn_blocking(move || handle.join(Duration::from_secs(2)))
        .await
        .expect("join task"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_flush_on_stop_delivers_pending_speech() {
    // ---
    let reader_config = ReaderConfig::default();
    let connection = Arc::new(
        UdpVoiceConnection::bind("127.0.0.1:0", MODE, KEY, reader_config.poll_interval)
            .expect("bind"),
    );
    connection.ssrc_map().insert(5, SpeakerId(50));
    connection.set_connected(true);
    let remote = connection.local_addr().expect("addr").to_string();

    // Long pause threshold: only the stop-time flush can deliver
    let (callback, mut utterances) = collecting_callback();
    let mut sink = SentenceSink::new(
        &Handle::current(),
        callback,
        SentenceConfig {
            silence_threshold: Duration::from_secs(60),
            check_interval: Duration::from_millis(50),
        },
    );
    let finished = sink.finished().expect("finished receiver");

    let mut handle = VoiceReader::spawn(connection, sink, reader_config, None, |_| {}).expect("spawn");
    speak(&remote, 5, 10).await;

    handle.stop_with(StopSignal {
        drain: true,
        flush: true,
    });
    assert!(tokio::task::spawn_blocking(move || handle.join(Duration::from_secs(2)))
        .await
        .expect("join task"));

    let (speaker, wav) = tokio::time::timeout(Duration::from_secs(5), utterances.recv())
        .await
        .expect("utterance before timeout")
        .expect("channel open");
    assert_eq!(speaker, SpeakerId(50));
    assert_eq!(wav_frames(wav), 10);

    assert!(tokio::time::timeout(Duration::from_secs(5), finished).await.is_ok());
}
