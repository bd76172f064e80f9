//! Voice receive pipeline.
//!
//! Reads encrypted RTP/RTCP datagrams from a voice connection on a
//! dedicated thread, decrypts them, and routes the audio through a chain
//! of sinks: jitter buffering, Opus decoding, PCM filters, WAV output,
//! and silence-based utterance segmentation.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use voice_receiver::connection::{SpeakerId, UdpVoiceConnection};
//! use voice_receiver::reader::{ReaderConfig, VoiceReader};
//! use voice_receiver::sink::WaveSink;
//! use voice_capture_common::EncryptionMode;
//!
//! let connection = Arc::new(UdpVoiceConnection::bind(
//!     "0.0.0.0:5004",
//!     EncryptionMode::Lite,
//!     [0u8; 32],
//!     Duration::from_millis(10),
//! ).unwrap());
//! connection.ssrc_map().insert(1234, SpeakerId(1));
//! connection.set_connected(true);
//!
//! let sink = WaveSink::create("capture.wav").unwrap();
//! let handle = VoiceReader::spawn(connection, sink, ReaderConfig::default(), None, |_| {}).unwrap();
//! ```

pub mod buffered;
pub mod codec;
pub mod connection;
pub mod jitter_buffer;
pub mod reader;
pub mod sink;
pub mod stats;

pub use buffered::{BufferedDecoder, DecodedFrame};
pub use codec::OpusDecoderWrapper;
pub use connection::{SpeakerId, SsrcMap, UdpVoiceConnection, VoiceConnection};
pub use jitter_buffer::{JitterBufferConfig, SimpleJitterBuffer};
pub use reader::{ReaderConfig, ReaderHandle, ReaderState, VoiceReader};
pub use sink::{AudioSink, SinkFlow, StopSignal, VoiceData};
pub use stats::ReaderStats;
pub use voice_capture_common::RtpPacket;
