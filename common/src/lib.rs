//! Shared voice-capture building blocks.
//!
//! This crate provides the RTP/RTCP packet codec and the transport
//! crypto used by both the receiver and the gateway simulator, plus
//! the observability and CLI policy both binaries share.

pub mod cli;
pub mod crypto;
pub mod error;
pub mod observability;
pub mod rtp;

pub use cli::{parse_secret_key, parse_ssrc_mapping, ColorWhen};
pub use crypto::{Cipher, EncryptionMode};
pub use error::PacketError;
pub use observability::{init_tracing, MetricsContext, MetricsServerConfig};
pub use rtp::{Packet, ReportBlock, RtcpPacket, RtpExtension, RtpPacket};
