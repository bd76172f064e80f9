//! Per-packet error classification.
//!
//! Everything here is recoverable from the reader's point of view: the
//! offending datagram is logged and dropped, and the loop keeps going.

use thiserror::Error;

/// Failure to turn one datagram into a usable packet.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Fewer bytes than the fixed header requires.
    #[error("packet too small: {len} bytes (need at least {min})")]
    TooShort { len: usize, min: usize },

    /// RTP/RTCP version field was not 2.
    #[error("invalid RTP version: {0}")]
    BadVersion(u8),

    /// Header declared more data (CSRCs, extension words) than present.
    #[error("truncated packet: {0}")]
    Truncated(&'static str),

    /// Authentication tag mismatch or missing nonce bytes.
    #[error("decryption failed: {0}")]
    Decrypt(&'static str),

    /// Structurally invalid control packet.
    #[error("malformed RTCP packet: {0}")]
    Rtcp(&'static str),
}
