//! Transport encryption for voice packets.
//!
//! The voice gateway seals every RTP payload and RTCP body with
//! XSalsa20-Poly1305. One mode is negotiated per connection; the modes
//! differ only in where the 24-byte nonce comes from:
//!
//! | Mode | Nonce source |
//! |---|---|
//! | `xsalsa20_poly1305` | RTP header (12 bytes, RTCP: 8), zero padded |
//! | `xsalsa20_poly1305_suffix` | last 24 bytes of the datagram |
//! | `xsalsa20_poly1305_lite` | last 4 bytes of the datagram, zero padded |

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};

use rand::RngCore;
use xsalsa20poly1305::aead::{Aead, KeyInit};
use xsalsa20poly1305::{Key, Nonce, XSalsa20Poly1305};

use crate::error::PacketError;
use crate::rtp::{RtpPacket, RTCP_HEADER_LEN};

/// Nonce size for XSalsa20
pub const NONCE_LEN: usize = 24;

/// Secret key size negotiated by the gateway
pub const KEY_LEN: usize = 32;

/// Trailing nonce bytes in lite mode
const LITE_NONCE_LEN: usize = 4;

/// Wire names of every supported mode, in order of preference.
pub const SUPPORTED_MODES: [&str; 3] = [
    "xsalsa20_poly1305_lite",
    "xsalsa20_poly1305_suffix",
    "xsalsa20_poly1305",
];

/// Nonce construction rule negotiated for a voice connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncryptionMode {
    /// Nonce is the packet header, zero padded
    Normal,

    /// Random nonce appended to the payload
    Suffix,

    /// 32-bit counter appended to the payload
    Lite,
}

impl EncryptionMode {
    // ---
    /// Returns the gateway's wire name for this mode.
    pub fn as_str(self) -> &'static str {
        match self {
            EncryptionMode::Normal => "xsalsa20_poly1305",
            EncryptionMode::Suffix => "xsalsa20_poly1305_suffix",
            EncryptionMode::Lite => "xsalsa20_poly1305_lite",
        }
    }

    /// Bytes appended after the ciphertext to carry the nonce.
    fn trailer_len(self) -> usize {
        match self {
            EncryptionMode::Normal => 0,
            EncryptionMode::Suffix => NONCE_LEN,
            EncryptionMode::Lite => LITE_NONCE_LEN,
        }
    }
}

impl fmt::Display for EncryptionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EncryptionMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "xsalsa20_poly1305" => Ok(EncryptionMode::Normal),
            "xsalsa20_poly1305_suffix" => Ok(EncryptionMode::Suffix),
            "xsalsa20_poly1305_lite" => Ok(EncryptionMode::Lite),
            other => anyhow::bail!(
                "unsupported encryption mode '{}' (expected one of {:?})",
                other,
                SUPPORTED_MODES
            ),
        }
    }
}

/// Packet cipher bound to one connection's key and mode.
///
/// The decrypt side is what the reader uses; the encrypt side exists so
/// the gateway simulator (and tests) can produce traffic in every mode.
pub struct Cipher {
    // ---
    mode: EncryptionMode,
    aead: XSalsa20Poly1305,
    lite_nonce: AtomicU32,
}

impl Cipher {
    // ---
    /// Creates a cipher for the negotiated mode and secret key.
    pub fn new(mode: EncryptionMode, key: [u8; KEY_LEN]) -> Self {
        // ---
        Self {
            mode,
            aead: XSalsa20Poly1305::new(&Key::from(key)),
            lite_nonce: AtomicU32::new(0),
        }
    }

    /// Returns the mode this cipher was created with.
    pub fn mode(&self) -> EncryptionMode {
        self.mode
    }

    /// Decrypts an RTP packet's payload in place.
    ///
    /// On success `packet.decrypted` holds the Opus payload. When the
    /// header extension bit is set, the extension block at the front of
    /// the plaintext is parsed into `packet.extension` and stripped.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::Decrypt`] if the nonce trailer is missing
    /// or authentication fails, and [`PacketError::Truncated`] if the
    /// extension block is malformed.
    pub fn decrypt_rtp(&self, packet: &mut RtpPacket) -> Result<(), PacketError> {
        // ---
        let (ciphertext, nonce) = match self.mode {
            EncryptionMode::Normal => (&packet.data[..], pad_nonce(&packet.header)),
            _ => split_trailer(&packet.data, self.mode)?,
        };

        let plaintext = self.open(ciphertext, &nonce)?;
        let offset = packet.update_ext_headers(&plaintext)?;

        packet.decrypted = Some(plaintext[offset..].to_vec());
        Ok(())
    }

    /// Decrypts a raw RTCP datagram.
    ///
    /// The first 8 bytes (common header and sender SSRC) are cleartext;
    /// the result is that header followed by the decrypted body, ready
    /// for [`crate::rtp::RtcpPacket::decode`].
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::TooShort`] for datagrams without a full
    /// header, or [`PacketError::Decrypt`] on authentication failure.
    pub fn decrypt_rtcp(&self, raw: &[u8]) -> Result<Vec<u8>, PacketError> {
        // ---
        if raw.len() < RTCP_HEADER_LEN {
            return Err(PacketError::TooShort {
                len: raw.len(),
                min: RTCP_HEADER_LEN,
            });
        }

        let (header, body) = raw.split_at(RTCP_HEADER_LEN);
        let (ciphertext, nonce) = match self.mode {
            EncryptionMode::Normal => (body, pad_nonce(header)),
            _ => split_trailer(body, self.mode)?,
        };

        let plaintext = self.open(ciphertext, &nonce)?;

        let mut result = Vec::with_capacity(RTCP_HEADER_LEN + plaintext.len());
        result.extend_from_slice(header);
        result.extend_from_slice(&plaintext);
        Ok(result)
    }

    /// Seals an Opus payload into a wire-ready RTP datagram.
    ///
    /// `plaintext` must already include the extension block when the
    /// packet's extension flag is set.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::Decrypt`] if the AEAD refuses the input
    /// (only possible for absurdly large payloads).
    pub fn encrypt_rtp(&self, packet: &RtpPacket, plaintext: &[u8]) -> Result<Vec<u8>, PacketError> {
        // ---
        let body = self.seal_with_trailer(&packet.header, plaintext)?;
        Ok(packet.serialize_with(&body))
    }

    /// Seals a serialized RTCP packet, keeping its 8-byte header in clear.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::TooShort`] if `raw` has no full header.
    pub fn encrypt_rtcp(&self, raw: &[u8]) -> Result<Vec<u8>, PacketError> {
        // ---
        if raw.len() < RTCP_HEADER_LEN {
            return Err(PacketError::TooShort {
                len: raw.len(),
                min: RTCP_HEADER_LEN,
            });
        }

        let (header, body) = raw.split_at(RTCP_HEADER_LEN);
        let sealed = self.seal_with_trailer(header, body)?;

        let mut result = Vec::with_capacity(RTCP_HEADER_LEN + sealed.len());
        result.extend_from_slice(header);
        result.extend_from_slice(&sealed);
        Ok(result)
    }

    /// Encrypts `plaintext` and appends the mode's nonce trailer.
    fn seal_with_trailer(&self, header: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, PacketError> {
        // ---
        let (nonce, trailer) = match self.mode {
            EncryptionMode::Normal => (pad_nonce(header), Vec::new()),
            EncryptionMode::Suffix => {
                let mut nonce = [0u8; NONCE_LEN];
                rand::thread_rng().fill_bytes(&mut nonce);
                (nonce, nonce.to_vec())
            }
            EncryptionMode::Lite => {
                let counter = self.lite_nonce.fetch_add(1, Ordering::Relaxed).to_be_bytes();
                (pad_nonce(&counter), counter.to_vec())
            }
        };

        let mut sealed = self
            .aead
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| PacketError::Decrypt("encryption refused"))?;
        sealed.extend_from_slice(&trailer);
        Ok(sealed)
    }

    fn open(&self, ciphertext: &[u8], nonce: &[u8; NONCE_LEN]) -> Result<Vec<u8>, PacketError> {
        // ---
        self.aead
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| PacketError::Decrypt("authentication failed"))
    }
}

/// Copies up to 24 bytes of nonce material into a zeroed nonce.
fn pad_nonce(material: &[u8]) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    let n = material.len().min(NONCE_LEN);
    nonce[..n].copy_from_slice(&material[..n]);
    nonce
}

/// Splits a suffix/lite body into `(ciphertext, nonce)`.
fn split_trailer(body: &[u8], mode: EncryptionMode) -> Result<(&[u8], [u8; NONCE_LEN]), PacketError> {
    let trailer = mode.trailer_len();
    if body.len() < trailer {
        return Err(PacketError::Decrypt("nonce trailer missing"));
    }
    let (ciphertext, nonce) = body.split_at(body.len() - trailer);
    Ok((ciphertext, pad_nonce(nonce)))
}
