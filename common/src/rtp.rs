//! RTP and RTCP packet structures and wire codec.
//!
//! Implements the subset of RFC 3550 a voice gateway actually sends:
//! fixed RTP header with CSRCs and an optional RFC 5285 header
//! extension, plus sender/receiver report control packets. Other
//! control packet types are carried through opaquely.

use tracing::{debug, warn};

use crate::error::PacketError;

/// RTP packet version 2 (as per RFC 3550)
pub const RTP_VERSION: u8 = 2;

/// Fixed RTP header size in bytes (without CSRCs)
pub const RTP_HEADER_LEN: usize = 12;

/// Fixed RTCP header size in bytes (common header + sender SSRC)
pub const RTCP_HEADER_LEN: usize = 8;

/// Payload type the voice gateway assigns to Opus
pub const PAYLOAD_TYPE_OPUS: u8 = 120;

/// RFC 5285 one-byte header extension profile
pub const EXTENSION_PROFILE_ONE_BYTE: u16 = 0xBEDE;

/// RTCP sender report packet type
pub const RTCP_SENDER_REPORT: u8 = 200;

/// RTCP receiver report packet type
pub const RTCP_RECEIVER_REPORT: u8 = 201;

const REPORT_BLOCK_LEN: usize = 24;
const SENDER_INFO_LEN: usize = 20;

/// Returns the signed distance from `b` to `a` in 16-bit sequence space.
///
/// Positive when `a` is ahead of `b`, negative when behind. Sequence
/// numbers wrap at 65536, so plain integer comparison is wrong near the
/// wrap point.
pub fn seq_distance(a: u16, b: u16) -> i16 {
    a.wrapping_sub(b) as i16
}

/// Returns `true` if `a` comes strictly before `b` in sequence space.
pub fn seq_before(a: u16, b: u16) -> bool {
    seq_distance(a, b) < 0
}

/// Returns `true` if `a` comes strictly after `b` in sequence space.
pub fn seq_after(a: u16, b: u16) -> bool {
    seq_distance(a, b) > 0
}

/// Returns `true` if the datagram is an RTCP control packet.
///
/// The second byte of an RTCP packet is its packet type (200-204). For
/// RTP that byte holds the marker bit and payload type, which never
/// lands in that range for the voice payload types in use.
pub fn is_rtcp(raw: &[u8]) -> bool {
    raw.len() >= 2 && (200..=204).contains(&raw[1])
}

/// A decoded datagram: either media or control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Rtp(RtpPacket),
    Rtcp(RtcpPacket),
}

/// Classifies and decodes a cleartext-header datagram.
///
/// RTP payloads remain encrypted in [`RtpPacket::data`]; RTCP must be
/// decrypted *before* calling this since its report blocks are inside
/// the encrypted region.
///
/// # Errors
///
/// Returns the [`PacketError`] of whichever decoder rejected the bytes.
pub fn decode(raw: &[u8]) -> Result<Packet, PacketError> {
    if is_rtcp(raw) {
        RtcpPacket::decode(raw).map(Packet::Rtcp)
    } else {
        RtpPacket::decode(raw).map(Packet::Rtp)
    }
}

/// Parsed RFC 5285 header extension.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RtpExtension {
    /// Profile marker (`0xBEDE` for one-byte elements)
    pub profile: u16,

    /// `(id, data)` pairs; empty for profiles we do not parse
    pub elements: Vec<(u8, Vec<u8>)>,
}

impl RtpExtension {
    /// Encodes the extension block (profile, word length, elements, padding).
    pub fn serialize(&self) -> Vec<u8> {
        let mut body = Vec::new();
        for (id, data) in &self.elements {
            if data.is_empty() || data.len() > 16 {
                continue;
            }
            body.push((*id << 4) | (data.len() as u8 - 1));
            body.extend_from_slice(data);
        }
        while body.len() % 4 != 0 {
            body.push(0);
        }

        let mut buf = Vec::with_capacity(4 + body.len());
        buf.extend_from_slice(&self.profile.to_be_bytes());
        buf.extend_from_slice(&((body.len() / 4) as u16).to_be_bytes());
        buf.extend_from_slice(&body);
        buf
    }

    fn parse_one_byte_elements(body: &[u8]) -> Vec<(u8, Vec<u8>)> {
        let mut elements = Vec::new();
        let mut i = 0;
        while i < body.len() {
            let b = body[i];
            i += 1;
            if b == 0 {
                continue; // padding
            }
            let id = b >> 4;
            if id == 15 {
                break;
            }
            let len = (b & 0x0F) as usize + 1;
            if i + len > body.len() {
                warn!("Header extension element {} overruns block", id);
                break;
            }
            elements.push((id, body[i..i + len].to_vec()));
            i += len;
        }
        elements
    }
}

/// RTP packet as received from the voice gateway.
///
/// The payload in `data` is still encrypted; the decrypted Opus frame
/// is stored in `decrypted` once the transport cipher has run.
///
/// # Protocol Details
///
/// - Version: Always 2 (RFC 3550)
/// - Payload Type: 120 (Opus)
/// - Sequence: Increments by 1 for each packet, wraps at 65535
/// - Timestamp: Increments by 960 samples for 20ms @ 48kHz
/// - SSRC: Identifies the speaking user's stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub version: u8,
    pub padding: bool,

    /// Header extension present (inside the encrypted payload)
    pub extended: bool,

    pub marker: bool,
    pub payload_type: u8,

    /// Packet sequence number (wraps at 65535)
    pub sequence: u16,

    /// RTP timestamp in sample units
    pub timestamp: u32,

    /// Synchronization source identifier
    pub ssrc: u32,

    pub csrcs: Vec<u32>,

    /// The 12 fixed header bytes, used as nonce material
    pub header: [u8; RTP_HEADER_LEN],

    /// Payload bytes following the header and CSRCs (encrypted on the wire)
    pub data: Vec<u8>,

    /// Decrypted Opus payload with any extension block stripped
    pub decrypted: Option<Vec<u8>>,

    /// Header extension parsed out of the decrypted payload
    pub extension: Option<RtpExtension>,
}

impl RtpPacket {
    /// Creates a new RTP Opus packet with the given parameters.
    ///
    /// # Arguments
    ///
    /// * `sequence` - Packet sequence number
    /// * `timestamp` - RTP timestamp (in sample units)
    /// * `ssrc` - Synchronization source identifier
    /// * `data` - Payload bytes (encrypted or cleartext)
    pub fn new(sequence: u16, timestamp: u32, ssrc: u32, data: Vec<u8>) -> Self {
        let mut packet = Self {
            version: RTP_VERSION,
            padding: false,
            extended: false,
            marker: false,
            payload_type: PAYLOAD_TYPE_OPUS,
            sequence,
            timestamp,
            ssrc,
            csrcs: Vec::new(),
            header: [0; RTP_HEADER_LEN],
            data,
            decrypted: None,
            extension: None,
        };
        packet.header = packet.build_header();
        packet
    }

    /// Marks the packet as carrying a header extension.
    pub fn with_extension_flag(mut self) -> Self {
        self.extended = true;
        self.header = self.build_header();
        self
    }

    /// Returns the decrypted audio payload, or an empty slice if the
    /// packet has not been decrypted.
    pub fn opus(&self) -> &[u8] {
        self.decrypted.as_deref().unwrap_or(&[])
    }

    /// Serializes the RTP packet into wire format.
    ///
    /// # Wire Format
    ///
    /// ```text
    ///  0                   1                   2                   3
    ///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |V=2|P|X|  CC   |M|     PT      |       sequence number         |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |                           timestamp                           |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |           synchronization source (SSRC) identifier            |
    /// +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
    /// |            contributing source (CSRC) identifiers             |
    /// |                             ....                              |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |                 payload (encrypted on the wire)               |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// ```
    pub fn serialize(&self) -> Vec<u8> {
        self.serialize_with(&self.data)
    }

    /// Serializes the header and CSRCs followed by an arbitrary body.
    pub fn serialize_with(&self, body: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(RTP_HEADER_LEN + 4 * self.csrcs.len() + body.len());
        buf.extend_from_slice(&self.build_header());
        for csrc in &self.csrcs {
            buf.extend_from_slice(&csrc.to_be_bytes());
        }
        buf.extend_from_slice(body);
        buf
    }

    /// Decodes an RTP packet from wire format.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Packet is smaller than minimum header size (12 bytes)
    /// - RTP version is not 2
    /// - The CSRC count runs past the end of the datagram
    pub fn decode(raw: &[u8]) -> Result<Self, PacketError> {
        if raw.len() < RTP_HEADER_LEN {
            return Err(PacketError::TooShort {
                len: raw.len(),
                min: RTP_HEADER_LEN,
            });
        }

        let version = (raw[0] >> 6) & 0x03;
        if version != RTP_VERSION {
            return Err(PacketError::BadVersion(version));
        }

        let padding = raw[0] & 0x20 != 0;
        let extended = raw[0] & 0x10 != 0;
        let csrc_count = (raw[0] & 0x0F) as usize;
        let marker = raw[1] & 0x80 != 0;
        let payload_type = raw[1] & 0x7F;

        let sequence = u16::from_be_bytes([raw[2], raw[3]]);
        let timestamp = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
        let ssrc = u32::from_be_bytes([raw[8], raw[9], raw[10], raw[11]]);

        let payload_start = RTP_HEADER_LEN + 4 * csrc_count;
        if raw.len() < payload_start {
            return Err(PacketError::Truncated("CSRC list"));
        }

        let csrcs = raw[RTP_HEADER_LEN..payload_start]
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        let mut header = [0u8; RTP_HEADER_LEN];
        header.copy_from_slice(&raw[..RTP_HEADER_LEN]);

        Ok(Self {
            version,
            padding,
            extended,
            marker,
            payload_type,
            sequence,
            timestamp,
            ssrc,
            csrcs,
            header,
            data: raw[payload_start..].to_vec(),
            decrypted: None,
            extension: None,
        })
    }

    /// Consumes the header extension at the front of a decrypted payload.
    ///
    /// Parses the extension block, stores it on the packet, and returns
    /// the byte offset at which the audio payload begins. Returns 0 when
    /// the packet is not extended.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::Truncated`] if the declared extension
    /// length runs past the payload.
    pub fn update_ext_headers(&mut self, decrypted: &[u8]) -> Result<usize, PacketError> {
        if !self.extended {
            return Ok(0);
        }
        if decrypted.len() < 4 {
            return Err(PacketError::Truncated("extension header"));
        }

        let profile = u16::from_be_bytes([decrypted[0], decrypted[1]]);
        let words = u16::from_be_bytes([decrypted[2], decrypted[3]]) as usize;
        let end = 4 + 4 * words;
        if decrypted.len() < end {
            return Err(PacketError::Truncated("extension body"));
        }

        let elements = if profile == EXTENSION_PROFILE_ONE_BYTE {
            RtpExtension::parse_one_byte_elements(&decrypted[4..end])
        } else {
            debug!("Skipping header extension with profile 0x{:04X}", profile);
            Vec::new()
        };

        self.extension = Some(RtpExtension { profile, elements });
        Ok(end)
    }

    fn build_header(&self) -> [u8; RTP_HEADER_LEN] {
        let mut header = [0u8; RTP_HEADER_LEN];

        // Byte 0: V(2) | P(1) | X(1) | CC(4)
        header[0] = (self.version << 6)
            | ((self.padding as u8) << 5)
            | ((self.extended as u8) << 4)
            | (self.csrcs.len() as u8 & 0x0F);

        // Byte 1: M(1) | PT(7)
        header[1] = ((self.marker as u8) << 7) | (self.payload_type & 0x7F);

        header[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        header[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        header
    }
}

/// Reception report block carried in SR and RR packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReportBlock {
    pub ssrc: u32,
    pub fraction_lost: u8,

    /// Signed 24-bit cumulative loss count
    pub cumulative_lost: i32,

    pub highest_sequence: u32,
    pub jitter: u32,
    pub last_sr: u32,
    pub delay_since_last_sr: u32,
}

impl ReportBlock {
    fn decode(b: &[u8]) -> Self {
        let raw_lost = u32::from_be_bytes([0, b[5], b[6], b[7]]);
        // sign-extend 24 bits
        let cumulative_lost = ((raw_lost << 8) as i32) >> 8;
        Self {
            ssrc: u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
            fraction_lost: b[4],
            cumulative_lost,
            highest_sequence: u32::from_be_bytes([b[8], b[9], b[10], b[11]]),
            jitter: u32::from_be_bytes([b[12], b[13], b[14], b[15]]),
            last_sr: u32::from_be_bytes([b[16], b[17], b[18], b[19]]),
            delay_since_last_sr: u32::from_be_bytes([b[20], b[21], b[22], b[23]]),
        }
    }

    fn serialize_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.ssrc.to_be_bytes());
        buf.push(self.fraction_lost);
        buf.extend_from_slice(&(self.cumulative_lost as u32).to_be_bytes()[1..]);
        buf.extend_from_slice(&self.highest_sequence.to_be_bytes());
        buf.extend_from_slice(&self.jitter.to_be_bytes());
        buf.extend_from_slice(&self.last_sr.to_be_bytes());
        buf.extend_from_slice(&self.delay_since_last_sr.to_be_bytes());
    }
}

/// Sender information section of a sender report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SenderInfo {
    pub ntp_timestamp: u64,
    pub rtp_timestamp: u32,
    pub packet_count: u32,
    pub octet_count: u32,
}

/// RTCP control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpPacket {
    SenderReport {
        ssrc: u32,
        info: SenderInfo,
        reports: Vec<ReportBlock>,
    },
    ReceiverReport {
        ssrc: u32,
        reports: Vec<ReportBlock>,

        /// Profile-specific extension bytes after the report blocks
        extension: Vec<u8>,
    },
    /// Any other control packet type, kept opaque
    Other {
        packet_type: u8,
        count: u8,
        body: Vec<u8>,
    },
}

impl RtcpPacket {
    /// Returns the RTCP packet type byte.
    pub fn packet_type(&self) -> u8 {
        match self {
            RtcpPacket::SenderReport { .. } => RTCP_SENDER_REPORT,
            RtcpPacket::ReceiverReport { .. } => RTCP_RECEIVER_REPORT,
            RtcpPacket::Other { packet_type, .. } => *packet_type,
        }
    }

    /// Decodes a (decrypted) RTCP packet.
    ///
    /// Sender and receiver reports are parsed fully. Every other packet
    /// type decodes to [`RtcpPacket::Other`] rather than failing.
    ///
    /// # Errors
    ///
    /// Returns error if the common header is short, the version is not 2,
    /// or the report count does not fit in the datagram.
    pub fn decode(raw: &[u8]) -> Result<Self, PacketError> {
        if raw.len() < RTCP_HEADER_LEN {
            return Err(PacketError::TooShort {
                len: raw.len(),
                min: RTCP_HEADER_LEN,
            });
        }

        let version = (raw[0] >> 6) & 0x03;
        if version != RTP_VERSION {
            return Err(PacketError::BadVersion(version));
        }

        let count = raw[0] & 0x1F;
        let packet_type = raw[1];
        let length_words = u16::from_be_bytes([raw[2], raw[3]]) as usize;
        let end = ((length_words + 1) * 4).min(raw.len());
        let ssrc = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);

        match packet_type {
            RTCP_RECEIVER_REPORT => {
                let blocks_end = RTCP_HEADER_LEN + count as usize * REPORT_BLOCK_LEN;
                if end < blocks_end {
                    return Err(PacketError::Rtcp("receiver report blocks truncated"));
                }
                let reports = raw[RTCP_HEADER_LEN..blocks_end]
                    .chunks_exact(REPORT_BLOCK_LEN)
                    .map(ReportBlock::decode)
                    .collect();
                Ok(RtcpPacket::ReceiverReport {
                    ssrc,
                    reports,
                    extension: raw[blocks_end..end].to_vec(),
                })
            }
            RTCP_SENDER_REPORT => {
                let info_end = RTCP_HEADER_LEN + SENDER_INFO_LEN;
                let blocks_end = info_end + count as usize * REPORT_BLOCK_LEN;
                if end < blocks_end {
                    return Err(PacketError::Rtcp("sender report truncated"));
                }
                let s = &raw[RTCP_HEADER_LEN..info_end];
                let info = SenderInfo {
                    ntp_timestamp: u64::from_be_bytes([
                        s[0], s[1], s[2], s[3], s[4], s[5], s[6], s[7],
                    ]),
                    rtp_timestamp: u32::from_be_bytes([s[8], s[9], s[10], s[11]]),
                    packet_count: u32::from_be_bytes([s[12], s[13], s[14], s[15]]),
                    octet_count: u32::from_be_bytes([s[16], s[17], s[18], s[19]]),
                };
                let reports = raw[info_end..blocks_end]
                    .chunks_exact(REPORT_BLOCK_LEN)
                    .map(ReportBlock::decode)
                    .collect();
                Ok(RtcpPacket::SenderReport {
                    ssrc,
                    info,
                    reports,
                })
            }
            other => Ok(RtcpPacket::Other {
                packet_type: other,
                count,
                body: raw[4..end].to_vec(),
            }),
        }
    }

    /// Serializes the packet, computing the length field.
    pub fn serialize(&self) -> Vec<u8> {
        let (count, body) = match self {
            RtcpPacket::SenderReport {
                ssrc,
                info,
                reports,
            } => {
                let mut body = ssrc.to_be_bytes().to_vec();
                body.extend_from_slice(&info.ntp_timestamp.to_be_bytes());
                body.extend_from_slice(&info.rtp_timestamp.to_be_bytes());
                body.extend_from_slice(&info.packet_count.to_be_bytes());
                body.extend_from_slice(&info.octet_count.to_be_bytes());
                for block in reports {
                    block.serialize_into(&mut body);
                }
                (reports.len() as u8, body)
            }
            RtcpPacket::ReceiverReport {
                ssrc,
                reports,
                extension,
            } => {
                let mut body = ssrc.to_be_bytes().to_vec();
                for block in reports {
                    block.serialize_into(&mut body);
                }
                body.extend_from_slice(extension);
                (reports.len() as u8, body)
            }
            RtcpPacket::Other { count, body, .. } => (*count, body.clone()),
        };

        let mut buf = Vec::with_capacity(4 + body.len() + 3);
        buf.push((RTP_VERSION << 6) | (count & 0x1F));
        buf.push(self.packet_type());
        let padded_len = body.len().div_ceil(4) * 4;
        buf.extend_from_slice(&((padded_len / 4) as u16).to_be_bytes());
        buf.extend_from_slice(&body);
        buf.resize(4 + padded_len, 0);
        buf
    }
}
