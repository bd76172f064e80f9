//! Encrypted UDP transmission of voice and control packets.
//!
//! Seals each RTP payload with the session cipher before it leaves the
//! socket, exactly as the voice gateway does, so the receiver sees
//! realistic traffic in whichever mode was configured.

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tracing::{debug, error, warn};
use voice_capture_common::crypto::KEY_LEN;
use voice_capture_common::{Cipher, EncryptionMode, RtcpPacket, RtpPacket};

/// UDP sender for encrypted voice traffic.
///
/// Network errors are logged and counted as unsent rather than
/// returned, matching the fire-and-forget nature of the transport.
///
/// # Example
///
/// ```ignore
/// use voice_sender::network::VoiceSender;
/// use voice_capture_common::EncryptionMode;
///
/// // Async context required
/// let sender = VoiceSender::new("127.0.0.1:5004", EncryptionMode::Lite, key).await.unwrap();
/// // Use sender.send_voice() to transmit packets
/// ```
pub struct VoiceSender {
    // ---
    socket: UdpSocket,
    remote_addr: String,
    cipher: Cipher,
    packets_sent: u64,
    bytes_sent: u64,
    reports_sent: u64,
}

impl VoiceSender {
    // ---
    /// Creates a sender bound to any available local port.
    ///
    /// # Arguments
    ///
    /// * `remote_addr` - Destination address in "IP:port" format
    /// * `mode` - Transport encryption mode
    /// * `secret_key` - Session key shared with the receiver
    ///
    /// # Errors
    ///
    /// Returns error if socket binding fails.
    pub async fn new(
        remote_addr: impl Into<String>,
        mode: EncryptionMode,
        secret_key: [u8; KEY_LEN],
    ) -> Result<Self> {
        // ---
        let remote_addr = remote_addr.into();

        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("failed to bind UDP socket")?;

        debug!(
            "UDP socket bound to {} ({} -> {})",
            socket.local_addr()?,
            mode,
            remote_addr
        );

        Ok(Self {
            socket,
            remote_addr,
            cipher: Cipher::new(mode, secret_key),
            packets_sent: 0,
            bytes_sent: 0,
            reports_sent: 0,
        })
    }

    /// Encrypts `opus` as the payload of `packet` and sends it.
    ///
    /// When the packet carries a header extension, its serialized block
    /// is sealed in front of the audio.
    ///
    /// Returns the datagram size, or 0 if the socket refused it.
    ///
    /// # Errors
    ///
    /// Returns error if the payload cannot be encrypted.
    pub async fn send_voice(&mut self, packet: &RtpPacket, opus: &[u8]) -> Result<usize> {
        // ---
        let plaintext = match (&packet.extension, packet.extended) {
            (Some(ext), true) => {
                let mut buf = ext.serialize();
                buf.extend_from_slice(opus);
                buf
            }
            _ => opus.to_vec(),
        };

        let datagram = self
            .cipher
            .encrypt_rtp(packet, &plaintext)
            .with_context(|| format!("failed to encrypt packet seq={}", packet.sequence))?;

        let sent = self.transmit(&datagram).await;
        if sent > 0 {
            self.packets_sent += 1;
            if self.packets_sent.is_multiple_of(100) {
                debug!(
                    "Sent {} packets ({} bytes) - seq={}",
                    self.packets_sent, self.bytes_sent, packet.sequence
                );
            }
        }
        Ok(sent)
    }

    /// Encrypts and sends an RTCP packet.
    ///
    /// Returns the datagram size, or 0 if the socket refused it.
    ///
    /// # Errors
    ///
    /// Returns error if the report cannot be encrypted.
    pub async fn send_receiver_report(&mut self, report: &RtcpPacket) -> Result<usize> {
        // ---
        let datagram = self
            .cipher
            .encrypt_rtcp(&report.serialize())
            .context("failed to encrypt RTCP packet")?;

        let sent = self.transmit(&datagram).await;
        if sent > 0 {
            self.reports_sent += 1;
        }
        Ok(sent)
    }

    async fn transmit(&mut self, datagram: &[u8]) -> usize {
        // ---
        match self.socket.send_to(datagram, &self.remote_addr).await {
            Ok(bytes) => {
                self.bytes_sent += bytes as u64;
                bytes
            }
            Err(e) => {
                error!("Failed to send datagram to {}: {}", self.remote_addr, e);
                warn!("Continuing despite network error");
                0
            }
        }
    }

    /// Returns `(packets, bytes)` sent so far; bytes include RTCP.
    pub fn stats(&self) -> (u64, u64) {
        (self.packets_sent, self.bytes_sent)
    }

    pub fn reports_sent(&self) -> u64 {
        self.reports_sent
    }
}
