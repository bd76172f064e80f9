//! Voice connection: the socket and session state the reader depends on.
//!
//! The gateway handshake that produces the secret key and the SSRC to
//! speaker mapping happens elsewhere; this module only defines what the
//! reader needs from it, plus a plain UDP implementation.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::{Condvar, Mutex, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info};
use voice_capture_common::crypto::KEY_LEN;
use voice_capture_common::EncryptionMode;

/// Identity of a participant in the voice channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpeakerId(pub u64);

impl fmt::Display for SpeakerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "speaker {}", self.0)
    }
}

/// What the reader thread needs from a voice session.
pub trait VoiceConnection: Send + Sync {
    // ---
    /// Receives one datagram.
    ///
    /// Returns `WouldBlock` or `TimedOut` when nothing arrived within the
    /// poll interval.
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn is_connected(&self) -> bool;

    /// Blocks until connected or `timeout` passes; returns the final state.
    fn wait_for_connection(&self, timeout: Duration) -> bool;

    fn speaker_for(&self, ssrc: u32) -> Option<SpeakerId>;

    fn knows_ssrc(&self, ssrc: u32) -> bool {
        self.speaker_for(ssrc).is_some()
    }

    fn mode(&self) -> EncryptionMode;

    fn secret_key(&self) -> [u8; KEY_LEN];
}

/// SSRC to speaker table, updated by the gateway as people join and
/// start speaking.
#[derive(Debug, Default)]
pub struct SsrcMap {
    inner: RwLock<HashMap<u32, SpeakerId>>,
}

impl SsrcMap {
    // ---
    pub fn insert(&self, ssrc: u32, speaker: SpeakerId) {
        // ---
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if map.insert(ssrc, speaker).is_none() {
            debug!("Mapped SSRC {} to {}", ssrc, speaker);
        }
    }

    pub fn remove(&self, ssrc: u32) -> Option<SpeakerId> {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&ssrc)
    }

    pub fn get(&self, ssrc: u32) -> Option<SpeakerId> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&ssrc)
            .copied()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Voice session over a bound UDP socket.
///
/// Starts disconnected; the owner calls [`UdpVoiceConnection::set_connected`]
/// once the session is established and again whenever it drops.
pub struct UdpVoiceConnection {
    // ---
    socket: UdpSocket,
    mode: EncryptionMode,
    secret_key: [u8; KEY_LEN],
    connected: Mutex<bool>,
    state_changed: Condvar,
    ssrcs: SsrcMap,
}

impl UdpVoiceConnection {
    // ---
    /// Binds a UDP socket whose reads time out after `poll_interval`.
    ///
    /// # Errors
    ///
    /// Returns error if the socket cannot be bound or configured.
    pub fn bind(
        addr: impl ToSocketAddrs,
        mode: EncryptionMode,
        secret_key: [u8; KEY_LEN],
        poll_interval: Duration,
    ) -> Result<Self> {
        // ---
        let socket = UdpSocket::bind(addr).context("failed to bind voice UDP socket")?;
        socket
            .set_read_timeout(Some(poll_interval))
            .context("failed to set socket read timeout")?;

        info!(
            "Voice socket bound to {} ({})",
            socket.local_addr().context("failed to read local address")?,
            mode
        );

        Ok(Self {
            socket,
            mode,
            secret_key,
            connected: Mutex::new(false),
            state_changed: Condvar::new(),
            ssrcs: SsrcMap::default(),
        })
    }

    /// # Errors
    ///
    /// Returns error if the local address cannot be read.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().context("failed to read local address")
    }

    /// Marks the session as up or down and wakes any waiting reader.
    pub fn set_connected(&self, connected: bool) {
        // ---
        let mut state = self.connected.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != connected {
            debug!("Voice connection {}", if connected { "up" } else { "down" });
        }
        *state = connected;
        self.state_changed.notify_all();
    }

    pub fn ssrc_map(&self) -> &SsrcMap {
        &self.ssrcs
    }
}

impl VoiceConnection for UdpVoiceConnection {
    // ---
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.recv(buf)
    }

    fn is_connected(&self) -> bool {
        *self.connected.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_for_connection(&self, timeout: Duration) -> bool {
        // ---
        let state = self.connected.lock().unwrap_or_else(PoisonError::into_inner);
        let (state, _) = self
            .state_changed
            .wait_timeout_while(state, timeout, |connected| !*connected)
            .unwrap_or_else(PoisonError::into_inner);
        *state
    }

    fn speaker_for(&self, ssrc: u32) -> Option<SpeakerId> {
        self.ssrcs.get(ssrc)
    }

    fn mode(&self) -> EncryptionMode {
        self.mode
    }

    fn secret_key(&self) -> [u8; KEY_LEN] {
        self.secret_key
    }
}
