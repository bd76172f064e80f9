//! Argument parsers shared by the receiver and the gateway simulator.

use anyhow::{Context, Result};

use crate::crypto::KEY_LEN;

/// Parses a 32-byte transport key given as 64 hex characters.
///
/// # Errors
///
/// Returns error if the string is not hex or is not exactly 32 bytes.
pub fn parse_secret_key(s: &str) -> Result<[u8; KEY_LEN]> {
    // ---
    let bytes = hex::decode(s.trim()).context("secret key must be hex encoded")?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("secret key must be {} bytes, got {}", KEY_LEN, len))
}

/// Parses an `SSRC=SPEAKER` mapping, e.g. `1234=987654321`.
///
/// The SSRC may be given in decimal or as `0x`-prefixed hex.
///
/// # Errors
///
/// Returns error if either side is missing or not a number.
pub fn parse_ssrc_mapping(s: &str) -> Result<(u32, u64)> {
    // ---
    let (ssrc, speaker) = s
        .split_once('=')
        .with_context(|| format!("expected SSRC=SPEAKER, got '{}'", s))?;

    let ssrc = match ssrc.trim().strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => ssrc.trim().parse(),
    }
    .with_context(|| format!("invalid SSRC in '{}'", s))?;

    let speaker = speaker
        .trim()
        .parse()
        .with_context(|| format!("invalid speaker id in '{}'", s))?;

    Ok((ssrc, speaker))
}
