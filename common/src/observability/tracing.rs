//! Tracing initialization.
//!
//! Centralizes tracing config so both binaries behave the same.

use crate::ColorWhen;
use anyhow::Result;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize tracing subscriber.
///
/// - Respects `RUST_LOG` via `EnvFilter`, defaulting to `info`.
/// - ANSI color controlled by `ColorWhen`.
/// - Lines carry the thread name (`voice-reader` for the reader thread).
///
/// # Errors
///
/// Returns error if a global subscriber was already installed.
pub fn init_tracing(color: ColorWhen) -> Result<()> {
    // ---
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(env_filter)
        .with_ansi(color.should_color_stderr())
        .with_thread_names(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    Ok(())
}
