//! CLI-related shared utilities.
//!
//! This module centralizes CLI policy so binaries don't duplicate behavior.

mod args;
mod color;

pub use args::{parse_secret_key, parse_ssrc_mapping};
pub use color::ColorWhen;
