//! Standardized CLI color policy.
//!
//! - Command-line choice wins.
//! - `NO_COLOR` disables colors.
//! - `EMACS` implies non-interactive output.
//! - In `Auto`, only enable colors when the target stream is a TTY.

use std::env;

/// When to emit ANSI colors.
///
/// Doubles as the `--color` argument of both binaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ColorWhen {
    /// Enable colors only when output is a TTY.
    #[default]
    Auto,

    /// Always enable colors.
    Always,

    /// Never enable colors.
    Never,
}

impl ColorWhen {
    // ---
    /// Returns whether ANSI color should be used for the given stream.
    pub fn should_color(self, stream: atty::Stream) -> bool {
        match self {
            ColorWhen::Always => true,
            ColorWhen::Never => false,
            ColorWhen::Auto => auto_allows_color() && atty::is(stream),
        }
    }

    /// Logs go to stderr in both binaries.
    pub fn should_color_stderr(self) -> bool {
        self.should_color(atty::Stream::Stderr)
    }
}

fn auto_allows_color() -> bool {
    env::var_os("NO_COLOR").is_none() && env::var_os("EMACS").is_none()
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use clap::ValueEnum;

    #[test]
    fn explicit_choices_ignore_environment() {
        // ---
        assert!(ColorWhen::Always.should_color(atty::Stream::Stderr));
        assert!(!ColorWhen::Never.should_color(atty::Stream::Stderr));
    }

    #[test]
    fn parses_from_command_line_names() {
        // ---
        assert_eq!(ColorWhen::from_str("never", true), Ok(ColorWhen::Never));
        assert_eq!(ColorWhen::from_str("ALWAYS", true), Ok(ColorWhen::Always));
        assert!(ColorWhen::from_str("sometimes", true).is_err());
        assert_eq!(ColorWhen::default(), ColorWhen::Auto);
    }
}
