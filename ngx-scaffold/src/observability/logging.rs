//! Diagnostic logging to stderr.
//!
//! stdout carries the TAP report, so every log line goes to stderr. The
//! default filter only raises the level of the scaffold's own crates;
//! dependencies stay at `warn` unless `NGX_SCAFFOLD_LOG_LEVEL` says
//! otherwise.

use std::io::IsTerminal;

use tracing_subscriber::EnvFilter;

use crate::cli::args::ColorChoice;

/// Environment variable holding a tracing filter directive.
pub const LOG_LEVEL_ENV: &str = "NGX_SCAFFOLD_LOG_LEVEL";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Plain text, colored on a terminal.
    #[default]
    Human,
    /// One JSON object per line.
    Json,
}

/// Filter directive for `-v` count and `--quiet`.
#[must_use]
pub fn default_directive(verbosity: u8, quiet: bool) -> String {
    let level = match (quiet, verbosity) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        (false, _) => "trace",
    };
    if quiet || verbosity == 0 {
        return level.to_string();
    }
    format!("warn,ngx_scaffold={level},ngx_scaffold_core={level}")
}

fn use_ansi(color: ColorChoice) -> bool {
    match color {
        ColorChoice::Always => true,
        ColorChoice::Never => false,
        ColorChoice::Auto => std::io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none(),
    }
}

/// Installs the global subscriber. Later calls are no-ops.
pub fn init_logging(format: LogFormat, verbosity: u8, quiet: bool, color: ColorChoice) {
    let filter = EnvFilter::try_from_env(LOG_LEVEL_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity, quiet)));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbosity >= 2)
        .with_writer(std::io::stderr);

    let _ = match format {
        LogFormat::Human => builder.with_ansi(use_ansi(color)).try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quiet_wins_over_verbosity() {
        assert_eq!(default_directive(3, true), "error");
    }

    #[test]
    fn test_verbosity_scopes_to_own_crates() {
        assert_eq!(default_directive(0, false), "warn");
        assert_eq!(
            default_directive(1, false),
            "warn,ngx_scaffold=info,ngx_scaffold_core=info"
        );
        assert!(default_directive(u8::MAX, false).ends_with("ngx_scaffold_core=trace"));
    }

    #[test]
    fn test_directives_parse() {
        for (v, q) in [(0, false), (2, false), (5, false), (1, true)] {
            assert!(EnvFilter::try_new(default_directive(v, q)).is_ok());
        }
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init_logging(LogFormat::Human, 0, false, ColorChoice::Never);
        init_logging(LogFormat::Json, 2, false, ColorChoice::Always);
    }
}
