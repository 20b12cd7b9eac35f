#![allow(clippy::module_name_repetitions)]
//! Color mode configuration and ANSI painting helpers.
//!
//! Logging helpers policy (stderr one-liners):
//! - Progress lines go through log_info_stderr, notes and degraded paths through
//!   log_warn_stderr, refusals and failures through log_error_stderr.
//! - Precompute once per scope and reuse:
//!     let use_err = devctl::color_enabled_stderr();
//! - Status reports meant for scripts are printed to stdout without color.

use clap::ValueEnum;
use once_cell::sync::OnceCell;

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum)]
pub enum ColorMode {
    Auto,
    Always,
    Never,
}

static COLOR_MODE: OnceCell<ColorMode> = OnceCell::new();

pub fn set_color_mode(mode: ColorMode) {
    let _ = COLOR_MODE.set(mode);
}

fn parse_color_mode(s: &str) -> Option<ColorMode> {
    match s.trim().to_ascii_lowercase().as_str() {
        "auto" => Some(ColorMode::Auto),
        "always" | "on" | "true" | "yes" => Some(ColorMode::Always),
        "never" | "off" | "false" | "no" => Some(ColorMode::Never),
        _ => None,
    }
}

fn env_color_mode_pref() -> Option<ColorMode> {
    std::env::var("DEVCTL_COLOR")
        .ok()
        .and_then(|v| parse_color_mode(&v))
}

fn no_color_env() -> bool {
    // Per https://no-color.org/
    std::env::var("NO_COLOR").is_ok()
}

fn color_enabled_for(is_tty: bool) -> bool {
    if no_color_env() {
        return false;
    }
    let mode = COLOR_MODE.get().copied().or_else(env_color_mode_pref);
    match mode {
        Some(ColorMode::Always) => true,
        Some(ColorMode::Never) => false,
        Some(ColorMode::Auto) | None => is_tty,
    }
}

pub fn color_enabled_stderr() -> bool {
    color_enabled_for(atty::is(atty::Stream::Stderr))
}

/// Wrap string with ANSI color code when enabled; otherwise return unchanged.
pub fn paint(enabled: bool, code: &str, s: &str) -> String {
    if enabled {
        format!("{code}{s}\x1b[0m")
    } else {
        s.to_string()
    }
}

pub fn log_info_stderr(use_color: bool, msg: &str) {
    eprintln!("{}", paint(use_color, "\x1b[36;1m", msg));
}

pub fn log_ok_stderr(use_color: bool, msg: &str) {
    eprintln!("{}", paint(use_color, "\x1b[32;1m", msg));
}

pub fn log_warn_stderr(use_color: bool, msg: &str) {
    eprintln!("{}", paint(use_color, "\x1b[33m", msg));
}

pub fn log_error_stderr(use_color: bool, msg: &str) {
    eprintln!("{}", paint(use_color, "\x1b[31;1m", msg));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_color_mode_aliases() {
        assert_eq!(parse_color_mode("ON"), Some(ColorMode::Always));
        assert_eq!(parse_color_mode(" never "), Some(ColorMode::Never));
        assert_eq!(parse_color_mode("auto"), Some(ColorMode::Auto));
        assert_eq!(parse_color_mode("sometimes"), None);
    }

    #[test]
    fn test_paint_disabled_is_identity() {
        assert_eq!(paint(false, "\x1b[31m", "plain"), "plain");
        assert_eq!(paint(true, "\x1b[31m", "x"), "\x1b[31mx\x1b[0m");
    }
}
