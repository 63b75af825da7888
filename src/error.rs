//! Error taxonomy: a hand-rolled enum with a manual `Display`/
//! `std::error::Error` impl rather than reaching for `thiserror` for a
//! handful of variants.

use std::fmt;

use crate::config::ConfigError;

/// Top-level error type for probe setup and operation. Most of these are
/// fail-fast (propagated to the caller as `Err`); a few (`Send`,
/// `TextLogOpen`) are policy-logged by the stage that produces them and
/// never surface here — they exist as variants so tests and the CLI can
/// still observe them via [`crate::pipeline::Counters`] without a separate
/// ad hoc type.
#[derive(Debug)]
pub enum ProbeError {
    Config(ConfigError),
    CaptureOpen(String),
    SocketBind(std::io::Error),
    Send(std::io::Error),
    TextLogOpen(std::io::Error),
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeError::Config(e) => write!(f, "configuration error: {e}"),
            ProbeError::CaptureOpen(msg) => write!(f, "failed to open capture source: {msg}"),
            ProbeError::SocketBind(e) => write!(f, "failed to bind export socket: {e}"),
            ProbeError::Send(e) => write!(f, "UDP send to collector failed: {e}"),
            ProbeError::TextLogOpen(e) => write!(f, "failed to open text log output: {e}"),
        }
    }
}

impl std::error::Error for ProbeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProbeError::Config(e) => Some(e),
            ProbeError::SocketBind(e) | ProbeError::Send(e) | ProbeError::TextLogOpen(e) => Some(e),
            ProbeError::CaptureOpen(_) => None,
        }
    }
}

impl From<ConfigError> for ProbeError {
    fn from(e: ConfigError) -> Self {
        ProbeError::Config(e)
    }
}
