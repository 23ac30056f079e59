//! Output configuration shared by every backend.
//!
//! Backend-specific options live next to their backend (`JackOutputConfig`,
//! `PipeWireOutputConfig`, `CoreMidiOutputConfig`); this module carries the
//! generic part: client naming, the timestamp domain for scheduled sends,
//! and the error/warning sinks.

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

/// Which time domain `schedule_message` timestamps are expressed in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimestampMode {
    /// No timestamping; messages go out as soon as the host allows.
    #[default]
    None,
    /// Frames within the current audio cycle (JACK direct mode).
    AudioFrame,
    /// The host's absolute clock (CoreMIDI host time).
    Absolute,
    /// Relative to the first message sent.
    Relative,
    /// The system monotonic clock.
    SystemMonotonic,
}

/// Callback for error and warning text.
///
/// Must be `Send + Sync`: backends may invoke it from their event threads.
/// Never invoked from a realtime callback.
pub type MessageCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Generic output options.
///
/// Warnings are advisory and only ever reach the warning sink; errors that
/// also surface through a `Result` are mirrored to the error sink so hosts
/// with centralised reporting see them once.
pub struct OutputConfig {
    pub client_name: String,
    pub timestamp_mode: TimestampMode,
    pub on_error: Option<MessageCallback>,
    pub on_warning: Option<MessageCallback>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            client_name: "busker".to_string(),
            timestamp_mode: TimestampMode::None,
            on_error: None,
            on_warning: None,
        }
    }
}

impl OutputConfig {
    /// Report a non-fatal condition. Falls back to `tracing` when the host
    /// installed no sink.
    pub(crate) fn warning(&self, text: &str) {
        match &self.on_warning {
            Some(sink) => sink(text),
            None => warn!("{}", text),
        }
    }

    /// Report a fatal condition (the caller still returns the error).
    pub(crate) fn error(&self, text: &str) {
        match &self.on_error {
            Some(sink) => sink(text),
            None => error!("{}", text),
        }
    }
}

impl std::fmt::Debug for OutputConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputConfig")
            .field("client_name", &self.client_name)
            .field("timestamp_mode", &self.timestamp_mode)
            .field("on_error", &self.on_error.is_some())
            .field("on_warning", &self.on_warning.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_default_config() {
        let config = OutputConfig::default();
        assert_eq!(config.client_name, "busker");
        assert_eq!(config.timestamp_mode, TimestampMode::None);
        assert!(config.on_warning.is_none());
    }

    #[test]
    fn test_warning_reaches_sink() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let config = OutputConfig {
            on_warning: Some(Box::new(move |_| {
                counter.fetch_add(1, Ordering::Relaxed);
            })),
            ..Default::default()
        };
        config.warning("queue overrun");
        config.warning("queue overrun");
        assert_eq!(hits.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_timestamp_mode_serde() {
        let json = serde_json::to_string(&TimestampMode::AudioFrame).unwrap();
        let back: TimestampMode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, TimestampMode::AudioFrame);
    }
}
