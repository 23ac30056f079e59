//! Error taxonomy shared by every backend.
//!
//! Failures from host APIs are translated at the backend boundary; the raw
//! host status code survives only inside [`MidiError::BackendStatus`].
//! Warnings (partial fragment failures, realtime drops) go to the configured
//! warning sink and are never returned as errors.

use thiserror::Error;

/// Everything a backend operation can fail with.
///
/// Validation errors (`InvalidArgument`, `BadMessage`, `MessageSize`) leave
/// no state behind and are safe to retry with corrected input. Transient
/// errors (`NoBufferSpace`, `IoError`) leave the connection usable.
/// Structural errors (`OperationNotSupported`, `NotConnected`,
/// `BackendStatus`) usually mean the object should be closed and recreated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MidiError {
    #[error("invalid argument")]
    InvalidArgument,

    #[error("malformed MIDI message")]
    BadMessage,

    #[error("message exceeds the transport's size limits")]
    MessageSize,

    #[error("I/O error talking to the MIDI host")]
    IoError,

    #[error("no buffer space available")]
    NoBufferSpace,

    #[error("operation not supported by this backend")]
    OperationNotSupported,

    #[error("not connected to a port")]
    NotConnected,

    #[error("backend reported status {0}")]
    BackendStatus(i32),
}

pub type Result<T> = std::result::Result<T, MidiError>;
