//! The output backend contract.
//!
//! Every backend implements [`MidiOutput`]; enumeration and construction are
//! free functions parameterised by [`MidiApi`], so callers never name a
//! backend type unless they want its backend-specific options.

use serde::{Deserialize, Serialize};

use crate::config::OutputConfig;
use crate::error::{MidiError, Result};
use crate::port::PortDescriptor;

/// The most data one packet/fragment may carry. Long SysEx is split into
/// fragments of this size, all stamped with one timestamp.
pub const MAX_PACKET_BYTES: usize = 65535;

/// Tag identifying which host a backend talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MidiApi {
    Jack,
    PipeWire,
    CoreMidi,
}

impl MidiApi {
    /// The APIs this build actually carries.
    pub fn available() -> Vec<MidiApi> {
        let mut apis = Vec::new();
        #[cfg(feature = "jack-backend")]
        apis.push(MidiApi::Jack);
        #[cfg(feature = "pipewire")]
        apis.push(MidiApi::PipeWire);
        #[cfg(target_os = "macos")]
        apis.push(MidiApi::CoreMidi);
        apis
    }
}

impl std::fmt::Display for MidiApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MidiApi::Jack => write!(f, "JACK"),
            MidiApi::PipeWire => write!(f, "PipeWire"),
            MidiApi::CoreMidi => write!(f, "CoreMIDI"),
        }
    }
}

/// Uniform lifecycle implemented by every output backend.
///
/// Concurrent calls from multiple threads are not ordered; callers needing
/// message order across threads must serialise externally. `close_port` is
/// idempotent and never fails fatally.
pub trait MidiOutput {
    /// Connect to a port previously returned by enumeration.
    fn open_port(&mut self, port: &PortDescriptor, local_name: &str) -> Result<()>;

    /// Create a locally visible endpoint peers can connect to.
    fn open_virtual_port(&mut self, local_name: &str) -> Result<()>;

    /// Disconnect. Closing twice is not an error.
    fn close_port(&mut self) -> Result<()>;

    /// Send raw MIDI bytes, observable to the peer in MIDI order.
    fn send_message(&mut self, bytes: &[u8]) -> Result<()>;

    /// Deliver bytes at `timestamp` (best effort), in the configured
    /// timestamp domain.
    fn schedule_message(&mut self, timestamp: i64, bytes: &[u8]) -> Result<()>;

    /// Rename the local endpoint.
    fn set_port_name(&mut self, name: &str) -> Result<()>;

    /// Which API this backend talks to.
    fn current_api(&self) -> MidiApi;
}

/// Validation every backend applies before touching its host.
///
/// Empty messages are rejected, and anything longer than three bytes must
/// be SysEx; a MIDI channel message cannot exceed three bytes. Backends
/// may validate further but never relax these two.
pub fn validate_message(bytes: &[u8]) -> Result<()> {
    if bytes.is_empty() {
        return Err(MidiError::InvalidArgument);
    }
    if bytes[0] != 0xF0 && bytes.len() > 3 {
        return Err(MidiError::BadMessage);
    }
    Ok(())
}

/// Split a message into transport-sized fragments.
///
/// The caller stamps all fragments with a single timestamp captured before
/// fragmentation, so a long SysEx is not spread across time.
pub fn packet_fragments(bytes: &[u8]) -> std::slice::Chunks<'_, u8> {
    bytes.chunks(MAX_PACKET_BYTES)
}

/// Enumerate the destinations a `MidiApi` output could open.
pub fn output_ports(api: MidiApi) -> Result<Vec<PortDescriptor>> {
    match api {
        #[cfg(feature = "jack-backend")]
        MidiApi::Jack => crate::jack_output::output_ports(),
        #[cfg(feature = "pipewire")]
        MidiApi::PipeWire => crate::pipewire_output::output_ports(),
        #[cfg(target_os = "macos")]
        MidiApi::CoreMidi => crate::coremidi_output::output_ports(),
        #[allow(unreachable_patterns)]
        _ => Err(MidiError::OperationNotSupported),
    }
}

/// Open an output backend with default backend-specific options.
///
/// Use a backend's own constructor when its options (direct mode, ring
/// sizing, external contexts) matter.
pub fn open_output(api: MidiApi, config: OutputConfig) -> Result<Box<dyn MidiOutput>> {
    match api {
        #[cfg(feature = "jack-backend")]
        MidiApi::Jack => Ok(Box::new(crate::jack_output::JackMidiOutput::new(
            config,
            Default::default(),
        )?)),
        #[cfg(feature = "pipewire")]
        MidiApi::PipeWire => Ok(Box::new(crate::pipewire_output::PipeWireMidiOutput::new(
            config,
            Default::default(),
        )?)),
        #[cfg(target_os = "macos")]
        MidiApi::CoreMidi => Ok(Box::new(crate::coremidi_output::CoreMidiOutput::new(
            config,
            Default::default(),
        )?)),
        #[allow(unreachable_patterns)]
        _ => {
            let _ = config;
            Err(MidiError::OperationNotSupported)
        }
    }
}
