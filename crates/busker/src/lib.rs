//! Busker: cross-platform MIDI output
//!
//! One port lifecycle (enumerate → open → send → close) mapped onto three
//! very different hosts:
//!
//! - **JACK**: MIDI crosses a non-blocking realtime graph. Messages travel
//!   through a lock-free framed ring into the process callback, or (direct
//!   mode) straight into the current cycle's buffer.
//! - **PipeWire**: ports appear and disappear asynchronously through the
//!   registry. A graph tracker mirrors the daemon's view; a filter node
//!   carries our local port and drains the same framed ring.
//! - **CoreMIDI**: packet lists sent to a destination and/or published
//!   through a virtual source endpoint (macOS only).
//!
//! Backends are feature-gated (`jack-backend`, `pipewire`) so the core
//! machinery builds and tests without the system libraries. The realtime
//! paths never allocate, lock or log; cross-thread state is limited to an
//! atomic port slot, the SPSC ring, and the release-handshake flag.

pub mod config;
pub mod error;
pub mod handshake;
pub mod output;
pub mod pipewire_graph;
pub mod port;
pub mod ring;

#[cfg(feature = "jack-backend")]
pub mod jack_output;

#[cfg(feature = "pipewire")]
pub mod pipewire_context;
#[cfg(feature = "pipewire")]
pub mod pipewire_filter;
#[cfg(feature = "pipewire")]
pub mod pipewire_output;

#[cfg(target_os = "macos")]
pub mod coremidi_output;

pub use config::{MessageCallback, OutputConfig, TimestampMode};
pub use error::{MidiError, Result};
pub use handshake::ReleaseHandshake;
pub use output::{open_output, output_ports, validate_message, MidiApi, MidiOutput};
pub use pipewire_graph::{Graph, NodePorts, PortInfo};
pub use port::{PortDescriptor, PortDirection};
pub use ring::{midi_ring, MidiRingConsumer, MidiRingProducer};

#[cfg(feature = "jack-backend")]
pub use jack_output::{JackHostContext, JackMidiOutput, JackOutputConfig, JackProcessFn};

#[cfg(feature = "pipewire")]
pub use pipewire_context::PwContext;
#[cfg(feature = "pipewire")]
pub use pipewire_output::{PipeWireMidiOutput, PipeWireOutputConfig};

#[cfg(target_os = "macos")]
pub use coremidi_output::{CoreMidiOutput, CoreMidiOutputConfig};
