//! CoreMIDI output (macOS).
//!
//! Messages become packet lists: one list per fragment, fragments capped at
//! 65535 bytes, all fragments of a call stamped with one host-time
//! timestamp so a long SysEx is not spread across time. Each list is
//! published through the virtual source endpoint when one exists, and sent
//! to the bound destination when a port is open, both on the same call if
//! both apply.
//!
//! Packet lists are assembled in one fixed-capacity buffer sized to the
//! fragment cap plus list headers, owned by the output and reused for
//! every fragment; the send path never allocates.
//!
//! The client is either created here (tagged with `client_name`) or shared
//! by the host application; a shared client is never disposed by this
//! object.

use std::sync::Arc;

use tracing::debug;

use crate::config::OutputConfig;
use crate::error::{MidiError, Result};
use crate::output::{packet_fragments, validate_message, MidiApi, MidiOutput, MAX_PACKET_BYTES};
use crate::port::PortDescriptor;

/// Room for one maximum-size fragment plus the list and packet headers.
const PACKET_LIST_CAPACITY: usize = MAX_PACKET_BYTES + 16;

/// CoreMIDI-specific output options.
#[derive(Default)]
pub struct CoreMidiOutputConfig {
    /// Externally owned client to reuse. The holder keeps its own reference
    /// and stays responsible for the client's lifetime.
    pub client: Option<Arc<coremidi::Client>>,
}

/// A CoreMIDI output.
pub struct CoreMidiOutput {
    config: OutputConfig,
    // Dropped before the client (declaration order): the port and endpoint
    // belong to it.
    port: Option<coremidi::OutputPort>,
    endpoint: Option<coremidi::VirtualSource>,
    destination: Option<coremidi::Destination>,
    /// Reusable packet-list storage; capacity is fixed at construction and
    /// `send_message` only ever clears and refills it.
    packets: coremidi::PacketBuffer,
    client: Arc<coremidi::Client>,
}

impl CoreMidiOutput {
    pub fn new(config: OutputConfig, core_config: CoreMidiOutputConfig) -> Result<Self> {
        let client = match core_config.client {
            Some(shared) => shared,
            None => Arc::new(coremidi::Client::new(&config.client_name).map_err(|status| {
                config.error(&format!(
                    "CoreMIDI: error creating client object: {status}"
                ));
                MidiError::BackendStatus(status)
            })?),
        };

        Ok(Self {
            config,
            port: None,
            endpoint: None,
            destination: None,
            packets: coremidi::PacketBuffer::with_capacity(PACKET_LIST_CAPACITY),
            client,
        })
    }

    /// Resolve a descriptor against the current destination list: display
    /// name first, enumeration index as tie-break.
    fn locate_destination(&self, port: &PortDescriptor) -> Option<coremidi::Destination> {
        let count = coremidi::Destinations::count();
        let mut by_index = None;
        for index in 0..count {
            let Some(destination) = coremidi::Destination::from_index(index) else {
                continue;
            };
            let display = destination.display_name().unwrap_or_default();
            if !port.display_name.is_empty() && display == port.display_name {
                return Some(destination);
            }
            if index as u32 == port.port {
                by_index = Some(destination);
            }
        }
        by_index
    }

    fn host_time(&self) -> u64 {
        unsafe { libc::mach_absolute_time() }
    }
}

impl MidiOutput for CoreMidiOutput {
    fn open_port(&mut self, port: &PortDescriptor, local_name: &str) -> Result<()> {
        let destination = self
            .locate_destination(port)
            .ok_or(MidiError::InvalidArgument)?;

        let output_port = self.client.output_port(local_name).map_err(|status| {
            self.config
                .error("CoreMIDI: error creating MIDI output port");
            MidiError::BackendStatus(status)
        })?;

        self.port = Some(output_port);
        self.destination = Some(destination);
        Ok(())
    }

    fn open_virtual_port(&mut self, local_name: &str) -> Result<()> {
        let endpoint = self.client.virtual_source(local_name).map_err(|status| {
            self.config
                .error("CoreMIDI: error creating virtual MIDI source");
            MidiError::BackendStatus(status)
        })?;
        self.endpoint = Some(endpoint);
        Ok(())
    }

    fn close_port(&mut self) -> Result<()> {
        // Dropping disposes; the virtual endpoint survives until the
        // object itself goes away.
        self.port = None;
        self.destination = None;
        Ok(())
    }

    fn send_message(&mut self, bytes: &[u8]) -> Result<()> {
        validate_message(bytes)?;
        if self.endpoint.is_none() && self.destination.is_none() {
            return Err(MidiError::NotConnected);
        }

        // One timestamp for every fragment of this call.
        let timestamp = self.host_time();

        for fragment in packet_fragments(bytes) {
            // Rebuild the list in place; the storage was sized for the
            // largest fragment at construction.
            self.packets.clear();
            self.packets.push_data(timestamp, fragment);

            // Publish to whoever subscribed to our virtual source.
            if let Some(endpoint) = &self.endpoint {
                if endpoint.received(&self.packets).is_err() {
                    self.config
                        .warning("CoreMIDI: error sending MIDI to virtual destinations");
                    return Err(MidiError::IoError);
                }
            }

            // And to the explicit destination when a port is bound.
            if let (Some(port), Some(destination)) = (&self.port, &self.destination) {
                if port.send(destination, &self.packets).is_err() {
                    self.config
                        .warning("CoreMIDI: error sending MIDI message to port");
                    return Err(MidiError::IoError);
                }
            }
        }
        Ok(())
    }

    fn schedule_message(&mut self, _timestamp: i64, bytes: &[u8]) -> Result<()> {
        // Host-time scheduling rides the same packet path; the stamp is
        // captured per call, so explicit scheduling is not offered.
        let _ = bytes;
        Err(MidiError::OperationNotSupported)
    }

    fn set_port_name(&mut self, _name: &str) -> Result<()> {
        // CoreMIDI offers no rename for ports or endpoints.
        Err(MidiError::OperationNotSupported)
    }

    fn current_api(&self) -> MidiApi {
        MidiApi::CoreMidi
    }
}

impl Drop for CoreMidiOutput {
    fn drop(&mut self) {
        let _ = self.close_port();
        debug!("CoreMIDI output dropped");
        // The endpoint and (when self-created) the client dispose with
        // their owners; a shared client outlives us in the holder's Arc.
    }
}

/// Enumerate the system's MIDI destinations.
pub fn output_ports() -> Result<Vec<PortDescriptor>> {
    let count = coremidi::Destinations::count();
    let mut ports = Vec::with_capacity(count);
    for index in 0..count {
        let Some(destination) = coremidi::Destination::from_index(index) else {
            continue;
        };
        let display = destination.display_name().unwrap_or_default();
        ports.push(PortDescriptor {
            client: 0,
            port: index as u32,
            manufacturer: String::new(),
            device_name: String::new(),
            port_name: display.clone(),
            display_name: display,
        });
    }
    Ok(ports)
}
