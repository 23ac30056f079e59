//! PipeWire MIDI output.
//!
//! The backend is a filter node with one local MIDI output port. Messages
//! cross the framed ring into the filter's realtime callback; opening a
//! port links our local port to the destination through the link factory.
//! Everything that needs the daemon's view (descriptor resolution, node and
//! port settling, link visibility) goes through the context's sync barrier.

use std::rc::Rc;

use libspa_sys as spa_sys;
use tracing::warn;

use crate::config::OutputConfig;
use crate::error::{MidiError, Result};
use crate::output::{validate_message, MidiApi, MidiOutput};
use crate::pipewire_context::PwContext;
use crate::pipewire_filter::PwFilter;
use crate::pipewire_graph::NodePorts;
use crate::port::{PortDescriptor, PortDirection};
use crate::ring::{midi_ring, MidiRingProducer};

/// PipeWire-specific output options.
#[derive(Default)]
pub struct PipeWireOutputConfig {
    /// Name for the filter node; falls back to the client name.
    pub filter_name: Option<String>,
    /// Externally owned context/loop to share instead of connecting anew.
    pub context: Option<Rc<PwContext>>,
}

/// Local topology this backend declares on its filter: (inputs, outputs).
const LOCAL_TOPOLOGY: (usize, usize) = (0, 1);

/// Bound on the settling loops; past it the port is simply unavailable.
const MAX_SYNC_ROUNDS: usize = 100;

const RING_CAPACITY: usize = 16384;

/// A PipeWire MIDI output.
pub struct PipeWireMidiOutput {
    config: OutputConfig,
    ctx: Rc<PwContext>,
    filter: PwFilter,
    producer: MidiRingProducer,
    links: Vec<pipewire::link::Link>,
    port_open: bool,
}

impl PipeWireMidiOutput {
    pub fn new(config: OutputConfig, pw_config: PipeWireOutputConfig) -> Result<Self> {
        let ctx = match pw_config.context {
            Some(shared) => shared,
            None => Rc::new(PwContext::new()?),
        };

        let (producer, consumer) = midi_ring(RING_CAPACITY);
        let filter_name = pw_config
            .filter_name
            .unwrap_or_else(|| config.client_name.clone());
        let filter = PwFilter::new(&ctx, &filter_name, consumer)?;
        filter.connect()?;

        Ok(Self {
            config,
            ctx,
            filter,
            producer,
            links: Vec::new(),
            port_open: false,
        })
    }

    /// Wait (bounded) for the daemon to assign our filter a node id.
    fn synchronize_node(&self) -> u32 {
        self.ctx.synchronize();
        let mut node_id = self.filter.node_id();
        let mut rounds = 0;
        while node_id == u32::MAX {
            self.ctx.synchronize();
            node_id = self.filter.node_id();
            rounds += 1;
            if rounds > MAX_SYNC_ROUNDS {
                break;
            }
        }
        node_id
    }

    /// Wait (bounded) until the graph shows our declared local ports.
    fn synchronize_ports(&self, node_id: u32) {
        fn settled(node: Option<&NodePorts>, want: (usize, usize)) -> bool {
            node.map(|n| n.inputs.len() >= want.0 && n.outputs.len() >= want.1)
                .unwrap_or(false)
        }

        let mut rounds = 0;
        loop {
            let ready = settled(self.ctx.graph().midi_node(node_id), LOCAL_TOPOLOGY);
            if ready {
                return;
            }
            self.ctx.synchronize();
            rounds += 1;
            if rounds > MAX_SYNC_ROUNDS {
                return;
            }
        }
    }

    /// Our local port's global id, once the graph shows it.
    fn local_port_id(&self, node_id: u32) -> Option<u32> {
        self.ctx
            .graph()
            .midi_node(node_id)?
            .outputs
            .first()
            .map(|p| p.id)
    }
}

impl MidiOutput for PipeWireMidiOutput {
    fn open_port(&mut self, port: &PortDescriptor, local_name: &str) -> Result<()> {
        self.ctx.synchronize();
        let known = {
            let graph = self.ctx.graph();
            graph
                .midi_ports(PortDirection::In)
                .iter()
                .any(|p| p.id == port.port)
        };
        if !known {
            return Err(MidiError::InvalidArgument);
        }

        self.open_virtual_port(local_name)?;

        let node_id = self.filter.node_id();
        let Some(our_port) = self.local_port_id(node_id) else {
            self.config
                .error("PipeWire: local port never appeared in the graph");
            return Err(MidiError::IoError);
        };

        let link = self.ctx.link_ports(our_port, port.port)?;
        self.links.push(link);
        Ok(())
    }

    fn open_virtual_port(&mut self, local_name: &str) -> Result<()> {
        if self.port_open {
            return Ok(());
        }
        let local_name = if local_name.is_empty() { "o" } else { local_name };
        self.filter
            .add_port(local_name, spa_sys::SPA_DIRECTION_OUTPUT)?;

        let node_id = self.synchronize_node();
        if node_id == u32::MAX {
            warn!("PipeWire: filter node id never resolved");
        } else {
            self.synchronize_ports(node_id);
        }
        self.port_open = true;
        Ok(())
    }

    fn close_port(&mut self) -> Result<()> {
        if !self.links.is_empty() {
            // Dropping the proxies unlinks.
            self.links.clear();
            self.ctx.synchronize();
        }
        if self.port_open {
            self.filter.remove_port();
            self.ctx.synchronize();
            self.port_open = false;
        }
        Ok(())
    }

    fn send_message(&mut self, bytes: &[u8]) -> Result<()> {
        validate_message(bytes)?;
        if !self.port_open {
            return Err(MidiError::NotConnected);
        }
        self.producer.write(bytes)
    }

    fn schedule_message(&mut self, _timestamp: i64, _bytes: &[u8]) -> Result<()> {
        // Timing would be lost crossing the ring; the frame format carries
        // no timestamp.
        Err(MidiError::OperationNotSupported)
    }

    fn set_port_name(&mut self, name: &str) -> Result<()> {
        self.filter.rename_port(name)?;
        self.ctx.synchronize();
        Ok(())
    }

    fn current_api(&self) -> MidiApi {
        MidiApi::PipeWire
    }
}

impl Drop for PipeWireMidiOutput {
    fn drop(&mut self) {
        let _ = self.close_port();
    }
}

/// Enumerate MIDI destinations via a short-lived context.
pub fn output_ports() -> Result<Vec<PortDescriptor>> {
    let ctx = PwContext::new()?;
    ctx.synchronize();

    let graph = ctx.graph();
    let mut ports = Vec::new();
    graph.for_each_port(|info| {
        if info.direction != PortDirection::In || !info.format.contains("midi") {
            return;
        }
        ports.push(PortDescriptor {
            client: 0,
            port: info.id,
            manufacturer: String::new(),
            device_name: info.object_path.clone(),
            port_name: info.name.clone(),
            display_name: if info.alias.is_empty() {
                info.name.clone()
            } else {
                info.alias.clone()
            },
        });
    });
    Ok(ports)
}
