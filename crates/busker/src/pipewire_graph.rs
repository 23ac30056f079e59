//! Mirror of the PipeWire daemon's port graph.
//!
//! The registry pushes unsolicited port events; this module keeps the
//! resulting view queryable: ports partitioned into
//! `{physical, software} × {audio, midi}` maps keyed by node id, each node
//! carrying its input and output ports. Parsing takes plain key/value pairs
//! so the classification logic tests without a daemon.
//!
//! Invariants: a port id occupies exactly one (map, node, direction) slot;
//! a port's node id never changes while it lives; removal clears it from
//! all four maps. The graph is only ever mutated from the thread driving
//! the main loop.

use std::collections::HashMap;

use crate::port::PortDirection;

/// One port as announced by the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Global id (registry id of the port object).
    pub id: u32,
    /// DSP format string, e.g. `32 bit float mono audio` or `8 bit raw midi`.
    pub format: String,
    pub name: String,
    pub alias: String,
    pub object_path: String,
    /// Owning node. Immutable for the port's lifetime.
    pub node_id: u32,
    /// Id within the node.
    pub port_id: u32,
    pub direction: PortDirection,
    pub physical: bool,
    pub terminal: bool,
    pub monitor: bool,
}

impl PortInfo {
    /// Parse a port-info property dictionary.
    ///
    /// Returns `None` when `node.id` is missing; such events carry nothing
    /// we can anchor in the graph and are dropped.
    pub fn from_props<'a>(
        id: u32,
        props: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Option<PortInfo> {
        let mut info = PortInfo {
            id,
            format: String::new(),
            name: String::new(),
            alias: String::new(),
            object_path: String::new(),
            node_id: u32::MAX,
            port_id: 0,
            direction: PortDirection::In,
            physical: false,
            terminal: false,
            monitor: false,
        };
        let mut node_seen = false;

        for (key, value) in props {
            match key {
                "format.dsp" => info.format = value.to_string(),
                "port.name" => info.name = value.to_string(),
                "port.alias" => info.alias = value.to_string(),
                "object.path" => info.object_path = value.to_string(),
                "port.id" => info.port_id = value.parse().unwrap_or(0),
                "node.id" => {
                    if let Ok(id) = value.parse() {
                        info.node_id = id;
                        node_seen = true;
                    }
                }
                "port.direction" => {
                    info.direction = if value == "out" {
                        PortDirection::Out
                    } else {
                        PortDirection::In
                    };
                }
                "port.physical" if value == "true" => info.physical = true,
                "port.terminal" if value == "true" => info.terminal = true,
                "port.monitor" if value == "true" => info.monitor = true,
                _ => {}
            }
        }

        node_seen.then_some(info)
    }
}

/// A node's ports, split by direction.
#[derive(Debug, Clone, Default)]
pub struct NodePorts {
    pub inputs: Vec<PortInfo>,
    pub outputs: Vec<PortInfo>,
}

/// The four-way partition of the daemon's ports.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    pub physical_audio: HashMap<u32, NodePorts>,
    pub physical_midi: HashMap<u32, NodePorts>,
    pub software_audio: HashMap<u32, NodePorts>,
    pub software_midi: HashMap<u32, NodePorts>,
}

impl Graph {
    /// Place a port in its slot.
    ///
    /// Ports whose format is neither audio nor midi are ignored (video and
    /// friends). A re-announcement of a known id replaces the previous
    /// record, so property updates cannot duplicate a port.
    pub fn insert(&mut self, port: PortInfo) {
        self.remove_port(port.id);

        let map = match (port.physical, &port.format) {
            (true, f) if f.contains("audio") => &mut self.physical_audio,
            (true, f) if f.contains("midi") => &mut self.physical_midi,
            (false, f) if f.contains("audio") => &mut self.software_audio,
            (false, f) if f.contains("midi") => &mut self.software_midi,
            _ => return,
        };

        let node = map.entry(port.node_id).or_default();
        match port.direction {
            PortDirection::In => node.inputs.push(port),
            PortDirection::Out => node.outputs.push(port),
        }
    }

    /// Remove a port from wherever it lives. Nodes left empty are dropped.
    pub fn remove_port(&mut self, id: u32) {
        for map in [
            &mut self.physical_audio,
            &mut self.physical_midi,
            &mut self.software_audio,
            &mut self.software_midi,
        ] {
            for node in map.values_mut() {
                node.inputs.retain(|p| p.id != id);
                node.outputs.retain(|p| p.id != id);
            }
            map.retain(|_, node| !node.inputs.is_empty() || !node.outputs.is_empty());
        }
    }

    /// Visit every port in the graph.
    pub fn for_each_port(&self, mut visit: impl FnMut(&PortInfo)) {
        for map in [
            &self.physical_audio,
            &self.physical_midi,
            &self.software_audio,
            &self.software_midi,
        ] {
            for node in map.values() {
                for port in &node.inputs {
                    visit(port);
                }
                for port in &node.outputs {
                    visit(port);
                }
            }
        }
    }

    /// A node's MIDI ports, wherever it was classified.
    pub fn midi_node(&self, node_id: u32) -> Option<&NodePorts> {
        self.physical_midi
            .get(&node_id)
            .or_else(|| self.software_midi.get(&node_id))
    }

    /// MIDI ports facing the given direction, physical and software alike.
    pub fn midi_ports(&self, direction: PortDirection) -> Vec<&PortInfo> {
        let mut ports = Vec::new();
        for map in [&self.physical_midi, &self.software_midi] {
            for node in map.values() {
                let side = match direction {
                    PortDirection::In => &node.inputs,
                    PortDirection::Out => &node.outputs,
                };
                ports.extend(side.iter());
            }
        }
        ports
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn midi_out_props(node: &str) -> Vec<(&str, &str)> {
        vec![
            ("format.dsp", "8 bit raw midi"),
            ("port.name", "capture_1"),
            ("port.alias", "Nord Lead MIDI 1"),
            ("object.path", "alsa:seq:default:2:0"),
            ("port.id", "0"),
            ("node.id", node),
            ("port.direction", "out"),
            ("port.physical", "true"),
            ("port.terminal", "true"),
        ]
    }

    fn slots_holding(graph: &Graph, id: u32) -> usize {
        let mut count = 0;
        graph.for_each_port(|p| {
            if p.id == id {
                count += 1;
            }
        });
        count
    }

    #[test]
    fn test_missing_node_id_is_dropped() {
        let props = vec![("format.dsp", "8 bit raw midi"), ("port.name", "x")];
        assert!(PortInfo::from_props(9, props).is_none());
    }

    #[test]
    fn test_physical_midi_classification() {
        let info = PortInfo::from_props(7, midi_out_props("42")).unwrap();
        assert!(info.physical);
        assert!(info.terminal);
        assert!(!info.monitor);
        assert_eq!(info.node_id, 42);
        assert_eq!(info.direction, PortDirection::Out);

        let mut graph = Graph::default();
        graph.insert(info);
        let node = graph.physical_midi.get(&42).unwrap();
        assert_eq!(node.outputs.len(), 1);
        assert!(node.inputs.is_empty());
        assert_eq!(slots_holding(&graph, 7), 1);
    }

    #[test]
    fn test_software_audio_classification() {
        let props = vec![
            ("format.dsp", "32 bit float mono audio"),
            ("port.name", "output_FL"),
            ("node.id", "51"),
            ("port.direction", "in"),
        ];
        let mut graph = Graph::default();
        graph.insert(PortInfo::from_props(12, props).unwrap());
        assert_eq!(graph.software_audio.get(&51).unwrap().inputs.len(), 1);
        assert!(graph.software_midi.is_empty());
        assert!(graph.physical_audio.is_empty());
    }

    #[test]
    fn test_unknown_format_ignored() {
        let props = vec![
            ("format.dsp", "video/raw"),
            ("node.id", "8"),
            ("port.direction", "out"),
        ];
        let mut graph = Graph::default();
        graph.insert(PortInfo::from_props(3, props).unwrap());
        assert_eq!(slots_holding(&graph, 3), 0);
    }

    #[test]
    fn test_remove_clears_all_maps_and_prunes_nodes() {
        let mut graph = Graph::default();
        graph.insert(PortInfo::from_props(7, midi_out_props("42")).unwrap());
        assert_eq!(slots_holding(&graph, 7), 1);

        graph.remove_port(7);
        assert_eq!(slots_holding(&graph, 7), 0);
        assert!(graph.physical_midi.is_empty());
        // Removing again is harmless.
        graph.remove_port(7);
    }

    #[test]
    fn test_reannouncement_replaces_not_duplicates() {
        let mut graph = Graph::default();
        graph.insert(PortInfo::from_props(7, midi_out_props("42")).unwrap());

        // Same port re-announced, now flagged as a monitor.
        let mut props = midi_out_props("42");
        props.push(("port.monitor", "true"));
        graph.insert(PortInfo::from_props(7, props).unwrap());

        assert_eq!(slots_holding(&graph, 7), 1);
        let node = graph.physical_midi.get(&42).unwrap();
        assert!(node.outputs[0].monitor);
    }

    #[test]
    fn test_every_port_in_exactly_one_slot() {
        let mut graph = Graph::default();
        let announcements: Vec<(u32, Vec<(&str, &str)>)> = vec![
            (1, midi_out_props("42")),
            (
                2,
                vec![
                    ("format.dsp", "8 bit raw midi"),
                    ("node.id", "42"),
                    ("port.direction", "in"),
                    ("port.physical", "true"),
                ],
            ),
            (
                3,
                vec![
                    ("format.dsp", "8 bit raw midi"),
                    ("node.id", "60"),
                    ("port.direction", "in"),
                ],
            ),
            (
                4,
                vec![
                    ("format.dsp", "32 bit float mono audio"),
                    ("node.id", "60"),
                    ("port.direction", "out"),
                ],
            ),
        ];
        for (id, props) in announcements {
            graph.insert(PortInfo::from_props(id, props).unwrap());
        }
        for id in 1..=4 {
            assert_eq!(slots_holding(&graph, id), 1, "port {}", id);
        }

        // Random removals keep the rest intact.
        graph.remove_port(2);
        assert_eq!(slots_holding(&graph, 2), 0);
        for id in [1, 3, 4] {
            assert_eq!(slots_holding(&graph, id), 1);
        }
    }

    #[test]
    fn test_midi_ports_by_direction() {
        let mut graph = Graph::default();
        graph.insert(PortInfo::from_props(7, midi_out_props("42")).unwrap());
        graph.insert(
            PortInfo::from_props(
                8,
                vec![
                    ("format.dsp", "8 bit raw midi"),
                    ("port.name", "playback_1"),
                    ("node.id", "43"),
                    ("port.direction", "in"),
                ],
            )
            .unwrap(),
        );

        let ins = graph.midi_ports(PortDirection::In);
        assert_eq!(ins.len(), 1);
        assert_eq!(ins[0].id, 8);
        let outs = graph.midi_ports(PortDirection::Out);
        assert_eq!(outs.len(), 1);
        assert_eq!(outs[0].id, 7);
        assert!(graph.midi_node(42).is_some());
        assert!(graph.midi_node(99).is_none());
    }
}
